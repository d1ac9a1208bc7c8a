//! Configuration.
//!
//! The core consumes a fully resolved [`Config`]; merging happens in
//! the CLI layer with per-field last-writer-wins precedence:
//! environment (`CONEXUS_*`) > TOML file > defaults.
//!
//! ```toml
//! db_path = "./data/conexus.db"
//! root_path = "."
//! transport = "stdio"
//!
//! [chunk]
//! max_tokens = 512
//! overlap_ratio = 0.2
//!
//! [indexer]
//! parallelism = 4
//! include_patterns = []
//! exclude_patterns = ["**/dist/**"]
//!
//! [embedder]
//! provider = "mock"
//! dimension = 384
//!
//! [search]
//! default_mode = "hybrid"
//! default_top_k = 10
//! ```

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite store location.
    pub db_path: PathBuf,
    /// Codebase root to index.
    pub root_path: PathBuf,
    /// Bind host for the HTTP transport.
    pub host: String,
    /// Bind port for the HTTP transport.
    pub port: u16,
    /// `stdio` (default) or `http`.
    pub transport: String,
    pub log_level: String,
    /// `text` or `json`.
    pub log_format: String,
    pub chunk: ChunkConfig,
    pub indexer: IndexerConfig,
    pub embedder: EmbedderConfig,
    pub search: SearchConfig,
    pub observability: ObservabilityConfig,
    pub tls: TlsConfig,
    pub rate_limit: RateLimitConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("./data/conexus.db"),
            root_path: PathBuf::from("."),
            host: "127.0.0.1".to_string(),
            port: 7700,
            transport: "stdio".to_string(),
            log_level: "info".to_string(),
            log_format: "text".to_string(),
            chunk: ChunkConfig::default(),
            indexer: IndexerConfig::default(),
            embedder: EmbedderConfig::default(),
            search: SearchConfig::default(),
            observability: ObservabilityConfig::default(),
            tls: TlsConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkConfig {
    pub max_tokens: usize,
    pub overlap_ratio: f64,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            max_tokens: 512,
            overlap_ratio: 0.20,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    pub parallelism: usize,
    pub include_patterns: Vec<String>,
    pub exclude_patterns: Vec<String>,
    /// Maximum file size in bytes; 0 = unbounded.
    pub max_file_size: u64,
    /// Merkle snapshot location. Defaults next to the database.
    pub state_path: Option<PathBuf>,
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            parallelism: 4,
            include_patterns: Vec::new(),
            exclude_patterns: Vec::new(),
            max_file_size: 1024 * 1024,
            state_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbedderConfig {
    /// Registry name: `mock` or `http`.
    pub provider: String,
    pub dimension: usize,
    /// HTTP provider endpoint.
    pub url: Option<String>,
    /// HTTP provider model name.
    pub model: Option<String>,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for EmbedderConfig {
    fn default() -> Self {
        Self {
            provider: "mock".to_string(),
            dimension: 384,
            url: None,
            model: None,
            timeout_secs: 30,
            max_retries: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    /// `bm25`, `vector`, or `hybrid`.
    pub default_mode: String,
    pub default_top_k: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_mode: "hybrid".to_string(),
            default_top_k: 10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub metrics_enabled: bool,
    pub tracing_enabled: bool,
}

/// TLS settings for the HTTP transport. Termination itself is the
/// embedding host's concern; the core only carries the resolved paths.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TlsConfig {
    pub enabled: bool,
    pub cert_path: Option<PathBuf>,
    pub key_path: Option<PathBuf>,
}

/// Rate limiting for the HTTP transport; enforced by the outer layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub requests_per_minute: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            requests_per_minute: 600,
        }
    }
}

impl Config {
    /// Resolved Merkle snapshot path.
    pub fn state_path(&self) -> PathBuf {
        self.indexer.state_path.clone().unwrap_or_else(|| {
            self.db_path
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join("merkle.json")
        })
    }

    /// Parse a TOML config file.
    pub fn from_file(path: &Path) -> Result<Config> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::with_source(
                crate::error::ErrorKind::InvalidParams,
                format!("cannot read config file: {}", path.display()),
                e,
            )
        })?;
        let config: Config = toml::from_str(&content).map_err(|e| {
            Error::with_source(
                crate::error::ErrorKind::InvalidParams,
                format!("cannot parse config file: {}", path.display()),
                e,
            )
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay `CONEXUS_*` environment variables, last-writer-wins per
    /// field. Unknown variables are ignored.
    pub fn apply_env(&mut self, vars: impl Iterator<Item = (String, String)>) {
        for (key, value) in vars {
            match key.as_str() {
                "CONEXUS_DB_PATH" => self.db_path = PathBuf::from(value),
                "CONEXUS_ROOT_PATH" => self.root_path = PathBuf::from(value),
                "CONEXUS_HOST" => self.host = value,
                "CONEXUS_PORT" => {
                    if let Ok(port) = value.parse() {
                        self.port = port;
                    }
                }
                "CONEXUS_TRANSPORT" => self.transport = value,
                "CONEXUS_LOG_LEVEL" => self.log_level = value,
                "CONEXUS_LOG_FORMAT" => self.log_format = value,
                "CONEXUS_CHUNK_MAX_TOKENS" => {
                    if let Ok(v) = value.parse() {
                        self.chunk.max_tokens = v;
                    }
                }
                "CONEXUS_CHUNK_OVERLAP_RATIO" => {
                    if let Ok(v) = value.parse() {
                        self.chunk.overlap_ratio = v;
                    }
                }
                "CONEXUS_INDEXER_PARALLELISM" => {
                    if let Ok(v) = value.parse() {
                        self.indexer.parallelism = v;
                    }
                }
                "CONEXUS_EMBEDDER_PROVIDER" => self.embedder.provider = value,
                "CONEXUS_EMBEDDER_DIMENSION" => {
                    if let Ok(v) = value.parse() {
                        self.embedder.dimension = v;
                    }
                }
                "CONEXUS_SEARCH_DEFAULT_MODE" => self.search.default_mode = value,
                "CONEXUS_SEARCH_DEFAULT_TOP_K" => {
                    if let Ok(v) = value.parse() {
                        self.search.default_top_k = v;
                    }
                }
                _ => {}
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk.max_tokens == 0 {
            return Err(Error::invalid_params("chunk.max_tokens must be > 0"));
        }
        if !(0.0..=1.0).contains(&self.chunk.overlap_ratio) {
            return Err(Error::invalid_params(
                "chunk.overlap_ratio must be in [0.0, 1.0]",
            ));
        }
        if self.embedder.dimension == 0 {
            return Err(Error::invalid_params("embedder.dimension must be > 0"));
        }
        match self.embedder.provider.as_str() {
            "mock" => {}
            "http" => {
                if self.embedder.url.is_none() {
                    return Err(Error::invalid_params(
                        "embedder.url is required for the http provider",
                    ));
                }
            }
            other => {
                return Err(Error::invalid_params(format!(
                    "unknown embedder provider: {other}"
                )))
            }
        }
        match self.search.default_mode.as_str() {
            "bm25" | "vector" | "hybrid" => {}
            other => {
                return Err(Error::invalid_params(format!(
                    "unknown search mode: {other}"
                )))
            }
        }
        match self.transport.as_str() {
            "stdio" | "http" => {}
            other => {
                return Err(Error::invalid_params(format!(
                    "unknown transport: {other} (use stdio or http)"
                )))
            }
        }
        if self.indexer.parallelism == 0 {
            return Err(Error::invalid_params("indexer.parallelism must be > 0"));
        }
        if self.tls.enabled && (self.tls.cert_path.is_none() || self.tls.key_path.is_none()) {
            return Err(Error::invalid_params(
                "tls.cert_path and tls.key_path are required when tls.enabled",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn toml_roundtrip_with_partial_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("conexus.toml");
        std::fs::write(
            &path,
            r#"
db_path = "/var/lib/conexus/store.db"

[chunk]
max_tokens = 256

[search]
default_mode = "bm25"
"#,
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        assert_eq!(config.db_path, PathBuf::from("/var/lib/conexus/store.db"));
        assert_eq!(config.chunk.max_tokens, 256);
        // Unset fields keep their defaults.
        assert!((config.chunk.overlap_ratio - 0.20).abs() < 1e-9);
        assert_eq!(config.search.default_mode, "bm25");
        assert_eq!(config.search.default_top_k, 10);
    }

    #[test]
    fn env_overrides_file() {
        let mut config = Config::default();
        config.search.default_mode = "bm25".to_string();
        config.apply_env(
            vec![
                ("CONEXUS_SEARCH_DEFAULT_MODE".to_string(), "vector".to_string()),
                ("CONEXUS_PORT".to_string(), "9000".to_string()),
                ("UNRELATED".to_string(), "ignored".to_string()),
            ]
            .into_iter(),
        );
        assert_eq!(config.search.default_mode, "vector");
        assert_eq!(config.port, 9000);
    }

    #[test]
    fn invalid_overlap_rejected() {
        let mut config = Config::default();
        config.chunk.overlap_ratio = 1.5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn http_provider_requires_url() {
        let mut config = Config::default();
        config.embedder.provider = "http".to_string();
        assert!(config.validate().is_err());
        config.embedder.url = Some("http://localhost:8080/v1/embeddings".to_string());
        config.validate().unwrap();
    }

    #[test]
    fn unknown_transport_rejected() {
        let mut config = Config::default();
        config.transport = "grpc".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn state_path_defaults_next_to_db() {
        let config = Config::default();
        assert_eq!(config.state_path(), PathBuf::from("./data/merkle.json"));
    }
}
