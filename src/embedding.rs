//! Embedding providers.
//!
//! An [`Embedder`] maps text to a unit vector of fixed dimension. Two
//! implementations ship with the crate:
//!
//! - [`MockEmbedder`] — deterministic, hash-derived vectors; the test
//!   provider and the default when no external provider is configured.
//! - [`HttpEmbedder`] — OpenAI-shaped `POST /v1/embeddings` endpoint
//!   with exponential-backoff retry.
//!
//! Providers register in an [`EmbedderRegistry`] by name; the server
//! selects one at startup. Vector blob codecs for SQLite storage live
//! here as well.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

/// Maps text to L2-normalized vectors of a fixed dimension.
///
/// Calls are async and abort when the caller drops or races the future
/// (the server wraps handler work in `tokio::select!` against its
/// shutdown signal), so providers must not hold locks across awaits.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Provider name used for registry lookup.
    fn name(&self) -> &str;

    /// Vector dimension; constant for the provider's lifetime.
    fn dimension(&self) -> usize;

    /// Embed a single text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a batch, preserving input order. Default implementation
    /// loops over [`embed`](Embedder::embed); network providers
    /// override with a single batched call.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }
}

/// Scale a vector to unit length in place. A zero vector is left as-is.
pub fn normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        for v in vector.iter_mut() {
            *v /= norm;
        }
    }
}

/// Dot product. For unit vectors this equals cosine similarity.
pub fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b.iter()).map(|(x, y)| x * y).sum()
}

/// Encode a float vector as little-endian f32 bytes for BLOB storage.
pub fn vec_to_blob(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for &v in vector {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB written by [`vec_to_blob`].
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

// ============ Mock provider ============

/// Deterministic embedder: component `i` is derived from
/// `SHA-256(text ‖ i)`, then the vector is L2-normalized. Identical
/// input always yields identical output, across processes.
pub struct MockEmbedder {
    dimension: usize,
}

impl MockEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self { dimension }
    }
}

#[async_trait]
impl Embedder for MockEmbedder {
    fn name(&self) -> &str {
        "mock"
    }

    fn dimension(&self) -> usize {
        self.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vector = Vec::with_capacity(self.dimension);
        for i in 0..self.dimension {
            let mut hasher = Sha256::new();
            hasher.update(text.as_bytes());
            hasher.update((i as u64).to_le_bytes());
            let digest = hasher.finalize();
            let raw = u64::from_le_bytes(digest[..8].try_into().expect("digest >= 8 bytes"));
            // Map to [-1, 1].
            vector.push((raw as f64 / u64::MAX as f64 * 2.0 - 1.0) as f32);
        }
        normalize(&mut vector);
        Ok(vector)
    }
}

// ============ HTTP provider ============

/// Configuration for [`HttpEmbedder`].
#[derive(Debug, Clone)]
pub struct HttpEmbedderConfig {
    /// Endpoint accepting `{"model": ..., "input": [...]}` and returning
    /// `{"data": [{"embedding": [...]}]}`.
    pub url: String,
    pub model: String,
    pub dimension: usize,
    /// Bearer token, if the endpoint requires one. Never logged.
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

/// Embedding provider backed by an OpenAI-compatible HTTP endpoint.
///
/// Retry strategy: HTTP 429 and 5xx retry with exponential backoff
/// (1s, 2s, 4s, ... capped at 2^5); other 4xx fail immediately; network
/// errors retry. Returned vectors are re-normalized locally so the
/// unit-norm invariant does not depend on the remote service.
pub struct HttpEmbedder {
    config: HttpEmbedderConfig,
    client: reqwest::Client,
}

impl HttpEmbedder {
    pub fn new(config: HttpEmbedderConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| {
                Error::with_source(crate::error::ErrorKind::Internal, "building HTTP client", e)
            })?;
        Ok(Self { config, client })
    }

    async fn request(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.config.model,
            "input": texts,
        });

        let mut last_err: Option<Error> = None;

        for attempt in 0..=self.config.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let mut req = self.client.post(&self.config.url).json(&body);
            if let Some(ref key) = self.config.api_key {
                req = req.bearer_auth(key);
            }

            match req.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let json: serde_json::Value = response.json().await.map_err(|e| {
                            Error::with_source(
                                crate::error::ErrorKind::Internal,
                                "decoding embedding response",
                                e,
                            )
                        })?;
                        return parse_embeddings(&json, self.config.dimension, texts.len());
                    }
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(Error::internal(format!(
                            "embedding endpoint returned {status}"
                        )));
                        continue;
                    }
                    return Err(Error::internal(format!(
                        "embedding endpoint returned {status}"
                    )));
                }
                Err(e) => {
                    last_err = Some(Error::with_source(
                        crate::error::ErrorKind::Internal,
                        "embedding request failed",
                        e,
                    ));
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| Error::internal("embedding failed after retries")))
    }
}

fn parse_embeddings(
    json: &serde_json::Value,
    dimension: usize,
    expected: usize,
) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| Error::internal("embedding response missing data array"))?;

    if data.len() != expected {
        return Err(Error::internal(format!(
            "embedding response has {} entries, expected {expected}",
            data.len()
        )));
    }

    let mut out = Vec::with_capacity(data.len());
    for item in data {
        let raw = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| Error::internal("embedding response entry missing embedding"))?;
        let mut vector: Vec<f32> = raw
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();
        if vector.len() != dimension {
            return Err(Error::dimension_mismatch(dimension, vector.len()));
        }
        normalize(&mut vector);
        out.push(vector);
    }
    Ok(out)
}

#[async_trait]
impl Embedder for HttpEmbedder {
    fn name(&self) -> &str {
        "http"
    }

    fn dimension(&self) -> usize {
        self.config.dimension
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let vectors = self.request(&[text.to_string()]).await?;
        vectors
            .into_iter()
            .next()
            .ok_or_else(|| Error::internal("empty embedding response"))
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        self.request(texts).await
    }
}

// ============ Registry ============

/// Named provider registry, read-mostly after startup.
pub struct EmbedderRegistry {
    providers: RwLock<HashMap<String, Arc<dyn Embedder>>>,
}

impl EmbedderRegistry {
    /// An empty registry pre-loaded with the `mock` provider at the
    /// given dimension.
    pub fn with_mock(dimension: usize) -> Self {
        let registry = Self {
            providers: RwLock::new(HashMap::new()),
        };
        registry.register(Arc::new(MockEmbedder::new(dimension)));
        registry
    }

    pub fn register(&self, embedder: Arc<dyn Embedder>) {
        let mut providers = self.providers.write().expect("registry lock poisoned");
        providers.insert(embedder.name().to_string(), embedder);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Embedder>> {
        let providers = self.providers.read().expect("registry lock poisoned");
        providers.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let providers = self.providers.read().expect("registry lock poisoned");
        let mut names: Vec<String> = providers.keys().cloned().collect();
        names.sort();
        names
    }
}
