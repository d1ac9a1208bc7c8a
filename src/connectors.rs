//! Connector store and lifecycle hooks.
//!
//! Connectors describe external data sources (filesystem, GitHub,
//! Slack, Jira, Discord). Their rows live in the same SQLite file as
//! the chunks, in a separate table. Transitions — add, update, remove —
//! run through an ordered chain of [`LifecycleHook`]s; a failed
//! `post_init` rolls the connector back through its shutdown hooks and
//! surfaces the original error.
//!
//! Connector `config` values may hold credentials; they are treated as
//! opaque and never logged.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};

use crate::error::{Error, Result};
use crate::store::VectorStore;

/// Supported connector types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectorType {
    Filesystem,
    Github,
    Slack,
    Jira,
    Discord,
}

impl ConnectorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectorType::Filesystem => "filesystem",
            ConnectorType::Github => "github",
            ConnectorType::Slack => "slack",
            ConnectorType::Jira => "jira",
            ConnectorType::Discord => "discord",
        }
    }

    /// Config keys that must be present for this type.
    pub fn required_config_keys(&self) -> &'static [&'static str] {
        match self {
            ConnectorType::Filesystem => &["root_path"],
            ConnectorType::Github => &["repo", "token"],
            ConnectorType::Slack => &["workspace", "token"],
            ConnectorType::Jira => &["url", "project_key", "token"],
            ConnectorType::Discord => &["guild_id", "token"],
        }
    }
}

impl FromStr for ConnectorType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "filesystem" => Ok(ConnectorType::Filesystem),
            "github" => Ok(ConnectorType::Github),
            "slack" => Ok(ConnectorType::Slack),
            "jira" => Ok(ConnectorType::Jira),
            "discord" => Ok(ConnectorType::Discord),
            other => Err(Error::invalid_params(format!(
                "unknown connector type: {other}"
            ))),
        }
    }
}

impl fmt::Display for ConnectorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Connector activation state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectorStatus {
    Active,
    Inactive,
}

impl ConnectorStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectorStatus::Active => "active",
            ConnectorStatus::Inactive => "inactive",
        }
    }
}

impl FromStr for ConnectorStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(ConnectorStatus::Active),
            "inactive" => Ok(ConnectorStatus::Inactive),
            other => Err(Error::invalid_params(format!(
                "unknown connector status: {other}"
            ))),
        }
    }
}

/// An external data source descriptor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Connector {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub connector_type: ConnectorType,
    pub status: ConnectorStatus,
    pub config: serde_json::Map<String, serde_json::Value>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Connector {
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        connector_type: ConnectorType,
        config: serde_json::Map<String, serde_json::Value>,
    ) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            id: id.into(),
            name: name.into(),
            connector_type,
            status: ConnectorStatus::Active,
            config,
            created_at: now,
            updated_at: now,
        }
    }
}

fn validate_row(connector: &Connector) -> Result<()> {
    if connector.id.trim().is_empty() {
        return Err(Error::invalid_params("connector id must not be empty"));
    }
    if connector.name.trim().is_empty() {
        return Err(Error::invalid_params("connector name must not be empty"));
    }
    for key in connector.connector_type.required_config_keys() {
        if !connector.config.contains_key(*key) {
            return Err(Error::invalid_params(format!(
                "connector type '{}' requires config key '{key}'",
                connector.connector_type
            )));
        }
    }
    Ok(())
}

// ============ Store ============

/// Persistence for connector rows; shares the vector store's SQLite
/// file.
#[derive(Clone)]
pub struct ConnectorStore {
    pool: SqlitePool,
}

impl ConnectorStore {
    pub fn new(store: &VectorStore) -> Self {
        Self {
            pool: store.pool().clone(),
        }
    }

    pub async fn add(&self, connector: &Connector) -> Result<()> {
        validate_row(connector)?;
        let exists: bool = sqlx::query_scalar("SELECT COUNT(*) > 0 FROM connectors WHERE id = ?")
            .bind(&connector.id)
            .fetch_one(&self.pool)
            .await?;
        if exists {
            return Err(Error::connector_exists(&connector.id));
        }

        sqlx::query(
            "INSERT INTO connectors (id, name, type, status, config, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&connector.id)
        .bind(&connector.name)
        .bind(connector.connector_type.as_str())
        .bind(connector.status.as_str())
        .bind(serde_json::to_string(&connector.config)?)
        .bind(connector.created_at)
        .bind(connector.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Connector> {
        let row = sqlx::query(
            "SELECT id, name, type, status, config, created_at, updated_at \
             FROM connectors WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::connector_not_found(id))?;
        row_to_connector(&row)
    }

    pub async fn update(&self, connector: &Connector) -> Result<()> {
        validate_row(connector)?;
        let updated_at = chrono::Utc::now().timestamp();
        let result = sqlx::query(
            "UPDATE connectors SET name = ?, type = ?, status = ?, config = ?, updated_at = ? \
             WHERE id = ?",
        )
        .bind(&connector.name)
        .bind(connector.connector_type.as_str())
        .bind(connector.status.as_str())
        .bind(serde_json::to_string(&connector.config)?)
        .bind(updated_at)
        .bind(&connector.id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(Error::connector_not_found(&connector.id));
        }
        Ok(())
    }

    pub async fn set_status(&self, id: &str, status: ConnectorStatus) -> Result<()> {
        let result = sqlx::query("UPDATE connectors SET status = ?, updated_at = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(chrono::Utc::now().timestamp())
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::connector_not_found(id));
        }
        Ok(())
    }

    pub async fn remove(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM connectors WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::connector_not_found(id));
        }
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<Connector>> {
        let rows = sqlx::query(
            "SELECT id, name, type, status, config, created_at, updated_at \
             FROM connectors ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_connector).collect()
    }
}

fn row_to_connector(row: &sqlx::sqlite::SqliteRow) -> Result<Connector> {
    let type_str: String = row.get("type");
    let status_str: String = row.get("status");
    let config_json: String = row.get("config");
    let config: serde_json::Map<String, serde_json::Value> = serde_json::from_str(&config_json)
        .map_err(|e| Error::with_source(crate::error::ErrorKind::Storage, "corrupt connector config", e))?;
    Ok(Connector {
        id: row.get("id"),
        name: row.get("name"),
        connector_type: type_str.parse()?,
        status: status_str.parse()?,
        config,
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    })
}

// ============ Lifecycle hooks ============

/// Callbacks run around connector init and shutdown. All default to
/// no-ops so implementations override only the phases they care about.
#[async_trait]
pub trait LifecycleHook: Send + Sync {
    fn name(&self) -> &str;

    async fn pre_init(&self, _connector: &Connector) -> Result<()> {
        Ok(())
    }

    async fn post_init(&self, _connector: &Connector) -> Result<()> {
        Ok(())
    }

    async fn pre_shutdown(&self, _connector: &Connector) -> Result<()> {
        Ok(())
    }

    async fn post_shutdown(&self, _connector: &Connector) -> Result<()> {
        Ok(())
    }
}

/// Ordered hook registry. The lock guards registration and snapshot
/// reads only; hook callbacks always run outside it.
#[derive(Default)]
pub struct HookRegistry {
    hooks: Mutex<Vec<Arc<dyn LifecycleHook>>>,
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry pre-loaded with the built-in hooks.
    pub fn with_builtins() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(HealthCheckHook));
        registry.register(Arc::new(ValidationHook));
        registry
    }

    pub fn register(&self, hook: Arc<dyn LifecycleHook>) {
        let mut hooks = self.hooks.lock().expect("hook registry lock poisoned");
        hooks.push(hook);
    }

    fn snapshot(&self) -> Vec<Arc<dyn LifecycleHook>> {
        let hooks = self.hooks.lock().expect("hook registry lock poisoned");
        hooks.clone()
    }

    /// Run the init chain: every `pre_init` in registration order, the
    /// connector's own (opaque) init, then every `post_init`. A
    /// `pre_init` error aborts before any `post_init` runs. A
    /// `post_init` error triggers a best-effort shutdown rollback and
    /// surfaces the original error.
    pub async fn initialize(&self, connector: &Connector) -> Result<()> {
        let hooks = self.snapshot();

        for hook in &hooks {
            hook.pre_init(connector).await.map_err(|e| {
                e.context(format!(
                    "pre-init hook '{}' failed for connector '{}'",
                    hook.name(),
                    connector.id
                ))
            })?;
        }

        // The type-specific init itself is opaque to the core.

        for hook in &hooks {
            if let Err(e) = hook.post_init(connector).await {
                let init_err = e.context(format!(
                    "post-init hook '{}' failed for connector '{}'",
                    hook.name(),
                    connector.id
                ));
                if let Err(shutdown_err) = self.shutdown(connector).await {
                    tracing::warn!(
                        connector = %connector.id,
                        error = %shutdown_err,
                        "rollback shutdown reported errors"
                    );
                }
                return Err(init_err);
            }
        }

        Ok(())
    }

    /// Run the shutdown chain. Errors are collected, not aborting; the
    /// first one is returned after every hook has run.
    pub async fn shutdown(&self, connector: &Connector) -> Result<()> {
        let hooks = self.snapshot();
        let mut first_err: Option<Error> = None;

        for hook in &hooks {
            if let Err(e) = hook.pre_shutdown(connector).await {
                tracing::warn!(connector = %connector.id, hook = hook.name(), error = %e, "pre-shutdown hook failed");
                first_err.get_or_insert(e);
            }
        }

        // Opaque type-specific shutdown.

        for hook in &hooks {
            if let Err(e) = hook.post_shutdown(connector).await {
                tracing::warn!(connector = %connector.id, hook = hook.name(), error = %e, "post-shutdown hook failed");
                first_err.get_or_insert(e);
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

// ============ Built-in hooks ============

/// Validates identity on pre-init and performs a cheap type-specific
/// liveness check on post-init.
pub struct HealthCheckHook;

#[async_trait]
impl LifecycleHook for HealthCheckHook {
    fn name(&self) -> &str {
        "health-check"
    }

    async fn pre_init(&self, connector: &Connector) -> Result<()> {
        if connector.id.trim().is_empty() {
            return Err(Error::invalid_params("connector id must not be empty"));
        }
        Ok(())
    }

    async fn post_init(&self, connector: &Connector) -> Result<()> {
        if connector.connector_type == ConnectorType::Filesystem {
            let root = connector
                .config
                .get("root_path")
                .and_then(|v| v.as_str())
                .ok_or_else(|| Error::invalid_params("filesystem connector requires root_path"))?;
            if !std::path::Path::new(root).is_dir() {
                return Err(Error::invalid_params(format!(
                    "filesystem connector root is not reachable: {root}"
                )));
            }
        }
        Ok(())
    }
}

/// Enforces required config keys per connector type on pre-init.
pub struct ValidationHook;

#[async_trait]
impl LifecycleHook for ValidationHook {
    fn name(&self) -> &str {
        "validation"
    }

    async fn pre_init(&self, connector: &Connector) -> Result<()> {
        for key in connector.connector_type.required_config_keys() {
            if !connector.config.contains_key(*key) {
                return Err(Error::invalid_params(format!(
                    "connector type '{}' requires config key '{key}'",
                    connector.connector_type
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fs_config(root: &str) -> serde_json::Map<String, serde_json::Value> {
        let mut m = serde_json::Map::new();
        m.insert("root_path".to_string(), serde_json::json!(root));
        m
    }

    async fn connector_store() -> (VectorStore, ConnectorStore) {
        let store = VectorStore::open_in_memory(4).await.unwrap();
        let connectors = ConnectorStore::new(&store);
        (store, connectors)
    }

    #[tokio::test]
    async fn add_list_remove_roundtrip() {
        let (_store, connectors) = connector_store().await;
        let cn = Connector::new("fs-docs", "Docs", ConnectorType::Filesystem, fs_config("/tmp"));
        connectors.add(&cn).await.unwrap();

        let listed = connectors.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "fs-docs");

        connectors.remove("fs-docs").await.unwrap();
        let err = connectors.get("fs-docs").await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ConnectorNotFound);
    }

    #[tokio::test]
    async fn duplicate_add_fails() {
        let (_store, connectors) = connector_store().await;
        let cn = Connector::new("fs-docs", "Docs", ConnectorType::Filesystem, fs_config("/tmp"));
        connectors.add(&cn).await.unwrap();
        let err = connectors.add(&cn).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ConnectorExists);
    }

    #[tokio::test]
    async fn update_unknown_fails() {
        let (_store, connectors) = connector_store().await;
        let cn = Connector::new("ghost", "Ghost", ConnectorType::Filesystem, fs_config("/tmp"));
        let err = connectors.update(&cn).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ConnectorNotFound);
    }

    #[tokio::test]
    async fn missing_required_config_rejected() {
        let (_store, connectors) = connector_store().await;
        let cn = Connector::new(
            "gh",
            "GitHub",
            ConnectorType::Github,
            serde_json::Map::new(),
        );
        let err = connectors.add(&cn).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidParams);
    }

    #[tokio::test]
    async fn empty_id_rejected() {
        let (_store, connectors) = connector_store().await;
        let cn = Connector::new("", "X", ConnectorType::Filesystem, fs_config("/tmp"));
        let err = connectors.add(&cn).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidParams);
    }

    #[tokio::test]
    async fn config_roundtrips_opaque_fields() {
        let (_store, connectors) = connector_store().await;
        let mut config = fs_config("/tmp");
        config.insert("api_secret".to_string(), serde_json::json!("s3cr3t"));
        let cn = Connector::new("fs", "FS", ConnectorType::Filesystem, config);
        connectors.add(&cn).await.unwrap();
        let got = connectors.get("fs").await.unwrap();
        assert_eq!(got.config.get("api_secret"), Some(&serde_json::json!("s3cr3t")));
    }

    // ── Lifecycle ───────────────────────────────────────────────────

    struct CountingHook {
        pre_inits: AtomicUsize,
        post_inits: AtomicUsize,
        pre_shutdowns: AtomicUsize,
        post_shutdowns: AtomicUsize,
        fail_post_init: bool,
    }

    impl CountingHook {
        fn new(fail_post_init: bool) -> Arc<Self> {
            Arc::new(Self {
                pre_inits: AtomicUsize::new(0),
                post_inits: AtomicUsize::new(0),
                pre_shutdowns: AtomicUsize::new(0),
                post_shutdowns: AtomicUsize::new(0),
                fail_post_init,
            })
        }
    }

    #[async_trait]
    impl LifecycleHook for CountingHook {
        fn name(&self) -> &str {
            "counting"
        }

        async fn pre_init(&self, _c: &Connector) -> Result<()> {
            self.pre_inits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn post_init(&self, _c: &Connector) -> Result<()> {
            self.post_inits.fetch_add(1, Ordering::SeqCst);
            if self.fail_post_init {
                return Err(Error::internal("post-init refused"));
            }
            Ok(())
        }

        async fn pre_shutdown(&self, _c: &Connector) -> Result<()> {
            self.pre_shutdowns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn post_shutdown(&self, _c: &Connector) -> Result<()> {
            self.post_shutdowns.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn init_runs_all_phases() {
        let registry = HookRegistry::new();
        let hook = CountingHook::new(false);
        registry.register(hook.clone());

        let cn = Connector::new("fs", "FS", ConnectorType::Filesystem, fs_config("/tmp"));
        registry.initialize(&cn).await.unwrap();

        assert_eq!(hook.pre_inits.load(Ordering::SeqCst), 1);
        assert_eq!(hook.post_inits.load(Ordering::SeqCst), 1);
        assert_eq!(hook.pre_shutdowns.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn failed_post_init_rolls_back_through_shutdown() {
        let registry = HookRegistry::new();
        let hook = CountingHook::new(true);
        registry.register(hook.clone());

        let cn = Connector::new("fs", "FS", ConnectorType::Filesystem, fs_config("/tmp"));
        let err = registry.initialize(&cn).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Internal);

        // Rollback ran the shutdown chain.
        assert_eq!(hook.pre_shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(hook.post_shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failed_pre_init_skips_post_init() {
        struct RefusingHook;

        #[async_trait]
        impl LifecycleHook for RefusingHook {
            fn name(&self) -> &str {
                "refusing"
            }
            async fn pre_init(&self, _c: &Connector) -> Result<()> {
                Err(Error::invalid_params("nope"))
            }
        }

        let registry = HookRegistry::new();
        registry.register(Arc::new(RefusingHook));
        let counting = CountingHook::new(false);
        registry.register(counting.clone());

        let cn = Connector::new("fs", "FS", ConnectorType::Filesystem, fs_config("/tmp"));
        assert!(registry.initialize(&cn).await.is_err());
        assert_eq!(counting.post_inits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn shutdown_collects_errors_without_aborting() {
        struct FailingShutdownHook;

        #[async_trait]
        impl LifecycleHook for FailingShutdownHook {
            fn name(&self) -> &str {
                "failing-shutdown"
            }
            async fn pre_shutdown(&self, _c: &Connector) -> Result<()> {
                Err(Error::internal("shutdown hiccup"))
            }
        }

        let registry = HookRegistry::new();
        registry.register(Arc::new(FailingShutdownHook));
        let counting = CountingHook::new(false);
        registry.register(counting.clone());

        let cn = Connector::new("fs", "FS", ConnectorType::Filesystem, fs_config("/tmp"));
        assert!(registry.shutdown(&cn).await.is_err());
        // Later hooks still ran.
        assert_eq!(counting.pre_shutdowns.load(Ordering::SeqCst), 1);
        assert_eq!(counting.post_shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn health_check_rejects_missing_filesystem_root() {
        let registry = HookRegistry::with_builtins();
        let cn = Connector::new(
            "fs",
            "FS",
            ConnectorType::Filesystem,
            fs_config("/definitely/not/a/real/dir"),
        );
        let err = registry.initialize(&cn).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidParams);
    }

    #[tokio::test]
    async fn validation_hook_requires_type_keys() {
        let registry = HookRegistry::with_builtins();
        let cn = Connector::new("jr", "Jira", ConnectorType::Jira, serde_json::Map::new());
        let err = registry.initialize(&cn).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidParams);
    }

    #[test]
    fn type_parsing() {
        assert_eq!(
            "github".parse::<ConnectorType>().unwrap(),
            ConnectorType::Github
        );
        assert!("ftp".parse::<ConnectorType>().is_err());
        assert_eq!(
            "inactive".parse::<ConnectorStatus>().unwrap(),
            ConnectorStatus::Inactive
        );
    }
}
