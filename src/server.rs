//! Server assembly and transports.
//!
//! [`Server::new`] builds the whole object graph — store, embedder,
//! indexer, connector store, hook registry, tool dispatcher — from a
//! resolved [`Config`]. No global state: tests construct as many
//! independent servers as they like.
//!
//! Two transports share the same dispatcher:
//!
//! - **stdio** (primary) — newline-delimited JSON-RPC over the process
//!   streams, driven by [`crate::rpc::serve_connection`].
//! - **http** (gated on `transport = "http"`) — one JSON-RPC exchange
//!   per `POST /mcp`, plus a `GET /health` probe.

use std::sync::Arc;

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde_json::Value;
use tower_http::cors::{Any, CorsLayer};

use crate::cancel::CancelToken;
use crate::chunker::ChunkOptions;
use crate::config::Config;
use crate::connectors::{ConnectorStatus, ConnectorStore, HookRegistry};
use crate::embedding::{Embedder, EmbedderRegistry, HttpEmbedder, HttpEmbedderConfig};
use crate::error::{Error, Result};
use crate::indexer::{Indexer, IndexerOptions};
use crate::metrics::Metrics;
use crate::rpc::{serve_connection, Dispatcher, RequestContext, RequestId, RpcError};
use crate::store::VectorStore;
use crate::tools::{build_dispatcher, related::RelatedCache, ToolContext, ToolRegistry};

/// A fully wired server instance.
pub struct Server {
    ctx: Arc<ToolContext>,
    dispatcher: Arc<Dispatcher>,
    cancel: CancelToken,
}

impl Server {
    /// Build the object graph from a resolved configuration. Opens the
    /// store (running migrations), selects the embedding provider, and
    /// prepares the indexer — but runs nothing yet.
    pub async fn new(config: Config) -> Result<Server> {
        config.validate()?;

        let store = VectorStore::open(&config.db_path, config.embedder.dimension).await?;

        let registry = EmbedderRegistry::with_mock(config.embedder.dimension);
        if config.embedder.provider == "http" {
            let url = config
                .embedder
                .url
                .clone()
                .ok_or_else(|| Error::invalid_params("embedder.url is required for http"))?;
            registry.register(Arc::new(HttpEmbedder::new(HttpEmbedderConfig {
                url,
                model: config.embedder.model.clone().unwrap_or_default(),
                dimension: config.embedder.dimension,
                api_key: std::env::var("CONEXUS_EMBEDDER_API_KEY").ok(),
                timeout_secs: config.embedder.timeout_secs,
                max_retries: config.embedder.max_retries,
            })?));
        }
        let embedder: Arc<dyn Embedder> = registry
            .get(&config.embedder.provider)
            .ok_or_else(|| {
                Error::invalid_params(format!(
                    "unknown embedder provider: {}",
                    config.embedder.provider
                ))
            })?;

        let metrics = Arc::new(Metrics::new());
        let indexer = Arc::new(Indexer::new(
            &config.root_path,
            store.clone(),
            embedder.clone(),
            metrics.clone(),
            IndexerOptions {
                include: config.indexer.include_patterns.clone(),
                exclude: config.indexer.exclude_patterns.clone(),
                max_file_size: config.indexer.max_file_size,
                chunk: ChunkOptions {
                    max_tokens: config.chunk.max_tokens,
                    overlap_ratio: config.chunk.overlap_ratio,
                },
                parallelism: config.indexer.parallelism,
                state_path: config.state_path(),
            },
        )?);

        let connectors = ConnectorStore::new(&store);
        let hooks = Arc::new(HookRegistry::with_builtins());

        let ctx = Arc::new(ToolContext {
            config,
            store,
            indexer,
            connectors,
            hooks,
            embedder,
            metrics,
            related_cache: RelatedCache::new(),
        });

        let tools = Arc::new(ToolRegistry::with_builtins());
        let dispatcher = Arc::new(build_dispatcher(ctx.clone(), tools));

        Ok(Server {
            ctx,
            dispatcher,
            cancel: CancelToken::new(),
        })
    }

    pub fn context(&self) -> &Arc<ToolContext> {
        &self.ctx
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Run connector init chains and one catch-up indexing pass.
    /// Connector init failures deactivate the row and continue;
    /// indexing failures other than cancellation are fatal to startup.
    pub async fn startup(&self) -> Result<()> {
        for connector in self.ctx.connectors.list().await? {
            if connector.status != ConnectorStatus::Active {
                continue;
            }
            if let Err(e) = self.ctx.hooks.initialize(&connector).await {
                tracing::warn!(connector = %connector.id, error = %e, "connector init failed, deactivating");
                self.ctx
                    .connectors
                    .set_status(&connector.id, ConnectorStatus::Inactive)
                    .await?;
            }
        }

        let summary = self.ctx.indexer.index_incremental(&self.cancel).await?;
        tracing::info!(
            files = summary.files_indexed,
            chunks = summary.chunks_written,
            failed = summary.files_failed.len(),
            duration_ms = summary.duration_ms,
            "startup indexing pass complete"
        );
        Ok(())
    }

    /// Drive JSON-RPC over the process's standard streams until EOF or
    /// cancellation.
    pub async fn run_stdio(&self) -> Result<()> {
        tracing::info!("serving MCP over stdio");
        self.serve_stream(tokio::io::stdin(), tokio::io::stdout())
            .await
    }

    /// Drive JSON-RPC over an arbitrary reader/writer pair. The
    /// transport is whatever the caller hands in — the stdio transport
    /// and the tests both route through here.
    pub async fn serve_stream<R, W>(&self, reader: R, writer: W) -> Result<()>
    where
        R: tokio::io::AsyncRead + Unpin + Send,
        W: tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        serve_connection(
            reader,
            writer,
            self.dispatcher.clone(),
            self.ctx.metrics.clone(),
            self.cancel.clone(),
        )
        .await
    }

    /// Serve one JSON-RPC exchange per `POST /mcp`.
    pub async fn run_http(&self) -> Result<()> {
        let bind = format!("{}:{}", self.ctx.config.host, self.ctx.config.port);
        let state = HttpState {
            dispatcher: self.dispatcher.clone(),
            metrics: self.ctx.metrics.clone(),
            cancel: self.cancel.clone(),
        };

        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        let app = Router::new()
            .route("/mcp", post(handle_mcp))
            .route("/health", get(handle_health))
            .layer(cors)
            .with_state(state);

        tracing::info!(bind = %bind, "serving MCP over HTTP");
        let listener = tokio::net::TcpListener::bind(&bind)
            .await
            .map_err(|e| Error::with_source(crate::error::ErrorKind::Internal, format!("cannot bind {bind}"), e))?;

        let cancel = self.cancel.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                while !cancel.is_canceled() {
                    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
                }
            })
            .await
            .map_err(|e| Error::with_source(crate::error::ErrorKind::Internal, "HTTP server failed", e))?;
        Ok(())
    }

    /// Run the transport selected by the configuration.
    pub async fn run(&self) -> Result<()> {
        match self.ctx.config.transport.as_str() {
            "http" => self.run_http().await,
            _ => self.run_stdio().await,
        }
    }

    /// Cancel outstanding work, run connector shutdown chains, close
    /// the store. Best-effort and idempotent.
    pub async fn shutdown(&self) {
        self.cancel.cancel();

        match self.ctx.connectors.list().await {
            Ok(connectors) => {
                for connector in connectors {
                    if connector.status != ConnectorStatus::Active {
                        continue;
                    }
                    if let Err(e) = self.ctx.hooks.shutdown(&connector).await {
                        tracing::warn!(connector = %connector.id, error = %e, "connector shutdown reported errors");
                    }
                }
            }
            Err(e) => tracing::warn!(error = %e, "could not list connectors for shutdown"),
        }

        self.ctx.store.close().await;
        tracing::info!("server shut down");
    }
}

#[derive(Clone)]
struct HttpState {
    dispatcher: Arc<Dispatcher>,
    metrics: Arc<Metrics>,
    cancel: CancelToken,
}

async fn handle_mcp(State(state): State<HttpState>, body: String) -> Json<Value> {
    let value: Value = match serde_json::from_str(&body) {
        Ok(v) => v,
        Err(e) => {
            state.metrics.record_error(crate::rpc::PARSE_ERROR);
            return Json(serde_json::json!({
                "jsonrpc": "2.0",
                "id": Value::Null,
                "error": RpcError::new(crate::rpc::PARSE_ERROR, format!("parse error: {e}")),
            }));
        }
    };

    let id = value
        .get("id")
        .map(RequestId::from_value)
        .unwrap_or(RequestId::Null);
    let method = value
        .get("method")
        .and_then(|m| m.as_str())
        .unwrap_or_default()
        .to_string();
    let params = value.get("params").cloned().unwrap_or(Value::Null);

    if value.get("jsonrpc").and_then(|v| v.as_str()) != Some("2.0") || method.is_empty() {
        return Json(serde_json::json!({
            "jsonrpc": "2.0",
            "id": id.to_value(),
            "error": RpcError::new(crate::rpc::INVALID_REQUEST, "not a JSON-RPC 2.0 request"),
        }));
    }

    state.metrics.record_request(&method);
    let ctx = RequestContext {
        request_id: uuid::Uuid::new_v4().to_string(),
        cancel: state.cancel.clone(),
    };

    match state.dispatcher.dispatch(&method, params, ctx).await {
        Ok(result) => Json(serde_json::json!({
            "jsonrpc": "2.0",
            "id": id.to_value(),
            "result": result,
        })),
        Err(error) => {
            state.metrics.record_error(error.code);
            Json(serde_json::json!({
                "jsonrpc": "2.0",
                "id": id.to_value(),
                "error": error,
            }))
        }
    }
}

async fn handle_health() -> Json<Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}
