//! MCP tool surface.
//!
//! Implements the method set an MCP client drives:
//!
//! | Method | Purpose |
//! |--------|---------|
//! | `initialize` | handshake: server info + capabilities |
//! | `tools/list` | tool definitions with JSON schemas |
//! | `tools/call` | invoke a named tool |
//! | `resources/list` | paginated `codebase://` URIs |
//! | `resources/read` | file content, optionally a line range |
//!
//! Tools implement the [`Tool`] trait and register by their
//! dot-notation names (`context.search`, `context.get_related_info`,
//! `context.index_control`, `context.manage_connectors`,
//! `context.grep`). Everything a tool may touch hangs off the shared
//! [`ToolContext`].

pub mod connectors;
pub mod control;
pub mod explain;
pub mod grep;
pub mod related;
pub mod resources;
pub mod search;

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::config::Config;
use crate::connectors::{ConnectorStore, HookRegistry};
use crate::embedding::Embedder;
use crate::error::Result;
use crate::indexer::Indexer;
use crate::metrics::Metrics;
use crate::rpc::{Dispatcher, MethodHandler, RequestContext, RpcError};
use crate::store::VectorStore;

/// Shared state handed to every tool invocation.
pub struct ToolContext {
    pub config: Config,
    pub store: VectorStore,
    pub indexer: Arc<Indexer>,
    pub connectors: ConnectorStore,
    pub hooks: Arc<HookRegistry>,
    pub embedder: Arc<dyn Embedder>,
    pub metrics: Arc<Metrics>,
    pub related_cache: related::RelatedCache,
}

/// An MCP tool: a name, a JSON schema for its parameters, and an async
/// execute.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Dot-notation tool name (e.g. `context.search`).
    fn name(&self) -> &str;

    fn description(&self) -> &str;

    /// JSON Schema for the tool's parameters.
    fn parameters_schema(&self) -> Value;

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value>;
}

/// Name → tool table.
pub struct ToolRegistry {
    tools: Vec<Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Registry pre-loaded with the built-in `context.*` tools.
    pub fn with_builtins() -> Self {
        Self {
            tools: vec![
                Arc::new(search::SearchTool),
                Arc::new(related::RelatedInfoTool),
                Arc::new(control::IndexControlTool),
                Arc::new(connectors::ManageConnectorsTool),
                Arc::new(grep::GrepTool),
                Arc::new(explain::ExplainTool),
            ],
        }
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn find(&self, name: &str) -> Option<&Arc<dyn Tool>> {
        self.tools.iter().find(|t| t.name() == name)
    }

    pub fn tools(&self) -> &[Arc<dyn Tool>] {
        &self.tools
    }
}

/// Build the JSON-RPC dispatcher for one server instance.
pub fn build_dispatcher(ctx: Arc<ToolContext>, registry: Arc<ToolRegistry>) -> Dispatcher {
    let mut dispatcher = Dispatcher::new();
    dispatcher.register(
        "initialize",
        Arc::new(InitializeHandler {
            registry: registry.clone(),
        }),
    );
    dispatcher.register(
        "tools/list",
        Arc::new(ToolsListHandler {
            registry: registry.clone(),
        }),
    );
    dispatcher.register(
        "tools/call",
        Arc::new(ToolsCallHandler {
            ctx: ctx.clone(),
            registry,
        }),
    );
    dispatcher.register(
        "resources/list",
        Arc::new(resources::ResourcesListHandler { ctx: ctx.clone() }),
    );
    dispatcher.register(
        "resources/read",
        Arc::new(resources::ResourcesReadHandler { ctx }),
    );
    dispatcher
}

// ============ initialize ============

struct InitializeHandler {
    registry: Arc<ToolRegistry>,
}

#[async_trait]
impl MethodHandler for InitializeHandler {
    async fn call(
        &self,
        _params: Value,
        _ctx: RequestContext,
    ) -> std::result::Result<Value, RpcError> {
        Ok(serde_json::json!({
            "protocolVersion": "2024-11-05",
            "capabilities": {
                "tools": {},
                "resources": {},
            },
            "serverInfo": {
                "name": "conexus",
                "version": env!("CARGO_PKG_VERSION"),
            },
            "instructions": format!(
                "Conexus exposes a locally indexed codebase. Available tools: {}.",
                self.registry
                    .tools()
                    .iter()
                    .map(|t| t.name())
                    .collect::<Vec<_>>()
                    .join(", ")
            ),
        }))
    }
}

// ============ tools/list ============

struct ToolsListHandler {
    registry: Arc<ToolRegistry>,
}

#[async_trait]
impl MethodHandler for ToolsListHandler {
    async fn call(
        &self,
        _params: Value,
        _ctx: RequestContext,
    ) -> std::result::Result<Value, RpcError> {
        let tools: Vec<Value> = self
            .registry
            .tools()
            .iter()
            .map(|tool| {
                serde_json::json!({
                    "name": tool.name(),
                    "description": tool.description(),
                    "inputSchema": tool.parameters_schema(),
                })
            })
            .collect();
        Ok(serde_json::json!({ "tools": tools }))
    }
}

// ============ tools/call ============

struct ToolsCallHandler {
    ctx: Arc<ToolContext>,
    registry: Arc<ToolRegistry>,
}

#[async_trait]
impl MethodHandler for ToolsCallHandler {
    async fn call(
        &self,
        params: Value,
        _ctx: RequestContext,
    ) -> std::result::Result<Value, RpcError> {
        let name = params
            .get("name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| RpcError::invalid_params("tools/call requires a 'name' field"))?;

        let tool = self
            .registry
            .find(name)
            .ok_or_else(|| RpcError::method_not_found(name))?;

        let arguments = params
            .get("arguments")
            .cloned()
            .unwrap_or(Value::Object(serde_json::Map::new()));
        reject_unknown_fields(&arguments, tool.parameters_schema())?;

        let result = tool.execute(arguments, &self.ctx).await.map_err(RpcError::from)?;

        let text = serde_json::to_string_pretty(&result).unwrap_or_default();
        Ok(serde_json::json!({
            "content": [{ "type": "text", "text": text }],
            "structuredContent": result,
        }))
    }
}

/// Reject argument objects carrying top-level fields the tool's schema
/// does not declare.
fn reject_unknown_fields(arguments: &Value, schema: Value) -> std::result::Result<(), RpcError> {
    let Some(args) = arguments.as_object() else {
        return Ok(());
    };
    let Some(properties) = schema.get("properties").and_then(|p| p.as_object()) else {
        return Ok(());
    };
    for key in args.keys() {
        if !properties.contains_key(key) {
            return Err(RpcError::invalid_params(format!(
                "unknown argument field: {key}"
            )));
        }
    }
    Ok(())
}

// ============ shared param helpers ============

pub(crate) fn optional_str<'a>(params: &'a Value, key: &str) -> Option<&'a str> {
    params.get(key).and_then(|v| v.as_str())
}

pub(crate) fn optional_usize(params: &Value, key: &str) -> Option<usize> {
    params.get(key).and_then(|v| v.as_u64()).map(|v| v as usize)
}

pub(crate) fn optional_bool(params: &Value, key: &str) -> Option<bool> {
    params.get(key).and_then(|v| v.as_bool())
}

/// Pagination window shared by the paginated tools: `(offset, limit)`.
pub(crate) fn pagination(params: &Value, default_limit: usize) -> (usize, usize) {
    let offset = optional_usize(params, "offset").unwrap_or(0);
    let limit = optional_usize(params, "limit").unwrap_or(default_limit);
    (offset, limit)
}


#[cfg(test)]
mod tests {
    use super::testutil::harness;
    use super::*;
    use crate::cancel::CancelToken;

    fn request_ctx() -> RequestContext {
        RequestContext {
            request_id: "test".to_string(),
            cancel: CancelToken::new(),
        }
    }

    #[tokio::test]
    async fn initialize_reports_capabilities() {
        let h = harness().await;
        let registry = Arc::new(ToolRegistry::with_builtins());
        let dispatcher = build_dispatcher(h.ctx.clone(), registry);
        let result = dispatcher
            .dispatch("initialize", Value::Null, request_ctx())
            .await
            .unwrap();
        assert_eq!(result["serverInfo"]["name"], "conexus");
        assert!(result["capabilities"]["tools"].is_object());
    }

    #[tokio::test]
    async fn tools_list_includes_dot_notation_names() {
        let h = harness().await;
        let registry = Arc::new(ToolRegistry::with_builtins());
        let dispatcher = build_dispatcher(h.ctx.clone(), registry);
        let result = dispatcher
            .dispatch("tools/list", Value::Null, request_ctx())
            .await
            .unwrap();
        let names: Vec<&str> = result["tools"]
            .as_array()
            .unwrap()
            .iter()
            .map(|t| t["name"].as_str().unwrap())
            .collect();
        for expected in [
            "context.search",
            "context.get_related_info",
            "context.index_control",
            "context.manage_connectors",
            "context.grep",
        ] {
            assert!(names.contains(&expected), "missing tool {expected}");
        }
        // Every tool publishes a schema.
        for tool in result["tools"].as_array().unwrap() {
            assert_eq!(tool["inputSchema"]["type"], "object");
        }
    }

    #[tokio::test]
    async fn unknown_tool_is_method_not_found() {
        let h = harness().await;
        let registry = Arc::new(ToolRegistry::with_builtins());
        let dispatcher = build_dispatcher(h.ctx.clone(), registry);
        let err = dispatcher
            .dispatch(
                "tools/call",
                serde_json::json!({"name": "context.nope", "arguments": {}}),
                request_ctx(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, crate::rpc::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn missing_name_is_invalid_params() {
        let h = harness().await;
        let registry = Arc::new(ToolRegistry::with_builtins());
        let dispatcher = build_dispatcher(h.ctx.clone(), registry);
        let err = dispatcher
            .dispatch("tools/call", serde_json::json!({"arguments": {}}), request_ctx())
            .await
            .unwrap_err();
        assert_eq!(err.code, crate::rpc::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn unknown_argument_field_rejected() {
        let h = harness().await;
        let registry = Arc::new(ToolRegistry::with_builtins());
        let dispatcher = build_dispatcher(h.ctx.clone(), registry);
        let err = dispatcher
            .dispatch(
                "tools/call",
                serde_json::json!({
                    "name": "context.search",
                    "arguments": {"query": "Foo", "bogus_field": 1},
                }),
                request_ctx(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.code, crate::rpc::INVALID_PARAMS);
    }

    #[tokio::test]
    async fn tool_call_returns_structured_content() {
        let h = harness().await;
        let registry = Arc::new(ToolRegistry::with_builtins());
        let dispatcher = build_dispatcher(h.ctx.clone(), registry);
        let result = dispatcher
            .dispatch(
                "tools/call",
                serde_json::json!({
                    "name": "context.search",
                    "arguments": {"query": "Foo", "mode": "bm25"},
                }),
                request_ctx(),
            )
            .await
            .unwrap();
        assert!(result["content"][0]["text"].is_string());
        assert!(result["structuredContent"]["results"].is_array());
    }
}
