//! `resources/list` and `resources/read` — the `codebase://` URI
//! surface.
//!
//! Listing pages over the distinct file paths in the store; reading
//! serves file bytes from disk, optionally a line range. Every path is
//! validated against the indexed root; an escaping path answers with
//! the server-specific path-escape code rather than the generic
//! invalid-params code, so clients can distinguish a traversal attempt
//! from a malformed argument.

use std::path::Path;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::ErrorKind;
use crate::pathsafe::validate_within_base;
use crate::rpc::{MethodHandler, RequestContext, RpcError, SERVER_PATH_ESCAPE};
use crate::tools::{optional_str, optional_usize, ToolContext};

const PAGE_SIZE: usize = 100;
const URI_SCHEME: &str = "codebase://";

pub struct ResourcesListHandler {
    pub ctx: std::sync::Arc<ToolContext>,
}

#[async_trait]
impl MethodHandler for ResourcesListHandler {
    async fn call(
        &self,
        params: Value,
        _rctx: RequestContext,
    ) -> std::result::Result<Value, RpcError> {
        let cursor: usize = optional_str(&params, "cursor")
            .map(|c| {
                c.parse()
                    .map_err(|_| RpcError::invalid_params(format!("invalid cursor: {c}")))
            })
            .transpose()?
            .unwrap_or(0);
        let prefix = optional_str(&params, "prefix");

        let paths = self
            .ctx
            .store
            .file_paths(prefix)
            .await
            .map_err(RpcError::from)?;

        let page: Vec<Value> = paths
            .iter()
            .skip(cursor)
            .take(PAGE_SIZE)
            .map(|path| {
                serde_json::json!({
                    "uri": format!("{URI_SCHEME}{path}"),
                    "name": path,
                    "mimeType": "text/plain",
                })
            })
            .collect();

        let mut response = serde_json::json!({ "resources": page });
        if cursor + PAGE_SIZE < paths.len() {
            response["nextCursor"] = Value::from((cursor + PAGE_SIZE).to_string());
        }
        Ok(response)
    }
}

pub struct ResourcesReadHandler {
    pub ctx: std::sync::Arc<ToolContext>,
}

#[async_trait]
impl MethodHandler for ResourcesReadHandler {
    async fn call(
        &self,
        params: Value,
        _rctx: RequestContext,
    ) -> std::result::Result<Value, RpcError> {
        let uri = optional_str(&params, "uri")
            .ok_or_else(|| RpcError::invalid_params("uri is required"))?;
        let relative = uri
            .strip_prefix(URI_SCHEME)
            .ok_or_else(|| RpcError::invalid_params(format!("unsupported URI scheme: {uri}")))?;

        let absolute = validate_within_base(Path::new(relative), &self.ctx.config.root_path)
            .map_err(|e| match e.kind() {
                ErrorKind::InvalidPath => RpcError::with_data(
                    SERVER_PATH_ESCAPE,
                    format!("path escapes the indexed root: {relative}"),
                    serde_json::json!({ "path": relative }),
                ),
                _ => RpcError::from(e),
            })?;

        let content = std::fs::read_to_string(&absolute).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                RpcError::with_data(
                    crate::rpc::SERVER_NOT_FOUND,
                    format!("resource not found: {uri}"),
                    serde_json::json!({ "path": relative }),
                )
            } else {
                RpcError::new(crate::rpc::INTERNAL_ERROR, format!("reading {relative}: {e}"))
            }
        })?;

        let start_line = optional_usize(&params, "start_line");
        let end_line = optional_usize(&params, "end_line");
        let text = match (start_line, end_line) {
            (None, None) => content,
            (start, end) => {
                let start = start.unwrap_or(1).max(1);
                let lines: Vec<&str> = content.lines().collect();
                let end = end.unwrap_or(lines.len()).min(lines.len());
                if start > end {
                    return Err(RpcError::invalid_params(format!(
                        "invalid line range: {start}-{end}"
                    )));
                }
                lines[start - 1..end].join("\n")
            }
        };

        Ok(serde_json::json!({
            "contents": [{
                "uri": uri,
                "mimeType": "text/plain",
                "text": text,
            }]
        }))
    }
}
