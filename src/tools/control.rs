//! `context.index_control` — index status and maintenance actions.
//!
//! `status` always works; `reindex` runs a full pass and `clear`
//! empties the store. `start`/`stop` (a background watcher) are not
//! part of the core and answer with a well-formed error.

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::tools::{optional_str, Tool, ToolContext};

pub struct IndexControlTool;

#[async_trait]
impl Tool for IndexControlTool {
    fn name(&self) -> &str {
        "context.index_control"
    }

    fn description(&self) -> &str {
        "Inspect and control the codebase index: status, reindex, clear."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ["status", "reindex", "clear", "start", "stop"],
                },
                "path": { "type": "string", "description": "Unused by status/clear; reserved" },
            },
            "required": ["action"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let action = optional_str(&params, "action")
            .ok_or_else(|| Error::invalid_params("action is required"))?;

        match action {
            "status" => {
                let stats = ctx.store.stats().await?;
                let files = ctx.store.file_paths(None).await?;
                let summary = ctx.indexer.last_summary();
                Ok(serde_json::json!({
                    "running": ctx.indexer.is_running(),
                    "chunk_count": stats.chunk_count,
                    "file_count": files.len(),
                    "dimension": stats.dimension,
                    "last_pass": summary,
                    "metrics": ctx.metrics.snapshot(),
                }))
            }
            "reindex" => {
                let cancel = crate::cancel::CancelToken::new();
                let summary = ctx.indexer.index_full(&cancel).await?;
                Ok(serde_json::json!({
                    "status": "ok",
                    "summary": summary,
                }))
            }
            "clear" => {
                ctx.store.clear().await?;
                Ok(serde_json::json!({
                    "status": "ok",
                    "message": "index cleared",
                }))
            }
            "start" | "stop" => Err(Error::invalid_params(format!(
                "action '{action}' is not supported by this server; use reindex for an on-demand pass"
            ))),
            other => Err(Error::invalid_params(format!("unknown action: {other}"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::testutil::harness;

    #[tokio::test]
    async fn status_reports_counts_and_running_flag() {
        let h = harness().await;
        let result = IndexControlTool
            .execute(serde_json::json!({"action": "status"}), &h.ctx)
            .await
            .unwrap();
        assert_eq!(result["running"], false);
        assert_eq!(result["file_count"], 2);
        assert!(result["chunk_count"].as_u64().unwrap() >= 2);
        assert!(result["last_pass"]["finished_at"].as_i64().unwrap() > 0);
    }

    #[tokio::test]
    async fn reindex_runs_a_pass() {
        let h = harness().await;
        let result = IndexControlTool
            .execute(serde_json::json!({"action": "reindex"}), &h.ctx)
            .await
            .unwrap();
        assert_eq!(result["status"], "ok");
        assert_eq!(result["summary"]["files_indexed"], 2);
    }

    #[tokio::test]
    async fn clear_empties_the_store() {
        let h = harness().await;
        IndexControlTool
            .execute(serde_json::json!({"action": "clear"}), &h.ctx)
            .await
            .unwrap();
        let stats = h.ctx.store.stats().await.unwrap();
        assert_eq!(stats.chunk_count, 0);
    }

    #[tokio::test]
    async fn unimplemented_actions_fail_cleanly() {
        let h = harness().await;
        for action in ["start", "stop"] {
            let err = IndexControlTool
                .execute(serde_json::json!({"action": action}), &h.ctx)
                .await
                .unwrap_err();
            assert_eq!(err.kind(), crate::error::ErrorKind::InvalidParams);
        }
    }

    #[tokio::test]
    async fn missing_action_rejected() {
        let h = harness().await;
        let err = IndexControlTool
            .execute(serde_json::json!({}), &h.ctx)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidParams);
    }
}
