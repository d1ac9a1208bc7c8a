//! `context.manage_connectors` — CRUD over external data source
//! descriptors, with the lifecycle hook chain run around every
//! transition.
//!
//! A connector whose init chain fails stays in the store with status
//! `inactive`: the row documents the attempt, and `list` surfaces the
//! failure instead of silently losing the operator's config.

use async_trait::async_trait;
use serde_json::Value;

use crate::connectors::{Connector, ConnectorStatus, ConnectorType};
use crate::error::{Error, Result};
use crate::tools::{optional_str, Tool, ToolContext};

pub struct ManageConnectorsTool;

#[async_trait]
impl Tool for ManageConnectorsTool {
    fn name(&self) -> &str {
        "context.manage_connectors"
    }

    fn description(&self) -> &str {
        "List, add, update, or remove external data source connectors."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "action": {
                    "type": "string",
                    "enum": ["list", "add", "update", "remove"],
                },
                "connector_id": { "type": "string" },
                "connector_config": {
                    "type": "object",
                    "properties": {
                        "name": { "type": "string" },
                        "type": {
                            "type": "string",
                            "enum": ["filesystem", "github", "slack", "jira", "discord"],
                        },
                        "status": { "type": "string", "enum": ["active", "inactive"] },
                        "config": { "type": "object" },
                    }
                },
            },
            "required": ["action"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let action = optional_str(&params, "action")
            .ok_or_else(|| Error::invalid_params("action is required"))?;

        match action {
            "list" => {
                let connectors = ctx.connectors.list().await?;
                Ok(serde_json::json!({
                    "status": "ok",
                    "connectors": connectors,
                }))
            }
            "add" => {
                let connector = parse_connector(&params)?;
                ctx.connectors.add(&connector).await?;

                if let Err(e) = ctx.hooks.initialize(&connector).await {
                    // Keep the row, mark it inactive, surface the error.
                    ctx.connectors
                        .set_status(&connector.id, ConnectorStatus::Inactive)
                        .await?;
                    return Err(e);
                }

                Ok(serde_json::json!({
                    "status": "ok",
                    "message": format!("connector '{}' added", connector.id),
                }))
            }
            "update" => {
                let connector = parse_connector(&params)?;
                let existing = ctx.connectors.get(&connector.id).await?;

                if let Err(e) = ctx.hooks.shutdown(&existing).await {
                    tracing::warn!(connector = %existing.id, error = %e, "shutdown before update reported errors");
                }
                ctx.connectors.update(&connector).await?;

                if let Err(e) = ctx.hooks.initialize(&connector).await {
                    ctx.connectors
                        .set_status(&connector.id, ConnectorStatus::Inactive)
                        .await?;
                    return Err(e);
                }

                Ok(serde_json::json!({
                    "status": "ok",
                    "message": format!("connector '{}' updated", connector.id),
                }))
            }
            "remove" => {
                let id = optional_str(&params, "connector_id")
                    .ok_or_else(|| Error::invalid_params("connector_id is required for remove"))?;
                let existing = ctx.connectors.get(id).await?;
                if let Err(e) = ctx.hooks.shutdown(&existing).await {
                    tracing::warn!(connector = %id, error = %e, "shutdown before remove reported errors");
                }
                ctx.connectors.remove(id).await?;
                Ok(serde_json::json!({
                    "status": "ok",
                    "message": format!("connector '{id}' removed"),
                }))
            }
            other => Err(Error::invalid_params(format!("unknown action: {other}"))),
        }
    }
}

fn parse_connector(params: &Value) -> Result<Connector> {
    let id = optional_str(params, "connector_id")
        .ok_or_else(|| Error::invalid_params("connector_id is required"))?;
    let config = params
        .get("connector_config")
        .and_then(|v| v.as_object())
        .ok_or_else(|| Error::invalid_params("connector_config is required"))?;

    let name = config
        .get("name")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::invalid_params("connector_config.name is required"))?;
    let type_str = config
        .get("type")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::invalid_params("connector_config.type is required"))?;
    let connector_type: ConnectorType = type_str.parse()?;

    let type_config = config
        .get("config")
        .and_then(|v| v.as_object())
        .cloned()
        .unwrap_or_default();

    let mut connector = Connector::new(id, name, connector_type, type_config);
    if let Some(status) = config.get("status").and_then(|v| v.as_str()) {
        connector.status = status.parse()?;
    }
    Ok(connector)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::testutil::harness;

    fn add_params(id: &str, root: &str) -> Value {
        serde_json::json!({
            "action": "add",
            "connector_id": id,
            "connector_config": {
                "name": "Local docs",
                "type": "filesystem",
                "config": {"root_path": root},
            },
        })
    }

    #[tokio::test]
    async fn add_then_list() {
        let h = harness().await;
        let root = h.ctx.config.root_path.to_string_lossy().to_string();
        ManageConnectorsTool
            .execute(add_params("fs-docs", &root), &h.ctx)
            .await
            .unwrap();

        let result = ManageConnectorsTool
            .execute(serde_json::json!({"action": "list"}), &h.ctx)
            .await
            .unwrap();
        let connectors = result["connectors"].as_array().unwrap();
        assert_eq!(connectors.len(), 1);
        assert_eq!(connectors[0]["id"], "fs-docs");
        assert_eq!(connectors[0]["status"], "active");
    }

    #[tokio::test]
    async fn failed_init_leaves_connector_inactive() {
        let h = harness().await;
        // Nonexistent root makes the built-in health check's post_init
        // fail after the row is stored.
        let err = ManageConnectorsTool
            .execute(add_params("fs-bad", "/nonexistent/conexus/root"), &h.ctx)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidParams);

        let result = ManageConnectorsTool
            .execute(serde_json::json!({"action": "list"}), &h.ctx)
            .await
            .unwrap();
        let connectors = result["connectors"].as_array().unwrap();
        assert_eq!(connectors.len(), 1);
        assert_eq!(connectors[0]["status"], "inactive");
    }

    #[tokio::test]
    async fn remove_requires_existing_id() {
        let h = harness().await;
        let err = ManageConnectorsTool
            .execute(
                serde_json::json!({"action": "remove", "connector_id": "ghost"}),
                &h.ctx,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ConnectorNotFound);
    }

    #[tokio::test]
    async fn add_update_remove_roundtrip() {
        let h = harness().await;
        let root = h.ctx.config.root_path.to_string_lossy().to_string();
        ManageConnectorsTool
            .execute(add_params("fs-docs", &root), &h.ctx)
            .await
            .unwrap();

        ManageConnectorsTool
            .execute(
                serde_json::json!({
                    "action": "update",
                    "connector_id": "fs-docs",
                    "connector_config": {
                        "name": "Renamed docs",
                        "type": "filesystem",
                        "config": {"root_path": root},
                    },
                }),
                &h.ctx,
            )
            .await
            .unwrap();

        let got = h.ctx.connectors.get("fs-docs").await.unwrap();
        assert_eq!(got.name, "Renamed docs");

        ManageConnectorsTool
            .execute(
                serde_json::json!({"action": "remove", "connector_id": "fs-docs"}),
                &h.ctx,
            )
            .await
            .unwrap();
        assert!(h.ctx.connectors.get("fs-docs").await.is_err());
    }

    #[tokio::test]
    async fn duplicate_add_surfaces_connector_exists() {
        let h = harness().await;
        let root = h.ctx.config.root_path.to_string_lossy().to_string();
        ManageConnectorsTool
            .execute(add_params("fs-docs", &root), &h.ctx)
            .await
            .unwrap();
        let err = ManageConnectorsTool
            .execute(add_params("fs-docs", &root), &h.ctx)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ConnectorExists);
    }

    #[tokio::test]
    async fn add_without_config_rejected() {
        let h = harness().await;
        let err = ManageConnectorsTool
            .execute(
                serde_json::json!({"action": "add", "connector_id": "x"}),
                &h.ctx,
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::InvalidParams);
    }
}
