//! `context.search` — semantic / keyword / hybrid search over the
//! indexed codebase.

use async_trait::async_trait;
use chrono::NaiveDate;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::store::{SearchOptions, SearchResult};
use crate::tools::{optional_str, optional_usize, Tool, ToolContext};

pub struct SearchTool;

#[async_trait]
impl Tool for SearchTool {
    fn name(&self) -> &str {
        "context.search"
    }

    fn description(&self) -> &str {
        "Search indexed code and documentation. Modes: bm25 (keyword), vector (semantic), hybrid (rank-fused, default)."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "Search query" },
                "mode": { "type": "string", "enum": ["bm25", "vector", "hybrid"] },
                "top_k": { "type": "integer", "description": "Max results per page", "default": 10 },
                "offset": { "type": "integer", "description": "Pagination offset", "default": 0 },
                "alpha": { "type": "number", "description": "Hybrid weight on the vector list, in [0, 1]", "default": 0.5 },
                "filters": {
                    "type": "object",
                    "properties": {
                        "file_types": { "type": "array", "items": { "type": "string" } },
                        "path_pattern": { "type": "string", "description": "Glob over file paths" },
                        "date_range": {
                            "type": "object",
                            "properties": {
                                "from": { "type": "string" },
                                "to": { "type": "string" }
                            }
                        }
                    }
                },
                "work_context": {
                    "type": "object",
                    "properties": {
                        "active_file": { "type": "string" },
                        "git_branch": { "type": "string" },
                        "open_ticket_ids": { "type": "array", "items": { "type": "string" } }
                    }
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let query = optional_str(&params, "query").unwrap_or("");
        if query.trim().is_empty() {
            return Err(Error::invalid_params("query must not be empty"));
        }

        let mode = optional_str(&params, "mode")
            .unwrap_or(&ctx.config.search.default_mode)
            .to_string();
        match mode.as_str() {
            "bm25" | "vector" | "hybrid" => {}
            other => {
                return Err(Error::invalid_params(format!(
                    "unknown search mode: {other} (use bm25, vector, or hybrid)"
                )))
            }
        }

        let top_k = optional_usize(&params, "top_k").unwrap_or(ctx.config.search.default_top_k);
        let offset = optional_usize(&params, "offset").unwrap_or(0);
        let alpha = params
            .get("alpha")
            .and_then(|v| v.as_f64())
            .unwrap_or(0.5);
        if !(0.0..=1.0).contains(&alpha) {
            return Err(Error::invalid_params("alpha must be in [0, 1]"));
        }

        if top_k == 0 {
            return Ok(serde_json::json!({
                "results": [],
                "mode": mode,
                "offset": offset,
                "limit": 0,
                "has_more": false,
            }));
        }

        let filters = params.get("filters").cloned().unwrap_or(Value::Null);
        let path_pattern = filters
            .get("path_pattern")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string());
        let file_types: Vec<String> = filters
            .get("file_types")
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str())
                    .map(|s| s.trim_start_matches('.').to_lowercase())
                    .collect()
            })
            .unwrap_or_default();
        let (date_from, date_to) = parse_date_range(filters.get("date_range"))?;

        // Oversample by one beyond the requested page so has_more falls
        // out of a length comparison.
        let inner_limit = offset + top_k + 1;
        let opts = SearchOptions {
            limit: inner_limit,
            file_path_glob: path_pattern,
            alpha,
            ..Default::default()
        };

        let mut results = match mode.as_str() {
            "bm25" => ctx.store.search_bm25(query, &opts).await?,
            "vector" => {
                let query_vector = ctx.embedder.embed(query).await?;
                ctx.store.search_vector(&query_vector, &opts).await?
            }
            _ => {
                let query_vector = ctx.embedder.embed(query).await?;
                ctx.store
                    .search_hybrid(Some(query), Some(&query_vector), &opts)
                    .await?
            }
        };

        if !file_types.is_empty() {
            results.retain(|r| {
                std::path::Path::new(&r.metadata.file_path)
                    .extension()
                    .map(|e| file_types.contains(&e.to_string_lossy().to_lowercase()))
                    .unwrap_or(false)
            });
        }
        if date_from.is_some() || date_to.is_some() {
            results.retain(|r| {
                let mtime = r
                    .metadata
                    .extra
                    .get("mtime")
                    .and_then(|v| v.as_i64())
                    .unwrap_or(0);
                date_from.map(|from| mtime >= from).unwrap_or(true)
                    && date_to.map(|to| mtime <= to).unwrap_or(true)
            });
        }

        let has_more = results.len() > offset + top_k;
        let page: Vec<&SearchResult> = results.iter().skip(offset).take(top_k).collect();

        Ok(serde_json::json!({
            "results": page,
            "mode": mode,
            "offset": offset,
            "limit": top_k,
            "has_more": has_more,
        }))
    }
}

/// Parse `{from, to}` as `YYYY-MM-DD` dates into epoch-second bounds.
fn parse_date_range(range: Option<&Value>) -> Result<(Option<i64>, Option<i64>)> {
    let Some(range) = range.filter(|v| v.is_object()) else {
        return Ok((None, None));
    };
    let parse = |key: &str, end_of_day: bool| -> Result<Option<i64>> {
        match range.get(key).and_then(|v| v.as_str()) {
            None => Ok(None),
            Some(raw) => {
                let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| {
                    Error::invalid_params(format!("invalid date '{raw}', expected YYYY-MM-DD"))
                })?;
                let time = if end_of_day {
                    date.and_hms_opt(23, 59, 59)
                } else {
                    date.and_hms_opt(0, 0, 0)
                };
                Ok(time.map(|t| t.and_utc().timestamp()))
            }
        }
    };
    Ok((parse("from", false)?, parse("to", true)?))
}
