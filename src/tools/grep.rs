//! `context.grep` — line-oriented scan of the live tree.
//!
//! Deliberately independent of the BM25/vector indexes: it reads files
//! as they are on disk right now, so it sees changes the index has not
//! caught up with.

use async_trait::async_trait;
use regex::RegexBuilder;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::pathsafe::validate_within_base;
use crate::tools::{optional_bool, optional_str, optional_usize, Tool, ToolContext};
use crate::walker::{walk, WalkOptions};

const DEFAULT_MAX_RESULTS: usize = 100;

pub struct GrepTool;

#[async_trait]
impl Tool for GrepTool {
    fn name(&self) -> &str {
        "context.grep"
    }

    fn description(&self) -> &str {
        "Scan files under the indexed root for lines matching a pattern (literal or regex)."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "pattern": { "type": "string" },
                "path": { "type": "string", "description": "Subdirectory to scan, relative to the root" },
                "regex": { "type": "boolean", "default": false },
                "case_sensitive": { "type": "boolean", "default": true },
                "max_results": { "type": "integer", "default": DEFAULT_MAX_RESULTS },
            },
            "required": ["pattern"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let pattern = optional_str(&params, "pattern").unwrap_or("");
        if pattern.is_empty() {
            return Err(Error::invalid_params("pattern must not be empty"));
        }
        let use_regex = optional_bool(&params, "regex").unwrap_or(false);
        let case_sensitive = optional_bool(&params, "case_sensitive").unwrap_or(true);
        let max_results = optional_usize(&params, "max_results").unwrap_or(DEFAULT_MAX_RESULTS);

        let scan_root = match optional_str(&params, "path") {
            Some(sub) => validate_within_base(std::path::Path::new(sub), &ctx.config.root_path)?,
            None => ctx.config.root_path.clone(),
        };
        if !scan_root.is_dir() {
            return Err(Error::not_found(format!(
                "path is not a directory: {}",
                scan_root.display()
            )));
        }

        let matcher = build_matcher(pattern, use_regex, case_sensitive)?;

        let files = walk(
            &scan_root,
            &WalkOptions {
                include: ctx.config.indexer.include_patterns.clone(),
                exclude: ctx.config.indexer.exclude_patterns.clone(),
                max_file_size: ctx.config.indexer.max_file_size,
            },
        )?;

        let mut matches = Vec::new();
        let mut truncated = false;

        'files: for file in &files {
            let Ok(content) = std::fs::read_to_string(&file.absolute_path) else {
                continue; // binary or unreadable
            };
            // Report paths relative to the indexed root, not the scan
            // subdirectory.
            let display_path = file
                .absolute_path
                .strip_prefix(&ctx.config.root_path)
                .map(|p| p.to_string_lossy().replace(std::path::MAIN_SEPARATOR, "/"))
                .unwrap_or_else(|_| file.relative_path.clone());

            for (idx, line) in content.lines().enumerate() {
                if matcher(line) {
                    if matches.len() >= max_results {
                        truncated = true;
                        break 'files;
                    }
                    matches.push(serde_json::json!({
                        "file_path": display_path,
                        "line_number": idx + 1,
                        "line": line,
                    }));
                }
            }
        }

        Ok(serde_json::json!({
            "matches": matches,
            "truncated": truncated,
        }))
    }
}

fn build_matcher(
    pattern: &str,
    use_regex: bool,
    case_sensitive: bool,
) -> Result<Box<dyn Fn(&str) -> bool + Send + Sync>> {
    if use_regex {
        let re = RegexBuilder::new(pattern)
            .case_insensitive(!case_sensitive)
            .build()
            .map_err(|e| Error::invalid_params(format!("invalid regex: {e}")))?;
        Ok(Box::new(move |line| re.is_match(line)))
    } else if case_sensitive {
        let needle = pattern.to_string();
        Ok(Box::new(move |line| line.contains(&needle)))
    } else {
        let needle = pattern.to_lowercase();
        Ok(Box::new(move |line| line.to_lowercase().contains(&needle)))
    }
}
