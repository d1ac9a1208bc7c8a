//! `context.explain` — assemble an explanation bundle for a file or a
//! symbol.
//!
//! Not a summarizer: it gathers the raw material an assistant needs to
//! explain code — the file's chunks in order, its defined symbols and
//! imports, where those symbols are referenced, and the closest chunks
//! by hybrid search.

use std::collections::BTreeSet;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{Error, Result};
use crate::pathsafe::is_path_safe;
use crate::store::SearchOptions;
use crate::tools::{optional_str, optional_usize, Tool, ToolContext};

const DEFAULT_CONTEXT_CHUNKS: usize = 5;

pub struct ExplainTool;

#[async_trait]
impl Tool for ExplainTool {
    fn name(&self) -> &str {
        "context.explain"
    }

    fn description(&self) -> &str {
        "Gather everything needed to explain a file or symbol: its chunks, symbols, imports, reference sites, and nearby context."
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "file_path": { "type": "string", "description": "File to explain, relative to the indexed root" },
                "symbol": { "type": "string", "description": "Symbol to explain (function, type, class)" },
                "context_chunks": { "type": "integer", "default": DEFAULT_CONTEXT_CHUNKS },
            }
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let file_path = optional_str(&params, "file_path");
        let symbol = optional_str(&params, "symbol");
        let context_chunks =
            optional_usize(&params, "context_chunks").unwrap_or(DEFAULT_CONTEXT_CHUNKS);

        match (file_path, symbol) {
            (Some(path), None) => self.explain_file(path, context_chunks, ctx).await,
            (None, Some(symbol)) => self.explain_symbol(symbol, context_chunks, ctx).await,
            _ => Err(Error::invalid_params(
                "provide exactly one of file_path or symbol",
            )),
        }
    }
}

impl ExplainTool {
    async fn explain_file(
        &self,
        file_path: &str,
        context_chunks: usize,
        ctx: &ToolContext,
    ) -> Result<Value> {
        if !is_path_safe(file_path) {
            return Err(Error::invalid_path(format!("invalid path: {file_path}")));
        }

        let chunks = ctx.store.chunks_by_file(file_path).await?;
        if chunks.is_empty() {
            return Err(Error::not_found(format!(
                "file is not in the index: {file_path}"
            )));
        }

        let symbols: BTreeSet<&String> =
            chunks.iter().flat_map(|c| c.metadata.symbols.iter()).collect();
        let imports: BTreeSet<&String> =
            chunks.iter().flat_map(|c| c.metadata.imports.iter()).collect();
        let language = chunks[0].metadata.language.clone();

        // Where this file's symbols are used elsewhere.
        let mut reference_sites = Vec::new();
        for symbol in &symbols {
            for chunk in ctx.store.chunks_by_symbol(symbol).await? {
                if chunk.metadata.file_path != file_path {
                    reference_sites.push(serde_json::json!({
                        "symbol": symbol,
                        "file_path": chunk.metadata.file_path,
                        "lines": format!("{}-{}", chunk.metadata.start_line, chunk.metadata.end_line),
                    }));
                }
            }
        }

        let nearby = self
            .nearby_context(&symbols.iter().map(|s| s.as_str()).collect::<Vec<_>>().join(" "), file_path, context_chunks, ctx)
            .await?;

        let chunk_views: Vec<Value> = chunks
            .iter()
            .map(|c| {
                serde_json::json!({
                    "chunk_id": c.id,
                    "lines": format!("{}-{}", c.metadata.start_line, c.metadata.end_line),
                    "content": c.content,
                })
            })
            .collect();

        Ok(serde_json::json!({
            "subject": file_path,
            "language": language,
            "chunks": chunk_views,
            "symbols": symbols,
            "imports": imports,
            "reference_sites": reference_sites,
            "nearby_context": nearby,
        }))
    }

    async fn explain_symbol(
        &self,
        symbol: &str,
        context_chunks: usize,
        ctx: &ToolContext,
    ) -> Result<Value> {
        if symbol.trim().is_empty() {
            return Err(Error::invalid_params("symbol must not be empty"));
        }

        let definitions = ctx.store.chunks_by_symbol(symbol).await?;
        if definitions.is_empty() {
            return Err(Error::not_found(format!("symbol not found: {symbol}")));
        }

        let definition_views: Vec<Value> = definitions
            .iter()
            .map(|c| {
                serde_json::json!({
                    "chunk_id": c.id,
                    "file_path": c.metadata.file_path,
                    "lines": format!("{}-{}", c.metadata.start_line, c.metadata.end_line),
                    "content": c.content,
                })
            })
            .collect();

        let defined_in: BTreeSet<&str> = definitions
            .iter()
            .map(|c| c.metadata.file_path.as_str())
            .collect();
        let nearby = self.nearby_context(symbol, "", context_chunks, ctx).await?;

        Ok(serde_json::json!({
            "subject": symbol,
            "defined_in": defined_in,
            "definitions": definition_views,
            "nearby_context": nearby,
        }))
    }

    /// Top hybrid-search hits for `query`, excluding `exclude_file`.
    async fn nearby_context(
        &self,
        query: &str,
        exclude_file: &str,
        limit: usize,
        ctx: &ToolContext,
    ) -> Result<Vec<Value>> {
        if query.trim().is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let query_vector = ctx.embedder.embed(query).await?;
        let hits = ctx
            .store
            .search_hybrid(
                Some(query),
                Some(&query_vector),
                &SearchOptions {
                    limit: limit + 1,
                    ..Default::default()
                },
            )
            .await?;
        Ok(hits
            .into_iter()
            .filter(|h| h.metadata.file_path != exclude_file)
            .take(limit)
            .map(|h| {
                serde_json::json!({
                    "chunk_id": h.chunk_id,
                    "file_path": h.metadata.file_path,
                    "score": h.score,
                    "content": h.content,
                })
            })
            .collect())
    }
}
