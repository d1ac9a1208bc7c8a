//! BM25 full-text search over the FTS5 mirror.
//!
//! User queries are rewritten into FTS5 MATCH syntax before they reach
//! the engine:
//!
//! | Input | Parsed |
//! |-------|--------|
//! | `hello` | `hello` |
//! | `hello world` | `hello AND world` |
//! | `"hello world"` | `"hello world"` |
//! | `"hello world" test` | `"hello world" AND test` |
//! | `hello OR world` | `hello OR world` |
//!
//! Double-quoted phrases stay atomic, explicit `AND`/`OR`/`NOT`
//! (case-insensitive) pass through verbatim and suppress the implicit
//! `AND`, and FTS meta-characters inside bare tokens are neutralized by
//! quoting the token.

use sqlx::Row;

use crate::error::Result;
use crate::store::{bind_filters, filter_sql, row_to_chunk, SearchOptions, SearchResult, VectorStore};

#[derive(Debug, PartialEq)]
enum Token {
    /// Bare word, possibly needing escaping.
    Word(String),
    /// Quoted phrase, kept atomic (without the surrounding quotes).
    Phrase(String),
    /// Explicit boolean operator, preserved verbatim.
    Operator(String),
}

fn tokenize(input: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
            continue;
        }
        if c == '"' {
            chars.next();
            let mut phrase = String::new();
            for ch in chars.by_ref() {
                if ch == '"' {
                    break;
                }
                phrase.push(ch);
            }
            tokens.push(Token::Phrase(phrase));
            continue;
        }
        let mut word = String::new();
        while let Some(&ch) = chars.peek() {
            if ch.is_whitespace() || ch == '"' {
                break;
            }
            word.push(ch);
            chars.next();
        }
        if word.eq_ignore_ascii_case("and")
            || word.eq_ignore_ascii_case("or")
            || word.eq_ignore_ascii_case("not")
        {
            tokens.push(Token::Operator(word));
        } else {
            tokens.push(Token::Word(word));
        }
    }

    tokens
}

fn needs_escaping(word: &str) -> bool {
    !word.chars().all(|c| c.is_alphanumeric() || c == '_')
}

/// Rewrite a user query into FTS5 MATCH syntax. Returns `None` for
/// queries with no searchable tokens.
pub fn build_fts_query(input: &str) -> Option<String> {
    let tokens = tokenize(input);
    if tokens.is_empty() {
        return None;
    }

    let mut parts: Vec<String> = Vec::with_capacity(tokens.len() * 2);
    let mut prev_was_term = false;

    for token in &tokens {
        match token {
            Token::Operator(op) => {
                parts.push(op.clone());
                prev_was_term = false;
            }
            Token::Word(word) => {
                if prev_was_term {
                    parts.push("AND".to_string());
                }
                if needs_escaping(word) {
                    parts.push(format!("\"{}\"", word.replace('"', "\"\"")));
                } else {
                    parts.push(word.clone());
                }
                prev_was_term = true;
            }
            Token::Phrase(phrase) => {
                if prev_was_term {
                    parts.push("AND".to_string());
                }
                parts.push(format!("\"{}\"", phrase.replace('"', "\"\"")));
                prev_was_term = true;
            }
        }
    }

    Some(parts.join(" "))
}

impl VectorStore {
    /// BM25 search over the full-text mirror.
    ///
    /// FTS5's `rank` is the negated BM25 relevance (more negative is
    /// better). The normalized score is `r / (1 + r)` for relevance
    /// `r = -rank` — equivalently `1 / (1 + 1/r)` — landing in
    /// `[0, 1)` with better matches higher. Ties break by id
    /// ascending.
    pub async fn search_bm25(
        &self,
        query: &str,
        opts: &SearchOptions,
    ) -> Result<Vec<SearchResult>> {
        if opts.limit == 0 {
            return Ok(Vec::new());
        }
        let Some(fts_query) = build_fts_query(query) else {
            return Ok(Vec::new());
        };

        let mut sql = String::from(
            "SELECT c.id, c.content, c.vector, c.metadata, chunks_fts.rank AS rank \
             FROM chunks_fts \
             JOIN chunks c ON c.id = chunks_fts.chunk_id \
             WHERE chunks_fts MATCH ?",
        );
        filter_sql(opts, &mut sql);
        sql.push_str(" ORDER BY chunks_fts.rank, c.id LIMIT ?");

        let mut query_builder = sqlx::query(&sql).bind(&fts_query);
        query_builder = bind_filters(opts, query_builder);
        query_builder = query_builder.bind(opts.limit as i64);

        let rows = match query_builder.fetch_all(self.pool()).await {
            Ok(rows) => rows,
            // FTS5 rejects queries it cannot parse (e.g. bare operators);
            // treat as no matches rather than a storage failure.
            Err(sqlx::Error::Database(e)) if e.message().contains("fts5") => {
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        let mut results = Vec::with_capacity(rows.len());
        for row in &rows {
            let rank: f64 = row.get("rank");
            let relevance = (-rank).max(0.0);
            let score = relevance / (1.0 + relevance);
            if let Some(min) = opts.min_score {
                if score < min {
                    continue;
                }
            }
            let chunk = row_to_chunk(row)?;
            results.push(SearchResult {
                chunk_id: chunk.id,
                content: chunk.content,
                metadata: chunk.metadata,
                score,
                relation_type: None,
            });
        }

        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });

        Ok(results)
    }
}
