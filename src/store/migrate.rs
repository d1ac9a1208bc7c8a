//! Schema creation and version checks.
//!
//! All DDL is idempotent; `run` executes on every open. The schema
//! version and vector dimension persist in `schema_meta`, and opening a
//! file written by a newer schema — or with a different dimension —
//! fails rather than guessing.

use sqlx::SqlitePool;

use crate::error::{Error, Result};

/// Current schema version. Bump on incompatible layout changes.
pub const SCHEMA_VERSION: i64 = 1;

pub async fn run(pool: &SqlitePool, dimension: usize) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS schema_meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    check_meta(pool, "version", &SCHEMA_VERSION.to_string(), |found| {
        format!("store schema version {found} is newer than supported {SCHEMA_VERSION}")
    })
    .await?;
    check_meta(pool, "dimension", &dimension.to_string(), |found| {
        format!("store has dimension {found}, configured dimension is {dimension}")
    })
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS chunks (
            id TEXT PRIMARY KEY,
            content TEXT NOT NULL,
            vector BLOB NOT NULL,
            metadata TEXT NOT NULL DEFAULT '{}',
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // FTS5 CREATE VIRTUAL TABLE is not idempotent; probe first.
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='chunks_fts'",
    )
    .fetch_one(pool)
    .await?;
    // Symbols are indexed alongside content so a definition chunk
    // outranks chunks that merely mention the name.
    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE chunks_fts USING fts5(
                chunk_id UNINDEXED,
                content,
                symbols
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS connectors (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            type TEXT NOT NULL,
            status TEXT NOT NULL,
            config TEXT NOT NULL DEFAULT '{}',
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_chunks_file_path \
         ON chunks(json_extract(metadata, '$.file_path'))",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_chunks_language \
         ON chunks(json_extract(metadata, '$.language'))",
    )
    .execute(pool)
    .await?;

    Ok(())
}

/// Insert `expected` for `key` when absent; error when a different
/// value is already persisted.
async fn check_meta(
    pool: &SqlitePool,
    key: &str,
    expected: &str,
    message: impl Fn(&str) -> String,
) -> Result<()> {
    let existing: Option<String> = sqlx::query_scalar("SELECT value FROM schema_meta WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?;

    match existing {
        Some(found) if found != expected => Err(Error::storage(message(&found))),
        Some(_) => Ok(()),
        None => {
            sqlx::query("INSERT INTO schema_meta (key, value) VALUES (?, ?)")
                .bind(key)
                .bind(expected)
                .execute(pool)
                .await?;
            Ok(())
        }
    }
}
