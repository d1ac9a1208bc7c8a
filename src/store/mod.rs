//! Single-file embedded vector store.
//!
//! Chunks, their metadata, a full-text mirror, and vector blobs live in
//! one SQLite database (WAL mode). Search comes in three modes:
//!
//! | Mode | Engine | Module |
//! |------|--------|--------|
//! | BM25 | FTS5 virtual table | [`fts`] |
//! | Vector | brute-force cosine over unit vectors | [`vector`] |
//! | Hybrid | reciprocal rank fusion of the two | [`hybrid`] |
//!
//! Writes serialize through SQLite's single-writer discipline; batch
//! upserts are one transaction so a crash leaves the store in the old
//! or the new state, never between. The store owns a fixed vector
//! dimension declared at open and persisted in the schema metadata.

pub mod fts;
pub mod hybrid;
mod migrate;
pub mod vector;

use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Row;

use crate::embedding::{blob_to_vec, vec_to_blob};
use crate::error::{Error, Result};

/// Chunk metadata persisted as JSON alongside the content and vector.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct ChunkMetadata {
    pub file_path: String,
    pub language: String,
    pub start_line: usize,
    pub end_line: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub symbols: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub imports: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_hash: Option<String>,
    /// Free-form fields preserved across round-trips.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// The unit of retrieval.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredChunk {
    /// Content-addressed id; unique within a store.
    pub id: String,
    pub content: String,
    /// L2-normalized, length equal to the store dimension.
    pub vector: Vec<f32>,
    pub metadata: ChunkMetadata,
}

/// A search hit.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResult {
    pub chunk_id: String,
    pub content: String,
    pub metadata: ChunkMetadata,
    pub score: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relation_type: Option<String>,
}

/// Options shared by the search modes.
#[derive(Debug, Clone)]
pub struct SearchOptions {
    /// Maximum results returned.
    pub limit: usize,
    /// BM25: drop results below this normalized score.
    pub min_score: Option<f64>,
    /// Vector: drop results below this similarity in `[-1, 1]`.
    pub min_similarity: Option<f64>,
    /// Metadata pre-filter: glob over `metadata.file_path`.
    pub file_path_glob: Option<String>,
    /// Metadata pre-filter: exact `metadata.language`.
    pub language: Option<String>,
    /// Metadata pre-filter: JSON-path equality pairs, e.g.
    /// `("commit_hash", "abc123")`.
    pub metadata_eq: Vec<(String, String)>,
    /// Hybrid weight on the vector list, in `[0, 1]`.
    pub alpha: f64,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            limit: 10,
            min_score: None,
            min_similarity: None,
            file_path_glob: None,
            language: None,
            metadata_eq: Vec::new(),
            alpha: 0.5,
        }
    }
}

/// Filter for [`VectorStore::list`].
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub file_path: Option<String>,
    pub language: Option<String>,
    pub limit: Option<usize>,
}

/// Aggregate store statistics.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub chunk_count: u64,
    pub dimension: usize,
}

/// Handle on the SQLite-backed store. Cheap to clone.
#[derive(Clone, Debug)]
pub struct VectorStore {
    pool: SqlitePool,
    dimension: usize,
}

impl VectorStore {
    /// Open (creating if missing) the store at `path` with the given
    /// vector dimension. Runs migrations and verifies the persisted
    /// schema version and dimension; a file written by a newer schema
    /// or a different dimension fails to open.
    pub async fn open(path: &Path, dimension: usize) -> Result<VectorStore> {
        if dimension == 0 {
            return Err(Error::invalid_params("store dimension must be > 0"));
        }
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))
            .map_err(|e| Error::with_source(crate::error::ErrorKind::Storage, "invalid database path", e))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        migrate::run(&pool, dimension).await?;

        Ok(VectorStore { pool, dimension })
    }

    /// In-memory store for tests.
    pub async fn open_in_memory(dimension: usize) -> Result<VectorStore> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| Error::with_source(crate::error::ErrorKind::Storage, "invalid database path", e))?;
        // A single pinned connection keeps every handle on the same
        // in-memory db; letting it idle out would drop the data.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        migrate::run(&pool, dimension).await?;
        Ok(VectorStore { pool, dimension })
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    /// Shared SQLite handle; sibling stores (connectors) and tests
    /// reuse the same file through it.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Flush and release the file. Safe to call more than once.
    pub async fn close(&self) {
        if !self.pool.is_closed() {
            self.pool.close().await;
        }
    }

    fn check_dimension(&self, vector: &[f32]) -> Result<()> {
        if vector.len() != self.dimension {
            return Err(Error::dimension_mismatch(self.dimension, vector.len()));
        }
        Ok(())
    }

    // ============ CRUD ============

    /// Insert or replace a chunk by id, keeping the FTS mirror in sync.
    /// The original `created_at` survives a replace.
    pub async fn upsert(&self, chunk: &StoredChunk) -> Result<()> {
        self.check_dimension(&chunk.vector)?;
        let mut tx = self.pool.begin().await?;
        upsert_in_tx(&mut tx, chunk).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Upsert many chunks in a single transaction: all rows apply or
    /// none do.
    pub async fn upsert_batch(&self, chunks: &[StoredChunk]) -> Result<()> {
        for chunk in chunks {
            self.check_dimension(&chunk.vector)?;
        }
        let mut tx = self.pool.begin().await?;
        for chunk in chunks {
            upsert_in_tx(&mut tx, chunk).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<StoredChunk> {
        let row = sqlx::query("SELECT id, content, vector, metadata FROM chunks WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::not_found(format!("chunk not found: {id}")))?;
        row_to_chunk(&row)
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let result = sqlx::query("DELETE FROM chunks WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        if result.rows_affected() == 0 {
            return Err(Error::not_found(format!("chunk not found: {id}")));
        }
        sqlx::query("DELETE FROM chunks_fts WHERE chunk_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    /// Replace every chunk for `file_path` with `chunks`, atomically:
    /// one transaction deletes the old rows and inserts the new ones,
    /// so a crash mid-pass leaves the file's chunks either old or new.
    pub async fn replace_file_chunks(
        &self,
        file_path: &str,
        chunks: &[StoredChunk],
    ) -> Result<()> {
        for chunk in chunks {
            self.check_dimension(&chunk.vector)?;
        }
        let mut tx = self.pool.begin().await?;

        // Drop only rows that are not being re-written; surviving ids
        // keep their created_at through the upsert's ON CONFLICT path.
        let placeholders = vec!["?"; chunks.len()].join(", ");
        let delete_sql = if chunks.is_empty() {
            "DELETE FROM chunks WHERE json_extract(metadata, '$.file_path') = ?".to_string()
        } else {
            format!(
                "DELETE FROM chunks WHERE json_extract(metadata, '$.file_path') = ? \
                 AND id NOT IN ({placeholders})"
            )
        };
        let fts_delete_sql = if chunks.is_empty() {
            "DELETE FROM chunks_fts WHERE chunk_id IN \
             (SELECT id FROM chunks WHERE json_extract(metadata, '$.file_path') = ?)"
                .to_string()
        } else {
            format!(
                "DELETE FROM chunks_fts WHERE chunk_id IN \
                 (SELECT id FROM chunks WHERE json_extract(metadata, '$.file_path') = ? \
                  AND id NOT IN ({placeholders}))"
            )
        };

        let mut fts_query = sqlx::query(&fts_delete_sql).bind(file_path);
        for chunk in chunks {
            fts_query = fts_query.bind(&chunk.id);
        }
        fts_query.execute(&mut *tx).await?;

        let mut delete_query = sqlx::query(&delete_sql).bind(file_path);
        for chunk in chunks {
            delete_query = delete_query.bind(&chunk.id);
        }
        delete_query.execute(&mut *tx).await?;

        for chunk in chunks {
            upsert_in_tx(&mut tx, chunk).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    /// Delete every chunk whose `metadata.file_path` equals `file_path`.
    /// Returns the number of chunks removed.
    pub async fn delete_by_file(&self, file_path: &str) -> Result<u64> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "DELETE FROM chunks_fts WHERE chunk_id IN \
             (SELECT id FROM chunks WHERE json_extract(metadata, '$.file_path') = ?)",
        )
        .bind(file_path)
        .execute(&mut *tx)
        .await?;
        let result = sqlx::query("DELETE FROM chunks WHERE json_extract(metadata, '$.file_path') = ?")
            .bind(file_path)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(result.rows_affected())
    }

    /// List chunks matching the filter, ordered by id.
    pub async fn list(&self, filter: &ListFilter) -> Result<Vec<StoredChunk>> {
        let mut sql = String::from("SELECT id, content, vector, metadata FROM chunks WHERE 1=1");
        if filter.file_path.is_some() {
            sql.push_str(" AND json_extract(metadata, '$.file_path') = ?");
        }
        if filter.language.is_some() {
            sql.push_str(" AND json_extract(metadata, '$.language') = ?");
        }
        sql.push_str(" ORDER BY id");
        if filter.limit.is_some() {
            sql.push_str(" LIMIT ?");
        }

        let mut query = sqlx::query(&sql);
        if let Some(ref fp) = filter.file_path {
            query = query.bind(fp);
        }
        if let Some(ref lang) = filter.language {
            query = query.bind(lang);
        }
        if let Some(limit) = filter.limit {
            query = query.bind(limit as i64);
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(row_to_chunk).collect()
    }

    /// Remove every chunk and its FTS mirror.
    pub async fn clear(&self) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM chunks_fts").execute(&mut *tx).await?;
        sqlx::query("DELETE FROM chunks").execute(&mut *tx).await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
            .fetch_one(&self.pool)
            .await?;
        Ok(StoreStats {
            chunk_count: count as u64,
            dimension: self.dimension,
        })
    }

    // ============ Relationship queries ============

    /// Chunks whose `metadata.file_path` equals `file_path`, in line
    /// order.
    pub async fn chunks_by_file(&self, file_path: &str) -> Result<Vec<StoredChunk>> {
        let rows = sqlx::query(
            "SELECT id, content, vector, metadata FROM chunks \
             WHERE json_extract(metadata, '$.file_path') = ? \
             ORDER BY json_extract(metadata, '$.start_line'), id",
        )
        .bind(file_path)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_chunk).collect()
    }

    /// Chunks whose `metadata.symbols` array contains `symbol`.
    pub async fn chunks_by_symbol(&self, symbol: &str) -> Result<Vec<StoredChunk>> {
        self.chunks_by_array_member("symbols", symbol).await
    }

    /// Chunks whose `metadata.imports` array contains `import`.
    pub async fn chunks_by_import(&self, import: &str) -> Result<Vec<StoredChunk>> {
        self.chunks_by_array_member("imports", import).await
    }

    /// Chunks whose `metadata.commit_hash` equals `commit_hash`.
    pub async fn chunks_by_commit(&self, commit_hash: &str) -> Result<Vec<StoredChunk>> {
        let rows = sqlx::query(
            "SELECT id, content, vector, metadata FROM chunks \
             WHERE json_extract(metadata, '$.commit_hash') = ? ORDER BY id",
        )
        .bind(commit_hash)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_chunk).collect()
    }

    async fn chunks_by_array_member(&self, field: &str, value: &str) -> Result<Vec<StoredChunk>> {
        let sql = format!(
            "SELECT id, content, vector, metadata FROM chunks c \
             WHERE EXISTS (SELECT 1 FROM json_each(json_extract(c.metadata, '$.{field}')) \
                           WHERE json_each.value = ?) \
             ORDER BY id"
        );
        let rows = sqlx::query(&sql)
            .bind(value)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_chunk).collect()
    }

    /// Distinct file paths present in the store, sorted, with optional
    /// prefix filter. Backs `resources/list`.
    pub async fn file_paths(&self, prefix: Option<&str>) -> Result<Vec<String>> {
        let rows = sqlx::query(
            "SELECT DISTINCT json_extract(metadata, '$.file_path') AS fp FROM chunks ORDER BY fp",
        )
        .fetch_all(&self.pool)
        .await?;
        let mut out = Vec::with_capacity(rows.len());
        for row in &rows {
            let fp: Option<String> = row.get("fp");
            if let Some(fp) = fp {
                if prefix.map(|p| fp.starts_with(p)).unwrap_or(true) {
                    out.push(fp);
                }
            }
        }
        Ok(out)
    }
}

async fn upsert_in_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
    chunk: &StoredChunk,
) -> Result<()> {
    let metadata_json = serde_json::to_string(&chunk.metadata)?;
    let blob = vec_to_blob(&chunk.vector);
    let now = chrono::Utc::now().timestamp();

    sqlx::query(
        "INSERT INTO chunks (id, content, vector, metadata, created_at) \
         VALUES (?, ?, ?, ?, ?) \
         ON CONFLICT(id) DO UPDATE SET \
           content = excluded.content, \
           vector = excluded.vector, \
           metadata = excluded.metadata",
    )
    .bind(&chunk.id)
    .bind(&chunk.content)
    .bind(&blob)
    .bind(&metadata_json)
    .bind(now)
    .execute(&mut **tx)
    .await?;

    sqlx::query("DELETE FROM chunks_fts WHERE chunk_id = ?")
        .bind(&chunk.id)
        .execute(&mut **tx)
        .await?;
    sqlx::query("INSERT INTO chunks_fts (chunk_id, content, symbols) VALUES (?, ?, ?)")
        .bind(&chunk.id)
        .bind(&chunk.content)
        .bind(chunk.metadata.symbols.join(" "))
        .execute(&mut **tx)
        .await?;

    Ok(())
}

fn row_to_chunk(row: &sqlx::sqlite::SqliteRow) -> Result<StoredChunk> {
    let metadata_json: String = row.get("metadata");
    let metadata: ChunkMetadata = serde_json::from_str(&metadata_json)
        .map_err(|e| Error::with_source(crate::error::ErrorKind::Storage, "corrupt chunk metadata", e))?;
    let blob: Vec<u8> = row.get("vector");
    Ok(StoredChunk {
        id: row.get("id"),
        content: row.get("content"),
        vector: blob_to_vec(&blob),
        metadata,
    })
}

/// Append the shared metadata pre-filter clauses to a query. Binds must
/// be applied in the same order by [`bind_filters`].
fn filter_sql(opts: &SearchOptions, sql: &mut String) {
    if opts.file_path_glob.is_some() {
        sql.push_str(" AND json_extract(c.metadata, '$.file_path') GLOB ?");
    }
    if opts.language.is_some() {
        sql.push_str(" AND json_extract(c.metadata, '$.language') = ?");
    }
    for _ in &opts.metadata_eq {
        sql.push_str(" AND json_extract(c.metadata, '$.' || ?) = ?");
    }
}

fn bind_filters<'q>(
    opts: &'q SearchOptions,
    mut query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    if let Some(ref glob) = opts.file_path_glob {
        query = query.bind(glob);
    }
    if let Some(ref lang) = opts.language {
        query = query.bind(lang);
    }
    for (key, value) in &opts.metadata_eq {
        query = query.bind(key).bind(value);
    }
    query
}

#[cfg(test)]
pub(crate) fn test_chunk(id: &str, content: &str, file_path: &str, vector: Vec<f32>) -> StoredChunk {
    StoredChunk {
        id: id.to_string(),
        content: content.to_string(),
        vector,
        metadata: ChunkMetadata {
            file_path: file_path.to_string(),
            language: "go".to_string(),
            start_line: 1,
            end_line: 1,
            ..Default::default()
        },
    }
}
