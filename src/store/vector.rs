//! Brute-force vector similarity search.
//!
//! Candidate rows (after the metadata pre-filter runs in SQL) stream
//! into a dot-product loop. Stored vectors are unit-length, so the dot
//! product is the cosine similarity. Acceptable up to roughly 10^4
//! chunks; the blob column stays opaque so an ANN index can replace
//! this scan without a schema change.

use sqlx::Row;

use crate::embedding::{blob_to_vec, dot};
use crate::error::{Error, Result};
use crate::store::{bind_filters, filter_sql, ChunkMetadata, SearchOptions, SearchResult, VectorStore};

impl VectorStore {
    /// Cosine-similarity search. Fails with `DimensionMismatch` when
    /// the query vector's length differs from the store dimension.
    /// Scores are similarities in `[-1, 1]`; ties break by id.
    pub async fn search_vector(
        &self,
        query_vector: &[f32],
        opts: &SearchOptions,
    ) -> Result<Vec<SearchResult>> {
        if query_vector.len() != self.dimension() {
            return Err(Error::dimension_mismatch(
                self.dimension(),
                query_vector.len(),
            ));
        }
        if opts.limit == 0 {
            return Ok(Vec::new());
        }

        let mut sql =
            String::from("SELECT c.id, c.content, c.vector, c.metadata FROM chunks c WHERE 1=1");
        filter_sql(opts, &mut sql);

        let mut query = sqlx::query(&sql);
        query = bind_filters(opts, query);

        let rows = query.fetch_all(self.pool()).await?;

        let mut results: Vec<SearchResult> = Vec::with_capacity(rows.len());
        for row in &rows {
            let blob: Vec<u8> = row.get("vector");
            let stored = blob_to_vec(&blob);
            if stored.len() != query_vector.len() {
                // Defunct row from a dimension change; never match it.
                continue;
            }
            let similarity = dot(query_vector, &stored) as f64;
            if let Some(min) = opts.min_similarity {
                if similarity < min {
                    continue;
                }
            }
            let metadata_json: String = row.get("metadata");
            let metadata: ChunkMetadata = serde_json::from_str(&metadata_json)
                .map_err(|e| Error::with_source(crate::error::ErrorKind::Storage, "corrupt chunk metadata", e))?;
            results.push(SearchResult {
                chunk_id: row.get("id"),
                content: row.get("content"),
                metadata,
                score: similarity,
                relation_type: None,
            });
        }

        results.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk_id.cmp(&b.chunk_id))
        });
        results.truncate(opts.limit);

        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use crate::store::{test_chunk, SearchOptions, VectorStore};

    fn unit4(x: f32, y: f32, z: f32, w: f32) -> Vec<f32> {
        let mut v = vec![x, y, z, w];
        crate::embedding::normalize(&mut v);
        v
    }

    async fn seeded_store() -> VectorStore {
        let store = VectorStore::open_in_memory(4).await.unwrap();
        store
            .upsert_batch(&[
                test_chunk("east", "east", "a.go", unit4(1.0, 0.0, 0.0, 0.0)),
                test_chunk("northeast", "northeast", "b.go", unit4(1.0, 1.0, 0.0, 0.0)),
                test_chunk("north", "north", "c.go", unit4(0.0, 1.0, 0.0, 0.0)),
                test_chunk("west", "west", "d.go", unit4(-1.0, 0.0, 0.0, 0.0)),
            ])
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn nearest_first() {
        let store = seeded_store().await;
        let results = store
            .search_vector(&unit4(1.0, 0.1, 0.0, 0.0), &SearchOptions::default())
            .await
            .unwrap();
        assert_eq!(results[0].chunk_id, "east");
        assert_eq!(results[1].chunk_id, "northeast");
        assert_eq!(results.last().unwrap().chunk_id, "west");
        for pair in results.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[tokio::test]
    async fn dimension_mismatch_rejected() {
        let store = seeded_store().await;
        let err = store
            .search_vector(&[1.0, 0.0], &SearchOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::DimensionMismatch);
    }

    #[tokio::test]
    async fn min_similarity_filters() {
        let store = seeded_store().await;
        let results = store
            .search_vector(
                &unit4(1.0, 0.0, 0.0, 0.0),
                &SearchOptions {
                    min_similarity: Some(0.5),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        assert!(results.iter().all(|r| r.score >= 0.5));
    }

    #[tokio::test]
    async fn limit_truncates() {
        let store = seeded_store().await;
        let results = store
            .search_vector(
                &unit4(1.0, 0.0, 0.0, 0.0),
                &SearchOptions {
                    limit: 2,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
    }

    #[tokio::test]
    async fn zero_limit_is_empty() {
        let store = seeded_store().await;
        let results = store
            .search_vector(
                &unit4(1.0, 0.0, 0.0, 0.0),
                &SearchOptions {
                    limit: 0,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn metadata_prefilter_applies() {
        let store = seeded_store().await;
        let results = store
            .search_vector(
                &unit4(1.0, 0.0, 0.0, 0.0),
                &SearchOptions {
                    file_path_glob: Some("b.*".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].chunk_id, "northeast");
    }

    #[tokio::test]
    async fn scores_within_cosine_range() {
        let store = seeded_store().await;
        let results = store
            .search_vector(&unit4(0.3, -0.7, 0.2, 0.1), &SearchOptions::default())
            .await
            .unwrap();
        assert!(results
            .iter()
            .all(|r| (-1.0 - 1e-6..=1.0 + 1e-6).contains(&r.score)));
    }
}
