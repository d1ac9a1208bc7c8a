//! Hybrid search: reciprocal rank fusion of BM25 and vector results.
//!
//! Each side is fetched at `max(limit, 60)` candidates, then fused:
//!
//! ```text
//! rrf(chunk) = α · 1/(k + rank_vec) + (1 − α) · 1/(k + rank_bm25)
//! ```
//!
//! with `k = 60` and 1-based ranks. A chunk missing from one list
//! contributes zero for that term. When only one of the query text /
//! query vector is supplied, the hybrid degenerates to that single
//! mode's results, scores included.

use std::collections::HashMap;

use crate::error::Result;
use crate::store::{SearchOptions, SearchResult, VectorStore};

/// RRF rank constant.
pub const RRF_K: f64 = 60.0;

impl VectorStore {
    /// Rank-fused search over `query_text` and/or `query_vector`.
    pub async fn search_hybrid(
        &self,
        query_text: Option<&str>,
        query_vector: Option<&[f32]>,
        opts: &SearchOptions,
    ) -> Result<Vec<SearchResult>> {
        if opts.limit == 0 {
            return Ok(Vec::new());
        }

        // Degenerate to the surviving single mode.
        match (query_text, query_vector) {
            (None, None) => return Ok(Vec::new()),
            (Some(text), None) => return self.search_bm25(text, opts).await,
            (None, Some(vector)) => return self.search_vector(vector, opts).await,
            (Some(_), Some(_)) => {}
        }
        let text = query_text.expect("checked above");
        let vector = query_vector.expect("checked above");

        let inner_limit = opts.limit.max(RRF_K as usize);
        let inner_opts = SearchOptions {
            limit: inner_limit,
            min_score: None,
            min_similarity: None,
            ..opts.clone()
        };

        let bm25 = self.search_bm25(text, &inner_opts).await?;
        let vec_results = self.search_vector(vector, &inner_opts).await?;

        let alpha = opts.alpha.clamp(0.0, 1.0);

        let mut fused: HashMap<String, (f64, SearchResult)> = HashMap::new();

        for (i, result) in vec_results.into_iter().enumerate() {
            let contribution = alpha / (RRF_K + (i + 1) as f64);
            fused.insert(result.chunk_id.clone(), (contribution, result));
        }
        for (i, result) in bm25.into_iter().enumerate() {
            let contribution = (1.0 - alpha) / (RRF_K + (i + 1) as f64);
            fused
                .entry(result.chunk_id.clone())
                .and_modify(|(score, _)| *score += contribution)
                .or_insert((contribution, result));
        }

        let mut results: Vec<SearchResult> = fused
            .into_values()
            .map(|(score, mut result)| {
                result.score = score;
                result
            })
            .collect();

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
    use crate::embedding::normalize;
    use crate::store::{test_chunk, SearchOptions, VectorStore};

    fn unit4(x: f32, y: f32, z: f32, w: f32) -> Vec<f32> {
        let mut v = vec![x, y, z, w];
        normalize(&mut v);
        v
    }

    /// Two chunks: one BM25-strong but vector-far, one vector-close but
    /// BM25-weak.
    async fn polarized_store() -> VectorStore {
        let store = VectorStore::open_in_memory(4).await.unwrap();
        store
            .upsert_batch(&[
                test_chunk(
                    "keyword-hit",
                    "deployment deployment deployment guide",
                    "a.md",
                    unit4(0.0, 0.0, 1.0, 0.0),
                ),
                test_chunk(
                    "vector-hit",
                    "notes on rolling out services",
                    "b.md",
                    unit4(1.0, 0.0, 0.0, 0.0),
                ),
            ])
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn fuses_both_lists() {
        let store = polarized_store().await;
        let results = store
            .search_hybrid(
                Some("deployment"),
                Some(&unit4(1.0, 0.05, 0.0, 0.0)),
                &SearchOptions {
                    limit: 2,
                    alpha: 0.5,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(results.len(), 2);
        let ids: Vec<&str> = results.iter().map(|r| r.chunk_id.as_str()).collect();
        assert!(ids.contains(&"keyword-hit"));
        assert!(ids.contains(&"vector-hit"));
    }

    #[tokio::test]
    async fn alpha_zero_matches_bm25_ordering() {
        let store = polarized_store().await;
        let query_vec = unit4(1.0, 0.0, 0.0, 0.0);
        let hybrid = store
            .search_hybrid(
                Some("deployment"),
                Some(&query_vec),
                &SearchOptions {
                    limit: 2,
                    alpha: 0.0,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let bm25 = store
            .search_bm25("deployment", &SearchOptions::default())
            .await
            .unwrap();
        // Chunks absent from the BM25 list contribute zero and sink.
        assert_eq!(hybrid[0].chunk_id, bm25[0].chunk_id);
    }

    #[tokio::test]
    async fn alpha_one_matches_vector_ordering() {
        let store = polarized_store().await;
        let query_vec = unit4(1.0, 0.0, 0.0, 0.0);
        let hybrid = store
            .search_hybrid(
                Some("deployment"),
                Some(&query_vec),
                &SearchOptions {
                    limit: 2,
                    alpha: 1.0,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        let vector = store
            .search_vector(&query_vec, &SearchOptions::default())
            .await
            .unwrap();
        assert_eq!(hybrid[0].chunk_id, vector[0].chunk_id);
    }

    #[tokio::test]
    async fn degenerates_to_bm25_without_vector() {
        let store = polarized_store().await;
        let opts = SearchOptions {
            limit: 5,
            ..Default::default()
        };
        let hybrid = store
            .search_hybrid(Some("deployment"), None, &opts)
            .await
            .unwrap();
        let bm25 = store.search_bm25("deployment", &opts).await.unwrap();
        assert_eq!(hybrid.len(), bm25.len());
        for (h, b) in hybrid.iter().zip(&bm25) {
            assert_eq!(h.chunk_id, b.chunk_id);
            assert_eq!(h.score, b.score);
        }
    }

    #[tokio::test]
    async fn degenerates_to_vector_without_text() {
        let store = polarized_store().await;
        let query_vec = unit4(1.0, 0.0, 0.0, 0.0);
        let opts = SearchOptions {
            limit: 5,
            ..Default::default()
        };
        let hybrid = store
            .search_hybrid(None, Some(&query_vec), &opts)
            .await
            .unwrap();
        let vector = store.search_vector(&query_vec, &opts).await.unwrap();
        assert_eq!(hybrid.len(), vector.len());
        for (h, v) in hybrid.iter().zip(&vector) {
            assert_eq!(h.chunk_id, v.chunk_id);
            assert_eq!(h.score, v.score);
        }
    }

    #[tokio::test]
    async fn no_inputs_is_empty() {
        let store = polarized_store().await;
        let results = store
            .search_hybrid(None, None, &SearchOptions::default())
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn dedups_by_id() {
        let store = VectorStore::open_in_memory(4).await.unwrap();
        store
            .upsert(&test_chunk(
                "both",
                "deployment notes",
                "a.md",
                unit4(1.0, 0.0, 0.0, 0.0),
            ))
            .await
            .unwrap();
        let results = store
            .search_hybrid(
                Some("deployment"),
                Some(&unit4(1.0, 0.0, 0.0, 0.0)),
                &SearchOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(results.len(), 1);
        // Rank 1 on both sides: alpha/(k+1) + (1-alpha)/(k+1) = 1/(k+1).
        assert!((results[0].score - 1.0 / 61.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn zero_limit_is_empty() {
        let store = polarized_store().await;
        let results = store
            .search_hybrid(
                Some("deployment"),
                Some(&unit4(1.0, 0.0, 0.0, 0.0)),
                &SearchOptions {
                    limit: 0,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(results.is_empty());
    }
}
