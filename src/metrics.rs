//! Instrumentation points.
//!
//! The core owns counters and latency histograms; how they are exposed
//! (Prometheus, logs, nothing) is the embedding host's business. All
//! counters are atomics, safe to bump from any task.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

/// Histogram bucket upper bounds, in milliseconds.
const LATENCY_BUCKETS_MS: &[u64] = &[1, 5, 10, 25, 50, 100, 250, 500, 1000, 2500, 5000, 10_000];

struct Histogram {
    buckets: Vec<u64>,
    count: u64,
    sum_ms: u64,
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

impl Histogram {
    fn new() -> Self {
        Self {
            buckets: vec![0; LATENCY_BUCKETS_MS.len() + 1],
            count: 0,
            sum_ms: 0,
        }
    }

    fn observe(&mut self, duration: Duration) {
        let ms = duration.as_millis() as u64;
        let idx = LATENCY_BUCKETS_MS
            .iter()
            .position(|&bound| ms <= bound)
            .unwrap_or(LATENCY_BUCKETS_MS.len());
        self.buckets[idx] += 1;
        self.count += 1;
        self.sum_ms += ms;
    }
}

/// Counters and histograms for the whole server. One instance per
/// server object graph; tests construct their own.
#[derive(Default)]
pub struct Metrics {
    requests_by_method: Mutex<HashMap<String, u64>>,
    errors_by_code: Mutex<HashMap<i64, u64>>,
    request_latency: Mutex<HashMap<String, Histogram>>,
    indexing_latency: Mutex<Histogram>,

    pub indexed_files: AtomicU64,
    pub indexed_chunks: AtomicU64,
    pub indexed_bytes: AtomicU64,
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_request(&self, method: &str) {
        let mut map = self.requests_by_method.lock().expect("metrics lock");
        *map.entry(method.to_string()).or_insert(0) += 1;
    }

    pub fn record_error(&self, code: i64) {
        let mut map = self.errors_by_code.lock().expect("metrics lock");
        *map.entry(code).or_insert(0) += 1;
    }

    pub fn record_request_latency(&self, method: &str, duration: Duration) {
        let mut map = self.request_latency.lock().expect("metrics lock");
        map.entry(method.to_string())
            .or_insert_with(Histogram::new)
            .observe(duration);
    }

    pub fn record_file_indexed(&self, bytes: u64, chunks: u64, duration: Duration) {
        self.indexed_files.fetch_add(1, Ordering::Relaxed);
        self.indexed_chunks.fetch_add(chunks, Ordering::Relaxed);
        self.indexed_bytes.fetch_add(bytes, Ordering::Relaxed);
        let mut hist = self.indexing_latency.lock().expect("metrics lock");
        hist.observe(duration);
    }

    /// Point-in-time snapshot for status reporting.
    pub fn snapshot(&self) -> serde_json::Value {
        let requests = self.requests_by_method.lock().expect("metrics lock");
        let errors = self.errors_by_code.lock().expect("metrics lock");
        let latency = self.request_latency.lock().expect("metrics lock");
        let indexing = self.indexing_latency.lock().expect("metrics lock");

        let latency_json: HashMap<&str, serde_json::Value> = latency
            .iter()
            .map(|(method, h)| {
                (
                    method.as_str(),
                    serde_json::json!({"count": h.count, "sum_ms": h.sum_ms}),
                )
            })
            .collect();
        let errors_json: HashMap<String, u64> =
            errors.iter().map(|(code, n)| (code.to_string(), *n)).collect();

        serde_json::json!({
            "requests_by_method": *requests,
            "errors_by_code": errors_json,
            "request_latency": latency_json,
            "indexing": {
                "files": self.indexed_files.load(Ordering::Relaxed),
                "chunks": self.indexed_chunks.load(Ordering::Relaxed),
                "bytes": self.indexed_bytes.load(Ordering::Relaxed),
                "per_file_latency": {"count": indexing.count, "sum_ms": indexing.sum_ms},
            },
            "cache": {
                "hits": self.cache_hits.load(Ordering::Relaxed),
                "misses": self.cache_misses.load(Ordering::Relaxed),
            },
        })
    }
}
