//! Indexing passes.
//!
//! The indexer walks the root, detects changes with a Merkle snapshot,
//! and pushes chunk batches through the embedder into the store:
//!
//! ```text
//! walk → merkle diff → read → chunk → embed → upsert (one tx per file)
//! ```
//!
//! Files process in parallel up to a configured limit; chunks within a
//! file are written in source order. Per-file failures are collected in
//! the pass summary rather than aborting, while store-level failures
//! and cancellation abort the pass and leave the persisted snapshot
//! untouched. The snapshot file itself is replaced with
//! write-temp-then-rename only after every store write committed.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::Semaphore;

use crate::cancel::CancelToken;
use crate::chunker::{chunk_file, ChunkOptions, Language};
use crate::embedding::Embedder;
use crate::error::{Error, ErrorKind, Result};
use crate::merkle::MerkleTree;
use crate::metrics::Metrics;
use crate::pathsafe::validate_within_base;
use crate::store::{ChunkMetadata, StoredChunk, VectorStore};
use crate::walker::WalkOptions;

/// On-disk snapshot format version.
const STATE_VERSION: u32 = 1;

/// Indexer configuration.
#[derive(Debug, Clone)]
pub struct IndexerOptions {
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    pub max_file_size: u64,
    pub chunk: ChunkOptions,
    /// Maximum files processed concurrently.
    pub parallelism: usize,
    /// Where the Merkle snapshot persists between runs.
    pub state_path: PathBuf,
}

impl IndexerOptions {
    fn walk_options(&self) -> WalkOptions {
        WalkOptions {
            include: self.include.clone(),
            exclude: self.exclude.clone(),
            max_file_size: self.max_file_size,
        }
    }
}

/// Per-file bookkeeping maintained across a pass.
#[derive(Debug, Clone, Serialize)]
pub struct FileState {
    pub file_path: String,
    pub content_hash: String,
    pub size: u64,
    pub mod_time: i64,
    pub chunk_ids: Vec<String>,
}

/// Outcome of one pass.
#[derive(Debug, Clone, Serialize, Default)]
pub struct IndexSummary {
    pub files_indexed: u64,
    pub files_removed: u64,
    pub chunks_written: u64,
    /// `(path, error)` for files skipped by non-fatal failures.
    pub files_failed: Vec<(String, String)>,
    pub duration_ms: u64,
    pub finished_at: i64,
}

#[derive(Serialize, Deserialize)]
struct PersistedState {
    version: u32,
    tree: MerkleTree,
}

/// Composes the walker, Merkle tree, chunker, embedder, and store into
/// full and incremental passes. One pass runs at a time; a concurrent
/// attempt fails with `Busy`.
pub struct Indexer {
    root: PathBuf,
    store: VectorStore,
    embedder: Arc<dyn Embedder>,
    metrics: Arc<Metrics>,
    opts: IndexerOptions,
    busy: AtomicBool,
    file_states: Mutex<HashMap<String, FileState>>,
    last_summary: Mutex<Option<IndexSummary>>,
}

/// Clears the busy flag on every exit path.
struct BusyGuard<'a>(&'a AtomicBool);

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

impl Indexer {
    pub fn new(
        root: &Path,
        store: VectorStore,
        embedder: Arc<dyn Embedder>,
        metrics: Arc<Metrics>,
        opts: IndexerOptions,
    ) -> Result<Indexer> {
        let root = root
            .canonicalize()
            .map_err(|e| Error::with_source(ErrorKind::InvalidPath, format!("cannot resolve root: {}", root.display()), e))?;
        Ok(Indexer {
            root,
            store,
            embedder,
            metrics,
            opts,
            busy: AtomicBool::new(false),
            file_states: Mutex::new(HashMap::new()),
            last_summary: Mutex::new(None),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn is_running(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    pub fn last_summary(&self) -> Option<IndexSummary> {
        self.last_summary.lock().expect("summary lock").clone()
    }

    pub fn file_state(&self, path: &str) -> Option<FileState> {
        self.file_states.lock().expect("state lock").get(path).cloned()
    }

    /// Re-process every file under the root.
    pub async fn index_full(&self, cancel: &CancelToken) -> Result<IndexSummary> {
        let _guard = self.acquire()?;
        let started = Instant::now();

        let tree = MerkleTree::build(&self.root, &self.opts.walk_options())?;
        let paths = tree.file_paths();
        let summary = self.process_files(&paths, &[], cancel).await?;

        self.persist_state(&tree)?;
        Ok(self.finish(summary, started))
    }

    /// Process only paths whose Merkle hash changed since the last
    /// persisted snapshot. Falls back to a full pass when no snapshot
    /// exists.
    pub async fn index_incremental(&self, cancel: &CancelToken) -> Result<IndexSummary> {
        let Some(previous) = self.load_state()? else {
            return self.index_full(cancel).await;
        };

        let _guard = self.acquire()?;
        let started = Instant::now();

        let tree = MerkleTree::build(&self.root, &self.opts.walk_options())?;
        let changed = MerkleTree::diff(&previous, &tree);

        let mut to_index = Vec::new();
        let mut to_remove = Vec::new();
        for path in changed {
            if tree.file_hash(&path).is_some() {
                to_index.push(path);
            } else {
                to_remove.push(path);
            }
        }

        let summary = self.process_files(&to_index, &to_remove, cancel).await?;

        self.persist_state(&tree)?;
        Ok(self.finish(summary, started))
    }

    fn acquire(&self) -> Result<BusyGuard<'_>> {
        if self
            .busy
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::busy("an indexing pass is already running"));
        }
        Ok(BusyGuard(&self.busy))
    }

    fn finish(&self, mut summary: IndexSummary, started: Instant) -> IndexSummary {
        summary.duration_ms = started.elapsed().as_millis() as u64;
        summary.finished_at = chrono::Utc::now().timestamp();
        *self.last_summary.lock().expect("summary lock") = Some(summary.clone());
        summary
    }

    async fn process_files(
        &self,
        to_index: &[String],
        to_remove: &[String],
        cancel: &CancelToken,
    ) -> Result<IndexSummary> {
        let mut summary = IndexSummary::default();

        for path in to_remove {
            cancel.check()?;
            self.store.delete_by_file(path).await?;
            self.file_states.lock().expect("state lock").remove(path);
            summary.files_removed += 1;
            tracing::debug!(path = %path, "removed deleted file from store");
        }

        let semaphore = Arc::new(Semaphore::new(self.opts.parallelism.max(1)));
        let mut join_set = tokio::task::JoinSet::new();

        for path in to_index {
            cancel.check()?;
            let permit = semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| Error::canceled("indexer semaphore closed"))?;
            let task = FileTask {
                root: self.root.clone(),
                relative_path: path.clone(),
                store: self.store.clone(),
                embedder: self.embedder.clone(),
                metrics: self.metrics.clone(),
                chunk_opts: self.opts.chunk.clone(),
                cancel: cancel.clone(),
            };
            join_set.spawn(async move {
                let _permit = permit;
                let path = task.relative_path.clone();
                (path, task.run().await)
            });
        }

        while let Some(joined) = join_set.join_next().await {
            let (path, outcome) = joined
                .map_err(|e| Error::with_source(ErrorKind::Internal, "indexing task panicked", e))?;
            match outcome {
                Ok(FileOutcome { state, chunk_count }) => {
                    summary.files_indexed += 1;
                    summary.chunks_written += chunk_count;
                    self.file_states
                        .lock()
                        .expect("state lock")
                        .insert(path, state);
                }
                // Store corruption or cancellation aborts the pass; the
                // persisted snapshot is never advanced.
                Err(e) if matches!(e.kind(), ErrorKind::Storage | ErrorKind::Canceled) => {
                    join_set.abort_all();
                    return Err(e);
                }
                Err(e) => {
                    tracing::warn!(path = %path, error = %e, "file skipped during indexing");
                    summary.files_failed.push((path, e.to_string()));
                }
            }
        }

        cancel.check()?;
        Ok(summary)
    }

    fn persist_state(&self, tree: &MerkleTree) -> Result<()> {
        let state = PersistedState {
            version: STATE_VERSION,
            tree: tree.clone(),
        };
        let json = serde_json::to_string(&state)?;

        if let Some(parent) = self.opts.state_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let tmp_path = self.opts.state_path.with_extension("tmp");
        std::fs::write(&tmp_path, &json)?;
        std::fs::rename(&tmp_path, &self.opts.state_path)?;
        Ok(())
    }

    fn load_state(&self) -> Result<Option<MerkleTree>> {
        let data = match std::fs::read_to_string(&self.opts.state_path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let state: PersistedState = serde_json::from_str(&data)
            .map_err(|e| Error::with_source(ErrorKind::Storage, "corrupt indexer state file", e))?;
        if state.version > STATE_VERSION {
            return Err(Error::storage(format!(
                "indexer state version {} is newer than supported {STATE_VERSION}",
                state.version
            )));
        }
        Ok(Some(state.tree))
    }
}

struct FileTask {
    root: PathBuf,
    relative_path: String,
    store: VectorStore,
    embedder: Arc<dyn Embedder>,
    metrics: Arc<Metrics>,
    chunk_opts: ChunkOptions,
    cancel: CancelToken,
}

struct FileOutcome {
    state: FileState,
    chunk_count: u64,
}

impl FileTask {
    async fn run(self) -> Result<FileOutcome> {
        let file_started = Instant::now();
        self.cancel.check()?;

        let absolute = validate_within_base(Path::new(&self.relative_path), &self.root)?;
        let content = std::fs::read_to_string(&absolute)
            .map_err(|e| Error::with_source(ErrorKind::Internal, format!("reading {}", self.relative_path), e))?;
        let metadata = std::fs::metadata(&absolute)?;
        let mod_time = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::SystemTime::UNIX_EPOCH).ok())
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);

        let language = Language::from_path(&self.relative_path);
        let chunks = chunk_file(&self.relative_path, &content, language, &self.chunk_opts);

        self.cancel.check()?;

        let texts: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
        let vectors = self.embedder.embed_batch(&texts).await?;
        if vectors.len() != chunks.len() {
            return Err(Error::internal(format!(
                "embedder returned {} vectors for {} chunks",
                vectors.len(),
                chunks.len()
            )));
        }

        let mut extra = std::collections::BTreeMap::new();
        extra.insert("mtime".to_string(), serde_json::json!(mod_time));

        let stored: Vec<StoredChunk> = chunks
            .iter()
            .zip(vectors)
            .map(|(chunk, vector)| StoredChunk {
                id: chunk.id.clone(),
                content: chunk.content.clone(),
                vector,
                metadata: ChunkMetadata {
                    file_path: self.relative_path.clone(),
                    language: language.name().to_string(),
                    start_line: chunk.start_line,
                    end_line: chunk.end_line,
                    symbols: chunk.symbols.clone(),
                    imports: chunk.imports.clone(),
                    commit_hash: None,
                    extra: extra.clone(),
                },
            })
            .collect();

        self.cancel.check()?;
        self.store
            .replace_file_chunks(&self.relative_path, &stored)
            .await?;

        let mut hasher = Sha256::new();
        hasher.update(content.as_bytes());
        let content_hash = format!("{:x}", hasher.finalize());

        self.metrics.record_file_indexed(
            content.len() as u64,
            stored.len() as u64,
            file_started.elapsed(),
        );

        Ok(FileOutcome {
            chunk_count: stored.len() as u64,
            state: FileState {
                file_path: self.relative_path,
                content_hash,
                size: content.len() as u64,
                mod_time,
                chunk_ids: stored.into_iter().map(|c| c.id).collect(),
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedding::MockEmbedder;
    use crate::store::ListFilter;
    use std::fs;

    const DIM: usize = 16;

    struct Fixture {
        _tmp: tempfile::TempDir,
        root: PathBuf,
        indexer: Indexer,
        store: VectorStore,
    }

    async fn fixture() -> Fixture {
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().join("repo");
        fs::create_dir_all(&root).unwrap();
        fs::write(root.join("a.go"), "func Foo() { return 1 }\n").unwrap();
        fs::write(root.join("b.go"), "func Bar() { Foo() }\n").unwrap();

        let store = VectorStore::open_in_memory(DIM).await.unwrap();
        let indexer = Indexer::new(
            &root,
            store.clone(),
            Arc::new(MockEmbedder::new(DIM)),
            Arc::new(Metrics::new()),
            IndexerOptions {
                include: Vec::new(),
                exclude: Vec::new(),
                max_file_size: 0,
                chunk: ChunkOptions::default(),
                parallelism: 2,
                state_path: tmp.path().join("state/merkle.json"),
            },
        )
        .unwrap();

        Fixture {
            _tmp: tmp,
            root,
            indexer,
            store,
        }
    }

    #[tokio::test]
    async fn full_pass_indexes_everything() {
        let fx = fixture().await;
        let summary = fx.indexer.index_full(&CancelToken::new()).await.unwrap();
        assert_eq!(summary.files_indexed, 2);
        assert!(summary.files_failed.is_empty());
        assert!(summary.chunks_written >= 2);

        let stats = fx.store.stats().await.unwrap();
        assert_eq!(stats.chunk_count, summary.chunks_written);
    }

    #[tokio::test]
    async fn file_state_tracks_chunk_ids() {
        let fx = fixture().await;
        fx.indexer.index_full(&CancelToken::new()).await.unwrap();
        let state = fx.indexer.file_state("a.go").unwrap();
        assert!(!state.chunk_ids.is_empty());
        assert_eq!(state.content_hash.len(), 64);

        let in_store = fx
            .store
            .list(&ListFilter {
                file_path: Some("a.go".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        let store_ids: Vec<&String> = in_store.iter().map(|c| &c.id).collect();
        assert_eq!(state.chunk_ids.iter().collect::<Vec<_>>(), store_ids);
    }

    #[tokio::test]
    async fn incremental_reindexes_only_changed() {
        let fx = fixture().await;
        fx.indexer.index_full(&CancelToken::new()).await.unwrap();

        fs::write(fx.root.join("a.go"), "func Foo() { return 2 }\n").unwrap();
        let summary = fx
            .indexer
            .index_incremental(&CancelToken::new())
            .await
            .unwrap();
        assert_eq!(summary.files_indexed, 1);
        assert_eq!(summary.files_removed, 0);
    }

    #[tokio::test]
    async fn incremental_noop_when_unchanged() {
        let fx = fixture().await;
        fx.indexer.index_full(&CancelToken::new()).await.unwrap();
        let summary = fx
            .indexer
            .index_incremental(&CancelToken::new())
            .await
            .unwrap();
        assert_eq!(summary.files_indexed, 0);
        assert_eq!(summary.files_removed, 0);
    }

    #[tokio::test]
    async fn incremental_removes_deleted_files() {
        let fx = fixture().await;
        fx.indexer.index_full(&CancelToken::new()).await.unwrap();

        fs::remove_file(fx.root.join("b.go")).unwrap();
        let summary = fx
            .indexer
            .index_incremental(&CancelToken::new())
            .await
            .unwrap();
        assert_eq!(summary.files_removed, 1);

        let remaining = fx
            .store
            .list(&ListFilter {
                file_path: Some("b.go".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(remaining.is_empty());
    }

    #[tokio::test]
    async fn incremental_without_state_runs_full() {
        let fx = fixture().await;
        let summary = fx
            .indexer
            .index_incremental(&CancelToken::new())
            .await
            .unwrap();
        assert_eq!(summary.files_indexed, 2);
    }

    #[tokio::test]
    async fn canceled_pass_does_not_advance_state() {
        let fx = fixture().await;
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = fx.indexer.index_full(&cancel).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Canceled);
        assert!(!fx.indexer.opts.state_path.exists());
    }

    #[tokio::test]
    async fn unreadable_file_is_skipped_not_fatal() {
        let fx = fixture().await;
        fs::write(fx.root.join("binary.go"), [0xff, 0xfe, 0x00, 0x01]).unwrap();
        let summary = fx.indexer.index_full(&CancelToken::new()).await.unwrap();
        assert_eq!(summary.files_indexed, 2);
        assert_eq!(summary.files_failed.len(), 1);
        assert_eq!(summary.files_failed[0].0, "binary.go");
    }

    #[tokio::test]
    async fn busy_flag_clears_after_pass() {
        let fx = fixture().await;
        assert!(!fx.indexer.is_running());
        fx.indexer.index_full(&CancelToken::new()).await.unwrap();
        assert!(!fx.indexer.is_running());
        // And the guard path also clears on error.
        let cancel = CancelToken::new();
        cancel.cancel();
        let _ = fx.indexer.index_full(&cancel).await;
        assert!(!fx.indexer.is_running());
    }

    #[tokio::test]
    async fn future_state_version_rejected() {
        let fx = fixture().await;
        fx.indexer.index_full(&CancelToken::new()).await.unwrap();
        let raw = fs::read_to_string(&fx.indexer.opts.state_path).unwrap();
        let bumped = raw.replacen("\"version\":1", "\"version\":99", 1);
        fs::write(&fx.indexer.opts.state_path, bumped).unwrap();

        let err = fx
            .indexer
            .index_incremental(&CancelToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Storage);
    }

    #[tokio::test]
    async fn last_summary_retained() {
        let fx = fixture().await;
        assert!(fx.indexer.last_summary().is_none());
        fx.indexer.index_full(&CancelToken::new()).await.unwrap();
        let summary = fx.indexer.last_summary().unwrap();
        assert_eq!(summary.files_indexed, 2);
    }
}
