//! # Conexus
//!
//! **A local context-retrieval MCP server.**
//!
//! Conexus indexes a codebase into content-addressed chunks — computing
//! vector embeddings and a full-text index over them — and answers
//! semantic-search and related-context queries from AI assistants over
//! JSON-RPC 2.0 (the Model Context Protocol).
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌────────────────┐   ┌───────────────┐
//! │  Walker   │──▶│    Indexer     │──▶│    SQLite     │
//! │  +Merkle  │   │ chunk + embed  │   │ FTS5 + vectors │
//! └──────────┘   └────────────────┘   └───────┬───────┘
//!                                             │
//!                        ┌────────────────────┤
//!                        ▼                    ▼
//!                  ┌──────────┐        ┌──────────┐
//!                  │  stdio    │        │   HTTP    │
//!                  │ JSON-RPC  │        │ POST /mcp │
//!                  └──────────┘        └──────────┘
//! ```
//!
//! ## Data flow
//!
//! 1. The **walker** ([`walker`]) produces a filtered, deterministic
//!    file list; the **Merkle tree** ([`merkle`]) hashes it for
//!    O(changes) incremental diffs.
//! 2. The **indexer** ([`indexer`]) chunks changed files ([`chunker`]),
//!    embeds them ([`embedding`]), and upserts into the store.
//! 3. The **vector store** ([`store`]) persists chunks, metadata, an
//!    FTS5 mirror, and vector blobs in one SQLite file, answering BM25,
//!    cosine, and rank-fused hybrid queries.
//! 4. The **RPC layer** ([`rpc`]) frames newline-delimited JSON-RPC and
//!    dispatches to the **tool layer** ([`tools`]): `context.search`,
//!    `context.get_related_info`, `context.index_control`,
//!    `context.manage_connectors`, `context.grep`, `context.explain`,
//!    plus the `codebase://` resource surface.
//! 5. **Connectors** ([`connectors`]) describe external sources and run
//!    validation/health hook chains around their lifecycle.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | resolved configuration (env > file > defaults merged by the CLI) |
//! | [`error`] | typed error kinds and JSON-RPC code mapping |
//! | [`pathsafe`] | path validation against the indexed root |
//! | [`walker`] | filtered deterministic filesystem walk |
//! | [`merkle`] | hash-tree change detection |
//! | [`chunker`] | code-aware chunking with token-estimated overlap |
//! | [`embedding`] | embedder trait, registry, mock and HTTP providers |
//! | [`store`] | SQLite vector store: CRUD, BM25, vector, hybrid |
//! | [`indexer`] | full and incremental indexing passes |
//! | [`connectors`] | connector rows and lifecycle hook chains |
//! | [`rpc`] | JSON-RPC 2.0 framing and dispatch |
//! | [`tools`] | MCP tool surface |
//! | [`metrics`] | counters and histograms |
//! | [`cancel`] | cooperative cancellation token |
//! | [`server`] | object graph assembly, stdio and HTTP transports |

pub mod cancel;
pub mod chunker;
pub mod config;
pub mod connectors;
pub mod embedding;
pub mod error;
pub mod indexer;
pub mod merkle;
pub mod metrics;
pub mod pathsafe;
pub mod rpc;
pub mod server;
pub mod store;
pub mod tools;
pub mod walker;
