//! Thin CLI over the Conexus core.
//!
//! Subcommands: `start` (serve MCP), `index` (run a pass), `query`
//! (one-shot search), `validate` (check the configuration). Exit code
//! is non-zero on initialization or validation failure.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};

use conexus::cancel::CancelToken;
use conexus::config::Config;
use conexus::server::Server;
use conexus::store::SearchOptions;

#[derive(Parser)]
#[command(
    name = "conexus",
    about = "Conexus — local context-retrieval MCP server for codebases",
    version
)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the MCP server on the configured transport
    Start,

    /// Run an indexing pass and exit
    Index {
        /// Re-process every file instead of diffing against the last pass
        #[arg(long)]
        full: bool,
    },

    /// Search the index and print results
    Query {
        /// Search query
        query: String,

        /// Search mode: bm25, vector, or hybrid
        #[arg(long)]
        mode: Option<String>,

        /// Maximum number of results
        #[arg(long)]
        top_k: Option<usize>,
    },

    /// Validate the configuration and exit
    Validate,
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<Config> {
    let mut config = match path {
        Some(p) => Config::from_file(p).with_context(|| format!("loading {}", p.display()))?,
        None => {
            let default = PathBuf::from("./conexus.toml");
            if default.exists() {
                Config::from_file(&default).context("loading ./conexus.toml")?
            } else {
                Config::default()
            }
        }
    };
    config.apply_env(std::env::vars());
    config.validate().context("invalid configuration")?;
    Ok(config)
}

fn init_tracing(config: &Config) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(config.log_level.clone()));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        // stdout carries the JSON-RPC stream; logs must not corrupt it.
        .with_writer(std::io::stderr);
    if config.log_format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;
    init_tracing(&config);

    match cli.command {
        Commands::Start => {
            let server = Server::new(config).await?;
            server.startup().await?;

            let cancel = server.cancel_token();
            tokio::select! {
                result = server.run() => {
                    result?;
                }
                _ = tokio::signal::ctrl_c() => {
                    tracing::info!("signal received, shutting down");
                    cancel.cancel();
                }
            }

            // Bounded shutdown: give outstanding work a deadline.
            tokio::time::timeout(std::time::Duration::from_secs(10), server.shutdown())
                .await
                .ok();
        }

        Commands::Index { full } => {
            let server = Server::new(config).await?;
            let cancel = server.cancel_token();
            let indexer = server.context().indexer.clone();
            let summary = if full {
                indexer.index_full(&cancel).await?
            } else {
                indexer.index_incremental(&cancel).await?
            };
            println!(
                "indexed {} files ({} chunks) in {} ms; {} removed, {} failed",
                summary.files_indexed,
                summary.chunks_written,
                summary.duration_ms,
                summary.files_removed,
                summary.files_failed.len(),
            );
            for (path, error) in &summary.files_failed {
                eprintln!("  failed: {path}: {error}");
            }
            server.shutdown().await;
        }

        Commands::Query { query, mode, top_k } => {
            let server = Server::new(config).await?;
            server.startup().await?;
            let ctx = server.context();

            let mode = mode.unwrap_or_else(|| ctx.config.search.default_mode.clone());
            let opts = SearchOptions {
                limit: top_k.unwrap_or(ctx.config.search.default_top_k),
                ..Default::default()
            };
            let results = match mode.as_str() {
                "bm25" => ctx.store.search_bm25(&query, &opts).await?,
                "vector" => {
                    let vector = ctx.embedder.embed(&query).await?;
                    ctx.store.search_vector(&vector, &opts).await?
                }
                "hybrid" => {
                    let vector = ctx.embedder.embed(&query).await?;
                    ctx.store
                        .search_hybrid(Some(&query), Some(&vector), &opts)
                        .await?
                }
                other => anyhow::bail!("unknown mode: {other}"),
            };

            if results.is_empty() {
                println!("no results");
            }
            for (i, result) in results.iter().enumerate() {
                println!(
                    "{}. [{:.3}] {}:{}-{}",
                    i + 1,
                    result.score,
                    result.metadata.file_path,
                    result.metadata.start_line,
                    result.metadata.end_line,
                );
                let preview: String = result.content.lines().take(3).collect::<Vec<_>>().join("\n    ");
                println!("    {preview}");
            }
            server.shutdown().await;
        }

        Commands::Validate => {
            // load_config already validated; report and exit 0.
            println!("configuration ok");
            println!("  db_path: {}", config.db_path.display());
            println!("  root_path: {}", config.root_path.display());
            println!("  transport: {}", config.transport);
            println!(
                "  embedder: {} (dimension {})",
                config.embedder.provider, config.embedder.dimension
            );
        }
    }

    Ok(())
}
