//! # lexrag CLI
//!
//! The `lexrag` binary drives ingestion, queries and maintenance of the
//! legal-text RAG pipeline.
//!
//! ## Usage
//!
//! ```bash
//! lexrag --config ./config/lexrag.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `lexrag init` | Create the SQLite database and run schema migrations |
//! | `lexrag ingest <path>` | Ingest scraper records (JSONL, JSON array, or a directory) |
//! | `lexrag search "<query>"` | Show ranked passages for a question |
//! | `lexrag query "<query>"` | Answer a question with cited sources |
//! | `lexrag health` | Check index and embedding model readiness |
//! | `lexrag verify` | Detect vectors whose chunk is missing |
//! | `lexrag reindex` | Re-embed every active chunk with the configured model |
//! | `lexrag stats` | Corpus statistics |
//!
//! Logs go to stderr. The level comes from `[logging] level`; `RUST_LOG`
//! overrides it.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

use lexrag::pipeline::QueryOptions;
use lexrag::{config, health, ingest, migrate, reindex, search, stats};

/// lexrag: grounded question answering over Berlin legal text.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file. See `config/lexrag.example.toml` for a full example.
#[derive(Parser)]
#[command(
    name = "lexrag",
    about = "lexrag: grounded question answering over Berlin legal text",
    version,
    long_about = "lexrag ingests scraped Berlin statutes, chunks and embeds them, and answers \
    questions with a language model constrained to cite the retrieved passages."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/lexrag.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Ingest scraper records.
    ///
    /// Accepts a JSON Lines file, a JSON array file, or a directory of
    /// `*.json` / `*.jsonl` files. Unchanged documents are skipped;
    /// changed ones get a new version that supersedes the old.
    Ingest {
        /// Feed file or directory.
        path: PathBuf,

        /// Documents ingested concurrently (default: `[ingest] concurrency`).
        #[arg(long)]
        concurrency: Option<usize>,

        /// Show record and chunk counts without embedding or writing.
        #[arg(long)]
        dry_run: bool,

        /// Ingest at most this many records.
        #[arg(long)]
        limit: Option<usize>,
    },

    /// Show the passages retrieved for a question.
    Search {
        query: String,

        /// Maximum passages (default: `[retrieval] top_k`).
        #[arg(long)]
        top_k: Option<i64>,

        /// Minimum cosine similarity (default: `[retrieval] score_threshold`).
        #[arg(long)]
        threshold: Option<f32>,
    },

    /// Answer a question with citations.
    Query {
        query: String,

        #[arg(long)]
        top_k: Option<i64>,

        #[arg(long)]
        threshold: Option<f32>,

        /// Print the answer as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Check index reachability and embedding model readiness.
    Health,

    /// Check that every indexed vector resolves to a stored chunk.
    Verify,

    /// Clear the index and re-embed all active chunks.
    Reindex,

    /// Show corpus statistics.
    Stats,
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;
    init_tracing(&cfg.logging.level);

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest {
            path,
            concurrency,
            dry_run,
            limit,
        } => {
            ingest::run_ingest(&cfg, &path, concurrency, dry_run, limit).await?;
        }
        Commands::Search {
            query,
            top_k,
            threshold,
        } => {
            let options = QueryOptions {
                top_k,
                score_threshold: threshold,
            };
            search::run_search(&cfg, &query, options).await?;
        }
        Commands::Query {
            query,
            top_k,
            threshold,
            json,
        } => {
            let options = QueryOptions {
                top_k,
                score_threshold: threshold,
            };
            search::run_query(&cfg, &query, options, json).await?;
        }
        Commands::Health => {
            health::run_health(&cfg).await?;
        }
        Commands::Verify => {
            health::run_verify(&cfg).await?;
        }
        Commands::Reindex => {
            reindex::run_reindex(&cfg).await?;
        }
        Commands::Stats => {
            stats::run_stats(&cfg).await?;
        }
    }

    Ok(())
}
