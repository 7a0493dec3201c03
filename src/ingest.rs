//! `lexrag ingest`: load scraper records and run them through the pipeline.
//!
//! With `--dry-run`, records are normalized and chunked but nothing is
//! embedded or written.
//!
//! Every real run is recorded in `ingest_runs`: a `running` row is written
//! before the feed is read and closed as `completed` or `failed` with the
//! run's counts. `lexrag stats` shows the most recent one.

use std::path::Path;
use std::sync::Arc;

use anyhow::Result;
use sqlx::SqlitePool;

use lexrag_core::chunk;
use lexrag_core::models::RawDocument;
use lexrag_core::normalize;

use crate::config::Config;
use crate::feed;
use crate::pipeline::{IngestReport, RagPipeline};
use crate::sqlite_store::SqliteStore;

pub async fn run_ingest(
    config: &Config,
    path: &Path,
    concurrency: Option<usize>,
    dry_run: bool,
    limit: Option<usize>,
) -> Result<()> {
    if dry_run {
        let documents = load_feed(config, path, limit)?;
        let boilerplate = config.ingest.boilerplate();
        let params = config.chunking.params()?;
        let total_chunks: usize = documents
            .iter()
            .map(|raw| chunk::chunk_document(&normalize::normalize_document(raw, &boilerplate), &params).len())
            .sum();

        println!("ingest {} (dry-run)", path.display());
        println!("  records found: {}", documents.len());
        println!("  estimated chunks: {}", total_chunks);
        return Ok(());
    }

    let sqlite = Arc::new(SqliteStore::open(&config.db.path).await?);
    let pipeline = RagPipeline::with_sqlite(config, sqlite.clone())?;
    let pool = sqlite.pool();

    let run_id = start_run(pool, &path.display().to_string()).await?;
    let documents = match load_feed(config, path, limit) {
        Ok(docs) => docs,
        Err(e) => {
            let message = format!("{:#}", e);
            finish_run(pool, run_id, &IngestReport::default(), Some(message.as_str())).await?;
            return Err(e);
        }
    };

    let report = pipeline.ingest_batch(documents, concurrency).await;
    let error = (report.failed > 0)
        .then(|| format!("{} of {} records failed to ingest", report.failed, report.processed));
    finish_run(pool, run_id, &report, error.as_deref()).await?;

    println!("ingest {}", path.display());
    println!("  processed: {}", report.processed);
    println!("  created: {}", report.created);
    println!("  updated: {}", report.updated);
    println!("  unchanged: {}", report.unchanged);
    println!("  chunks written: {}", report.chunks);
    println!("  embeddings written: {}", report.embeddings);
    if let Some(error) = error {
        println!("  failed: {}", report.failed);
        for f in &report.failures {
            eprintln!("Warning: {}: {}", f.source_url, f.error);
        }
        anyhow::bail!(error);
    }
    println!("ok");
    Ok(())
}

fn load_feed(config: &Config, path: &Path, limit: Option<usize>) -> Result<Vec<RawDocument>> {
    let mut documents = feed::read_feed(path, &config.ingest.exclude_globs)?;
    if let Some(lim) = limit {
        documents.truncate(lim);
    }
    Ok(documents)
}

async fn start_run(pool: &SqlitePool, source: &str) -> Result<i64> {
    let now = chrono::Utc::now().timestamp_millis();
    let id = sqlx::query("INSERT INTO ingest_runs (source, status, started_at) VALUES (?, 'running', ?)")
        .bind(source)
        .bind(now)
        .execute(pool)
        .await?
        .last_insert_rowid();
    Ok(id)
}

async fn finish_run(pool: &SqlitePool, id: i64, report: &IngestReport, error: Option<&str>) -> Result<()> {
    let now = chrono::Utc::now().timestamp_millis();
    let status = if error.is_some() { "failed" } else { "completed" };
    sqlx::query(
        r#"
        UPDATE ingest_runs
        SET status = ?, processed = ?, created = ?, updated = ?, unchanged = ?,
            chunks = ?, embeddings = ?, failed = ?, error = ?, completed_at = ?
        WHERE id = ?
        "#,
    )
    .bind(status)
    .bind(report.processed as i64)
    .bind(report.created as i64)
    .bind(report.updated as i64)
    .bind(report.unchanged as i64)
    .bind(report.chunks as i64)
    .bind(report.embeddings as i64)
    .bind(report.failed as i64)
    .bind(error)
    .bind(now)
    .bind(id)
    .execute(pool)
    .await?;
    Ok(())
}
