//! Corpus statistics.
//!
//! Summarizes what is indexed: active and superseded document versions,
//! chunk counts, embedding coverage, the most recent ingest run, the
//! embedding model(s) in the index and a per-site breakdown. Used by `lexrag stats` to confirm that
//! ingestion and embedding are keeping up.

use std::collections::BTreeMap;

use anyhow::Result;
use sqlx::Row;

use crate::config::Config;
use crate::db;

#[derive(Default)]
struct SiteStats {
    documents: i64,
    chunks: i64,
}

/// Run the stats command: query the database and print a summary.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;

    let active_docs: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE superseded_by IS NULL")
            .fetch_one(&pool)
            .await?;
    let superseded_docs: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM documents WHERE superseded_by IS NOT NULL")
            .fetch_one(&pool)
            .await?;
    let total_chunks: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunks")
        .fetch_one(&pool)
        .await?;
    let total_embedded: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM chunk_vectors")
        .fetch_one(&pool)
        .await?;
    let last_ingest: Option<i64> = sqlx::query_scalar("SELECT MAX(ingested_at) FROM documents")
        .fetch_one(&pool)
        .await?;

    let db_size = std::fs::metadata(&config.db.path)
        .map(|m| m.len())
        .unwrap_or(0);

    println!("lexrag: corpus stats");
    println!("====================");
    println!();
    println!("  Database:    {}", config.db.path.display());
    println!("  Size:        {}", format_bytes(db_size));
    println!();
    println!("  Documents:   {} active, {} superseded", active_docs, superseded_docs);
    println!("  Chunks:      {}", total_chunks);
    println!(
        "  Embedded:    {} / {} ({}%)",
        total_embedded,
        total_chunks,
        if total_chunks > 0 {
            (total_embedded * 100) / total_chunks
        } else {
            0
        }
    );
    println!(
        "  Last ingest: {}",
        last_ingest
            .map(|ms| format_ts_relative(ms / 1000))
            .unwrap_or_else(|| "never".to_string())
    );

    let last_run = sqlx::query(
        r#"
        SELECT source, status, processed, created, updated, unchanged, failed, error,
               started_at, completed_at
        FROM ingest_runs
        ORDER BY id DESC
        LIMIT 1
        "#,
    )
    .fetch_optional(&pool)
    .await?;

    if let Some(row) = &last_run {
        let status: String = row.get("status");
        let started_at: i64 = row.get("started_at");
        let completed_at: Option<i64> = row.get("completed_at");
        println!();
        println!("  Last run:    {} ({})", status, row.get::<String, _>("source"));
        println!("    started:   {}", format_ts_relative(started_at / 1000));
        if let Some(done) = completed_at {
            println!("    duration:  {}", format_duration_ms(done - started_at));
        }
        println!(
            "    records:   {} processed, {} created, {} updated, {} unchanged, {} failed",
            row.get::<i64, _>("processed"),
            row.get::<i64, _>("created"),
            row.get::<i64, _>("updated"),
            row.get::<i64, _>("unchanged"),
            row.get::<i64, _>("failed"),
        );
        if let Some(error) = row.get::<Option<String>, _>("error") {
            println!("    error:     {}", error);
        }
    }

    let model_rows = sqlx::query(
        r#"
        SELECT model_name, model_version, dims, COUNT(*) AS vectors
        FROM chunk_vectors
        GROUP BY model_name, model_version, dims
        ORDER BY vectors DESC
        "#,
    )
    .fetch_all(&pool)
    .await?;

    if !model_rows.is_empty() {
        println!();
        println!("  Embedding models:");
        for row in &model_rows {
            let name: String = row.get("model_name");
            let version: String = row.get("model_version");
            let dims: i64 = row.get("dims");
            let vectors: i64 = row.get("vectors");
            println!("    {}@{} ({} dims): {} vectors", name, version, dims, vectors);
        }
        if model_rows.len() > 1 {
            println!("    warning: index mixes models; run `lexrag reindex`");
        }
    }

    let doc_rows = sqlx::query(
        r#"
        SELECT d.source_url, COUNT(c.id) AS chunk_count
        FROM documents d
        LEFT JOIN chunks c ON c.document_id = d.id
        WHERE d.superseded_by IS NULL
        GROUP BY d.id
        "#,
    )
    .fetch_all(&pool)
    .await?;

    let mut sites: BTreeMap<String, SiteStats> = BTreeMap::new();
    for row in &doc_rows {
        let url: String = row.get("source_url");
        let site = sites.entry(site_of(&url).to_string()).or_default();
        site.documents += 1;
        site.chunks += row.get::<i64, _>("chunk_count");
    }

    if !sites.is_empty() {
        println!();
        println!("  By site:");
        println!("  {:<40} {:>6} {:>8}", "SITE", "DOCS", "CHUNKS");
        println!("  {}", "-".repeat(56));
        for (site, s) in &sites {
            println!("  {:<40} {:>6} {:>8}", site, s.documents, s.chunks);
        }
    }

    println!();

    pool.close().await;
    Ok(())
}

/// Host part of a URL, or the whole string if it has no scheme.
fn site_of(url: &str) -> &str {
    let rest = url.split_once("://").map(|(_, r)| r).unwrap_or(url);
    rest.split(['/', '?', '#']).next().unwrap_or(rest)
}

/// Format a byte count as a human-readable string.
fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

fn format_duration_ms(ms: i64) -> String {
    if ms < 1000 {
        format!("{} ms", ms.max(0))
    } else if ms < 60_000 {
        format!("{:.1} s", ms as f64 / 1000.0)
    } else {
        format!("{} min {} s", ms / 60_000, (ms % 60_000) / 1000)
    }
}

/// Format a Unix timestamp as a relative time string (e.g. "3 hours ago").
fn format_ts_relative(ts: i64) -> String {
    let delta = chrono::Utc::now().timestamp() - ts;
    if delta < 0 {
        return format_ts_iso(ts);
    }

    if delta < 60 {
        "just now".to_string()
    } else if delta < 3600 {
        let mins = delta / 60;
        format!("{} min{} ago", mins, if mins == 1 { "" } else { "s" })
    } else if delta < 86400 {
        let hours = delta / 3600;
        format!("{} hour{} ago", hours, if hours == 1 { "" } else { "s" })
    } else if delta < 86400 * 30 {
        let days = delta / 86400;
        format!("{} day{} ago", days, if days == 1 { "" } else { "s" })
    } else {
        format_ts_iso(ts)
    }
}

fn format_ts_iso(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| ts.to_string())
}
