//! `lexrag health` and `lexrag verify`.

use anyhow::{bail, Result};

use crate::config::Config;
use crate::pipeline::RagPipeline;

/// Print readiness of the index and embedding model. Fails if not ready.
pub async fn run_health(config: &Config) -> Result<()> {
    let pipeline = RagPipeline::from_config(config).await?;
    let report = pipeline.health().await;

    println!("{:<16} {}", "CHECK", "STATUS");
    println!(
        "{:<16} {}",
        "index",
        if report.index_reachable { "OK" } else { "UNREACHABLE" }
    );
    println!(
        "{:<16} {}",
        "embedder",
        if report.embedder_loaded { "OK" } else { "UNAVAILABLE" }
    );
    println!();
    println!("  indexed vectors: {}", report.indexed_vectors);
    match &report.model {
        Some(model) => println!("  index model: {}", model),
        None => println!("  index model: (empty index)"),
    }
    println!("  embedder model: {}", report.embedder);
    if let Some(model) = &report.model {
        if *model != report.embedder {
            println!("  warning: embedder differs from index model; run `lexrag reindex`");
        }
    }

    for e in &report.errors {
        eprintln!("Error: {}", e);
    }
    if !report.ready() {
        bail!("not ready");
    }
    println!("ok");
    Ok(())
}

/// Cross-check the index against the metadata store. Fails on orphans.
pub async fn run_verify(config: &Config) -> Result<()> {
    let pipeline = RagPipeline::from_config(config).await?;
    let report = pipeline.verify().await?;

    println!("verify");
    println!("  indexed vectors: {}", report.indexed_vectors);
    println!("  orphaned vectors: {}", report.orphaned.len());
    println!("  unindexed chunks: {}", report.unindexed.len());
    for id in &report.orphaned {
        println!("    orphan: {}", id);
    }
    if !report.is_consistent() {
        bail!(lexrag_core::RagError::IndexInconsistency {
            chunk_ids: report.orphaned,
        });
    }
    println!("ok");
    Ok(())
}
