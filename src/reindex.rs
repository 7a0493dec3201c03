//! `lexrag reindex`: re-embed every active chunk with the configured model.
//!
//! This is the only supported way to switch embedding models; the index
//! refuses to mix vectors from different models.

use anyhow::Result;

use crate::config::Config;
use crate::pipeline::RagPipeline;

pub async fn run_reindex(config: &Config) -> Result<()> {
    let pipeline = RagPipeline::from_config(config).await?;
    let before = pipeline.index().stats().await?;
    let report = pipeline.reindex().await?;

    println!("reindex");
    if let Some(model) = &before.model {
        println!("  previous model: {}", model);
    }
    println!("  model: {}", pipeline.embedder().identity());
    println!("  documents: {}", report.documents);
    println!("  embedded: {}", report.chunks);
    println!("ok");
    Ok(())
}
