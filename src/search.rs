//! `lexrag search` and `lexrag query`.
//!
//! `search` prints the ranked passages only; `query` runs the full
//! pipeline and prints the cited answer, or JSON with `--json`.

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use lexrag_core::models::{AnswerStatus, RetrievalResult};

use crate::config::Config;
use crate::pipeline::{QueryOptions, RagPipeline};

const EXCERPT_CHARS: usize = 240;

pub async fn run_search(config: &Config, query: &str, options: QueryOptions) -> Result<()> {
    let pipeline = RagPipeline::from_config(config).await?;
    let results = pipeline.search_with(query, options).await?;

    if results.is_empty() {
        println!("No results.");
        return Ok(());
    }
    for result in &results {
        print_result(result);
    }
    Ok(())
}

pub async fn run_query(config: &Config, query: &str, options: QueryOptions, json: bool) -> Result<()> {
    let pipeline = RagPipeline::from_config(config).await?;
    let answer = pipeline
        .query_with(query, options, &CancellationToken::new())
        .await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&answer)?);
        return Ok(());
    }

    println!("{}", answer.answer_text);
    println!();
    match answer.status {
        AnswerStatus::Grounded => {
            println!("Sources:");
            for c in &answer.citations {
                let title = c.title.as_deref().unwrap_or("(untitled)");
                println!("  {} {}", c.marker, title);
                println!("      {}", c.source_url);
            }
        }
        AnswerStatus::Ungrounded => {
            println!("Warning: the answer cites none of the retrieved passages.");
        }
        AnswerStatus::InsufficientContext => {
            println!("No passage in the corpus answers this question.");
        }
    }
    Ok(())
}

fn print_result(result: &RetrievalResult) {
    let title = result.title.as_deref().unwrap_or("(untitled)");
    let excerpt: String = result
        .text
        .replace('\n', " ")
        .chars()
        .take(EXCERPT_CHARS)
        .collect();

    println!("{}. [{:.2}] {}", result.rank, result.score, title);
    println!("    url: {}", result.source_url);
    println!("    passage: {} of document {}", result.sequence_index + 1, result.document_id);
    println!("    excerpt: \"{}\"", excerpt.trim());
    println!("    id: {}", result.chunk_id);
    println!();
}
