//! Core data models used throughout lexrag.
//!
//! These types represent the scraped records, normalized documents, chunks,
//! vectors, retrieval results and answers that flow through the ingestion
//! and query paths.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

/// Raw record produced by the scraper before normalization.
///
/// Field aliases accept the scraper's own JSON names (`url`, `content`,
/// `scraped_at`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawDocument {
    #[serde(alias = "url")]
    pub source_url: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(alias = "content")]
    pub raw_text: String,
    #[serde(
        alias = "scraped_at",
        default = "Utc::now",
        deserialize_with = "deserialize_timestamp"
    )]
    pub scrape_timestamp: DateTime<Utc>,
}

/// Accept RFC 3339 timestamps and the naive ISO 8601 form the scraper
/// writes (interpreted as UTC).
fn deserialize_timestamp<'de, D>(deserializer: D) -> std::result::Result<DateTime<Utc>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    if let Ok(ts) = DateTime::parse_from_rfc3339(&raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(&raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| serde::de::Error::custom(format!("invalid timestamp '{}': {}", raw, e)))
}

/// A normalized document version.
///
/// Immutable once ingested. A re-scrape with different content produces a
/// new version with a new `id`; the previous version is superseded.
#[derive(Debug, Clone, Serialize)]
pub struct Document {
    pub id: String,
    pub source_url: String,
    pub title: Option<String>,
    pub raw_text: String,
    pub normalized_text: String,
    pub scrape_timestamp: DateTime<Utc>,
    /// SHA-256 of `normalized_text`, used to skip unchanged re-scrapes.
    pub content_hash: String,
    /// 1-based version number per `source_url`.
    pub version: i64,
    pub ingested_at: DateTime<Utc>,
}

impl Document {
    /// Length of `normalized_text` in characters, the unit of chunk offsets.
    pub fn char_len(&self) -> usize {
        self.normalized_text.chars().count()
    }
}

/// A bounded segment of a document's normalized text.
///
/// `text` is exactly the characters `char_start..char_end` of the owning
/// document's `normalized_text`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    pub sequence_index: i64,
    pub text: String,
    pub char_start: usize,
    pub char_end: usize,
    pub token_count: usize,
}

/// An embedding for one chunk under one model.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddingVector {
    pub chunk_id: String,
    pub vector: Vec<f32>,
    pub model_name: String,
    pub model_version: String,
}

/// An embedded query, tagged with the model that produced it.
#[derive(Debug, Clone)]
pub struct QueryVector {
    pub vector: Vec<f32>,
    pub model_name: String,
    pub model_version: String,
}

/// One retrieved chunk, ranked for a single query. Not persisted.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievalResult {
    pub chunk_id: String,
    /// Cosine similarity to the query.
    pub score: f32,
    /// 1-based rank.
    pub rank: usize,
    pub document_id: String,
    pub sequence_index: i64,
    pub text: String,
    pub title: Option<String>,
    pub source_url: String,
}

/// How well an [`Answer`] is backed by retrieved passages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerStatus {
    /// At least one retrieved passage is cited.
    Grounded,
    /// The model answered without citing any provided passage.
    Ungrounded,
    /// No passage met the relevance threshold, or the model reported that
    /// the passages do not answer the question.
    InsufficientContext,
}

/// A source referenced by an answer.
#[derive(Debug, Clone, Serialize)]
pub struct Citation {
    pub marker: String,
    pub chunk_id: String,
    pub document_id: String,
    pub title: Option<String>,
    pub source_url: String,
}

/// Output of one query. Not authoritative state.
#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub query_text: String,
    pub answer_text: String,
    /// Chunk ids in order of first citation; always a subset of the
    /// retrieval results passed to the synthesizer.
    pub cited_chunk_ids: Vec<String>,
    pub citations: Vec<Citation>,
    pub status: AnswerStatus,
    pub generation_timestamp: DateTime<Utc>,
}
