//! Ranking and hit resolution shared by every index backend.
//!
//! Backends score candidates (brute-force cosine similarity); this module
//! orders them, applies `top_k` and the relevance threshold, and turns hits
//! into [`RetrievalResult`]s through a [`DocumentStore`].
//!
//! # Ordering
//!
//! Hits with a non-finite score (a corrupt stored vector) are dropped
//! before ordering.
//!
//! 1. Score, descending.
//! 2. Sequence index, ascending (earlier passages of a statute first).
//! 3. Chunk id, ascending.
//!
//! The threshold is applied after ordering; since scores are sorted it only
//! ever removes a tail, so the result may be shorter than `top_k` or empty.

use std::cmp::Ordering;
use std::collections::HashMap;

use tracing::debug;

use crate::error::{RagError, Result};
use crate::models::{Document, QueryVector, RetrievalResult};
use crate::store::{DocumentStore, IndexHit, VectorIndex};

/// Validated retrieval parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchParams {
    pub top_k: usize,
    pub score_threshold: Option<f32>,
}

impl SearchParams {
    /// Fails with [`RagError::Configuration`] when `top_k <= 0` or the
    /// threshold is not a finite number.
    pub fn new(top_k: i64, score_threshold: Option<f32>) -> Result<Self> {
        if top_k <= 0 {
            return Err(RagError::config(format!("top_k must be > 0, got {}", top_k)));
        }
        if let Some(t) = score_threshold {
            if !t.is_finite() {
                return Err(RagError::config("score_threshold must be a finite number"));
            }
        }
        Ok(Self {
            top_k: top_k as usize,
            score_threshold,
        })
    }
}

fn compare_hits(a: &IndexHit, b: &IndexHit) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.sequence_index.cmp(&b.sequence_index))
        .then_with(|| a.chunk_id.cmp(&b.chunk_id))
}

/// Order scored candidates, keep the best `top_k` that meet the threshold,
/// and assign ranks `1..=n`.
pub fn rank_hits(mut hits: Vec<IndexHit>, top_k: usize, score_threshold: Option<f32>) -> Vec<IndexHit> {
    let scored = hits.len();
    hits.retain(|h| h.score.is_finite());
    if hits.len() < scored {
        debug!(dropped = scored - hits.len(), "dropped hits with non-finite scores");
    }
    hits.sort_by(compare_hits);
    hits.truncate(top_k);
    if let Some(threshold) = score_threshold {
        hits.retain(|h| h.score >= threshold);
    }
    for (i, hit) in hits.iter_mut().enumerate() {
        hit.rank = i + 1;
    }
    hits
}

/// Resolve ranked hits to full results.
///
/// Every hit must name a chunk of a document present in the store;
/// otherwise fails with [`RagError::IndexInconsistency`] listing the
/// orphaned chunk ids.
pub async fn resolve_results<S>(store: &S, hits: Vec<IndexHit>) -> Result<Vec<RetrievalResult>>
where
    S: DocumentStore + ?Sized,
{
    if hits.is_empty() {
        return Ok(Vec::new());
    }

    let ids: Vec<String> = hits.iter().map(|h| h.chunk_id.clone()).collect();
    let mut chunks: HashMap<String, _> = store
        .get_chunks(&ids)
        .await?
        .into_iter()
        .map(|c| (c.id.clone(), c))
        .collect();

    let mut documents: HashMap<String, Option<Document>> = HashMap::new();
    let mut orphans = Vec::new();
    let mut results = Vec::with_capacity(hits.len());

    for hit in hits {
        let Some(chunk) = chunks.remove(&hit.chunk_id) else {
            orphans.push(hit.chunk_id);
            continue;
        };
        if !documents.contains_key(&chunk.document_id) {
            let doc = store.get_document(&chunk.document_id).await?;
            documents.insert(chunk.document_id.clone(), doc);
        }
        let Some(Some(doc)) = documents.get(&chunk.document_id) else {
            orphans.push(hit.chunk_id);
            continue;
        };

        results.push(RetrievalResult {
            chunk_id: chunk.id,
            score: hit.score,
            rank: hit.rank,
            document_id: chunk.document_id,
            sequence_index: chunk.sequence_index,
            text: chunk.text,
            title: doc.title.clone(),
            source_url: doc.source_url.clone(),
        });
    }

    if !orphans.is_empty() {
        debug!(orphans = orphans.len(), "hits without a stored chunk");
        return Err(RagError::IndexInconsistency { chunk_ids: orphans });
    }
    Ok(results)
}

/// Search an index with an embedded query and resolve the hits.
pub async fn search<I, S>(
    index: &I,
    store: &S,
    query: &QueryVector,
    params: &SearchParams,
) -> Result<Vec<RetrievalResult>>
where
    I: VectorIndex + ?Sized,
    S: DocumentStore + ?Sized,
{
    let hits = index.search(query, params.top_k, params.score_threshold).await?;
    resolve_results(store, hits).await
}
