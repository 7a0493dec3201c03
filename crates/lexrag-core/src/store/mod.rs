//! Storage abstractions for lexrag.
//!
//! Two traits split persistent state the way the pipeline uses it:
//!
//! - [`DocumentStore`]: the authoritative metadata store for document
//!   versions and their chunks.
//! - [`VectorIndex`]: chunk embeddings and nearest-neighbour search.
//!
//! Both are async (via `async-trait`) so the SQLite backend in the app
//! crate and the in-memory backends in [`memory`] are interchangeable.
//! Implementations must be `Send + Sync`.
//!
//! # Vector index operations
//!
//! | Method | Purpose |
//! |--------|---------|
//! | [`upsert`](VectorIndex::upsert) | Insert or replace one chunk's vector |
//! | [`replace_document`](VectorIndex::replace_document) | Atomically swap a document version's vectors |
//! | [`delete`](VectorIndex::delete) | Remove one chunk's vector (idempotent) |
//! | [`search`](VectorIndex::search) | Ranked cosine-similarity search |
//! | [`clear`](VectorIndex::clear) | Drop every vector and the model identity |
//!
//! # Model identity
//!
//! An index holds vectors of exactly one [`ModelIdentity`]. Writing or
//! querying with a different identity fails with
//! [`RagError::Configuration`]. The identity is released when the index
//! becomes empty.

pub mod memory;

use async_trait::async_trait;
use serde::Serialize;

use crate::error::{RagError, Result};
use crate::models::{Chunk, Document, EmbeddingVector, QueryVector};

/// The embedding space an index holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ModelIdentity {
    pub model_name: String,
    pub model_version: String,
    pub dims: usize,
}

impl ModelIdentity {
    pub fn of_embedding(e: &EmbeddingVector) -> Self {
        Self {
            model_name: e.model_name.clone(),
            model_version: e.model_version.clone(),
            dims: e.vector.len(),
        }
    }

    pub fn of_query(q: &QueryVector) -> Self {
        Self {
            model_name: q.model_name.clone(),
            model_version: q.model_version.clone(),
            dims: q.vector.len(),
        }
    }

    /// Fail unless `other` is the same embedding space.
    pub fn ensure_matches(&self, other: &ModelIdentity) -> Result<()> {
        if self == other {
            return Ok(());
        }
        Err(RagError::config(format!(
            "embedding model mismatch: index holds {} but got {}; run `lexrag reindex` after switching models",
            self, other
        )))
    }
}

impl std::fmt::Display for ModelIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{} ({} dims)", self.model_name, self.model_version, self.dims)
    }
}

/// One vector to index, with the chunk position used for tie-breaking.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub embedding: EmbeddingVector,
    pub document_id: String,
    pub sequence_index: i64,
}

/// A ranked search hit.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexHit {
    pub chunk_id: String,
    pub document_id: String,
    pub sequence_index: i64,
    /// Cosine similarity to the query.
    pub score: f32,
    /// 1-based rank, assigned by [`crate::search::rank_hits`].
    pub rank: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexStats {
    pub vectors: usize,
    pub model: Option<ModelIdentity>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct StoreCounts {
    /// Active (non-superseded) document versions.
    pub documents: usize,
    pub superseded: usize,
    /// Chunks of active versions.
    pub chunks: usize,
}

/// Verify that every entry shares one model identity and return it.
pub fn batch_identity(entries: &[IndexEntry]) -> Result<Option<ModelIdentity>> {
    let mut iter = entries.iter();
    let Some(first) = iter.next() else {
        return Ok(None);
    };
    let identity = ModelIdentity::of_embedding(&first.embedding);
    for e in iter {
        identity.ensure_matches(&ModelIdentity::of_embedding(&e.embedding))?;
    }
    Ok(Some(identity))
}

/// Metadata store for document versions and chunks.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// The active version for a source URL, if any.
    async fn current_version(&self, source_url: &str) -> Result<Option<Document>>;

    /// Persist a new document version with all its chunks, atomically.
    async fn insert_version(&self, document: &Document, chunks: &[Chunk]) -> Result<()>;

    /// Remove a version and its chunks (rollback of a failed ingest).
    async fn discard_version(&self, document_id: &str) -> Result<()>;

    /// Mark `document_id` superseded by `by_document_id` and delete its
    /// chunks.
    async fn supersede(&self, document_id: &str, by_document_id: &str) -> Result<()>;

    async fn get_document(&self, document_id: &str) -> Result<Option<Document>>;

    /// Fetch chunks by id. Missing ids are omitted from the result.
    async fn get_chunks(&self, chunk_ids: &[String]) -> Result<Vec<Chunk>>;

    /// Every chunk of every active version, in document then sequence order.
    async fn active_chunks(&self) -> Result<Vec<Chunk>>;

    async fn counts(&self) -> Result<StoreCounts>;
}

/// Vector index over chunk embeddings.
#[async_trait]
pub trait VectorIndex: Send + Sync {
    /// Insert or replace the vector for `entry.embedding.chunk_id`.
    async fn upsert(&self, entry: IndexEntry) -> Result<()>;

    /// Delete every vector of `stale_document_id` and write `entries`, all
    /// or nothing.
    async fn replace_document(
        &self,
        stale_document_id: Option<&str>,
        entries: Vec<IndexEntry>,
    ) -> Result<()>;

    /// Remove one chunk's vector. Deleting a missing id is not an error.
    async fn delete(&self, chunk_id: &str) -> Result<()>;

    /// Remove every vector of a document version. Returns the count removed.
    async fn delete_document(&self, document_id: &str) -> Result<usize>;

    /// Ranked search: descending score, then ascending sequence index, then
    /// chunk id; at most `top_k` hits, none below `score_threshold`.
    async fn search(
        &self,
        query: &QueryVector,
        top_k: usize,
        score_threshold: Option<f32>,
    ) -> Result<Vec<IndexHit>>;

    async fn clear(&self) -> Result<()>;

    async fn stats(&self) -> Result<IndexStats>;

    /// Every indexed chunk id, for consistency checks.
    async fn chunk_ids(&self) -> Result<Vec<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(chunk: &str, model: &str, dims: usize) -> IndexEntry {
        IndexEntry {
            embedding: EmbeddingVector {
                chunk_id: chunk.into(),
                vector: vec![0.5; dims],
                model_name: model.into(),
                model_version: "1".into(),
            },
            document_id: "d".into(),
            sequence_index: 0,
        }
    }

    #[test]
    fn test_batch_identity() {
        assert!(batch_identity(&[]).unwrap().is_none());
        let id = batch_identity(&[entry("a", "m", 3), entry("b", "m", 3)])
            .unwrap()
            .unwrap();
        assert_eq!(id.dims, 3);
        assert!(matches!(
            batch_identity(&[entry("a", "m", 3), entry("b", "m", 4)]),
            Err(RagError::Configuration(_))
        ));
        assert!(matches!(
            batch_identity(&[entry("a", "m", 3), entry("b", "other", 3)]),
            Err(RagError::Configuration(_))
        ));
    }

    #[test]
    fn test_identity_display() {
        let id = ModelIdentity {
            model_name: "bge".into(),
            model_version: "1.5".into(),
            dims: 384,
        };
        assert_eq!(id.to_string(), "bge@1.5 (384 dims)");
    }
}
