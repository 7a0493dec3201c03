//! In-memory [`DocumentStore`] and [`VectorIndex`] implementations.
//!
//! Uses `HashMap`s behind `std::sync::RwLock`: searches take a read guard
//! and run concurrently, writes take the write guard, so each write to a
//! chunk id is linearizable. Vector search is brute-force cosine
//! similarity over all stored vectors.

use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;

use crate::embedding::cosine_similarity;
use crate::error::{RagError, Result};
use crate::models::{Chunk, Document, QueryVector};
use crate::search::rank_hits;

use super::{
    batch_identity, DocumentStore, IndexEntry, IndexHit, IndexStats, ModelIdentity, StoreCounts,
    VectorIndex,
};

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>> {
    lock.read().map_err(|_| RagError::storage("in-memory lock poisoned"))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>> {
    lock.write().map_err(|_| RagError::storage("in-memory lock poisoned"))
}

// ---------------------------------------------------------------------------
// Vector index
// ---------------------------------------------------------------------------

struct StoredVector {
    document_id: String,
    sequence_index: i64,
    vector: Vec<f32>,
}

#[derive(Default)]
struct IndexState {
    vectors: HashMap<String, StoredVector>,
    model: Option<ModelIdentity>,
}

impl IndexState {
    /// Check `identity` against the vectors that survive replacing `chunk_id`.
    fn admit(&self, identity: &ModelIdentity, chunk_id: &str) -> Result<()> {
        let others = self.vectors.keys().any(|id| id != chunk_id);
        match &self.model {
            Some(current) if others => current.ensure_matches(identity),
            _ => Ok(()),
        }
    }

    fn insert(&mut self, entry: IndexEntry) {
        self.vectors.insert(
            entry.embedding.chunk_id,
            StoredVector {
                document_id: entry.document_id,
                sequence_index: entry.sequence_index,
                vector: entry.embedding.vector,
            },
        );
    }

    fn release_identity_if_empty(&mut self) {
        if self.vectors.is_empty() {
            self.model = None;
        }
    }
}

/// In-memory vector index for tests and single-process use.
#[derive(Default)]
pub struct InMemoryIndex {
    state: RwLock<IndexState>,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl VectorIndex for InMemoryIndex {
    async fn upsert(&self, entry: IndexEntry) -> Result<()> {
        let identity = ModelIdentity::of_embedding(&entry.embedding);
        let mut state = write(&self.state)?;
        state.admit(&identity, &entry.embedding.chunk_id)?;
        state.model = Some(identity);
        state.insert(entry);
        Ok(())
    }

    async fn replace_document(
        &self,
        stale_document_id: Option<&str>,
        entries: Vec<IndexEntry>,
    ) -> Result<()> {
        let identity = batch_identity(&entries)?;
        let mut state = write(&self.state)?;

        if let (Some(identity), Some(current)) = (&identity, &state.model) {
            let survivors = state
                .vectors
                .values()
                .any(|v| Some(v.document_id.as_str()) != stale_document_id);
            if survivors {
                current.ensure_matches(identity)?;
            }
        }

        if let Some(stale) = stale_document_id {
            state.vectors.retain(|_, v| v.document_id != stale);
            state.release_identity_if_empty();
        }
        if let Some(identity) = identity {
            state.model = Some(identity);
        }
        for entry in entries {
            state.insert(entry);
        }
        Ok(())
    }

    async fn delete(&self, chunk_id: &str) -> Result<()> {
        let mut state = write(&self.state)?;
        state.vectors.remove(chunk_id);
        state.release_identity_if_empty();
        Ok(())
    }

    async fn delete_document(&self, document_id: &str) -> Result<usize> {
        let mut state = write(&self.state)?;
        let before = state.vectors.len();
        state.vectors.retain(|_, v| v.document_id != document_id);
        let removed = before - state.vectors.len();
        state.release_identity_if_empty();
        Ok(removed)
    }

    async fn search(
        &self,
        query: &QueryVector,
        top_k: usize,
        score_threshold: Option<f32>,
    ) -> Result<Vec<IndexHit>> {
        let state = read(&self.state)?;
        if state.vectors.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(model) = &state.model {
            model.ensure_matches(&ModelIdentity::of_query(query))?;
        }

        let hits: Vec<IndexHit> = state
            .vectors
            .iter()
            .map(|(chunk_id, v)| IndexHit {
                chunk_id: chunk_id.clone(),
                document_id: v.document_id.clone(),
                sequence_index: v.sequence_index,
                score: cosine_similarity(&query.vector, &v.vector),
                rank: 0,
            })
            .collect();

        Ok(rank_hits(hits, top_k, score_threshold))
    }

    async fn clear(&self) -> Result<()> {
        let mut state = write(&self.state)?;
        state.vectors.clear();
        state.model = None;
        Ok(())
    }

    async fn stats(&self) -> Result<IndexStats> {
        let state = read(&self.state)?;
        Ok(IndexStats {
            vectors: state.vectors.len(),
            model: state.model.clone(),
        })
    }

    async fn chunk_ids(&self) -> Result<Vec<String>> {
        let state = read(&self.state)?;
        let mut ids: Vec<String> = state.vectors.keys().cloned().collect();
        ids.sort();
        Ok(ids)
    }
}

// ---------------------------------------------------------------------------
// Document store
// ---------------------------------------------------------------------------

struct StoredDocument {
    document: Document,
    superseded_by: Option<String>,
}

#[derive(Default)]
struct DocState {
    documents: HashMap<String, StoredDocument>,
    chunks: HashMap<String, Chunk>,
}

/// In-memory metadata store for tests and single-process use.
#[derive(Default)]
pub struct InMemoryDocumentStore {
    state: RwLock<DocState>,
}

impl InMemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop a chunk behind the index's back. Test helper for orphan
    /// detection.
    pub fn remove_chunk(&self, chunk_id: &str) -> Result<bool> {
        Ok(write(&self.state)?.chunks.remove(chunk_id).is_some())
    }
}

#[async_trait]
impl DocumentStore for InMemoryDocumentStore {
    async fn current_version(&self, source_url: &str) -> Result<Option<Document>> {
        let state = read(&self.state)?;
        Ok(state
            .documents
            .values()
            .filter(|d| d.superseded_by.is_none() && d.document.source_url == source_url)
            .max_by_key(|d| d.document.version)
            .map(|d| d.document.clone()))
    }

    async fn insert_version(&self, document: &Document, chunks: &[Chunk]) -> Result<()> {
        let mut state = write(&self.state)?;
        if state.documents.contains_key(&document.id) {
            return Err(RagError::storage(format!(
                "document {} already exists",
                document.id
            )));
        }
        if let Some(c) = chunks.iter().find(|c| c.document_id != document.id) {
            return Err(RagError::storage(format!(
                "chunk {} belongs to {}, not {}",
                c.id, c.document_id, document.id
            )));
        }
        state.documents.insert(
            document.id.clone(),
            StoredDocument {
                document: document.clone(),
                superseded_by: None,
            },
        );
        for c in chunks {
            state.chunks.insert(c.id.clone(), c.clone());
        }
        Ok(())
    }

    async fn discard_version(&self, document_id: &str) -> Result<()> {
        let mut state = write(&self.state)?;
        state.documents.remove(document_id);
        state.chunks.retain(|_, c| c.document_id != document_id);
        Ok(())
    }

    async fn supersede(&self, document_id: &str, by_document_id: &str) -> Result<()> {
        let mut state = write(&self.state)?;
        match state.documents.get_mut(document_id) {
            Some(stored) => stored.superseded_by = Some(by_document_id.to_string()),
            None => {
                return Err(RagError::storage(format!(
                    "cannot supersede unknown document {}",
                    document_id
                )))
            }
        }
        state.chunks.retain(|_, c| c.document_id != document_id);
        Ok(())
    }

    async fn get_document(&self, document_id: &str) -> Result<Option<Document>> {
        let state = read(&self.state)?;
        Ok(state.documents.get(document_id).map(|d| d.document.clone()))
    }

    async fn get_chunks(&self, chunk_ids: &[String]) -> Result<Vec<Chunk>> {
        let state = read(&self.state)?;
        Ok(chunk_ids
            .iter()
            .filter_map(|id| state.chunks.get(id).cloned())
            .collect())
    }

    async fn active_chunks(&self) -> Result<Vec<Chunk>> {
        let state = read(&self.state)?;
        let mut chunks: Vec<Chunk> = state
            .chunks
            .values()
            .filter(|c| {
                state
                    .documents
                    .get(&c.document_id)
                    .is_some_and(|d| d.superseded_by.is_none())
            })
            .cloned()
            .collect();
        chunks.sort_by(|a, b| {
            a.document_id
                .cmp(&b.document_id)
                .then(a.sequence_index.cmp(&b.sequence_index))
        });
        Ok(chunks)
    }

    async fn counts(&self) -> Result<StoreCounts> {
        let state = read(&self.state)?;
        let superseded = state
            .documents
            .values()
            .filter(|d| d.superseded_by.is_some())
            .count();
        Ok(StoreCounts {
            documents: state.documents.len() - superseded,
            superseded,
            chunks: state.chunks.len(),
        })
    }
}
