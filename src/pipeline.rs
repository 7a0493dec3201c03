//! The RAG pipeline orchestrator.
//!
//! Wires the normalizer, chunker, [`Embedder`], vector index, metadata
//! store, [`Retriever`] and [`Synthesizer`] into the two paths the rest
//! of the system calls:
//!
//! # Ingestion
//!
//! ```text
//! RawDocument → normalize → (unchanged? skip) → chunk → embed all
//!   → store new version + chunks → index.replace_document → supersede prior
//! ```
//!
//! Nothing is written until every chunk has a vector. If the index write
//! fails the new version is discarded again, so a document is either fully
//! searchable in its new version or still served by its previous one.
//! Ingestion of the same `source_url` is serialized; distinct documents
//! are ingested concurrently by [`RagPipeline::ingest_batch`].
//!
//! # Query
//!
//! ```text
//! question → retrieve (embed, search, resolve) → synthesize → Answer
//! ```
//!
//! The query path performs no writes.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use lexrag_core::chunk::{self, ChunkParams};
use lexrag_core::embedding::EmbeddingProvider;
use lexrag_core::generation::LanguageModel;
use lexrag_core::models::{Answer, RawDocument, RetrievalResult};
use lexrag_core::normalize::{self, Boilerplate};
use lexrag_core::search::SearchParams;
use lexrag_core::store::{DocumentStore, IndexEntry, ModelIdentity, VectorIndex};
use lexrag_core::{RagError, Result};

use crate::config::Config;
use crate::embedder::Embedder;
use crate::retriever::Retriever;
use crate::sqlite_store::SqliteStore;
use crate::synthesizer::Synthesizer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestStatus {
    Created,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestOutcome {
    pub document_id: String,
    pub source_url: String,
    pub version: i64,
    /// Chunks written for this version; zero when unchanged.
    pub chunks: usize,
    pub status: IngestStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct IngestFailure {
    pub source_url: String,
    pub error: String,
}

/// Summary of a batch ingestion run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    pub processed: usize,
    pub created: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub chunks: usize,
    pub embeddings: usize,
    pub failed: usize,
    pub failures: Vec<IngestFailure>,
}

impl IngestReport {
    fn record(&mut self, source_url: String, outcome: Result<IngestOutcome>) {
        self.processed += 1;
        match outcome {
            Ok(o) => {
                match o.status {
                    IngestStatus::Created => self.created += 1,
                    IngestStatus::Updated => self.updated += 1,
                    IngestStatus::Unchanged => self.unchanged += 1,
                }
                self.chunks += o.chunks;
                self.embeddings += o.chunks;
            }
            Err(e) => {
                self.failed += 1;
                self.failures.push(IngestFailure {
                    source_url,
                    error: e.to_string(),
                });
            }
        }
    }
}

/// Per-query overrides of the `[retrieval]` defaults.
#[derive(Debug, Clone, Copy, Default)]
pub struct QueryOptions {
    pub top_k: Option<i64>,
    pub score_threshold: Option<f32>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub index_reachable: bool,
    pub embedder_loaded: bool,
    pub indexed_vectors: usize,
    /// Identity of the vectors in the index, if any.
    pub model: Option<ModelIdentity>,
    /// Identity of the configured embedding model.
    pub embedder: ModelIdentity,
    pub errors: Vec<String>,
}

impl HealthReport {
    pub fn ready(&self) -> bool {
        self.index_reachable && self.embedder_loaded
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ConsistencyReport {
    pub indexed_vectors: usize,
    /// Vectors whose chunk is missing from the metadata store.
    pub orphaned: Vec<String>,
    /// Active chunks with no vector.
    pub unindexed: Vec<String>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.orphaned.is_empty()
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReindexReport {
    pub documents: usize,
    pub chunks: usize,
}

/// One async mutex per `source_url`, dropped once no ingest holds it.
#[derive(Default)]
struct DocumentLocks {
    locks: Mutex<HashMap<String, Weak<tokio::sync::Mutex<()>>>>,
}

impl DocumentLocks {
    fn get(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(lock) = locks.get(key).and_then(Weak::upgrade) {
            return lock;
        }
        locks.retain(|_, weak| weak.strong_count() > 0);
        let lock = Arc::new(tokio::sync::Mutex::new(()));
        locks.insert(key.to_string(), Arc::downgrade(&lock));
        lock
    }
}

pub struct RagPipeline {
    store: Arc<dyn DocumentStore>,
    index: Arc<dyn VectorIndex>,
    embedder: Embedder,
    retriever: Retriever,
    synthesizer: Synthesizer,
    boilerplate: Boilerplate,
    chunk_params: ChunkParams,
    search_defaults: SearchParams,
    ingest_concurrency: usize,
    locks: DocumentLocks,
}

impl RagPipeline {
    /// Validate `config` and assemble the pipeline.
    pub fn new(
        config: &Config,
        store: Arc<dyn DocumentStore>,
        index: Arc<dyn VectorIndex>,
        embedding: Arc<dyn EmbeddingProvider>,
        model: Arc<dyn LanguageModel>,
    ) -> Result<Self> {
        config.validate()?;
        let chunk_params = config.chunking.params()?;
        let search_defaults = config.retrieval.params()?;

        let embedder = Embedder::new(embedding, &config.embedding);
        let retriever = Retriever::new(embedder.clone(), index.clone(), store.clone());
        let synthesizer = Synthesizer::new(model, &config.generation);
        let boilerplate = config.ingest.boilerplate();

        Ok(Self {
            store,
            index,
            embedder,
            retriever,
            synthesizer,
            boilerplate,
            chunk_params,
            search_defaults,
            ingest_concurrency: config.ingest.concurrency,
            locks: DocumentLocks::default(),
        })
    }

    /// Open the SQLite store named by `[db]` and build the configured
    /// providers.
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let sqlite = Arc::new(SqliteStore::open(&config.db.path).await?);
        Self::with_sqlite(config, sqlite)
    }

    /// Pipeline over an already open SQLite store, with the configured
    /// providers.
    pub fn with_sqlite(config: &Config, sqlite: Arc<SqliteStore>) -> anyhow::Result<Self> {
        let embedding = crate::embedding::create_provider(&config.embedding)?;
        let model = crate::generation::create_model(&config.generation)?;
        Ok(Self::new(config, sqlite.clone(), sqlite, embedding, model)?)
    }

    pub fn embedder(&self) -> &Embedder {
        &self.embedder
    }

    pub fn retriever(&self) -> &Retriever {
        &self.retriever
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn index(&self) -> &Arc<dyn VectorIndex> {
        &self.index
    }

    // ------------------------------------------------------------------
    // Ingestion
    // ------------------------------------------------------------------

    /// Ingest one scraped record as a new document version.
    pub async fn ingest(&self, raw: &RawDocument) -> Result<IngestOutcome> {
        let mut document = normalize::normalize_document(raw, &self.boilerplate);
        if document.source_url.is_empty() {
            return Err(RagError::config("document has an empty source_url"));
        }

        let lock = self.locks.get(&document.source_url);
        let _guard = lock.lock().await;

        let previous = self.store.current_version(&document.source_url).await?;
        if let Some(prev) = &previous {
            if prev.content_hash == document.content_hash {
                debug!(source_url = %prev.source_url, version = prev.version, "unchanged, skipping");
                return Ok(IngestOutcome {
                    document_id: prev.id.clone(),
                    source_url: prev.source_url.clone(),
                    version: prev.version,
                    chunks: 0,
                    status: IngestStatus::Unchanged,
                });
            }
            document.version = prev.version + 1;
        }

        let chunks = chunk::chunk_document(&document, &self.chunk_params);
        let embeddings = self.embedder.embed_chunks(&chunks).await?;
        let entries: Vec<IndexEntry> = chunks
            .iter()
            .zip(embeddings)
            .map(|(c, embedding)| IndexEntry {
                embedding,
                document_id: c.document_id.clone(),
                sequence_index: c.sequence_index,
            })
            .collect();

        self.store.insert_version(&document, &chunks).await?;

        let stale = previous.as_ref().map(|p| p.id.as_str());
        if let Err(e) = self.index.replace_document(stale, entries).await {
            if let Err(rollback) = self.store.discard_version(&document.id).await {
                warn!(document_id = %document.id, error = %rollback, "failed to discard version after index error");
            }
            return Err(e);
        }

        // The new version is live once the index write commits. A failed
        // supersede leaves the old version active with unindexed chunks,
        // which `verify` reports; the ingest itself still succeeded.
        if let Some(prev) = &previous {
            if let Err(e) = self.store.supersede(&prev.id, &document.id).await {
                warn!(
                    source_url = %document.source_url,
                    previous = %prev.id,
                    document_id = %document.id,
                    error = %e,
                    "failed to supersede previous version"
                );
            }
        }

        let status = if previous.is_some() {
            IngestStatus::Updated
        } else {
            IngestStatus::Created
        };
        info!(
            source_url = %document.source_url,
            document_id = %document.id,
            version = document.version,
            chunks = chunks.len(),
            status = ?status,
            "ingested document"
        );

        Ok(IngestOutcome {
            document_id: document.id,
            source_url: document.source_url,
            version: document.version,
            chunks: chunks.len(),
            status,
        })
    }

    /// Ingest many records, up to `concurrency` at a time. Per-document
    /// failures are collected in the report.
    pub async fn ingest_batch(&self, documents: Vec<RawDocument>, concurrency: Option<usize>) -> IngestReport {
        let concurrency = concurrency.unwrap_or(self.ingest_concurrency).max(1);

        let outcomes: Vec<(String, Result<IngestOutcome>)> = stream::iter(documents)
            .map(|raw| async move {
                let outcome = self.ingest(&raw).await;
                if let Err(e) = &outcome {
                    warn!(source_url = %raw.source_url, error = %e, "ingest failed");
                }
                (raw.source_url, outcome)
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        let mut report = IngestReport::default();
        for (source_url, outcome) in outcomes {
            report.record(source_url, outcome);
        }
        info!(
            processed = report.processed,
            created = report.created,
            updated = report.updated,
            unchanged = report.unchanged,
            failed = report.failed,
            "ingest batch finished"
        );
        report
    }

    // ------------------------------------------------------------------
    // Query
    // ------------------------------------------------------------------

    pub async fn query(&self, query_text: &str) -> Result<Answer> {
        self.query_with(query_text, QueryOptions::default(), &CancellationToken::new())
            .await
    }

    pub async fn query_with(
        &self,
        query_text: &str,
        options: QueryOptions,
        cancel: &CancellationToken,
    ) -> Result<Answer> {
        let results = tokio::select! {
            _ = cancel.cancelled() => return Err(RagError::Cancelled),
            results = self.search_with(query_text, options) => results?,
        };
        let answer = self
            .synthesizer
            .synthesize_with(query_text, &results, cancel)
            .await?;

        info!(
            retrieved = results.len(),
            cited = answer.cited_chunk_ids.len(),
            status = ?answer.status,
            "query answered"
        );
        Ok(answer)
    }

    /// Retrieval only, with optional overrides.
    pub async fn search_with(&self, query_text: &str, options: QueryOptions) -> Result<Vec<RetrievalResult>> {
        let params = SearchParams::new(
            options.top_k.unwrap_or(self.search_defaults.top_k as i64),
            options.score_threshold.or(self.search_defaults.score_threshold),
        )?;
        self.retriever.retrieve_with(query_text, &params).await
    }

    // ------------------------------------------------------------------
    // Operations
    // ------------------------------------------------------------------

    pub async fn health(&self) -> HealthReport {
        let mut errors = Vec::new();

        let (index_reachable, indexed_vectors, model) = match self.index.stats().await {
            Ok(stats) => (true, stats.vectors, stats.model),
            Err(e) => {
                errors.push(format!("index: {}", e));
                (false, 0, None)
            }
        };
        let embedder_loaded = match self.embedder.check_loaded().await {
            Ok(()) => true,
            Err(e) => {
                errors.push(format!("embedder: {}", e));
                false
            }
        };

        HealthReport {
            index_reachable,
            embedder_loaded,
            indexed_vectors,
            model,
            embedder: self.embedder.identity(),
            errors,
        }
    }

    pub async fn ready(&self) -> bool {
        self.health().await.ready()
    }

    /// Cross-check the index against the metadata store.
    pub async fn verify(&self) -> Result<ConsistencyReport> {
        let indexed = self.index.chunk_ids().await?;
        let known: HashSet<String> = self
            .store
            .get_chunks(&indexed)
            .await?
            .into_iter()
            .map(|c| c.id)
            .collect();
        let orphaned: Vec<String> = indexed
            .iter()
            .filter(|id| !known.contains(*id))
            .cloned()
            .collect();

        let indexed_set: HashSet<&String> = indexed.iter().collect();
        let unindexed: Vec<String> = self
            .store
            .active_chunks()
            .await?
            .into_iter()
            .filter(|c| !indexed_set.contains(&c.id))
            .map(|c| c.id)
            .collect();

        Ok(ConsistencyReport {
            indexed_vectors: indexed.len(),
            orphaned,
            unindexed,
        })
    }

    /// Fail with [`RagError::IndexInconsistency`] if any vector is orphaned.
    pub async fn ensure_consistent(&self) -> Result<()> {
        let report = self.verify().await?;
        if report.is_consistent() {
            Ok(())
        } else {
            Err(RagError::IndexInconsistency {
                chunk_ids: report.orphaned,
            })
        }
    }

    /// Drop every vector and re-embed all active chunks with the
    /// configured model.
    pub async fn reindex(&self) -> Result<ReindexReport> {
        let chunks = self.store.active_chunks().await?;
        let mut by_document: BTreeMap<String, Vec<_>> = BTreeMap::new();
        for c in chunks {
            by_document.entry(c.document_id.clone()).or_default().push(c);
        }

        // Embed before clearing so a provider failure leaves the index intact.
        let mut batches = Vec::with_capacity(by_document.len());
        for (document_id, chunks) in by_document {
            let embeddings = self.embedder.embed_chunks(&chunks).await?;
            let entries: Vec<IndexEntry> = chunks
                .iter()
                .zip(embeddings)
                .map(|(c, embedding)| IndexEntry {
                    embedding,
                    document_id: c.document_id.clone(),
                    sequence_index: c.sequence_index,
                })
                .collect();
            batches.push((document_id, entries));
        }

        self.index.clear().await?;
        let mut report = ReindexReport::default();
        for (document_id, entries) in batches {
            report.documents += 1;
            report.chunks += entries.len();
            self.index.replace_document(Some(&document_id), entries).await?;
        }

        info!(
            documents = report.documents,
            chunks = report.chunks,
            model = %self.embedder.identity(),
            "reindexed"
        );
        Ok(report)
    }
}
