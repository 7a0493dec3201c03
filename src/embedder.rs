//! The Embedder: batching, bounded concurrency, timeouts, retries and
//! response validation around an [`EmbeddingProvider`].
//!
//! `embed(texts)` returns exactly one vector per input, in input order.
//! Inputs are split into batches of `batch_size`; up to `max_concurrency`
//! batches are in flight at once (`futures::StreamExt::buffered`, which
//! yields results in submission order). Each provider call runs under
//! `timeout_secs` and transient failures are retried with backoff.
//!
//! Any failed batch fails the whole call, so a document is never indexed
//! with a partial set of vectors.

use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt, TryStreamExt};
use tracing::debug;

use lexrag_core::embedding::EmbeddingProvider;
use lexrag_core::models::{Chunk, EmbeddingVector, QueryVector};
use lexrag_core::store::ModelIdentity;
use lexrag_core::{RagError, Result};

use crate::config::EmbeddingConfig;
use crate::retry::{retry_with_backoff, RetryPolicy};

#[derive(Clone)]
pub struct Embedder {
    provider: Arc<dyn EmbeddingProvider>,
    batch_size: usize,
    max_concurrency: usize,
    timeout: Duration,
    retry: RetryPolicy,
}

impl Embedder {
    pub fn new(provider: Arc<dyn EmbeddingProvider>, config: &EmbeddingConfig) -> Self {
        Self::with_settings(
            provider,
            config.batch_size,
            config.max_concurrency,
            Duration::from_secs(config.timeout_secs),
            RetryPolicy::with_default_backoff(config.max_retries),
        )
    }

    pub fn with_settings(
        provider: Arc<dyn EmbeddingProvider>,
        batch_size: usize,
        max_concurrency: usize,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            provider,
            batch_size: batch_size.max(1),
            max_concurrency: max_concurrency.max(1),
            timeout,
            retry,
        }
    }

    pub fn identity(&self) -> ModelIdentity {
        ModelIdentity {
            model_name: self.provider.model_name().to_string(),
            model_version: self.provider.model_version().to_string(),
            dims: self.provider.dims(),
        }
    }

    /// Embed texts, one vector per input, order preserved.
    pub async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let batches: Vec<&[String]> = texts.chunks(self.batch_size).collect();
        debug!(
            texts = texts.len(),
            batches = batches.len(),
            batch_size = self.batch_size,
            model = self.provider.model_name(),
            "embedding texts"
        );

        let results: Vec<Vec<Vec<f32>>> = stream::iter(batches)
            .map(|batch| self.embed_batch(batch))
            .buffered(self.max_concurrency)
            .try_collect()
            .await?;

        Ok(results.into_iter().flatten().collect())
    }

    async fn embed_batch(&self, batch: &[String]) -> Result<Vec<Vec<f32>>> {
        let vectors = retry_with_backoff(&self.retry, "embedding", self.timeout, || {
            self.provider.embed_batch(batch)
        })
        .await?;
        self.validate(batch.len(), &vectors)?;
        Ok(vectors)
    }

    fn validate(&self, expected: usize, vectors: &[Vec<f32>]) -> Result<()> {
        if vectors.len() != expected {
            return Err(RagError::rejected(format!(
                "{} returned {} vectors for {} inputs",
                self.provider.model_name(),
                vectors.len(),
                expected
            )));
        }
        let dims = self.provider.dims();
        if let Some(bad) = vectors.iter().find(|v| v.len() != dims) {
            return Err(RagError::rejected(format!(
                "{} returned a {}-dimensional vector, expected {}",
                self.provider.model_name(),
                bad.len(),
                dims
            )));
        }
        if vectors.iter().flatten().any(|x| !x.is_finite()) {
            return Err(RagError::rejected(format!(
                "{} returned a vector with non-finite components",
                self.provider.model_name()
            )));
        }
        Ok(())
    }

    /// Embed chunks into tagged vectors.
    pub async fn embed_chunks(&self, chunks: &[Chunk]) -> Result<Vec<EmbeddingVector>> {
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = self.embed(&texts).await?;
        let model_name = self.provider.model_name().to_string();
        let model_version = self.provider.model_version().to_string();

        Ok(chunks
            .iter()
            .zip(vectors)
            .map(|(chunk, vector)| EmbeddingVector {
                chunk_id: chunk.id.clone(),
                vector,
                model_name: model_name.clone(),
                model_version: model_version.clone(),
            })
            .collect())
    }

    /// Embed a query with the corpus model.
    pub async fn embed_query(&self, text: &str) -> Result<QueryVector> {
        let vector = self
            .embed(&[text.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RagError::rejected("Empty embedding response"))?;
        Ok(QueryVector {
            vector,
            model_name: self.provider.model_name().to_string(),
            model_version: self.provider.model_version().to_string(),
        })
    }

    /// Round-trip a sample text through the provider.
    pub async fn check_loaded(&self) -> Result<()> {
        self.embed(&["Gesundheitsprüfung".to_string()]).await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use lexrag_core::embedding::HashingEmbedder;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Encodes each text's length, records the peak number of in-flight
    /// batches, and fails the first `failures` calls.
    struct Counting {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
        failures: usize,
        dims: usize,
    }

    impl Counting {
        fn new(failures: usize, dims: usize) -> Self {
            Self {
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
                failures,
                dims,
            }
        }
    }

    #[async_trait]
    impl EmbeddingProvider for Counting {
        fn model_name(&self) -> &str {
            "counting"
        }
        fn model_version(&self) -> &str {
            "1"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < self.failures {
                return Err(RagError::unavailable("503"));
            }
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(5)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(texts.iter().map(|t| vec![t.len() as f32; self.dims]).collect())
        }
    }

    fn embedder(provider: Arc<dyn EmbeddingProvider>, batch: usize, conc: usize) -> Embedder {
        Embedder::with_settings(
            provider,
            batch,
            conc,
            Duration::from_secs(5),
            RetryPolicy::new(2, Duration::from_millis(1), Duration::from_millis(2)),
        )
    }

    fn texts(n: usize) -> Vec<String> {
        (1..=n).map(|i| "x".repeat(i)).collect()
    }

    #[tokio::test]
    async fn test_order_preserved_across_batches() {
        let e = embedder(Arc::new(Counting::new(0, 2)), 3, 4);
        let out = e.embed(&texts(10)).await.unwrap();
        assert_eq!(out.len(), 10);
        for (i, v) in out.iter().enumerate() {
            assert_eq!(v[0], (i + 1) as f32);
        }
    }

    #[tokio::test]
    async fn test_concurrency_bounded() {
        let counting = Arc::new(Counting::new(0, 2));
        let e = embedder(counting.clone(), 1, 2);
        e.embed(&texts(8)).await.unwrap();
        assert!(counting.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(counting.calls.load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn test_transient_failures_retried() {
        let counting = Arc::new(Counting::new(2, 2));
        let e = embedder(counting.clone(), 10, 1);
        assert_eq!(e.embed(&texts(3)).await.unwrap().len(), 3);
        assert_eq!(counting.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_fail() {
        let e = embedder(Arc::new(Counting::new(100, 2)), 10, 1);
        let err = e.embed(&texts(3)).await.unwrap_err();
        assert!(matches!(err, RagError::ModelUnavailable { .. }));
    }

    #[tokio::test]
    async fn test_wrong_dims_rejected() {
        let e = embedder(Arc::new(Counting::new(0, 3)), 10, 1);
        let err = e.embed(&texts(2)).await.unwrap_err();
        assert!(err.to_string().contains("3-dimensional"));
    }

    struct Corrupt;

    #[async_trait]
    impl EmbeddingProvider for Corrupt {
        fn model_name(&self) -> &str {
            "corrupt"
        }
        fn model_version(&self) -> &str {
            "1"
        }
        fn dims(&self) -> usize {
            2
        }
        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| vec![f32::NAN, 1.0]).collect())
        }
    }

    #[tokio::test]
    async fn test_non_finite_vectors_rejected() {
        let e = embedder(Arc::new(Corrupt), 10, 1);
        let err = e.embed(&texts(2)).await.unwrap_err();
        assert!(matches!(err, RagError::ModelUnavailable { retryable: false, .. }));
        assert!(err.to_string().contains("non-finite"));
    }

    #[tokio::test]
    async fn test_empty_input() {
        let counting = Arc::new(Counting::new(0, 2));
        let e = embedder(counting.clone(), 10, 1);
        assert!(e.embed(&[]).await.unwrap().is_empty());
        assert_eq!(counting.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_query_vector_tagged() {
        let e = embedder(Arc::new(HashingEmbedder::new(16)), 8, 1);
        let q = e.embed_query("Abstandsflächen").await.unwrap();
        assert_eq!(q.vector.len(), 16);
        assert_eq!(q.model_name, "lexrag-hashing");
        assert_eq!(e.identity().dims, 16);
    }
}
