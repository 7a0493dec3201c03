//! Query-time retrieval: embed the question with the corpus model, search
//! the vector index, and resolve hits against the metadata store.

use std::sync::Arc;

use tracing::debug;

use lexrag_core::models::RetrievalResult;
use lexrag_core::search::{self, SearchParams};
use lexrag_core::store::{DocumentStore, VectorIndex};
use lexrag_core::Result;

use crate::embedder::Embedder;

#[derive(Clone)]
pub struct Retriever {
    embedder: Embedder,
    index: Arc<dyn VectorIndex>,
    store: Arc<dyn DocumentStore>,
}

impl Retriever {
    pub fn new(embedder: Embedder, index: Arc<dyn VectorIndex>, store: Arc<dyn DocumentStore>) -> Self {
        Self {
            embedder,
            index,
            store,
        }
    }

    /// Up to `top_k` results at or above `score_threshold`, ranked `1..=n`.
    ///
    /// `top_k <= 0` is a configuration error. A blank query returns no
    /// results without calling the embedding provider.
    pub async fn retrieve(
        &self,
        query_text: &str,
        top_k: i64,
        score_threshold: Option<f32>,
    ) -> Result<Vec<RetrievalResult>> {
        let params = SearchParams::new(top_k, score_threshold)?;
        self.retrieve_with(query_text, &params).await
    }

    pub async fn retrieve_with(&self, query_text: &str, params: &SearchParams) -> Result<Vec<RetrievalResult>> {
        if query_text.trim().is_empty() {
            return Ok(Vec::new());
        }

        let query = self.embedder.embed_query(query_text.trim()).await?;
        let results = search::search(self.index.as_ref(), self.store.as_ref(), &query, params).await?;

        debug!(
            top_k = params.top_k,
            threshold = ?params.score_threshold,
            results = results.len(),
            "retrieved passages"
        );
        Ok(results)
    }
}
