//! Answer synthesis: prompt a [`LanguageModel`] with ranked passages and
//! turn its reply into a cited [`Answer`].
//!
//! - No passages → insufficient-context answer; the model is not called.
//! - Each attempt is bounded by `generation.timeout_secs`; transient
//!   failures are retried with exponential backoff up to
//!   `generation.max_retries`.
//! - Retries exhausted on a rate-limited or failing provider →
//!   [`RagError::Generation`]. A final timeout stays [`RagError::Timeout`].
//! - Cancelling the token aborts the in-flight call with
//!   [`RagError::Cancelled`].

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use lexrag_core::generation::LanguageModel;
use lexrag_core::models::{Answer, RetrievalResult};
use lexrag_core::prompt;
use lexrag_core::{RagError, Result};

use crate::config::GenerationConfig;
use crate::retry::{retry_with_backoff, RetryPolicy};

#[derive(Clone)]
pub struct Synthesizer {
    model: Arc<dyn LanguageModel>,
    temperature: f32,
    max_tokens: u32,
    timeout: Duration,
    retry: RetryPolicy,
}

impl Synthesizer {
    pub fn new(model: Arc<dyn LanguageModel>, config: &GenerationConfig) -> Self {
        Self {
            model,
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            timeout: Duration::from_secs(config.timeout_secs),
            retry: RetryPolicy::new(
                config.max_retries,
                Duration::from_millis(config.backoff_base_ms),
                Duration::from_millis(config.backoff_max_ms),
            ),
        }
    }

    pub fn with_settings(
        model: Arc<dyn LanguageModel>,
        temperature: f32,
        max_tokens: u32,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            model,
            temperature,
            max_tokens,
            timeout,
            retry,
        }
    }

    pub fn model_name(&self) -> &str {
        self.model.model_name()
    }

    pub async fn synthesize(&self, query_text: &str, results: &[RetrievalResult]) -> Result<Answer> {
        self.synthesize_with(query_text, results, &CancellationToken::new())
            .await
    }

    pub async fn synthesize_with(
        &self,
        query_text: &str,
        results: &[RetrievalResult],
        cancel: &CancellationToken,
    ) -> Result<Answer> {
        if results.is_empty() {
            debug!("no passages retrieved, answering with insufficient context");
            return Ok(prompt::insufficient_context_answer(query_text));
        }

        let request = prompt::build_request(query_text, results, self.temperature, self.max_tokens);
        let call = retry_with_backoff(&self.retry, "generation", self.timeout, || {
            self.model.generate(&request)
        });

        let reply = tokio::select! {
            _ = cancel.cancelled() => return Err(RagError::Cancelled),
            reply = call => reply.map_err(|e| self.exhausted(e))?,
        };

        let answer = prompt::finalize_answer(query_text, &reply, results)?;
        info!(
            model = self.model.model_name(),
            sources = results.len(),
            cited = answer.cited_chunk_ids.len(),
            status = ?answer.status,
            "answer synthesized"
        );
        Ok(answer)
    }

    fn exhausted(&self, e: RagError) -> RagError {
        match e {
            RagError::ModelUnavailable {
                reason,
                retryable: true,
            } => RagError::Generation(format!(
                "{} failed after {} retries: {}",
                self.model.model_name(),
                self.retry.max_retries,
                reason
            )),
            other => other,
        }
    }
}
