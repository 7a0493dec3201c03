//! Error taxonomy shared by every pipeline component.
//!
//! Callers distinguish "no answer found" (an [`Answer`](crate::models::Answer)
//! with insufficient-context status) from system failure (an `Err` of one
//! of these variants).

use thiserror::Error;

/// Failure modes of the RAG core.
#[derive(Debug, Error)]
pub enum RagError {
    /// Invalid tunables or an incompatible model/index combination.
    /// Fatal at startup; never retried.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// The embedding or language-model provider could not be reached or
    /// loaded. `retryable` is set for transient causes (rate limits,
    /// server errors, connection failures).
    #[error("model unavailable: {reason}")]
    ModelUnavailable { reason: String, retryable: bool },

    /// A provider call exceeded its configured time budget.
    #[error("{operation} timed out after {secs}s")]
    Timeout { operation: String, secs: u64 },

    /// The vector index references chunks missing from the metadata store.
    #[error("index inconsistency: {} vector(s) reference missing chunks: {}", chunk_ids.len(), chunk_ids.join(", "))]
    IndexInconsistency { chunk_ids: Vec<String> },

    /// The language model exhausted its retries or returned unusable output.
    #[error("generation failed: {0}")]
    Generation(String),

    /// The metadata store or index backend failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, RagError>;

impl RagError {
    pub fn config(message: impl Into<String>) -> Self {
        RagError::Configuration(message.into())
    }

    pub fn storage(err: impl std::fmt::Display) -> Self {
        RagError::Storage(err.to_string())
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        RagError::ModelUnavailable {
            reason: reason.into(),
            retryable: true,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        RagError::ModelUnavailable {
            reason: reason.into(),
            retryable: false,
        }
    }

    /// Whether a retry with backoff may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            RagError::ModelUnavailable { retryable, .. } => *retryable,
            RagError::Timeout { .. } => true,
            _ => false,
        }
    }

    /// Short machine-readable code, used by the CLI's JSON output.
    pub fn code(&self) -> &'static str {
        match self {
            RagError::Configuration(_) => "configuration",
            RagError::ModelUnavailable { .. } => "model_unavailable",
            RagError::Timeout { .. } => "timeout",
            RagError::IndexInconsistency { .. } => "index_inconsistency",
            RagError::Generation(_) => "generation",
            RagError::Storage(_) => "storage",
            RagError::Cancelled => "cancelled",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(RagError::unavailable("429").is_transient());
        assert!(!RagError::rejected("401").is_transient());
        assert!(RagError::Timeout {
            operation: "embedding".into(),
            secs: 30
        }
        .is_transient());
        assert!(!RagError::Generation("empty".into()).is_transient());
        assert!(!RagError::config("bad").is_transient());
    }

    #[test]
    fn test_inconsistency_message_lists_ids() {
        let err = RagError::IndexInconsistency {
            chunk_ids: vec!["a".into(), "b".into()],
        };
        let msg = err.to_string();
        assert!(msg.contains("2 vector(s)"));
        assert!(msg.contains("a, b"));
    }
}
