//! HTTP plumbing shared by the embedding and language-model providers.
//!
//! Maps transport and status failures onto [`RagError`]:
//! - HTTP 429 (rate limited) and 5xx (server error) → retryable
//! - other HTTP 4xx → permanent
//! - connection errors → retryable
//! - client-side timeouts → [`RagError::Timeout`]

use std::time::Duration;

use lexrag_core::{RagError, Result};
use reqwest::{Client, Response};

pub fn build_client(timeout_secs: u64) -> Result<Client> {
    Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| RagError::config(format!("failed to build HTTP client: {}", e)))
}

/// Turn a send failure into a provider error.
pub fn send_error(provider: &str, url: &str, timeout_secs: u64, e: reqwest::Error) -> RagError {
    if e.is_timeout() {
        return RagError::Timeout {
            operation: format!("{} request", provider),
            secs: timeout_secs,
        };
    }
    RagError::unavailable(format!(
        "{} connection error (is it reachable at {}?): {}",
        provider, url, e
    ))
}

/// Return the response if successful, otherwise the classified error.
pub async fn check_status(provider: &str, response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    let body_text = response.text().await.unwrap_or_default();
    let reason = format!("{} API error {}: {}", provider, status, body_text);
    if status.as_u16() == 429 || status.is_server_error() {
        Err(RagError::unavailable(reason))
    } else {
        Err(RagError::rejected(reason))
    }
}

/// Decode a JSON body, treating malformed payloads as permanent failures.
pub async fn read_json(provider: &str, response: Response) -> Result<serde_json::Value> {
    response
        .json()
        .await
        .map_err(|e| RagError::rejected(format!("Invalid {} response: {}", provider, e)))
}
