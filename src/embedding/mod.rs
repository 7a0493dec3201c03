//! Embedding provider implementations.
//!
//! Concrete backends for [`EmbeddingProvider`]:
//! - **hashing**: [`HashingEmbedder`] from the core crate; deterministic,
//!   offline, for tests and air-gapped runs.
//! - **[`OpenAIProvider`]**: `POST {url}/embeddings` (OpenAI-compatible).
//! - **[`OllamaProvider`]**: `POST {url}/api/embed` on a local Ollama.
//! - **`LocalProvider`**: fastembed ONNX models, behind the
//!   `local-embeddings-fastembed` feature.
//!
//! Providers perform exactly one request per [`embed_batch`] call and
//! classify failures as retryable or permanent. Batching, concurrency,
//! timeouts and retries are applied by
//! [`Embedder`](crate::embedder::Embedder).
//!
//! # Provider Selection
//!
//! ```rust
//! # use lexrag::config::EmbeddingConfig;
//! # use lexrag::embedding::create_provider;
//! let config = EmbeddingConfig::default(); // provider = "hashing"
//! let provider = create_provider(&config).unwrap();
//! assert_eq!(provider.model_name(), "lexrag-hashing");
//! ```
//!
//! [`embed_batch`]: EmbeddingProvider::embed_batch

use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;

pub use lexrag_core::embedding::{EmbeddingProvider, HashingEmbedder};
use lexrag_core::{RagError, Result};

use crate::config::EmbeddingConfig;
use crate::http;

const DEFAULT_HASHING_DIMS: usize = 256;
const DEFAULT_OPENAI_URL: &str = "https://api.openai.com/v1";
const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

// ============ OpenAI Provider ============

/// Embedding provider for the OpenAI embeddings API (or any compatible
/// server). Requires `OPENAI_API_KEY`.
pub struct OpenAIProvider {
    client: Client,
    api_key: String,
    url: String,
    model: String,
    model_version: String,
    dims: usize,
    timeout_secs: u64,
}

impl OpenAIProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| RagError::config("embedding.model required for OpenAI provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| RagError::config("embedding.dims required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| RagError::config("OPENAI_API_KEY environment variable not set"))?;

        Ok(Self {
            client: http::build_client(config.timeout_secs)?,
            api_key,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| DEFAULT_OPENAI_URL.to_string()),
            model,
            model_version: config.model_version().to_string(),
            dims,
            timeout_secs: config.timeout_secs,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAIProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn model_version(&self) -> &str {
        &self.model_version
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let endpoint = format!("{}/embeddings", self.url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let response = self
            .client
            .post(&endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| http::send_error("OpenAI", &self.url, self.timeout_secs, e))?;
        let response = http::check_status("OpenAI", response).await?;
        let json = http::read_json("OpenAI", response).await?;
        parse_openai_response(&json)
    }
}

/// Extract `data[].embedding`, ordered by `data[].index`.
fn parse_openai_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| RagError::rejected("Invalid OpenAI response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (position, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(position);
        let embedding = item
            .get("embedding")
            .and_then(|e| e.as_array())
            .ok_or_else(|| RagError::rejected("Invalid OpenAI response: missing embedding"))?;
        indexed.push((index, to_f32_vec(embedding)?));
    }

    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

// ============ Ollama Provider ============

/// Embedding provider using a local Ollama instance.
///
/// Requires Ollama running with an embedding model pulled
/// (e.g. `ollama pull nomic-embed-text`).
pub struct OllamaProvider {
    client: Client,
    url: String,
    model: String,
    model_version: String,
    dims: usize,
    timeout_secs: u64,
}

impl OllamaProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| RagError::config("embedding.model required for Ollama provider"))?;
        let dims = config
            .dims
            .ok_or_else(|| RagError::config("embedding.dims required for Ollama provider"))?;

        Ok(Self {
            client: http::build_client(config.timeout_secs)?,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| DEFAULT_OLLAMA_URL.to_string()),
            model,
            model_version: config.model_version().to_string(),
            dims,
            timeout_secs: config.timeout_secs,
        })
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    fn model_name(&self) -> &str {
        &self.model
    }
    fn model_version(&self) -> &str {
        &self.model_version
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });

        let response = self
            .client
            .post(format!("{}/api/embed", self.url.trim_end_matches('/')))
            .json(&body)
            .send()
            .await
            .map_err(|e| http::send_error("Ollama", &self.url, self.timeout_secs, e))?;
        let response = http::check_status("Ollama", response).await?;
        let json = http::read_json("Ollama", response).await?;
        parse_ollama_response(&json)
    }
}

fn parse_ollama_response(json: &serde_json::Value) -> Result<Vec<Vec<f32>>> {
    let embeddings = json
        .get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| RagError::rejected("Invalid Ollama response: missing embeddings array"))?;

    embeddings
        .iter()
        .map(|embedding| {
            embedding
                .as_array()
                .ok_or_else(|| RagError::rejected("Invalid Ollama response: embedding is not an array"))
                .and_then(|values| to_f32_vec(values))
        })
        .collect()
}

fn to_f32_vec(values: &[serde_json::Value]) -> Result<Vec<f32>> {
    values
        .iter()
        .map(|v| {
            let f = v
                .as_f64()
                .ok_or_else(|| RagError::rejected("Invalid embedding response: non-numeric value"))?;
            let x = f as f32;
            if !x.is_finite() {
                return Err(RagError::rejected(format!(
                    "Invalid embedding response: {} is out of f32 range",
                    f
                )));
            }
            Ok(x)
        })
        .collect()
}

// ============ Local Provider (fastembed) ============

/// Embedding provider for local ONNX inference via fastembed.
///
/// The model is downloaded from Hugging Face on first use and cached; after
/// that embeddings run offline. Inference runs on the blocking pool.
#[cfg(feature = "local-embeddings-fastembed")]
pub struct LocalProvider {
    model: Arc<std::sync::Mutex<fastembed::TextEmbedding>>,
    model_name: String,
    model_version: String,
    dims: usize,
}

#[cfg(feature = "local-embeddings-fastembed")]
impl LocalProvider {
    pub fn new(config: &EmbeddingConfig) -> Result<Self> {
        let model_name = config
            .model
            .clone()
            .unwrap_or_else(|| "multilingual-e5-small".to_string());
        let dims = config.dims.unwrap_or(match model_name.as_str() {
            "all-minilm-l6-v2" | "bge-small-en-v1.5" | "multilingual-e5-small" => 384,
            "bge-base-en-v1.5" | "multilingual-e5-base" => 768,
            "nomic-embed-text-v1" | "nomic-embed-text-v1.5" => 768,
            "bge-large-en-v1.5" | "multilingual-e5-large" => 1024,
            _ => 384,
        });

        let fastembed_model = config_to_fastembed_model(&model_name)?;
        let model = fastembed::TextEmbedding::try_new(
            fastembed::InitOptions::new(fastembed_model).with_show_download_progress(false),
        )
        .map_err(|e| RagError::rejected(format!("Failed to initialize local embedding model: {}", e)))?;

        Ok(Self {
            model: Arc::new(std::sync::Mutex::new(model)),
            model_name,
            model_version: config.model_version().to_string(),
            dims,
        })
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
fn config_to_fastembed_model(name: &str) -> Result<fastembed::EmbeddingModel> {
    match name {
        "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        "bge-large-en-v1.5" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
        "nomic-embed-text-v1" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV1),
        "nomic-embed-text-v1.5" => Ok(fastembed::EmbeddingModel::NomicEmbedTextV15),
        "multilingual-e5-small" => Ok(fastembed::EmbeddingModel::MultilingualE5Small),
        "multilingual-e5-base" => Ok(fastembed::EmbeddingModel::MultilingualE5Base),
        "multilingual-e5-large" => Ok(fastembed::EmbeddingModel::MultilingualE5Large),
        other => Err(RagError::config(format!(
            "Unknown local embedding model: '{}'. Supported models: \
             all-minilm-l6-v2, bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5, \
             nomic-embed-text-v1, nomic-embed-text-v1.5, \
             multilingual-e5-small, multilingual-e5-base, multilingual-e5-large",
            other
        ))),
    }
}

#[cfg(feature = "local-embeddings-fastembed")]
#[async_trait]
impl EmbeddingProvider for LocalProvider {
    fn model_name(&self) -> &str {
        &self.model_name
    }
    fn model_version(&self) -> &str {
        &self.model_version
    }
    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let model = Arc::clone(&self.model);
        let texts = texts.to_vec();
        tokio::task::spawn_blocking(move || {
            let mut model = model
                .lock()
                .map_err(|_| RagError::rejected("local embedding model lock poisoned"))?;
            model
                .embed(texts, None)
                .map_err(|e| RagError::rejected(format!("Local embedding failed: {}", e)))
        })
        .await
        .map_err(|e| RagError::rejected(format!("Local embedding task failed: {}", e)))?
    }
}

/// Create the configured [`EmbeddingProvider`].
///
/// | Config Value | Provider |
/// |-------------|----------|
/// | `"hashing"` | [`HashingEmbedder`] |
/// | `"openai"` | [`OpenAIProvider`] |
/// | `"ollama"` | [`OllamaProvider`] |
/// | `"local"` | `LocalProvider` (requires `local-embeddings-fastembed`) |
pub fn create_provider(config: &EmbeddingConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    match config.provider.as_str() {
        "hashing" => Ok(Arc::new(HashingEmbedder::new(
            config.dims.unwrap_or(DEFAULT_HASHING_DIMS),
        ))),
        "openai" => Ok(Arc::new(OpenAIProvider::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaProvider::new(config)?)),
        #[cfg(feature = "local-embeddings-fastembed")]
        "local" => Ok(Arc::new(LocalProvider::new(config)?)),
        #[cfg(not(feature = "local-embeddings-fastembed"))]
        "local" => Err(RagError::config(
            "Local embedding provider requires --features local-embeddings-fastembed",
        )),
        other => Err(RagError::config(format!(
            "Unknown embedding provider: {}",
            other
        ))),
    }
}
