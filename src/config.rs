//! Configuration parsing and validation.
//!
//! lexrag is configured via a TOML file (default: `config/lexrag.toml`).
//! Every section except `[db]` has defaults, so a minimal file is:
//!
//! ```toml
//! [db]
//! path = "./data/lexrag.sqlite"
//! ```
//!
//! # Sections
//!
//! | Section | Purpose |
//! |---------|---------|
//! | `[db]` | SQLite database path |
//! | `[chunking]` | Chunk size, overlap and minimum structural chunk, in characters |
//! | `[embedding]` | Embedding provider, model identity, batching, retries, timeout |
//! | `[generation]` | Language model, sampling, retries, backoff, timeout |
//! | `[retrieval]` | Default `top_k` and relevance threshold |
//! | `[ingest]` | Ingestion concurrency, boilerplate lines, feed excludes |
//! | `[logging]` | Default log level (`RUST_LOG` overrides) |
//!
//! [`load_config`] validates the parsed file and fails fast on invalid
//! tunables; [`Config::validate`] is also called by
//! [`RagPipeline::new`](crate::pipeline::RagPipeline::new).

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use lexrag_core::chunk::ChunkParams;
use lexrag_core::normalize::{Boilerplate, DEFAULT_BOILERPLATE};
use lexrag_core::search::SearchParams;
use lexrag_core::RagError;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    pub min_chunk_size: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1500,
            chunk_overlap: 200,
            min_chunk_size: 300,
        }
    }
}

impl ChunkingConfig {
    pub fn params(&self) -> Result<ChunkParams, RagError> {
        ChunkParams::with_min(self.chunk_size, self.chunk_overlap, self.min_chunk_size)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EmbeddingConfig {
    /// `hashing`, `openai`, `ollama` or `local`.
    pub provider: String,
    pub model: Option<String>,
    /// Model revision recorded with every vector. Defaults to `"1"`.
    pub model_version: Option<String>,
    pub dims: Option<usize>,
    /// Base URL for `openai` (default `https://api.openai.com/v1`) or
    /// `ollama` (default `http://localhost:11434`).
    pub url: Option<String>,
    pub batch_size: usize,
    pub max_concurrency: usize,
    pub max_retries: u32,
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: "hashing".to_string(),
            model: None,
            model_version: None,
            dims: None,
            url: None,
            batch_size: 32,
            max_concurrency: 2,
            max_retries: 3,
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct GenerationConfig {
    /// `extractive`, `openai` or `ollama`.
    pub provider: String,
    pub model: Option<String>,
    pub url: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
    pub max_retries: u32,
    pub timeout_secs: u64,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: "extractive".to_string(),
            model: None,
            url: None,
            temperature: 0.1,
            max_tokens: 1024,
            max_retries: 3,
            timeout_secs: 60,
            backoff_base_ms: 1000,
            backoff_max_ms: 32_000,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetrievalConfig {
    pub top_k: i64,
    pub score_threshold: Option<f32>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            top_k: 5,
            score_threshold: Some(0.3),
        }
    }
}

impl RetrievalConfig {
    pub fn params(&self) -> Result<SearchParams, RagError> {
        SearchParams::new(self.top_k, self.score_threshold)
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct IngestConfig {
    pub concurrency: usize,
    /// Extra boilerplate lines, added to the built-in portal list.
    pub boilerplate: Vec<String>,
    /// Globs of feed files to skip when ingesting a directory.
    pub exclude_globs: Vec<String>,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            boilerplate: Vec::new(),
            exclude_globs: Vec::new(),
        }
    }
}

impl IngestConfig {
    /// Built-in portal boilerplate plus the configured extra lines.
    pub fn boilerplate(&self) -> Boilerplate {
        Boilerplate::new(
            DEFAULT_BOILERPLATE
                .iter()
                .map(|s| s.to_string())
                .chain(self.boilerplate.iter().cloned()),
        )
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl EmbeddingConfig {
    pub fn model_version(&self) -> &str {
        self.model_version.as_deref().unwrap_or("1")
    }
}

impl Config {
    /// Check every tunable and provider combination.
    pub fn validate(&self) -> Result<(), RagError> {
        self.chunking.params()?;
        self.retrieval.params()?;

        let e = &self.embedding;
        match e.provider.as_str() {
            "hashing" | "local" => {}
            "openai" | "ollama" => {
                if e.model.is_none() {
                    return Err(RagError::config(format!(
                        "embedding.model must be specified when provider is '{}'",
                        e.provider
                    )));
                }
                if e.dims.unwrap_or(0) == 0 {
                    return Err(RagError::config(format!(
                        "embedding.dims must be > 0 when provider is '{}'",
                        e.provider
                    )));
                }
            }
            other => {
                return Err(RagError::config(format!(
                    "Unknown embedding provider: '{}'. Must be hashing, openai, ollama, or local.",
                    other
                )))
            }
        }
        if e.dims == Some(0) {
            return Err(RagError::config("embedding.dims must be > 0"));
        }
        if e.batch_size == 0 {
            return Err(RagError::config("embedding.batch_size must be > 0"));
        }
        if e.max_concurrency == 0 {
            return Err(RagError::config("embedding.max_concurrency must be > 0"));
        }
        if e.timeout_secs == 0 {
            return Err(RagError::config("embedding.timeout_secs must be > 0"));
        }

        let g = &self.generation;
        match g.provider.as_str() {
            "extractive" => {}
            "openai" | "ollama" => {
                if g.model.is_none() {
                    return Err(RagError::config(format!(
                        "generation.model must be specified when provider is '{}'",
                        g.provider
                    )));
                }
            }
            other => {
                return Err(RagError::config(format!(
                    "Unknown generation provider: '{}'. Must be extractive, openai, or ollama.",
                    other
                )))
            }
        }
        if !(0.0..=2.0).contains(&g.temperature) {
            return Err(RagError::config("generation.temperature must be in [0.0, 2.0]"));
        }
        if g.max_tokens == 0 {
            return Err(RagError::config("generation.max_tokens must be > 0"));
        }
        if g.timeout_secs == 0 {
            return Err(RagError::config("generation.timeout_secs must be > 0"));
        }
        if g.backoff_base_ms > g.backoff_max_ms {
            return Err(RagError::config(
                "generation.backoff_base_ms must not exceed generation.backoff_max_ms",
            ));
        }

        if self.ingest.concurrency == 0 {
            return Err(RagError::config("ingest.concurrency must be > 0"));
        }
        Ok(())
    }
}

/// Read, parse and validate a config file.
pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_text: &str) -> Config {
        toml::from_str(toml_text).unwrap()
    }

    #[test]
    fn test_minimal_config_defaults() {
        let config = parse("[db]\npath = \"./data/lexrag.sqlite\"\n");
        assert_eq!(config.chunking.chunk_size, 1500);
        assert_eq!(config.embedding.provider, "hashing");
        assert_eq!(config.embedding.model_version(), "1");
        assert_eq!(config.generation.provider, "extractive");
        assert_eq!(config.retrieval.top_k, 5);
        config.validate().unwrap();
    }

    #[test]
    fn test_overlap_must_be_smaller_than_size() {
        let config = parse(
            "[db]\npath = \"x\"\n[chunking]\nchunk_size = 500\nchunk_overlap = 500\nmin_chunk_size = 100\n",
        );
        assert!(matches!(config.validate(), Err(RagError::Configuration(_))));
    }

    #[test]
    fn test_top_k_must_be_positive() {
        let config = parse("[db]\npath = \"x\"\n[retrieval]\ntop_k = 0\n");
        assert!(matches!(config.validate(), Err(RagError::Configuration(_))));
    }

    #[test]
    fn test_remote_providers_need_model() {
        let config = parse("[db]\npath = \"x\"\n[embedding]\nprovider = \"openai\"\ndims = 1536\n");
        assert!(config.validate().is_err());

        let config = parse("[db]\npath = \"x\"\n[generation]\nprovider = \"ollama\"\n");
        assert!(config.validate().is_err());

        let config = parse(
            "[db]\npath = \"x\"\n[embedding]\nprovider = \"ollama\"\nmodel = \"nomic-embed-text\"\ndims = 768\n",
        );
        config.validate().unwrap();
    }

    #[test]
    fn test_unknown_provider_rejected() {
        let config = parse("[db]\npath = \"x\"\n[embedding]\nprovider = \"word2vec\"\n");
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("Unknown embedding provider"));
    }

    #[test]
    fn test_boilerplate_extends_portal_defaults() {
        let config = parse("[db]\npath = \"x\"\n[ingest]\nboilerplate = [\"Gesamtes Gesetz\"]\n");
        let text = lexrag_core::normalize::normalize_text(
            "Nach oben\nGesamtes Gesetz\n§ 1 Ziel",
            &config.ingest.boilerplate(),
        );
        assert_eq!(text, "§ 1 Ziel");
    }

    #[test]
    fn test_load_config_reports_missing_file() {
        let err = load_config(Path::new("/nonexistent/lexrag.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
