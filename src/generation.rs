//! Language-model implementations.
//!
//! - **extractive**: [`ExtractiveModel`] from the core crate; offline,
//!   quotes the leading sentence of each passage.
//! - **[`OpenAIChatModel`]**: `POST {url}/chat/completions`
//!   (OpenAI-compatible). Requires `OPENAI_API_KEY`.
//! - **[`OllamaChatModel`]**: `POST {url}/api/chat` with `stream: false`.
//!
//! Each `generate` call is a single request; timeouts and retries are
//! applied by the [`Synthesizer`](crate::synthesizer::Synthesizer).

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

pub use lexrag_core::generation::{ExtractiveModel, GenerationRequest, LanguageModel};
use lexrag_core::{RagError, Result};

use crate::config::GenerationConfig;
use crate::http;

const DEFAULT_OPENAI_URL: &str = "https://api.openai.com/v1";
const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatMessage {
    role: String,
    content: String,
}

fn messages(request: &GenerationRequest) -> Vec<ChatMessage> {
    vec![
        ChatMessage {
            role: "system".into(),
            content: request.system.clone(),
        },
        ChatMessage {
            role: "user".into(),
            content: request.prompt.clone(),
        },
    ]
}

// ============ OpenAI ============

#[derive(Debug, Serialize)]
struct OpenAIChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f32,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct OpenAIChatResponse {
    choices: Vec<OpenAIChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: ChatMessage,
}

pub struct OpenAIChatModel {
    client: Client,
    api_key: String,
    url: String,
    model: String,
    timeout_secs: u64,
}

impl OpenAIChatModel {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| RagError::config("generation.model required for OpenAI provider"))?;
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
            timeout_secs: config.timeout_secs,
        })
    }
}

#[async_trait]
impl LanguageModel for OpenAIChatModel {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        let body = OpenAIChatRequest {
            model: self.model.clone(),
            messages: messages(request),
            temperature: request.temperature,
            max_tokens: request.max_tokens,
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.url.trim_end_matches('/')))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&body)
            .send()
            .await
            .map_err(|e| http::send_error("OpenAI", &self.url, self.timeout_secs, e))?;
        let response = http::check_status("OpenAI", response).await?;
        let parsed: OpenAIChatResponse = response
            .json()
            .await
            .map_err(|e| RagError::Generation(format!("Invalid OpenAI chat response: {}", e)))?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| RagError::Generation("OpenAI chat response had no choices".into()))
    }
}

// ============ Ollama ============

#[derive(Debug, Serialize)]
struct OllamaChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    options: HashMap<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct OllamaChatResponse {
    message: ChatMessage,
}

pub struct OllamaChatModel {
    client: Client,
    url: String,
    model: String,
    timeout_secs: u64,
}

impl OllamaChatModel {
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| RagError::config("generation.model required for Ollama provider"))?;
        Ok(Self {
            client: http::build_client(config.timeout_secs)?,
            url: config
                .url
                .clone()
                .unwrap_or_else(|| DEFAULT_OLLAMA_URL.to_string()),
            model,
            timeout_secs: config.timeout_secs,
        })
    }
}

#[async_trait]
impl LanguageModel for OllamaChatModel {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        let mut options = HashMap::new();
        options.insert("temperature".to_string(), serde_json::json!(request.temperature));
        options.insert("num_predict".to_string(), serde_json::json!(request.max_tokens));

        let body = OllamaChatRequest {
            model: self.model.clone(),
            messages: messages(request),
            stream: false,
            options,
        };

        let response = self
            .client
            .post(format!("{}/api/chat", self.url.trim_end_matches('/')))
            .json(&body)
            .send()
            .await
            .map_err(|e| http::send_error("Ollama", &self.url, self.timeout_secs, e))?;
        let response = http::check_status("Ollama", response).await?;
        let parsed: OllamaChatResponse = response
            .json()
            .await
            .map_err(|e| RagError::Generation(format!("Invalid Ollama chat response: {}", e)))?;
        Ok(parsed.message.content)
    }
}

/// Create the configured [`LanguageModel`].
pub fn create_model(config: &GenerationConfig) -> Result<Arc<dyn LanguageModel>> {
    match config.provider.as_str() {
        "extractive" => Ok(Arc::new(ExtractiveModel::new())),
        "openai" => Ok(Arc::new(OpenAIChatModel::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaChatModel::new(config)?)),
        other => Err(RagError::config(format!(
            "Unknown generation provider: {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ollama_request_shape() {
        let req = GenerationRequest {
            system: "sys".into(),
            prompt: "frage".into(),
            sources: Vec::new(),
            temperature: 0.2,
            max_tokens: 128,
        };
        let mut options = HashMap::new();
        options.insert("num_predict".to_string(), serde_json::json!(req.max_tokens));
        let body = OllamaChatRequest {
            model: "llama3".into(),
            messages: messages(&req),
            stream: false,
            options,
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json["stream"], false);
        assert_eq!(json["messages"][0]["role"], "system");
        assert_eq!(json["messages"][1]["content"], "frage");
        assert_eq!(json["options"]["num_predict"], 128);
    }

    #[test]
    fn test_openai_response_parse() {
        let parsed: OpenAIChatResponse = serde_json::from_value(serde_json::json!({
            "choices": [{"index": 0, "message": {"role": "assistant", "content": "Antwort [Q1]"}}]
        }))
        .unwrap();
        assert_eq!(parsed.choices[0].message.content, "Antwort [Q1]");
    }

    #[test]
    fn test_create_model() {
        let model = create_model(&GenerationConfig::default()).unwrap();
        assert_eq!(model.model_name(), "extractive");
        let bad = GenerationConfig {
            provider: "gpt2-local".into(),
            ..GenerationConfig::default()
        };
        assert!(matches!(create_model(&bad), Err(RagError::Configuration(_))));
    }
}
