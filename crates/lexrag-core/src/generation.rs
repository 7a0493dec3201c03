//! Language-model trait and the offline extractive model.
//!
//! HTTP-backed models (OpenAI chat completions, Ollama `/api/chat`) live in
//! the `lexrag` app crate.

use async_trait::async_trait;

use crate::error::Result;

/// One prompt-ready source passage.
#[derive(Debug, Clone)]
pub struct SourcePassage {
    /// Citation marker, e.g. `[Q1]`.
    pub marker: String,
    pub title: Option<String>,
    pub source_url: String,
    pub text: String,
}

/// A grounded generation request.
///
/// `system` and `prompt` carry the rendered instructions and user message;
/// `sources` repeats the passages in structured form for models that do not
/// read prose.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub system: String,
    pub prompt: String,
    pub sources: Vec<SourcePassage>,
    pub temperature: f32,
    pub max_tokens: u32,
}

/// Trait for language-model backends.
#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn model_name(&self) -> &str;
    /// Produce the raw answer text. Retries and timeouts are applied by the
    /// caller.
    async fn generate(&self, request: &GenerationRequest) -> Result<String>;
}

/// Offline model that answers by quoting the leading sentence of each
/// source passage, cited with its marker.
#[derive(Debug, Clone, Default)]
pub struct ExtractiveModel {
    /// Maximum number of passages quoted.
    pub max_sources: Option<usize>,
}

pub const EXTRACTIVE_MODEL_NAME: &str = "extractive";

impl ExtractiveModel {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LanguageModel for ExtractiveModel {
    fn model_name(&self) -> &str {
        EXTRACTIVE_MODEL_NAME
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        let limit = self.max_sources.unwrap_or(usize::MAX);
        let lines: Vec<String> = request
            .sources
            .iter()
            .take(limit)
            .filter_map(|s| {
                let sentence = leading_sentence(&s.text);
                (!sentence.is_empty()).then(|| format!("{} {}", sentence, s.marker))
            })
            .collect();
        Ok(lines.join("\n"))
    }
}

/// Abbreviations common in statute citations that do not end a sentence.
const ABBREVIATIONS: &[&str] = &["Abs", "Art", "Nr", "Satz", "S", "bzw", "ggf", "vgl", "gem", "u", "z", "B"];

/// First sentence of a passage, whitespace-collapsed, capped at 300 chars.
fn leading_sentence(text: &str) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    let mut end = flat.len();
    for (i, c) in flat.char_indices() {
        if !matches!(c, '.' | '!' | '?') {
            continue;
        }
        let next = flat[i + c.len_utf8()..].chars().next();
        if next.is_some_and(|n| n != ' ') {
            continue;
        }
        let word = flat[..i].rsplit(' ').next().unwrap_or("");
        if c == '.' && ABBREVIATIONS.contains(&word) {
            continue;
        }
        end = i + c.len_utf8();
        break;
    }
    let sentence = &flat[..end];
    if sentence.chars().count() > 300 {
        let cut: String = sentence.chars().take(300).collect();
        format!("{}…", cut.trim_end())
    } else {
        sentence.to_string()
    }
}
