//! Provider trait — the abstraction over LLM backends.
//!
//! A Provider knows how to send a conversation to an LLM and return a
//! response with uniform metrics. Implementations: Anthropic native,
//! OpenAI-compatible (OpenAI, Groq), mock.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;
use crate::models::{ChatMessage, StepMetrics};

/// Output shape requested from the model.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseFormat {
    #[default]
    Text,
    Json,
}

/// Options recognized uniformly across providers. Adapters ignore options
/// they cannot honor and record that in the response metrics metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerateOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub response_format: ResponseFormat,
}

/// A request for a completion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateRequest {
    pub model: String,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub options: GenerateOptions,
}

impl GenerateRequest {
    pub fn new(model: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            model: model.into(),
            messages,
            options: GenerateOptions::default(),
        }
    }

    pub fn with_options(mut self, options: GenerateOptions) -> Self {
        self.options = options;
        self
    }
}

/// Token usage reported by a provider.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
}

impl Usage {
    pub fn total(&self) -> u32 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// A completion with uniform per-call metrics. Adapters fill latency,
/// tokens, provider, and model; the metered wrapper adds cost and attempt
/// counts.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerateResponse {
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
    pub metrics: StepMetrics,
    /// Options the adapter could not honor for this provider.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ignored_options: Vec<String>,
}

/// Embedding vectors for a batch of inputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedResponse {
    pub vectors: Vec<Vec<f32>>,
    pub metrics: StepMetrics,
}

/// Moderation verdict for a single input.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModerationResponse {
    pub flagged: bool,
    #[serde(default)]
    pub categories: serde_json::Map<String, serde_json::Value>,
    pub metrics: StepMetrics,
}

/// The core Provider trait.
///
/// Every LLM backend implements this. Implementations must be
/// concurrency-safe: one instance is shared across all in-flight steps
/// with a pooled HTTP client.
#[async_trait]
pub trait Provider: Send + Sync {
    /// A short name for this provider (e.g. "anthropic", "openai", "groq").
    fn name(&self) -> &str;

    /// Send a conversation and get a completion.
    async fn generate(
        &self,
        request: GenerateRequest,
    ) -> std::result::Result<GenerateResponse, ProviderError>;

    /// Generate embeddings for the given texts.
    ///
    /// Default implementation signals that embeddings are unsupported.
    async fn embed(
        &self,
        _inputs: Vec<String>,
        _model: &str,
    ) -> std::result::Result<EmbedResponse, ProviderError> {
        Err(ProviderError::Unsupported(format!(
            "Provider '{}' does not support embeddings",
            self.name()
        )))
    }

    /// Run content moderation on an input.
    ///
    /// Default implementation signals that moderation is unsupported.
    async fn moderate(
        &self,
        _input: &str,
        _model: &str,
    ) -> std::result::Result<ModerationResponse, ProviderError> {
        Err(ProviderError::Unsupported(format!(
            "Provider '{}' does not support moderation",
            self.name()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct GenerateOnly;

    #[async_trait]
    impl Provider for GenerateOnly {
        fn name(&self) -> &str {
            "generate_only"
        }

        async fn generate(
            &self,
            _request: GenerateRequest,
        ) -> std::result::Result<GenerateResponse, ProviderError> {
            Ok(GenerateResponse {
                content: "ok".into(),
                finish_reason: Some("stop".into()),
                metrics: StepMetrics::with_latency(1),
                ignored_options: vec![],
            })
        }
    }

    #[tokio::test]
    async fn optional_operations_default_to_unsupported() {
        let p = GenerateOnly;
        let err = p.embed(vec!["hi".into()], "any").await.unwrap_err();
        assert!(matches!(err, ProviderError::Unsupported(_)));
        let err = p.moderate("hi", "any").await.unwrap_err();
        assert!(matches!(err, ProviderError::Unsupported(_)));
    }

    #[test]
    fn options_default_to_text_format() {
        let opts = GenerateOptions::default();
        assert_eq!(opts.response_format, ResponseFormat::Text);
        assert!(!opts.stream);
    }

    #[test]
    fn request_serialization_skips_empty_fields() {
        let req = GenerateRequest::new("claude-sonnet-4", vec![ChatMessage::user("hi")]);
        let json = serde_json::to_string(&req).unwrap();
        assert!(!json.contains("stop"));
        assert!(!json.contains("temperature"));
    }
}
