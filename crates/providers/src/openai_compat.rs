//! OpenAI-compatible provider implementation.
//!
//! Works with OpenAI, Groq, and any endpoint exposing the
//! `/chat/completions` shape. Groq serves an OpenAI-compatible API at
//! `https://api.groq.com/openai/v1`, so one adapter covers both.
//!
//! Embeddings and moderation are OpenAI endpoints; adapters built for
//! other backends leave them at the unsupported default.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use turnloom_core::{
    ChatMessage, EmbedResponse, GenerateRequest, GenerateResponse, ModerationResponse, Provider,
    ProviderError, ResponseFormat, Role, StepMetrics,
};

pub const OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const GROQ_BASE_URL: &str = "https://api.groq.com/openai/v1";

/// An OpenAI-compatible LLM provider.
pub struct OpenAiCompatProvider {
    name: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
    /// Whether this backend serves `/embeddings`.
    supports_embeddings: bool,
    /// Whether this backend serves `/moderations`.
    supports_moderation: bool,
}

impl OpenAiCompatProvider {
    pub fn new(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self::with_timeout(name, base_url, api_key, Duration::from_secs(120))
    }

    pub fn with_timeout(
        name: impl Into<String>,
        base_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();

        Self {
            name: name.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client,
            supports_embeddings: false,
            supports_moderation: false,
        }
    }

    /// OpenAI with embeddings and moderation enabled.
    pub fn openai(api_key: impl Into<String>) -> Self {
        let mut p = Self::new("openai", OPENAI_BASE_URL, api_key);
        p.supports_embeddings = true;
        p.supports_moderation = true;
        p
    }

    /// Groq (chat completions only).
    pub fn groq(api_key: impl Into<String>) -> Self {
        Self::new("groq", GROQ_BASE_URL, api_key)
    }

    /// Mark which optional endpoints this backend serves.
    pub fn with_capabilities(mut self, embeddings: bool, moderation: bool) -> Self {
        self.supports_embeddings = embeddings;
        self.supports_moderation = moderation;
        self
    }

    fn to_api_messages(messages: &[ChatMessage]) -> Vec<ApiMessage> {
        messages
            .iter()
            .map(|m| ApiMessage {
                role: match m.role {
                    Role::User => "user",
                    Role::Assistant => "assistant",
                    Role::System => "system",
                    Role::Tool => "tool",
                }
                .into(),
                content: m.content.clone(),
            })
            .collect()
    }

    fn map_error_status(status: u16, body: String, retry_after: Option<u64>) -> ProviderError {
        match status {
            401 | 403 => {
                ProviderError::Auth("Invalid API key or insufficient permissions".into())
            }
            400 | 404 | 422 => ProviderError::BadRequest(body),
            429 => ProviderError::RateLimited {
                retry_after_secs: retry_after,
            },
            503 => ProviderError::Unavailable(body),
            s => ProviderError::Api {
                status: s,
                message: body,
            },
        }
    }

    async fn post_json(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> std::result::Result<reqwest::Response, ProviderError> {
        let url = format!("{}{path}", self.base_url);
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ProviderError::Timeout(e.to_string())
                } else {
                    ProviderError::Network(e.to_string())
                }
            })?;

        let status = response.status().as_u16();
        if status != 200 {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok());
            let error_body = response.text().await.unwrap_or_default();
            warn!(provider = %self.name, status, body = %error_body, "Provider returned error");
            return Err(Self::map_error_status(status, error_body, retry_after));
        }

        Ok(response)
    }
}

#[async_trait]
impl Provider for OpenAiCompatProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(
        &self,
        request: GenerateRequest,
    ) -> std::result::Result<GenerateResponse, ProviderError> {
        let mut ignored_options = Vec::new();
        let opts = &request.options;

        let mut body = serde_json::json!({
            "model": request.model,
            "messages": Self::to_api_messages(&request.messages),
            "stream": false,
        });

        if let Some(t) = opts.temperature {
            body["temperature"] = serde_json::json!(t);
        }
        if let Some(m) = opts.max_tokens {
            body["max_tokens"] = serde_json::json!(m);
        }
        if let Some(p) = opts.top_p {
            body["top_p"] = serde_json::json!(p);
        }
        if !opts.stop.is_empty() {
            body["stop"] = serde_json::json!(opts.stop);
        }
        if opts.response_format == ResponseFormat::Json {
            body["response_format"] = serde_json::json!({ "type": "json_object" });
        }
        if opts.stream {
            ignored_options.push("stream".to_string());
        }

        debug!(provider = %self.name, model = %request.model, "Sending completion request");
        let started = Instant::now();

        let response = self.post_json("/chat/completions", &body).await?;

        let api_response: ApiResponse =
            response.json().await.map_err(|e| ProviderError::Api {
                status: 200,
                message: format!("Failed to parse response: {e}"),
            })?;

        let latency_ms = started.elapsed().as_millis() as u64;

        let choice = api_response
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::Api {
                status: 200,
                message: "No choices in response".into(),
            })?;

        Ok(GenerateResponse {
            content: choice.message.content.unwrap_or_default(),
            finish_reason: choice.finish_reason,
            metrics: StepMetrics {
                latency_ms,
                prompt_tokens: api_response.usage.as_ref().map(|u| u.prompt_tokens),
                completion_tokens: api_response.usage.as_ref().map(|u| u.completion_tokens),
                provider: Some(self.name.clone()),
                model: Some(api_response.model),
                ..StepMetrics::default()
            },
            ignored_options,
        })
    }

    async fn embed(
        &self,
        inputs: Vec<String>,
        model: &str,
    ) -> std::result::Result<EmbedResponse, ProviderError> {
        if !self.supports_embeddings {
            return Err(ProviderError::Unsupported(format!(
                "Provider '{}' does not support embeddings",
                self.name
            )));
        }

        let body = serde_json::json!({ "model": model, "input": inputs });
        let started = Instant::now();
        let response = self.post_json("/embeddings", &body).await?;

        let api_response: EmbeddingApiResponse =
            response.json().await.map_err(|e| ProviderError::Api {
                status: 200,
                message: format!("Failed to parse embedding response: {e}"),
            })?;

        let mut data = api_response.data;
        data.sort_by_key(|d| d.index);

        Ok(EmbedResponse {
            vectors: data.into_iter().map(|d| d.embedding).collect(),
            metrics: StepMetrics {
                latency_ms: started.elapsed().as_millis() as u64,
                prompt_tokens: api_response.usage.as_ref().map(|u| u.prompt_tokens),
                provider: Some(self.name.clone()),
                model: Some(model.to_string()),
                ..StepMetrics::default()
            },
        })
    }

    async fn moderate(
        &self,
        input: &str,
        model: &str,
    ) -> std::result::Result<ModerationResponse, ProviderError> {
        if !self.supports_moderation {
            return Err(ProviderError::Unsupported(format!(
                "Provider '{}' does not support moderation",
                self.name
            )));
        }

        let body = serde_json::json!({ "model": model, "input": input });
        let started = Instant::now();
        let response = self.post_json("/moderations", &body).await?;

        let api_response: ModerationApiResponse =
            response.json().await.map_err(|e| ProviderError::Api {
                status: 200,
                message: format!("Failed to parse moderation response: {e}"),
            })?;

        let result = api_response
            .results
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::Api {
                status: 200,
                message: "No results in moderation response".into(),
            })?;

        Ok(ModerationResponse {
            flagged: result.flagged,
            categories: result.categories,
            metrics: StepMetrics {
                latency_ms: started.elapsed().as_millis() as u64,
                provider: Some(self.name.clone()),
                model: Some(model.to_string()),
                ..StepMetrics::default()
            },
        })
    }
}

// --- API types ---

#[derive(Debug, Serialize)]
struct ApiMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    model: String,
    choices: Vec<ApiChoice>,
    #[serde(default)]
    usage: Option<ApiUsage>,
}

#[derive(Debug, Deserialize)]
struct ApiChoice {
    message: ApiResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct EmbeddingApiResponse {
    data: Vec<EmbeddingDatum>,
    #[serde(default)]
    usage: Option<EmbeddingUsage>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingDatum {
    index: usize,
    embedding: Vec<f32>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingUsage {
    prompt_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ModerationApiResponse {
    results: Vec<ModerationResult>,
}

#[derive(Debug, Deserialize)]
struct ModerationResult {
    flagged: bool,
    #[serde(default)]
    categories: serde_json::Map<String, serde_json::Value>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructors() {
        let openai = OpenAiCompatProvider::openai("sk-test");
        assert_eq!(openai.name(), "openai");
        assert_eq!(openai.base_url, OPENAI_BASE_URL);
        assert!(openai.supports_embeddings);
        assert!(openai.supports_moderation);

        let groq = OpenAiCompatProvider::groq("gsk-test");
        assert_eq!(groq.name(), "groq");
        assert_eq!(groq.base_url, GROQ_BASE_URL);
        assert!(!groq.supports_embeddings);
    }

    #[tokio::test]
    async fn groq_embeddings_unsupported() {
        let groq = OpenAiCompatProvider::groq("gsk-test");
        let err = groq
            .embed(vec!["text".into()], "any-model")
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::Unsupported(_)));
        let err = groq.moderate("text", "any-model").await.unwrap_err();
        assert!(matches!(err, ProviderError::Unsupported(_)));
    }

    #[test]
    fn message_conversion() {
        let messages = vec![
            ChatMessage::system("Be brief"),
            ChatMessage::user("Hello"),
            ChatMessage::assistant("Hi"),
        ];
        let api = OpenAiCompatProvider::to_api_messages(&messages);
        assert_eq!(api.len(), 3);
        assert_eq!(api[0].role, "system");
        assert_eq!(api[1].role, "user");
        assert_eq!(api[2].content, "Hi");
    }

    #[test]
    fn error_status_mapping() {
        assert!(matches!(
            OpenAiCompatProvider::map_error_status(401, String::new(), None),
            ProviderError::Auth(_)
        ));
        assert!(matches!(
            OpenAiCompatProvider::map_error_status(429, String::new(), Some(3)),
            ProviderError::RateLimited {
                retry_after_secs: Some(3)
            }
        ));
        assert!(matches!(
            OpenAiCompatProvider::map_error_status(503, String::new(), None),
            ProviderError::Unavailable(_)
        ));
        assert!(matches!(
            OpenAiCompatProvider::map_error_status(502, String::new(), None),
            ProviderError::Api { status: 502, .. }
        ));
    }

    #[test]
    fn parse_chat_response() {
        let resp: ApiResponse = serde_json::from_str(
            r#"{
                "model": "gpt-4o-2024-08-06",
                "choices": [{
                    "message": {"role": "assistant", "content": "4"},
                    "finish_reason": "stop"
                }],
                "usage": {"prompt_tokens": 12, "completion_tokens": 1, "total_tokens": 13}
            }"#,
        )
        .unwrap();

        assert_eq!(resp.choices[0].message.content.as_deref(), Some("4"));
        assert_eq!(resp.usage.unwrap().prompt_tokens, 12);
    }

    #[test]
    fn parse_embedding_response_preserves_order() {
        let resp: EmbeddingApiResponse = serde_json::from_str(
            r#"{
                "data": [
                    {"index": 1, "embedding": [0.3, 0.4]},
                    {"index": 0, "embedding": [0.1, 0.2]}
                ],
                "usage": {"prompt_tokens": 8}
            }"#,
        )
        .unwrap();

        let mut data = resp.data;
        data.sort_by_key(|d| d.index);
        assert_eq!(data[0].embedding, vec![0.1, 0.2]);
        assert_eq!(data[1].embedding, vec![0.3, 0.4]);
    }
}
