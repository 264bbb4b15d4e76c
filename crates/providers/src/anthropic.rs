//! Anthropic native provider implementation.
//!
//! Uses Anthropic's Messages API directly:
//! - `x-api-key` header authentication (not Bearer)
//! - `anthropic-version` header
//! - System prompt as a top-level field
//!
//! Anthropic has no `response_format` parameter; a JSON format request is
//! recorded as an ignored option and the caller's prompt instruction has to
//! carry it.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use turnloom_core::{
    ChatMessage, GenerateRequest, GenerateResponse, Provider, ProviderError, ResponseFormat, Role,
    StepMetrics,
};

const ANTHROPIC_VERSION: &str = "2023-06-01";
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Anthropic native Messages API provider.
pub struct AnthropicProvider {
    name: String,
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl AnthropicProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_timeout(api_key, Duration::from_secs(120))
    }

    pub fn with_timeout(api_key: impl Into<String>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();

        Self {
            name: "anthropic".into(),
            base_url: DEFAULT_BASE_URL.into(),
            api_key: api_key.into(),
            client,
        }
    }

    /// Override the base URL (testing, proxies).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Anthropic takes the system prompt as a top-level field, not a
    /// message.
    fn extract_system(messages: &[ChatMessage]) -> (Option<String>, Vec<&ChatMessage>) {
        let mut system_parts: Vec<&str> = Vec::new();
        let mut non_system: Vec<&ChatMessage> = Vec::new();

        for msg in messages {
            match msg.role {
                Role::System => system_parts.push(&msg.content),
                _ => non_system.push(msg),
            }
        }

        let system = if system_parts.is_empty() {
            None
        } else {
            Some(system_parts.join("\n\n"))
        };

        (system, non_system)
    }

    fn to_api_messages(messages: &[&ChatMessage]) -> Vec<ApiMessage> {
        messages
            .iter()
            .map(|m| ApiMessage {
                role: match m.role {
                    Role::Assistant => "assistant".into(),
                    // Tool results travel as user messages in this API
                    _ => "user".into(),
                },
                content: m.content.clone(),
            })
            .collect()
    }

    fn map_error_status(status: u16, body: String, retry_after: Option<u64>) -> ProviderError {
        match status {
            401 | 403 => ProviderError::Auth("Invalid Anthropic API key".into()),
            400 | 404 | 422 => ProviderError::BadRequest(body),
            429 => ProviderError::RateLimited {
                retry_after_secs: retry_after,
            },
            529 => ProviderError::Unavailable("Anthropic overloaded".into()),
            s => ProviderError::Api {
                status: s,
                message: body,
            },
        }
    }
}

#[async_trait]
impl Provider for AnthropicProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(
        &self,
        request: GenerateRequest,
    ) -> std::result::Result<GenerateResponse, ProviderError> {
        let url = format!("{}/v1/messages", self.base_url);
        let (system, messages) = Self::extract_system(&request.messages);
        let api_messages = Self::to_api_messages(&messages);

        let mut ignored_options = Vec::new();
        let opts = &request.options;

        let mut body = serde_json::json!({
            "model": request.model,
            "messages": api_messages,
            "max_tokens": opts.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
        });

        if let Some(ref sys) = system {
            body["system"] = serde_json::json!(sys);
        }
        if let Some(t) = opts.temperature {
            body["temperature"] = serde_json::json!(t);
        }
        if let Some(p) = opts.top_p {
            body["top_p"] = serde_json::json!(p);
        }
        if !opts.stop.is_empty() {
            body["stop_sequences"] = serde_json::json!(opts.stop);
        }
        if opts.response_format == ResponseFormat::Json {
            ignored_options.push("response_format".to_string());
        }
        if opts.stream {
            ignored_options.push("stream".to_string());
        }

        debug!(provider = "anthropic", model = %request.model, "Sending completion request");
        let started = Instant::now();

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("Content-Type", "application/json")
            .json(&body)
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
            warn!(status, body = %error_body, "Anthropic API error");
            return Err(Self::map_error_status(status, error_body, retry_after));
        }

        let api_resp: ApiResponse = response.json().await.map_err(|e| ProviderError::Api {
            status: 200,
            message: format!("Failed to parse Anthropic response: {e}"),
        })?;

        let latency_ms = started.elapsed().as_millis() as u64;

        let content = api_resp
            .content
            .iter()
            .filter_map(|block| match block {
                ContentBlock::Text { text } => Some(text.as_str()),
            })
            .collect::<Vec<_>>()
            .join("\n");

        Ok(GenerateResponse {
            content,
            finish_reason: api_resp.stop_reason,
            metrics: StepMetrics {
                latency_ms,
                prompt_tokens: Some(api_resp.usage.input_tokens),
                completion_tokens: Some(api_resp.usage.output_tokens),
                provider: Some(self.name.clone()),
                model: Some(api_resp.model),
                ..StepMetrics::default()
            },
            ignored_options,
        })
    }
}

// --- Anthropic API types ---

#[derive(Debug, Serialize)]
struct ApiMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    model: String,
    content: Vec<ContentBlock>,
    usage: ApiUsage,
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
}

#[derive(Debug, Deserialize)]
struct ApiUsage {
    input_tokens: u32,
    output_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constructor_defaults() {
        let provider = AnthropicProvider::new("sk-ant-test");
        assert_eq!(provider.name(), "anthropic");
        assert_eq!(provider.base_url, DEFAULT_BASE_URL);
    }

    #[test]
    fn base_url_trailing_slash_trimmed() {
        let provider =
            AnthropicProvider::new("sk-ant-test").with_base_url("https://proxy.example.com/");
        assert_eq!(provider.base_url, "https://proxy.example.com");
    }

    #[test]
    fn system_extraction() {
        let messages = vec![
            ChatMessage::system("You are helpful"),
            ChatMessage::system("Be concise"),
            ChatMessage::user("Hello"),
            ChatMessage::assistant("Hi!"),
        ];

        let (system, non_system) = AnthropicProvider::extract_system(&messages);
        assert_eq!(system.as_deref(), Some("You are helpful\n\nBe concise"));
        assert_eq!(non_system.len(), 2);
        assert_eq!(non_system[0].role, Role::User);
    }

    #[test]
    fn system_extraction_without_system() {
        let messages = vec![ChatMessage::user("Hello")];
        let (system, non_system) = AnthropicProvider::extract_system(&messages);
        assert!(system.is_none());
        assert_eq!(non_system.len(), 1);
    }

    #[test]
    fn error_status_mapping() {
        assert!(matches!(
            AnthropicProvider::map_error_status(401, String::new(), None),
            ProviderError::Auth(_)
        ));
        assert!(matches!(
            AnthropicProvider::map_error_status(400, String::new(), None),
            ProviderError::BadRequest(_)
        ));
        assert!(matches!(
            AnthropicProvider::map_error_status(429, String::new(), Some(5)),
            ProviderError::RateLimited {
                retry_after_secs: Some(5)
            }
        ));
        assert!(matches!(
            AnthropicProvider::map_error_status(529, String::new(), None),
            ProviderError::Unavailable(_)
        ));
        assert!(matches!(
            AnthropicProvider::map_error_status(500, String::new(), None),
            ProviderError::Api { status: 500, .. }
        ));
    }

    #[test]
    fn parse_text_response() {
        let resp: ApiResponse = serde_json::from_str(
            r#"{
                "id": "msg_01",
                "model": "claude-sonnet-4-20250514",
                "content": [{"type": "text", "text": "Hello!"}],
                "usage": {"input_tokens": 10, "output_tokens": 5},
                "stop_reason": "end_turn"
            }"#,
        )
        .unwrap();

        assert_eq!(resp.model, "claude-sonnet-4-20250514");
        assert_eq!(resp.usage.input_tokens, 10);
        assert!(matches!(&resp.content[0], ContentBlock::Text { text } if text == "Hello!"));
    }

}
