//! Scripted mock provider for tests.
//!
//! Returns a queued sequence of responses and failures, in order. When the
//! script runs dry the fallback response is served if one was set,
//! otherwise the call fails as unavailable. Safe to share across tasks.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use turnloom_core::{
    GenerateRequest, GenerateResponse, Provider, ProviderError, StepMetrics,
};

struct ScriptedReply {
    delay: Option<Duration>,
    result: Result<GenerateResponse, ProviderError>,
}

pub struct ScriptedProvider {
    name: String,
    script: Mutex<VecDeque<ScriptedReply>>,
    fallback: Mutex<Option<GenerateResponse>>,
    calls: AtomicU32,
    /// Requests seen, for asserting on prompts.
    requests: Mutex<Vec<GenerateRequest>>,
}

impl ScriptedProvider {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            script: Mutex::new(VecDeque::new()),
            fallback: Mutex::new(None),
            calls: AtomicU32::new(0),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Build a text response with default usage (10 prompt / 5 completion).
    pub fn text_response(provider: &str, content: &str) -> GenerateResponse {
        Self::text_response_with_usage(provider, content, 10, 5)
    }

    pub fn text_response_with_usage(
        provider: &str,
        content: &str,
        prompt_tokens: u32,
        completion_tokens: u32,
    ) -> GenerateResponse {
        GenerateResponse {
            content: content.into(),
            finish_reason: Some("stop".into()),
            metrics: StepMetrics {
                latency_ms: 1,
                prompt_tokens: Some(prompt_tokens),
                completion_tokens: Some(completion_tokens),
                provider: Some(provider.into()),
                model: Some("test-model".into()),
                ..StepMetrics::default()
            },
            ignored_options: vec![],
        }
    }

    pub fn push_text(&self, content: &str) {
        self.push_reply(None, Ok(Self::text_response(&self.name, content)));
    }

    pub fn push_text_with_usage(&self, content: &str, prompt_tokens: u32, completion_tokens: u32) {
        self.push_reply(
            None,
            Ok(Self::text_response_with_usage(
                &self.name,
                content,
                prompt_tokens,
                completion_tokens,
            )),
        );
    }

    /// Queue a text response that arrives after a delay.
    pub fn push_delayed_text(&self, content: &str, delay: Duration) {
        self.push_reply(Some(delay), Ok(Self::text_response(&self.name, content)));
    }

    pub fn push_error(&self, error: ProviderError) {
        self.push_reply(None, Err(error));
    }

    pub fn push_rate_limited(&self, retry_after_secs: Option<u64>) {
        self.push_error(ProviderError::RateLimited { retry_after_secs });
    }

    /// Serve this response whenever the script is empty.
    pub fn set_fallback_text(&self, content: &str) {
        *self.fallback.lock().unwrap() = Some(Self::text_response(&self.name, content));
    }

    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// All requests received so far.
    pub fn seen_requests(&self) -> Vec<GenerateRequest> {
        self.requests.lock().unwrap().clone()
    }

    fn push_reply(&self, delay: Option<Duration>, result: Result<GenerateResponse, ProviderError>) {
        self.script
            .lock()
            .unwrap()
            .push_back(ScriptedReply { delay, result });
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(
        &self,
        request: GenerateRequest,
    ) -> std::result::Result<GenerateResponse, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request);

        let reply = self.script.lock().unwrap().pop_front();
        match reply {
            Some(reply) => {
                if let Some(delay) = reply.delay {
                    tokio::time::sleep(delay).await;
                }
                reply.result
            }
            None => match self.fallback.lock().unwrap().clone() {
                Some(response) => Ok(response),
                None => Err(ProviderError::Unavailable(
                    "scripted provider has no more replies".into(),
                )),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use turnloom_core::ChatMessage;

    fn request() -> GenerateRequest {
        GenerateRequest::new("test-model", vec![ChatMessage::user("hello")])
    }

    #[tokio::test]
    async fn replies_in_order_then_fallback() {
        let mock = ScriptedProvider::new("mock");
        mock.push_text("first");
        mock.push_text("second");
        mock.set_fallback_text("fallback");

        assert_eq!(mock.generate(request()).await.unwrap().content, "first");
        assert_eq!(mock.generate(request()).await.unwrap().content, "second");
        assert_eq!(mock.generate(request()).await.unwrap().content, "fallback");
        assert_eq!(mock.call_count(), 3);
    }

    #[tokio::test]
    async fn empty_script_without_fallback_fails() {
        let mock = ScriptedProvider::new("mock");
        let err = mock.generate(request()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Unavailable(_)));
    }

    #[tokio::test]
    async fn records_seen_requests() {
        let mock = ScriptedProvider::new("mock");
        mock.push_text("ok");
        let _ = mock.generate(request()).await;
        let seen = mock.seen_requests();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].messages[0].content, "hello");
    }
}
