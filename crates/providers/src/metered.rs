//! Metered provider wrapper — retries and cost accounting.
//!
//! Wraps any raw adapter: drives the retry policy for transient failures,
//! stamps the attempt count, and prices the successful call's token usage
//! against the pricing table. Only the successful attempt reports usage, so
//! cost never includes failed attempts.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;

use crate::pricing::PricingTable;
use crate::retry::{call_with_retry, RetryPolicy};
use turnloom_core::{
    EmbedResponse, GenerateRequest, GenerateResponse, ModerationResponse, Provider, ProviderError,
};

pub struct MeteredProvider {
    inner: Arc<dyn Provider>,
    policy: RetryPolicy,
    pricing: Arc<PricingTable>,
}

impl MeteredProvider {
    pub fn new(inner: Arc<dyn Provider>, policy: RetryPolicy, pricing: Arc<PricingTable>) -> Self {
        Self {
            inner,
            policy,
            pricing,
        }
    }
}

#[async_trait]
impl Provider for MeteredProvider {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn generate(
        &self,
        request: GenerateRequest,
    ) -> std::result::Result<GenerateResponse, ProviderError> {
        let started = Instant::now();
        let inner = Arc::clone(&self.inner);
        let (mut response, attempts) = call_with_retry(&self.policy, "generate", || {
            let inner = Arc::clone(&inner);
            let request = request.clone();
            async move { inner.generate(request).await }
        })
        .await?;

        response.metrics.attempts = attempts;
        // Wall clock over all attempts, not just the winning one
        response.metrics.latency_ms = started.elapsed().as_millis() as u64;

        let model = response
            .metrics
            .model
            .clone()
            .unwrap_or_else(|| request.model.clone());
        let cost = self.pricing.compute_cost(
            self.inner.name(),
            &model,
            response.metrics.prompt_tokens.unwrap_or(0),
            response.metrics.completion_tokens.unwrap_or(0),
        );
        response.metrics.cost_usd = Some(cost);

        Ok(response)
    }

    async fn embed(
        &self,
        inputs: Vec<String>,
        model: &str,
    ) -> std::result::Result<EmbedResponse, ProviderError> {
        let started = Instant::now();
        let inner = Arc::clone(&self.inner);
        let (mut response, attempts) = call_with_retry(&self.policy, "embed", || {
            let inner = Arc::clone(&inner);
            let inputs = inputs.clone();
            let model = model.to_string();
            async move { inner.embed(inputs, &model).await }
        })
        .await?;

        response.metrics.attempts = attempts;
        response.metrics.latency_ms = started.elapsed().as_millis() as u64;
        let cost = self.pricing.compute_cost(
            self.inner.name(),
            model,
            response.metrics.prompt_tokens.unwrap_or(0),
            0,
        );
        response.metrics.cost_usd = Some(cost);

        Ok(response)
    }

    async fn moderate(
        &self,
        input: &str,
        model: &str,
    ) -> std::result::Result<ModerationResponse, ProviderError> {
        let started = Instant::now();
        let inner = Arc::clone(&self.inner);
        let (mut response, attempts) = call_with_retry(&self.policy, "moderate", || {
            let inner = Arc::clone(&inner);
            let input = input.to_string();
            let model = model.to_string();
            async move { inner.moderate(&input, &model).await }
        })
        .await?;

        response.metrics.attempts = attempts;
        response.metrics.latency_ms = started.elapsed().as_millis() as u64;

        Ok(response)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::ScriptedProvider;
    use crate::pricing::ModelPricing;
    use std::time::Duration;
    use turnloom_core::ChatMessage;

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
        }
    }

    fn request() -> GenerateRequest {
        GenerateRequest::new("test-model", vec![ChatMessage::user("hi")])
    }

    #[tokio::test]
    async fn cost_and_attempts_are_stamped() {
        let mock = ScriptedProvider::new("mock");
        mock.push_rate_limited(None);
        mock.push_rate_limited(None);
        mock.push_text_with_usage("recovered", 1000, 500);

        let pricing = Arc::new(PricingTable::empty());
        pricing.set("mock", "test-model", ModelPricing::new(3.0, 15.0));

        let metered = MeteredProvider::new(Arc::new(mock), fast_policy(), pricing);
        let response = metered.generate(request()).await.unwrap();

        assert_eq!(response.content, "recovered");
        assert_eq!(response.metrics.attempts, 3);
        // (1000 * 3.0 + 500 * 15.0) / 1M
        assert!((response.metrics.cost_usd.unwrap() - 0.0105).abs() < 1e-10);
    }

    #[tokio::test]
    async fn rate_limited_on_every_attempt_fails_with_rate_limit() {
        let mock = ScriptedProvider::new("mock");
        for _ in 0..5 {
            mock.push_rate_limited(None);
        }

        let metered = MeteredProvider::new(
            Arc::new(mock),
            fast_policy(),
            Arc::new(PricingTable::empty()),
        );
        let err = metered.generate(request()).await.unwrap_err();
        assert!(matches!(err, ProviderError::RateLimited { .. }));
    }

    #[tokio::test]
    async fn auth_error_is_not_retried() {
        let mock = ScriptedProvider::new("mock");
        mock.push_error(ProviderError::Auth("bad key".into()));
        mock.push_text("should not be reached");

        let metered = MeteredProvider::new(
            Arc::new(mock),
            fast_policy(),
            Arc::new(PricingTable::empty()),
        );
        let err = metered.generate(request()).await.unwrap_err();
        assert!(matches!(err, ProviderError::Auth(_)));
    }

    #[tokio::test]
    async fn unknown_model_records_zero_cost() {
        let mock = ScriptedProvider::new("mock");
        mock.push_text_with_usage("ok", 100, 10);

        let metered = MeteredProvider::new(
            Arc::new(mock),
            fast_policy(),
            Arc::new(PricingTable::empty()),
        );
        let response = metered.generate(request()).await.unwrap();
        assert_eq!(response.metrics.cost_usd, Some(0.0));
    }
}
