//! Provider router — builds and selects adapters from configuration.
//!
//! Each configured provider is wrapped in a [`MeteredProvider`] carrying
//! its retry policy and the shared pricing table, so callers get retries
//! and cost accounting regardless of which adapter answers.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::anthropic::AnthropicProvider;
use crate::metered::MeteredProvider;
use crate::openai_compat::{OpenAiCompatProvider, GROQ_BASE_URL, OPENAI_BASE_URL};
use crate::pricing::PricingTable;
use crate::retry::RetryPolicy;
use turnloom_core::Provider;

/// Routes generate/embed/moderate calls to the named provider.
pub struct ProviderRouter {
    providers: HashMap<String, Arc<dyn Provider>>,
    default_provider: String,
}

impl ProviderRouter {
    pub fn new(default_provider: impl Into<String>) -> Self {
        Self {
            providers: HashMap::new(),
            default_provider: default_provider.into(),
        }
    }

    pub fn register(&mut self, name: impl Into<String>, provider: Arc<dyn Provider>) {
        self.providers.insert(name.into(), provider);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.providers.get(name).cloned()
    }

    /// The configured default provider.
    pub fn default_provider(&self) -> Option<Arc<dyn Provider>> {
        self.providers.get(&self.default_provider).cloned()
    }

    pub fn default_provider_name(&self) -> &str {
        &self.default_provider
    }

    /// Resolve by name, falling back to the default provider.
    pub fn resolve(&self, name: Option<&str>) -> Option<Arc<dyn Provider>> {
        match name {
            Some(n) => self.get(n),
            None => self.default_provider(),
        }
    }

    pub fn list(&self) -> Vec<&str> {
        self.providers.keys().map(String::as_str).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}

/// Build a router from configuration.
///
/// Known names get their native adapter ("anthropic" → Messages API,
/// "openai"/"groq" → chat-completions with the right base URL and
/// capabilities); any other name is treated as an OpenAI-compatible
/// endpoint and requires `api_url`.
pub fn build_from_config(config: &turnloom_config::AppConfig) -> ProviderRouter {
    let pricing = Arc::new(PricingTable::with_defaults());
    pricing.apply_config(config);

    let mut router = ProviderRouter::new(&config.general.current_provider);

    for (name, provider_config) in &config.providers {
        let api_key = provider_config.api_key.clone().unwrap_or_default();
        let timeout = Duration::from_millis(provider_config.request_timeout_ms);

        let raw: Arc<dyn Provider> = match name.as_str() {
            "anthropic" => {
                let mut p = AnthropicProvider::with_timeout(&api_key, timeout);
                if let Some(url) = &provider_config.api_url {
                    p = p.with_base_url(url);
                }
                Arc::new(p)
            }
            "openai" => {
                let base = provider_config
                    .api_url
                    .clone()
                    .unwrap_or_else(|| OPENAI_BASE_URL.into());
                Arc::new(
                    OpenAiCompatProvider::with_timeout("openai", base, &api_key, timeout)
                        .with_capabilities(true, true),
                )
            }
            "groq" => {
                let base = provider_config
                    .api_url
                    .clone()
                    .unwrap_or_else(|| GROQ_BASE_URL.into());
                Arc::new(OpenAiCompatProvider::with_timeout(
                    "groq", base, &api_key, timeout,
                ))
            }
            other => {
                let Some(base) = provider_config.api_url.clone() else {
                    tracing::warn!(
                        provider = other,
                        "Skipping provider with no api_url and no built-in base URL"
                    );
                    continue;
                };
                Arc::new(OpenAiCompatProvider::with_timeout(
                    other, base, &api_key, timeout,
                ))
            }
        };

        let metered = MeteredProvider::new(
            raw,
            RetryPolicy::from_config(provider_config),
            Arc::clone(&pricing),
        );
        router.register(name.clone(), Arc::new(metered));
    }

    router
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::ScriptedProvider;

    #[test]
    fn register_and_resolve() {
        let mut router = ProviderRouter::new("mock");
        router.register("mock", Arc::new(ScriptedProvider::new("mock")));
        router.register("other", Arc::new(ScriptedProvider::new("other")));

        assert_eq!(router.resolve(None).unwrap().name(), "mock");
        assert_eq!(router.resolve(Some("other")).unwrap().name(), "other");
        assert!(router.resolve(Some("missing")).is_none());
    }

    #[test]
    fn build_from_config_registers_known_providers() {
        let toml_str = r#"
[general]
current_provider = "anthropic"

[providers.anthropic]
model = "claude-sonnet-4-20250514"

[providers.openai]
model = "gpt-4o"

[providers.groq]
model = "llama-3.1-8b-instant"

[providers.unknown_without_url]
model = "whatever"
"#;
        let config = turnloom_config::AppConfig::load_from_str(toml_str).unwrap();
        let router = build_from_config(&config);

        assert!(router.get("anthropic").is_some());
        assert!(router.get("openai").is_some());
        assert!(router.get("groq").is_some());
        // No api_url and no built-in base URL: skipped
        assert!(router.get("unknown_without_url").is_none());
        assert_eq!(router.default_provider().unwrap().name(), "anthropic");
    }

    #[test]
    fn custom_endpoint_requires_api_url() {
        let toml_str = r#"
[general]
current_provider = "vllm"

[providers.vllm]
model = "qwen-72b"
api_url = "http://localhost:8000/v1"
"#;
        let config = turnloom_config::AppConfig::load_from_str(toml_str).unwrap();
        let router = build_from_config(&config);
        assert_eq!(router.default_provider().unwrap().name(), "vllm");
    }
}
