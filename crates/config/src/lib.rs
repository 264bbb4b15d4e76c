//! Configuration loading and validation for Turnloom.
//!
//! Loads a TOML file into a typed [`AppConfig`], resolving `${ENV_VAR}`
//! placeholders from the environment during load. A placeholder that names
//! an unset variable fails startup — secrets never default silently.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// The root configuration structure. Maps directly to `config.toml`.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub general: GeneralConfig,
    pub logging: LoggingConfig,
    /// Provider-specific configurations keyed by provider name
    /// ("openai", "anthropic", "groq", ...).
    pub providers: HashMap<String, ProviderConfig>,
    pub personalities: PersonalitiesConfig,
    pub memory: MemoryConfig,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis: Option<RedisConfig>,
    pub core_runtime: CoreRuntimeConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            general: GeneralConfig::default(),
            logging: LoggingConfig::default(),
            providers: HashMap::new(),
            personalities: PersonalitiesConfig::default(),
            memory: MemoryConfig::default(),
            redis: None,
            core_runtime: CoreRuntimeConfig::default(),
        }
    }
}

/// Redact secrets from Debug output.
fn redact(s: &Option<String>) -> &'static str {
    match s {
        Some(_) => "[REDACTED]",
        None => "None",
    }
}

impl std::fmt::Debug for AppConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppConfig")
            .field("general", &self.general)
            .field("logging", &self.logging)
            .field("providers", &self.providers)
            .field("personalities", &self.personalities)
            .field("memory", &self.memory)
            .field("redis", &self.redis)
            .field("core_runtime", &self.core_runtime)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Default provider for planning and LLM steps.
    pub current_provider: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            current_provider: "openai".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level directive ("error", "warn", "info", "debug", "trace").
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

/// Per-model pricing in USD per 1 million tokens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelPricingConfig {
    pub input_per_m: f64,
    pub output_per_m: f64,
}

#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProviderConfig {
    /// Default model for this provider.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// API key, usually supplied as a `${ENV_VAR}` placeholder.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    /// Override the provider base URL (proxies, self-hosted gateways).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_url: Option<String>,

    pub max_retries: u32,
    pub base_backoff_ms: u64,
    pub request_timeout_ms: u64,

    /// Pricing overrides keyed by model name.
    #[serde(skip_serializing_if = "HashMap::is_empty")]
    pub pricing: HashMap<String, ModelPricingConfig>,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            model: None,
            api_key: None,
            api_url: None,
            max_retries: 3,
            base_backoff_ms: 500,
            request_timeout_ms: 30_000,
            pricing: HashMap::new(),
        }
    }
}

impl std::fmt::Debug for ProviderConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderConfig")
            .field("model", &self.model)
            .field("api_key", &redact(&self.api_key))
            .field("api_url", &self.api_url)
            .field("max_retries", &self.max_retries)
            .field("base_backoff_ms", &self.base_backoff_ms)
            .field("request_timeout_ms", &self.request_timeout_ms)
            .field("pricing", &self.pricing)
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersonalitiesConfig {
    /// Directory holding personality pack subdirectories.
    pub directory: String,
    /// Used when a turn does not specify a personality.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_personality_id: Option<String>,
}

impl Default for PersonalitiesConfig {
    fn default() -> Self {
        Self {
            directory: "./personalities".into(),
            default_personality_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    pub redis_enabled: bool,
    pub vector_store_enabled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lancedb: Option<LanceDbConfig>,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            redis_enabled: false,
            vector_store_enabled: false,
            lancedb: None,
        }
    }
}

/// Vector-store backend wiring, consumed by an external memory service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LanceDbConfig {
    pub uri: String,
    pub table_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding_function_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding_model_name: Option<String>,
}

impl Default for LanceDbConfig {
    fn default() -> Self {
        Self {
            uri: "./data/lancedb".into(),
            table_name: "agent_memory".into(),
            embedding_function_name: None,
            embedding_model_name: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379/0".into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreRuntimeConfig {
    pub max_turn_duration_seconds: u64,
    pub max_steps_per_plan: usize,
    pub max_plan_generation_retries: u32,
    pub max_step_execution_retries: u32,
    pub max_conversation_history_turns: usize,
    pub max_context_tokens_for_llm: usize,
    /// Fail the turn on the first failed step.
    pub fail_fast: bool,
    /// Process-wide bound on in-flight step executions.
    pub max_concurrent_steps: usize,
}

impl Default for CoreRuntimeConfig {
    fn default() -> Self {
        Self {
            max_turn_duration_seconds: 120,
            max_steps_per_plan: 25,
            max_plan_generation_retries: 2,
            max_step_execution_retries: 3,
            max_conversation_history_turns: 20,
            max_context_tokens_for_llm: 8_000,
            fail_fast: true,
            max_concurrent_steps: 16,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file, resolving `${ENV}` placeholders.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::load_from_str(&content).map_err(|e| match e {
            ConfigError::Parse { reason, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                reason,
            },
            other => other,
        })
    }

    /// Parse configuration from a TOML string, resolving `${ENV}`
    /// placeholders against the process environment.
    pub fn load_from_str(content: &str) -> Result<Self, ConfigError> {
        let mut value: toml::Value = toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: PathBuf::new(),
            reason: e.to_string(),
        })?;

        resolve_env_placeholders(&mut value)?;

        let config: Self = value.try_into().map_err(|e| ConfigError::Parse {
            path: PathBuf::new(),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize back to TOML. `load_from_str(serialize(cfg)) == cfg` over
    /// the recognized key set.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Validation(e.to_string()))
    }

    /// Configuration for a named provider, if present.
    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.get(name)
    }

    /// Configuration for the default provider.
    pub fn current_provider(&self) -> Option<&ProviderConfig> {
        self.providers.get(&self.general.current_provider)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.general.current_provider.is_empty() {
            return Err(ConfigError::Validation(
                "general.current_provider must not be empty".into(),
            ));
        }
        if self.core_runtime.max_steps_per_plan == 0 {
            return Err(ConfigError::Validation(
                "core_runtime.max_steps_per_plan must be at least 1".into(),
            ));
        }
        if self.core_runtime.max_turn_duration_seconds == 0 {
            return Err(ConfigError::Validation(
                "core_runtime.max_turn_duration_seconds must be at least 1".into(),
            ));
        }
        if self.core_runtime.max_concurrent_steps == 0 {
            return Err(ConfigError::Validation(
                "core_runtime.max_concurrent_steps must be at least 1".into(),
            ));
        }
        if self.personalities.directory.is_empty() {
            return Err(ConfigError::Validation(
                "personalities.directory must not be empty".into(),
            ));
        }
        for (name, provider) in &self.providers {
            for (model, pricing) in &provider.pricing {
                if pricing.input_per_m < 0.0 || pricing.output_per_m < 0.0 {
                    return Err(ConfigError::Validation(format!(
                        "providers.{name}.pricing.{model} must not be negative"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Walk every string value and substitute full `${VAR}` placeholders with
/// the environment variable's value. A placeholder naming an unset variable
/// is a startup failure.
fn resolve_env_placeholders(value: &mut toml::Value) -> Result<(), ConfigError> {
    match value {
        toml::Value::String(s) => {
            if let Some(var_name) = placeholder_name(s) {
                match std::env::var(var_name) {
                    Ok(resolved) => {
                        tracing::debug!(var = var_name, "Resolved secret from environment");
                        *s = resolved;
                    }
                    Err(_) => {
                        return Err(ConfigError::MissingSecret(var_name.to_string()));
                    }
                }
            }
        }
        toml::Value::Table(table) => {
            for (_, v) in table.iter_mut() {
                resolve_env_placeholders(v)?;
            }
        }
        toml::Value::Array(items) => {
            for v in items.iter_mut() {
                resolve_env_placeholders(v)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// `"${FOO}"` → `Some("FOO")`; anything else → `None`. Only full-value
/// placeholders are recognized.
fn placeholder_name(s: &str) -> Option<&str> {
    let inner = s.strip_prefix("${")?.strip_suffix('}')?;
    if inner.is_empty() || inner.contains(['{', '}', '$']) {
        return None;
    }
    Some(inner)
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    Read { path: PathBuf, reason: String },

    #[error("Failed to parse config at {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    Validation(String),

    #[error("Required environment variable '{0}' referenced in config is not set")]
    MissingSecret(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[general]
current_provider = "anthropic"

[logging]
level = "debug"

[providers.anthropic]
model = "claude-sonnet-4-20250514"
max_retries = 4
base_backoff_ms = 250
request_timeout_ms = 20000

[providers.anthropic.pricing."claude-sonnet-4-20250514"]
input_per_m = 3.0
output_per_m = 15.0

[providers.groq]
model = "llama-3.1-70b-versatile"

[personalities]
directory = "./personalities"
default_personality_id = "default"

[memory]
redis_enabled = true
vector_store_enabled = true

[memory.lancedb]
uri = "./data/lancedb"
table_name = "agent_memory"
embedding_model_name = "text-embedding-3-small"

[redis]
url = "redis://localhost:6379/1"

[core_runtime]
max_turn_duration_seconds = 60
max_steps_per_plan = 10
max_plan_generation_retries = 1
fail_fast = true
"#;

    #[test]
    fn parses_recognized_keys() {
        let config = AppConfig::load_from_str(SAMPLE).unwrap();
        assert_eq!(config.general.current_provider, "anthropic");
        assert_eq!(config.logging.level, "debug");

        let anthropic = config.provider("anthropic").unwrap();
        assert_eq!(anthropic.model.as_deref(), Some("claude-sonnet-4-20250514"));
        assert_eq!(anthropic.max_retries, 4);
        let pricing = &anthropic.pricing["claude-sonnet-4-20250514"];
        assert!((pricing.input_per_m - 3.0).abs() < f64::EPSILON);

        assert_eq!(
            config.personalities.default_personality_id.as_deref(),
            Some("default")
        );
        assert!(config.memory.redis_enabled);
        assert_eq!(
            config.memory.lancedb.as_ref().unwrap().table_name,
            "agent_memory"
        );
        assert_eq!(config.redis.as_ref().unwrap().url, "redis://localhost:6379/1");
        assert_eq!(config.core_runtime.max_turn_duration_seconds, 60);
        assert_eq!(config.core_runtime.max_steps_per_plan, 10);
        // Unspecified keys fall back to defaults
        assert_eq!(config.core_runtime.max_step_execution_retries, 3);
        assert_eq!(config.core_runtime.max_concurrent_steps, 16);
    }

    #[test]
    fn roundtrip_through_toml() {
        let config = AppConfig::load_from_str(SAMPLE).unwrap();
        let serialized = config.to_toml().unwrap();
        let reparsed = AppConfig::load_from_str(&serialized).unwrap();
        assert_eq!(reparsed, config);
    }

    #[test]
    fn env_placeholder_resolves() {
        std::env::set_var("TURNLOOM_TEST_KEY", "sk-resolved");
        let toml_str = r#"
[providers.openai]
api_key = "${TURNLOOM_TEST_KEY}"
"#;
        let config = AppConfig::load_from_str(toml_str).unwrap();
        assert_eq!(
            config.provider("openai").unwrap().api_key.as_deref(),
            Some("sk-resolved")
        );
    }

    #[test]
    fn missing_secret_fails_startup() {
        let toml_str = r#"
[providers.openai]
api_key = "${TURNLOOM_TEST_DEFINITELY_UNSET}"
"#;
        let err = AppConfig::load_from_str(toml_str).unwrap_err();
        assert!(matches!(err, ConfigError::MissingSecret(var) if var == "TURNLOOM_TEST_DEFINITELY_UNSET"));
    }

    #[test]
    fn partial_placeholders_are_left_alone() {
        assert_eq!(placeholder_name("${FOO}"), Some("FOO"));
        assert_eq!(placeholder_name("prefix-${FOO}"), None);
        assert_eq!(placeholder_name("${}"), None);
        assert_eq!(placeholder_name("plain"), None);
    }

    #[test]
    fn zero_steps_per_plan_rejected() {
        let toml_str = r#"
[core_runtime]
max_steps_per_plan = 0
"#;
        let err = AppConfig::load_from_str(toml_str).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn negative_pricing_rejected() {
        let toml_str = r#"
[providers.openai.pricing."gpt-4o"]
input_per_m = -1.0
output_per_m = 10.0
"#;
        assert!(AppConfig::load_from_str(toml_str).is_err());
    }

    #[test]
    fn api_key_redacted_in_debug() {
        let mut config = AppConfig::default();
        config.providers.insert(
            "openai".into(),
            ProviderConfig {
                api_key: Some("sk-super-secret".into()),
                ..ProviderConfig::default()
            },
        );
        let debug = format!("{config:?}");
        assert!(!debug.contains("sk-super-secret"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn load_from_missing_file_is_read_error() {
        let err = AppConfig::load_from(Path::new("/nonexistent/config.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let config = AppConfig::load_from(&path).unwrap();
        assert_eq!(config.general.current_provider, "anthropic");
    }
}
