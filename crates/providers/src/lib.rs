//! LLM provider adapters for Turnloom.
//!
//! All adapters implement the `turnloom_core::Provider` trait. The router
//! builds adapters from configuration and wraps each one in a metered
//! layer that drives retries and accounts cost per call.

pub mod anthropic;
pub mod metered;
pub mod mock;
pub mod openai_compat;
pub mod pricing;
pub mod retry;
pub mod router;

pub use anthropic::AnthropicProvider;
pub use metered::MeteredProvider;
pub use mock::ScriptedProvider;
pub use openai_compat::OpenAiCompatProvider;
pub use pricing::{ModelPricing, PricingTable};
pub use retry::RetryPolicy;
pub use router::ProviderRouter;
