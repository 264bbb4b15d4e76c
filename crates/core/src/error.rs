//! Error types for the Turnloom domain.
//!
//! Uses `thiserror` for ergonomic error definitions. Each bounded context
//! has its own error enum; `ErrorInfo` is the normalized `{kind, detail}`
//! record that crosses the event bus — native errors never do.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The top-level error type for all Turnloom operations.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("Memory error: {0}")]
    Memory(#[from] MemoryError),

    #[error("Personality error: {0}")]
    Personality(#[from] PersonalityError),

    #[error("Runtime error: {0}")]
    Runtime(#[from] RuntimeError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias using our Error.
pub type Result<T> = std::result::Result<T, Error>;

// --- Bounded context errors ---

#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Rate limited by provider{}", .retry_after_secs.map(|s| format!(", retry after {s}s")).unwrap_or_default())]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("Request timed out: {0}")]
    Timeout(String),

    #[error("Provider unavailable: {0}")]
    Unavailable(String),

    #[error("API request failed: {message} (status: {status})")]
    Api { status: u16, message: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),
}

impl ProviderError {
    /// Whether the retry driver should attempt this call again.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::RateLimited { .. } | Self::Timeout(_) | Self::Unavailable(_) | Self::Network(_) => {
                true
            }
            Self::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }

    /// The normalized error kind for this provider error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Auth(_) => ErrorKind::ProviderAuth,
            Self::BadRequest(_) | Self::Unsupported(_) => ErrorKind::ProviderBadRequest,
            Self::RateLimited { .. } => ErrorKind::ProviderRateLimit,
            Self::Timeout(_) => ErrorKind::ProviderTimeout,
            Self::Unavailable(_) | Self::Network(_) => ErrorKind::ProviderUnavailable,
            Self::Api { status, .. } if *status >= 500 => ErrorKind::ProviderUnavailable,
            Self::Api { .. } => ErrorKind::ProviderApi,
        }
    }
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Tool not found: {0}")]
    NotFound(String),

    #[error("Tool execution failed: {tool_name} — {reason}")]
    ExecutionFailed { tool_name: String, reason: String },

    #[error("Tool timed out: {tool_name} after {timeout_secs}s")]
    Timeout { tool_name: String, timeout_secs: u64 },

    #[error("Invalid tool arguments: {0}")]
    InvalidArguments(String),

    /// A tool may flag its own failure as transient to opt into retry.
    #[error("Transient tool failure: {tool_name} — {reason}")]
    Transient { tool_name: String, reason: String },
}

impl ToolError {
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. } | Self::Timeout { .. })
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_) => ErrorKind::ToolNotFound,
            _ => ErrorKind::ToolExecution,
        }
    }
}

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("Backend error: {0}")]
    Backend(String),

    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),
}

#[derive(Debug, Error)]
pub enum PersonalityError {
    #[error("Personality not found: {0}")]
    NotFound(String),

    #[error("Invalid manifest in {path}: {reason}")]
    InvalidManifest { path: String, reason: String },

    #[error("System prompt file not found: {0}")]
    PromptFileMissing(String),

    #[error("Tool '{tool}' declared by pack '{pack}' is not registered in the tool library")]
    UnboundTool { pack: String, tool: String },

    #[error("Pack directory not readable: {0}")]
    DirectoryUnreadable(String),
}

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Turn already exists: {0}")]
    DuplicateTurn(String),

    #[error("Turn not found: {0}")]
    TurnNotFound(String),

    #[error("Plan generation failed: {0}")]
    PlanGeneration(String),

    #[error("Turn exceeded maximum duration of {0}s")]
    TurnTimeout(u64),
}

// --- Normalized error records ---

/// Categorical error kinds. These are the only error identities that cross
/// the event bus or appear on a failed Turn/Step; the serialized names are
/// part of the external contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    #[serde(rename = "ValidationError")]
    Validation,
    #[serde(rename = "ProviderAuthError")]
    ProviderAuth,
    #[serde(rename = "ProviderBadRequest")]
    ProviderBadRequest,
    #[serde(rename = "ProviderRateLimitError")]
    ProviderRateLimit,
    #[serde(rename = "ProviderTimeoutError")]
    ProviderTimeout,
    #[serde(rename = "ProviderUnavailableError")]
    ProviderUnavailable,
    #[serde(rename = "ProviderAPIError")]
    ProviderApi,
    #[serde(rename = "ToolExecutionError")]
    ToolExecution,
    #[serde(rename = "ToolNotFoundError")]
    ToolNotFound,
    #[serde(rename = "MemoryBackendError")]
    MemoryBackend,
    #[serde(rename = "PlanGenerationError")]
    PlanGeneration,
    #[serde(rename = "StepExecutionFailure")]
    StepExecutionFailure,
    #[serde(rename = "TurnTimeout")]
    TurnTimeout,
    #[serde(rename = "InternalError")]
    Internal,
}

impl ErrorKind {
    /// The serialized wire name (the same string serde produces).
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Validation => "ValidationError",
            Self::ProviderAuth => "ProviderAuthError",
            Self::ProviderBadRequest => "ProviderBadRequest",
            Self::ProviderRateLimit => "ProviderRateLimitError",
            Self::ProviderTimeout => "ProviderTimeoutError",
            Self::ProviderUnavailable => "ProviderUnavailableError",
            Self::ProviderApi => "ProviderAPIError",
            Self::ToolExecution => "ToolExecutionError",
            Self::ToolNotFound => "ToolNotFoundError",
            Self::MemoryBackend => "MemoryBackendError",
            Self::PlanGeneration => "PlanGenerationError",
            Self::StepExecutionFailure => "StepExecutionFailure",
            Self::TurnTimeout => "TurnTimeout",
            Self::Internal => "InternalError",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A normalized `{kind, detail}` error record attached to failed Steps and
/// Turns. Vendor-specific detail is kept out of `detail` for provider
/// failures; callers log the raw error before normalizing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub detail: String,
}

impl ErrorInfo {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }

    /// Normalize a provider error, redacting the vendor payload.
    pub fn from_provider(err: &ProviderError) -> Self {
        let detail = match err {
            // Auth/API bodies can echo key fragments or account details
            ProviderError::Auth(_) => "provider authentication failed".to_string(),
            ProviderError::Api { status, .. } => format!("provider API error (status {status})"),
            other => other.to_string(),
        };
        Self::new(err.kind(), detail)
    }

    pub fn from_tool(err: &ToolError) -> Self {
        Self::new(err.kind(), err.to_string())
    }
}

impl std::fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.detail)
    }
}
