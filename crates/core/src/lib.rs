//! # Turnloom Core
//!
//! Domain types, traits, and error definitions for the Turnloom agent
//! runtime. This crate has **zero framework dependencies** — it defines the
//! domain model that all other crates implement against.
//!
//! ## Design Philosophy
//!
//! Every subsystem is defined as a trait here. Implementations live in their
//! respective crates. This enables:
//! - Swapping implementations via configuration
//! - Easy testing with mock/stub implementations
//! - Clean dependency graph (all crates depend inward on core)

pub mod error;
pub mod event;
pub mod memory;
pub mod models;
pub mod provider;
pub mod tool;

// Re-export key types at crate root for ergonomics
pub use error::{
    Error, ErrorInfo, ErrorKind, MemoryError, PersonalityError, ProviderError, Result,
    RuntimeError, ToolError,
};
pub use event::{EventBus, EventEnvelope, EventHandler, EventKind, SPEC_VERSION};
pub use memory::{MemoryBackend, MemoryHit, MemoryRecord};
pub use models::{
    ChatMessage, Plan, PlanStatus, Role, Step, StepMetrics, StepResult, StepStatus, StepType,
    Turn, TurnMetrics, TurnOutcome, TurnStatus,
};
pub use provider::{
    EmbedResponse, GenerateOptions, GenerateRequest, GenerateResponse, ModerationResponse,
    Provider, ResponseFormat, Usage,
};
pub use tool::{Tool, ToolLibrary};
