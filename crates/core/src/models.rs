//! Turn, Plan, and Step domain types.
//!
//! These are the core value objects that flow through the runtime:
//! a user message becomes a Turn, the planner derives a Plan of Steps,
//! the step processor executes each Step, and the turn manager folds the
//! results back into the Turn until it reaches a terminal state.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ErrorInfo, ErrorKind};

/// The role of a message in a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
    Tool,
}

/// A single role+content message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }
}

// --- Identifiers ---

pub fn new_turn_id() -> String {
    format!("turn_{}", Uuid::new_v4())
}

pub fn new_trace_id() -> String {
    format!("trace_{}", Uuid::new_v4())
}

pub fn new_event_id() -> String {
    format!("evt_{}", Uuid::new_v4())
}

/// Plan ids are derived from the turn so logs correlate without a join.
pub fn plan_id_for(turn_id: &str) -> String {
    format!("plan_{turn_id}")
}

pub fn step_id_for(plan_id: &str, index: usize) -> String {
    format!("step_{plan_id}_{index}")
}

// --- Turn ---

/// Lifecycle status of a Turn.
///
/// PENDING → PLANNING → EXECUTING → (COMPLETED | FAILED).
/// FAILED is reachable from any non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TurnStatus {
    Pending,
    Planning,
    Executing,
    Completed,
    Failed,
}

impl TurnStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// The outcome of a Turn, present/absent by construction rather than as a
/// pair of nullable fields: a Turn carries a final response iff it
/// completed, and error info iff it failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum TurnOutcome {
    InProgress,
    Completed { response: ChatMessage },
    Failed { error: ErrorInfo },
}

/// Additive roll-up of step metrics over a whole Turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TurnMetrics {
    pub latency_ms: u64,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub cost_usd: f64,
    pub llm_calls: u32,
    pub tool_calls: u32,
    pub memory_ops: u32,
}

impl TurnMetrics {
    /// Fold one step's metrics into the turn totals.
    pub fn absorb(&mut self, metrics: &StepMetrics, step_type: StepType) {
        self.latency_ms += metrics.latency_ms;
        self.prompt_tokens += u64::from(metrics.prompt_tokens.unwrap_or(0));
        self.completion_tokens += u64::from(metrics.completion_tokens.unwrap_or(0));
        self.cost_usd += metrics.cost_usd.unwrap_or(0.0);
        match step_type {
            StepType::LlmCall => self.llm_calls += 1,
            StepType::ToolCall => self.tool_calls += 1,
            StepType::MemoryOp => self.memory_ops += 1,
        }
    }
}

/// One user request and its eventual response, with all intermediate
/// planning and execution state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub turn_id: String,
    pub trace_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub personality_id: String,
    pub user_input: ChatMessage,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conversation_history: Vec<ChatMessage>,
    pub status: TurnStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<Plan>,
    pub outcome: TurnOutcome,
    #[serde(default)]
    pub metrics: TurnMetrics,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Turn {
    pub fn new(personality_id: impl Into<String>, user_input: ChatMessage) -> Self {
        let now = Utc::now();
        Self {
            turn_id: new_turn_id(),
            trace_id: new_trace_id(),
            session_id: None,
            personality_id: personality_id.into(),
            user_input,
            conversation_history: Vec::new(),
            status: TurnStatus::Pending,
            plan: None,
            outcome: TurnOutcome::InProgress,
            metrics: TurnMetrics::default(),
            metadata: serde_json::Map::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Bump `updated_at` after a mutation.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    /// Move to a non-terminal status. Terminal transitions go through
    /// [`Turn::try_complete`] / [`Turn::try_fail`].
    pub fn advance(&mut self, status: TurnStatus) {
        debug_assert!(!status.is_terminal());
        if !self.is_terminal() {
            self.status = status;
            self.touch();
        }
    }

    /// Compare-and-set transition to COMPLETED. Returns false if the turn
    /// was already terminal; losers of a terminal race do nothing.
    pub fn try_complete(&mut self, response: ChatMessage) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = TurnStatus::Completed;
        self.outcome = TurnOutcome::Completed { response };
        self.touch();
        true
    }

    /// Compare-and-set transition to FAILED. Returns false if already
    /// terminal.
    pub fn try_fail(&mut self, error: ErrorInfo) -> bool {
        if self.is_terminal() {
            return false;
        }
        self.status = TurnStatus::Failed;
        self.outcome = TurnOutcome::Failed { error };
        self.touch();
        true
    }

    /// The final response, set iff the turn completed.
    pub fn final_response(&self) -> Option<&ChatMessage> {
        match &self.outcome {
            TurnOutcome::Completed { response } => Some(response),
            _ => None,
        }
    }

    /// The failure record, set iff the turn failed.
    pub fn error_info(&self) -> Option<&ErrorInfo> {
        match &self.outcome {
            TurnOutcome::Failed { error } => Some(error),
            _ => None,
        }
    }
}

// --- Plan ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlanStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// The ordered sequence of Steps derived from a user request. Never
/// mutated by the planner after its step events are published; only step
/// results are merged in by the turn manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub plan_id: String,
    pub turn_id: String,
    pub status: PlanStatus,
    pub steps: Vec<Step>,
}

impl Plan {
    pub fn new(turn_id: impl Into<String>, steps: Vec<Step>) -> Self {
        let turn_id = turn_id.into();
        Self {
            plan_id: plan_id_for(&turn_id),
            turn_id,
            status: PlanStatus::Pending,
            steps,
        }
    }

    pub fn last_index(&self) -> usize {
        self.steps.len().saturating_sub(1)
    }

    pub fn step_by_id_mut(&mut self, step_id: &str) -> Option<&mut Step> {
        self.steps.iter_mut().find(|s| s.step_id == step_id)
    }
}

// --- Step ---

/// A single action within a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepType {
    LlmCall,
    ToolCall,
    MemoryOp,
}

impl std::fmt::Display for StepType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LlmCall => write!(f, "LLM_CALL"),
            Self::ToolCall => write!(f, "TOOL_CALL"),
            Self::MemoryOp => write!(f, "MEMORY_OP"),
        }
    }
}

impl std::str::FromStr for StepType {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "LLM_CALL" => Ok(Self::LlmCall),
            "TOOL_CALL" => Ok(Self::ToolCall),
            "MEMORY_OP" => Ok(Self::MemoryOp),
            other => Err(format!("unknown step type: {other}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Skipped)
    }
}

/// A single planned action: an LLM call, a tool call, or a memory op.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub step_id: String,
    pub plan_id: String,
    pub turn_id: String,
    pub step_index: usize,
    pub step_type: StepType,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: serde_json::Map<String, serde_json::Value>,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<StepResult>,
}

/// Per-call metrics recorded for every provider call, tool execution, and
/// memory operation. Turn metrics are an additive roll-up of these.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepMetrics {
    pub latency_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Number of attempts the retry driver made (1 = first try succeeded).
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
}

fn default_attempts() -> u32 {
    1
}

impl StepMetrics {
    pub fn with_latency(latency_ms: u64) -> Self {
        Self {
            latency_ms,
            attempts: 1,
            ..Self::default()
        }
    }
}

/// The immutable outcome of executing a Step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<StepMetrics>,
}

impl StepResult {
    pub fn succeeded(step_id: impl Into<String>, output: serde_json::Value, metrics: StepMetrics) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Succeeded,
            output: Some(output),
            error: None,
            metrics: Some(metrics),
        }
    }

    pub fn failed(step_id: impl Into<String>, error: ErrorInfo, metrics: StepMetrics) -> Self {
        Self {
            step_id: step_id.into(),
            status: StepStatus::Failed,
            output: None,
            error: Some(error),
            metrics: Some(metrics),
        }
    }
}
