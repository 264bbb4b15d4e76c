//! Turn lifecycle ownership.
//!
//! `start_turn` validates input, creates the Turn with its personality
//! snapshot, arms the whole-turn watchdog, and publishes `turn.start`.
//! The `step.result` handler aggregates step outcomes under the per-turn
//! lock: results merge once per step id, metrics roll up additively, and
//! terminal transitions are compare-and-set so duplicate deliveries and
//! watchdog races cannot double-fire.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::context::ContextManager;
use crate::finalize;
use crate::sequencer::TurnSequencer;
use turnloom_core::{
    ChatMessage, ErrorInfo, ErrorKind, EventBus, EventEnvelope, EventHandler, EventKind, Plan,
    PlanStatus, Result, RuntimeError, StepResult, StepStatus, StepType, Turn,
};
use turnloom_personality::PersonalityPackManager;

/// Identifiers returned to the caller when a turn is accepted.
#[derive(Debug, Clone)]
pub struct StartedTurn {
    pub turn_id: String,
    pub trace_id: String,
}

/// Input to `start_turn`.
#[derive(Debug, Clone, Default)]
pub struct StartTurnRequest {
    pub user_input: Option<ChatMessage>,
    pub personality_id: Option<String>,
    pub session_id: Option<String>,
    /// Caller-supplied turn id; a known id is rejected.
    pub turn_id: Option<String>,
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl StartTurnRequest {
    pub fn from_user(content: impl Into<String>) -> Self {
        Self {
            user_input: Some(ChatMessage::user(content)),
            ..Self::default()
        }
    }

    pub fn with_personality(mut self, id: impl Into<String>) -> Self {
        self.personality_id = Some(id.into());
        self
    }

    pub fn with_session(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }
}

pub struct TurnManager {
    context: Arc<ContextManager>,
    personalities: Arc<PersonalityPackManager>,
    bus: Arc<EventBus>,
    sequencer: Arc<TurnSequencer>,
    config: Arc<turnloom_config::AppConfig>,
}

impl TurnManager {
    pub fn new(
        context: Arc<ContextManager>,
        personalities: Arc<PersonalityPackManager>,
        bus: Arc<EventBus>,
        sequencer: Arc<TurnSequencer>,
        config: Arc<turnloom_config::AppConfig>,
    ) -> Self {
        Self {
            context,
            personalities,
            bus,
            sequencer,
            config,
        }
    }

    /// Accept a user message and kick off the turn. Returns the turn and
    /// trace ids; the terminal outcome arrives later as a
    /// `turn.completed` or `turn.failed` event.
    pub async fn start_turn(&self, request: StartTurnRequest) -> std::result::Result<StartedTurn, RuntimeError> {
        let user_input = request
            .user_input
            .ok_or_else(|| RuntimeError::Validation("user message is required".into()))?;
        if user_input.content.trim().is_empty() {
            return Err(RuntimeError::Validation(
                "user message content must not be empty".into(),
            ));
        }

        // An explicitly named personality must exist; only an omitted one
        // falls back to the configured default.
        let personality = match &request.personality_id {
            Some(id) => self.personalities.get_exact(id).ok_or_else(|| {
                RuntimeError::Validation(format!("personality '{id}' not found"))
            })?,
            None => self.personalities.default_personality().ok_or_else(|| {
                RuntimeError::Validation("no default personality configured".into())
            })?,
        };

        let mut turn = Turn::new(personality.id.clone(), user_input);
        if let Some(requested_id) = request.turn_id {
            if self.context.contains_turn(&requested_id).await {
                return Err(RuntimeError::Validation(format!(
                    "turn '{requested_id}' already exists"
                )));
            }
            turn.turn_id = requested_id;
        }
        turn.session_id = request.session_id.clone();
        turn.metadata = request.metadata;

        if let Some(session_id) = &request.session_id {
            let limit = self.config.core_runtime.max_conversation_history_turns * 2;
            turn.conversation_history = self.context.get_history(session_id, limit).await;
        }

        let turn_id = turn.turn_id.clone();
        let trace_id = turn.trace_id.clone();

        self.context.create_turn(turn, personality).await?;
        self.arm_watchdog(&turn_id);

        info!(turn_id, trace_id, "Turn accepted");
        self.bus.publish(EventEnvelope::new(
            EventKind::TurnStart,
            trace_id.clone(),
            turn_id.clone(),
            serde_json::json!({}),
        ));

        Ok(StartedTurn { turn_id, trace_id })
    }

    /// Whole-turn watchdog: fail the turn if it outlives the budget. The
    /// CAS in `fail_turn` makes this a no-op for turns that finished.
    fn arm_watchdog(&self, turn_id: &str) {
        let duration = Duration::from_secs(self.config.core_runtime.max_turn_duration_seconds);
        let context = Arc::clone(&self.context);
        let bus = Arc::clone(&self.bus);
        let sequencer = Arc::clone(&self.sequencer);
        let turn_id = turn_id.to_string();

        tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let error = ErrorInfo::new(
                ErrorKind::TurnTimeout,
                format!("turn exceeded {}s", duration.as_secs()),
            );
            if finalize::fail_turn(&context, &bus, &sequencer, &turn_id, error).await {
                warn!(turn_id, "Turn watchdog fired");
            }
        });
    }

    async fn handle_step_result(&self, envelope: &EventEnvelope) {
        let result: StepResult = match serde_json::from_value(envelope.payload.clone()) {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, "Malformed step.result payload; dropping");
                return;
            }
        };
        let turn_id = envelope.turn_id.clone();
        let fail_fast = self.config.core_runtime.fail_fast;

        let action = self
            .context
            .update_turn(&turn_id, |turn| merge_step_result(turn, &result, fail_fast))
            .await;

        match action {
            Ok(Action::Fail(error)) => {
                finalize::fail_turn(&self.context, &self.bus, &self.sequencer, &turn_id, error)
                    .await;
            }
            Ok(Action::Complete(response)) => {
                finalize::complete_turn(
                    &self.context,
                    &self.bus,
                    &self.sequencer,
                    &turn_id,
                    response,
                )
                .await;
            }
            Ok(Action::None) => {}
            Err(_) => {
                warn!(turn_id, step_id = %result.step_id, "step.result for unknown turn; dropping");
            }
        }
    }
}

enum Action {
    None,
    Fail(ErrorInfo),
    Complete(ChatMessage),
}

/// Merge one step result into the turn under its lock and decide what, if
/// anything, terminates the turn. Duplicate deliveries are dropped by the
/// step-id set-membership check (a step merges exactly once).
fn merge_step_result(turn: &mut Turn, result: &StepResult, fail_fast: bool) -> Action {
    if turn.is_terminal() {
        return Action::None;
    }
    let Some(plan) = turn.plan.as_mut() else {
        return Action::None;
    };
    let last_index = plan.last_index();

    let Some(step) = plan.step_by_id_mut(&result.step_id) else {
        return Action::None;
    };
    if step.result.is_some() {
        // Duplicate delivery; aggregating again would double-count
        return Action::None;
    }

    step.status = result.status;
    step.result = Some(result.clone());
    let step_type = step.step_type;
    let step_index = step.step_index;

    if let Some(metrics) = &result.metrics {
        turn.metrics.absorb(metrics, step_type);
    }
    turn.touch();

    let plan = turn.plan.as_mut().expect("plan checked above");

    if result.status == StepStatus::Failed && fail_fast {
        plan.status = PlanStatus::Failed;
        let detail = result
            .error
            .as_ref()
            .map(ToString::to_string)
            .unwrap_or_else(|| "step failed without details".into());
        return Action::Fail(ErrorInfo::new(
            ErrorKind::StepExecutionFailure,
            format!("step {step_index} failed: {detail}"),
        ));
    }

    if step_index == last_index && result.status == StepStatus::Succeeded {
        plan.status = PlanStatus::Completed;
        return Action::Complete(derive_final_response(plan));
    }

    let all_terminal = plan.steps.iter().all(|s| s.status.is_terminal());
    if all_terminal && plan.steps.iter().any(|s| s.status == StepStatus::Failed) {
        plan.status = PlanStatus::Failed;
        let detail = plan
            .steps
            .iter()
            .find(|s| s.status == StepStatus::Failed)
            .and_then(|s| s.result.as_ref())
            .and_then(|r| r.error.as_ref())
            .map(ToString::to_string)
            .unwrap_or_else(|| "a step failed without details".into());
        return Action::Fail(ErrorInfo::new(ErrorKind::StepExecutionFailure, detail));
    }

    Action::None
}

/// The final response comes from the last succeeded LLM_CALL step; plans
/// ending in a non-LLM step fall back to the last succeeded step's output.
fn derive_final_response(plan: &Plan) -> ChatMessage {
    for step in plan.steps.iter().rev() {
        if step.status != StepStatus::Succeeded {
            continue;
        }
        let Some(output) = step.result.as_ref().and_then(|r| r.output.as_ref()) else {
            continue;
        };
        if step.step_type == StepType::LlmCall {
            if let Ok(message) = serde_json::from_value::<ChatMessage>(output.clone()) {
                return message;
            }
        }
    }

    // No LLM output: serialize the last successful step's output
    let fallback = plan
        .steps
        .iter()
        .rev()
        .find(|s| s.status == StepStatus::Succeeded)
        .and_then(|s| s.result.as_ref())
        .and_then(|r| r.output.as_ref())
        .map(|o| match o {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .unwrap_or_default();
    ChatMessage::assistant(fallback)
}

#[async_trait]
impl EventHandler for TurnManager {
    fn name(&self) -> &str {
        "turn_manager"
    }

    async fn handle(&self, envelope: EventEnvelope) -> Result<()> {
        self.handle_step_result(&envelope).await;
        Ok(())
    }
}
