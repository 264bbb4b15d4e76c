//! Step execution.
//!
//! Consumes `step.execute` events. For each step: drop if the turn is
//! already terminal, wait on the per-turn sequence gate, take a permit
//! from the process-wide concurrency semaphore, execute the action, and
//! publish `step.result`. Transient failures (provider rate limits and
//! timeouts, tools flagging themselves transient) are retried up to
//! `max_step_execution_retries`; permanent kinds fail the step on first
//! occurrence. Failed steps always carry metrics with at least the
//! attempt latency.

use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::context::ContextManager;
use crate::sequencer::TurnSequencer;
use turnloom_core::{
    ChatMessage, ErrorInfo, ErrorKind, EventBus, EventEnvelope, EventHandler, EventKind,
    GenerateOptions, GenerateRequest, MemoryError, Result, Step, StepMetrics, StepResult,
    StepStatus, StepType,
};
use turnloom_personality::PersonalityInstance;
use turnloom_providers::ProviderRouter;

#[derive(Deserialize)]
struct StepExecutePayload {
    step: Step,
}

pub struct StepProcessor {
    context: Arc<ContextManager>,
    providers: Arc<ProviderRouter>,
    bus: Arc<EventBus>,
    sequencer: Arc<TurnSequencer>,
    config: Arc<turnloom_config::AppConfig>,
    /// Process-wide bound on in-flight step executions.
    inflight: Arc<Semaphore>,
}

/// Failure outcome of one execution attempt: the normalized error plus
/// whether the step retry loop may try again.
type ExecError = (ErrorInfo, bool);

impl StepProcessor {
    pub fn new(
        context: Arc<ContextManager>,
        providers: Arc<ProviderRouter>,
        bus: Arc<EventBus>,
        sequencer: Arc<TurnSequencer>,
        config: Arc<turnloom_config::AppConfig>,
    ) -> Self {
        let inflight = Arc::new(Semaphore::new(config.core_runtime.max_concurrent_steps));
        Self {
            context,
            providers,
            bus,
            sequencer,
            config,
            inflight,
        }
    }

    async fn process(&self, step: Step, trace_id: &str) {
        let turn_id = step.turn_id.clone();

        match self.context.get_turn(&turn_id).await {
            None => {
                warn!(turn_id, step_id = %step.step_id, "step.execute for unknown turn; dropping");
                return;
            }
            Some(turn) if turn.is_terminal() => {
                debug!(turn_id, step_id = %step.step_id, "Turn already terminal; dropping step");
                return;
            }
            Some(_) => {}
        }

        // Step events are published up front; this gate enforces the
        // step_index order within the turn.
        self.sequencer.wait_for(&turn_id, step.step_index).await;

        // The gate may have opened because the turn went terminal.
        match self.context.get_turn(&turn_id).await {
            Some(turn) if !turn.is_terminal() => {}
            _ => {
                debug!(turn_id, step_id = %step.step_id, "Turn ended while step was queued; dropping");
                return;
            }
        }

        // Back-pressure: permits are taken only after the gate so a turn's
        // queued steps never starve the one that has to run first.
        let Ok(_permit) = self.inflight.acquire().await else {
            return;
        };

        let _ = self
            .context
            .update_turn(&turn_id, |turn| {
                if let Some(plan) = turn.plan.as_mut() {
                    if let Some(s) = plan.step_by_id_mut(&step.step_id) {
                        s.status = StepStatus::Running;
                    }
                }
                turn.touch();
            })
            .await;

        let result = self.execute_with_retries(&step).await;
        debug!(
            turn_id,
            step_id = %step.step_id,
            status = ?result.status,
            "Step finished"
        );

        let envelope = EventEnvelope::new(
            EventKind::StepResult,
            trace_id.to_string(),
            turn_id.clone(),
            serde_json::to_value(&result).unwrap_or_default(),
        )
        .with_plan(step.plan_id.clone())
        .with_step(step.step_id.clone());
        self.bus.publish(envelope);

        self.sequencer.advance(&turn_id, step.step_index).await;
    }

    async fn execute_with_retries(&self, step: &Step) -> StepResult {
        let max_attempts = 1 + self.config.core_runtime.max_step_execution_retries;
        let started = Instant::now();
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            match self.execute_once(step).await {
                Ok((output, mut metrics)) => {
                    metrics.attempts = metrics.attempts.max(attempt);
                    return StepResult::succeeded(step.step_id.clone(), output, metrics);
                }
                Err((error, retryable)) => {
                    if retryable && attempt < max_attempts {
                        warn!(
                            step_id = %step.step_id,
                            attempt,
                            max_attempts,
                            kind = %error.kind,
                            "Retrying step after transient failure"
                        );
                        continue;
                    }
                    let metrics = StepMetrics {
                        latency_ms: started.elapsed().as_millis() as u64,
                        attempts: attempt,
                        error_kind: Some(error.kind),
                        ..StepMetrics::default()
                    };
                    return StepResult::failed(step.step_id.clone(), error, metrics);
                }
            }
        }
    }

    async fn execute_once(
        &self,
        step: &Step,
    ) -> std::result::Result<(serde_json::Value, StepMetrics), ExecError> {
        let personality = self
            .context
            .personality_for_turn(&step.turn_id)
            .await
            .ok_or_else(|| {
                (
                    ErrorInfo::new(ErrorKind::Internal, "no personality snapshot for turn"),
                    false,
                )
            })?;

        match step.step_type {
            StepType::LlmCall => self.execute_llm_call(step, &personality).await,
            StepType::ToolCall => self.execute_tool_call(step, &personality).await,
            StepType::MemoryOp => self.execute_memory_op(step).await,
        }
    }

    async fn execute_llm_call(
        &self,
        step: &Step,
        personality: &PersonalityInstance,
    ) -> std::result::Result<(serde_json::Value, StepMetrics), ExecError> {
        let params = &step.parameters;

        let provider_name = personality
            .default_provider
            .clone()
            .unwrap_or_else(|| self.providers.default_provider_name().to_string());
        let provider = self.providers.get(&provider_name).ok_or_else(|| {
            (
                ErrorInfo::new(
                    ErrorKind::ProviderBadRequest,
                    format!("provider '{provider_name}' is not configured"),
                ),
                false,
            )
        })?;

        let model = params
            .get("model")
            .and_then(|v| v.as_str())
            .map(String::from)
            .or_else(|| personality.default_model.clone())
            .or_else(|| {
                self.config
                    .provider(&provider_name)
                    .and_then(|p| p.model.clone())
            })
            .ok_or_else(|| {
                (
                    ErrorInfo::new(
                        ErrorKind::ProviderBadRequest,
                        format!("no model configured for provider '{provider_name}'"),
                    ),
                    false,
                )
            })?;

        let mut messages = Vec::new();
        if let Some(system) = &personality.system_prompt {
            messages.push(ChatMessage::system(system.clone()));
        }
        if let Some(step_messages) = params.get("messages") {
            let parsed: Vec<ChatMessage> = serde_json::from_value(step_messages.clone())
                .map_err(|e| {
                    (
                        ErrorInfo::new(
                            ErrorKind::Validation,
                            format!("LLM_CALL 'messages' is malformed: {e}"),
                        ),
                        false,
                    )
                })?;
            messages.extend(parsed);
        } else if let Some(prompt) = params.get("prompt").and_then(|v| v.as_str()) {
            messages.push(ChatMessage::user(prompt));
        } else {
            return Err((
                ErrorInfo::new(
                    ErrorKind::Validation,
                    "LLM_CALL needs 'prompt' or 'messages' in parameters",
                ),
                false,
            ));
        }

        let options: GenerateOptions = params
            .get("options")
            .map(|v| serde_json::from_value(v.clone()))
            .transpose()
            .map_err(|e| {
                (
                    ErrorInfo::new(
                        ErrorKind::Validation,
                        format!("LLM_CALL 'options' is malformed: {e}"),
                    ),
                    false,
                )
            })?
            .unwrap_or_default();

        let request = GenerateRequest::new(model, messages).with_options(options);
        match provider.generate(request).await {
            Ok(response) => {
                let output = serde_json::json!({
                    "role": "assistant",
                    "content": response.content,
                    "finish_reason": response.finish_reason,
                });
                Ok((output, response.metrics))
            }
            Err(e) => Err((ErrorInfo::from_provider(&e), e.is_transient())),
        }
    }

    async fn execute_tool_call(
        &self,
        step: &Step,
        personality: &PersonalityInstance,
    ) -> std::result::Result<(serde_json::Value, StepMetrics), ExecError> {
        let params = &step.parameters;
        let tool_name = params
            .get("tool_name")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                (
                    ErrorInfo::new(ErrorKind::Validation, "TOOL_CALL is missing 'tool_name'"),
                    false,
                )
            })?;
        let arguments = match params.get("arguments") {
            Some(serde_json::Value::Object(map)) => map.clone(),
            None => serde_json::Map::new(),
            Some(_) => {
                return Err((
                    ErrorInfo::new(
                        ErrorKind::Validation,
                        "TOOL_CALL 'arguments' must be an object",
                    ),
                    false,
                ))
            }
        };

        // The turn's captured snapshot executes the tool, so a pack reload
        // mid-turn cannot change what runs here.
        match personality.execute_tool(tool_name, arguments).await {
            Ok((value, metrics)) => Ok((value, metrics)),
            Err(e) => Err((ErrorInfo::from_tool(&e), e.is_transient())),
        }
    }

    async fn execute_memory_op(
        &self,
        step: &Step,
    ) -> std::result::Result<(serde_json::Value, StepMetrics), ExecError> {
        let params = &step.parameters;
        let operation = params
            .get("operation")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                (
                    ErrorInfo::new(ErrorKind::Validation, "MEMORY_OP is missing 'operation'"),
                    false,
                )
            })?;
        let payload = params
            .get("payload")
            .and_then(|v| v.as_object())
            .cloned()
            .unwrap_or_default();

        let memory = self.context.memory();
        let started = Instant::now();

        let output = match operation {
            "search" => {
                let query = payload.get("query").and_then(|v| v.as_str()).ok_or_else(|| {
                    (
                        ErrorInfo::new(ErrorKind::Validation, "memory search needs 'query'"),
                        false,
                    )
                })?;
                let limit = payload
                    .get("limit")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(5) as usize;
                let filter = payload.get("filter").and_then(|v| v.as_object());
                // Best-effort: backend failures already degrade to empty
                let hits = memory.search(query, limit, filter).await;
                serde_json::json!({ "hits": hits })
            }
            "retrieve" => {
                let id = payload.get("id").and_then(|v| v.as_str()).ok_or_else(|| {
                    (
                        ErrorInfo::new(ErrorKind::Validation, "memory retrieve needs 'id'"),
                        false,
                    )
                })?;
                let record = memory.retrieve(id).await.map_err(memory_failure)?;
                serde_json::to_value(record).unwrap_or_default()
            }
            "store" => {
                let text = payload.get("text").and_then(|v| v.as_str()).ok_or_else(|| {
                    (
                        ErrorInfo::new(ErrorKind::Validation, "memory store needs 'text'"),
                        false,
                    )
                })?;
                let metadata = payload
                    .get("metadata")
                    .and_then(|v| v.as_object())
                    .cloned()
                    .unwrap_or_default();
                let id = memory
                    .store(text.to_string(), metadata)
                    .await
                    .map_err(memory_failure)?;
                serde_json::json!({ "id": id })
            }
            "delete" => {
                let id = payload.get("id").and_then(|v| v.as_str()).ok_or_else(|| {
                    (
                        ErrorInfo::new(ErrorKind::Validation, "memory delete needs 'id'"),
                        false,
                    )
                })?;
                let deleted = memory.delete(id).await.map_err(memory_failure)?;
                serde_json::json!({ "deleted": deleted })
            }
            other => {
                return Err((
                    ErrorInfo::new(
                        ErrorKind::Validation,
                        format!("unknown memory operation '{other}'"),
                    ),
                    false,
                ))
            }
        };

        Ok((
            output,
            StepMetrics::with_latency(started.elapsed().as_millis() as u64),
        ))
    }
}

fn memory_failure(e: MemoryError) -> ExecError {
    (
        ErrorInfo::new(ErrorKind::MemoryBackend, e.to_string()),
        false,
    )
}

#[async_trait]
impl EventHandler for StepProcessor {
    fn name(&self) -> &str {
        "step_processor"
    }

    async fn handle(&self, envelope: EventEnvelope) -> Result<()> {
        let payload: StepExecutePayload = serde_json::from_value(envelope.payload.clone())?;
        self.process(payload.step, &envelope.trace_id).await;
        Ok(())
    }
}
