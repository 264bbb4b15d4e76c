//! Plan generation.
//!
//! Consumes `turn.start`: prompts the planning LLM with the personality's
//! system prompt, the tool and memory-primitive catalog, recent history,
//! and best-effort memory context, then parses the JSON plan. Invalid
//! plans are re-prompted with the validator error up to
//! `max_plan_generation_retries` times; a turn whose plan cannot be
//! produced fails with `PlanGenerationError`. On success all step events
//! are published up front in index order — sequencing is enforced by the
//! step processor.

use async_trait::async_trait;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::context::ContextManager;
use crate::finalize;
use crate::sequencer::TurnSequencer;
use turnloom_core::{
    ChatMessage, ErrorInfo, ErrorKind, EventBus, EventEnvelope, EventHandler, EventKind,
    GenerateOptions, GenerateRequest, Plan, PlanStatus, Provider, ResponseFormat, Result, Step,
    StepStatus, StepType, Turn, TurnStatus,
};
use turnloom_personality::PersonalityInstance;
use turnloom_providers::ProviderRouter;

/// Memory primitives advertised to the planner alongside pack tools.
const MEMORY_PRIMITIVES: &[(&str, &str)] = &[
    ("search", "Search long-term memory. payload: {\"query\": string, \"limit\": int?}"),
    ("retrieve", "Fetch a memory record by id. payload: {\"id\": string}"),
    ("store", "Store a text in long-term memory. payload: {\"text\": string, \"metadata\": object?}"),
];

/// How many memory hits get prepended to the planning prompt.
const PLANNING_MEMORY_HITS: usize = 3;

pub struct PlanExecutor {
    context: Arc<ContextManager>,
    providers: Arc<ProviderRouter>,
    bus: Arc<EventBus>,
    sequencer: Arc<TurnSequencer>,
    config: Arc<turnloom_config::AppConfig>,
}

impl PlanExecutor {
    pub fn new(
        context: Arc<ContextManager>,
        providers: Arc<ProviderRouter>,
        bus: Arc<EventBus>,
        sequencer: Arc<TurnSequencer>,
        config: Arc<turnloom_config::AppConfig>,
    ) -> Self {
        Self {
            context,
            providers,
            bus,
            sequencer,
            config,
        }
    }

    async fn run(&self, envelope: &EventEnvelope) {
        let turn_id = envelope.turn_id.clone();

        let Some(turn) = self.context.get_turn(&turn_id).await else {
            warn!(turn_id, "turn.start for unknown turn; dropping");
            return;
        };
        if turn.is_terminal() {
            return;
        }

        let Some(personality) = self.context.personality_for_turn(&turn_id).await else {
            let error = ErrorInfo::new(
                ErrorKind::PlanGeneration,
                "no personality snapshot for turn",
            );
            finalize::fail_turn(&self.context, &self.bus, &self.sequencer, &turn_id, error).await;
            return;
        };

        let _ = self
            .context
            .update_turn(&turn_id, |t| t.advance(TurnStatus::Planning))
            .await;

        match self.generate_plan(&turn, &personality).await {
            Ok(plan) => self.publish_plan(&turn, &personality, plan).await,
            Err(error) => {
                finalize::fail_turn(&self.context, &self.bus, &self.sequencer, &turn_id, error)
                    .await;
            }
        }
    }

    async fn generate_plan(
        &self,
        turn: &Turn,
        personality: &PersonalityInstance,
    ) -> std::result::Result<Plan, ErrorInfo> {
        let (provider, model) = self.resolve_planning_target(personality)?;

        let memory_context = self.memory_context(turn).await;
        let base_prompt = build_planning_prompt(turn, personality, &memory_context);

        let max_attempts = 1 + self.config.core_runtime.max_plan_generation_retries;
        let mut validator_error: Option<String> = None;

        for attempt in 1..=max_attempts {
            let mut prompt = base_prompt.clone();
            if let Some(ref error) = validator_error {
                prompt.push_str(&format!(
                    "\n\nYour previous plan was rejected: {error}\nReturn a corrected JSON plan."
                ));
            }

            let mut messages = Vec::new();
            if let Some(system) = &personality.system_prompt {
                messages.push(ChatMessage::system(system.clone()));
            }
            messages.push(ChatMessage::user(prompt));

            let request = GenerateRequest::new(model.clone(), messages).with_options(
                GenerateOptions {
                    response_format: ResponseFormat::Json,
                    ..GenerateOptions::default()
                },
            );

            debug!(turn_id = %turn.turn_id, attempt, model = %model, "Requesting plan");
            let response = provider.generate(request).await.map_err(|e| {
                warn!(turn_id = %turn.turn_id, error = %e, "Planning provider call failed");
                ErrorInfo::new(ErrorKind::PlanGeneration, format!("provider failure: {}", ErrorInfo::from_provider(&e).detail))
            })?;

            match parse_plan(
                &response.content,
                turn,
                personality,
                self.config.core_runtime.max_steps_per_plan,
            ) {
                Ok(plan) => {
                    info!(
                        turn_id = %turn.turn_id,
                        plan_id = %plan.plan_id,
                        steps = plan.steps.len(),
                        attempt,
                        "Plan generated"
                    );
                    return Ok(plan);
                }
                Err(reason) => {
                    warn!(turn_id = %turn.turn_id, attempt, %reason, "Plan rejected by validator");
                    validator_error = Some(reason);
                }
            }
        }

        Err(ErrorInfo::new(
            ErrorKind::PlanGeneration,
            validator_error.unwrap_or_else(|| "no valid plan produced".into()),
        ))
    }

    fn resolve_planning_target(
        &self,
        personality: &PersonalityInstance,
    ) -> std::result::Result<(Arc<dyn Provider>, String), ErrorInfo> {
        let planning = personality.planning.as_ref();
        let provider_name = planning
            .and_then(|p| p.provider.clone())
            .or_else(|| personality.default_provider.clone())
            .unwrap_or_else(|| self.providers.default_provider_name().to_string());

        let provider = self.providers.get(&provider_name).ok_or_else(|| {
            ErrorInfo::new(
                ErrorKind::PlanGeneration,
                format!("planning provider '{provider_name}' is not configured"),
            )
        })?;

        let model = planning
            .and_then(|p| p.model.clone())
            .or_else(|| personality.default_model.clone())
            .or_else(|| {
                self.config
                    .provider(&provider_name)
                    .and_then(|p| p.model.clone())
            })
            .ok_or_else(|| {
                ErrorInfo::new(
                    ErrorKind::PlanGeneration,
                    format!("no model configured for provider '{provider_name}'"),
                )
            })?;

        Ok((provider, model))
    }

    /// Best-effort memory context; failures degrade to nothing.
    async fn memory_context(&self, turn: &Turn) -> String {
        let hits = self
            .context
            .memory()
            .search(&turn.user_input.content, PLANNING_MEMORY_HITS, None)
            .await;
        if hits.is_empty() {
            return String::new();
        }
        let mut section = String::from("Relevant context from memory:\n");
        for (i, hit) in hits.iter().enumerate() {
            let mut text = hit.text.clone();
            if text.len() > 200 {
                text.truncate(200);
                text.push_str("...");
            }
            section.push_str(&format!("  {}. {}\n", i + 1, text));
        }
        section
    }

    async fn publish_plan(
        &self,
        turn: &Turn,
        personality: &PersonalityInstance,
        mut plan: Plan,
    ) {
        plan.status = PlanStatus::InProgress;
        let steps = plan.steps.clone();

        let stored = self
            .context
            .update_turn(&turn.turn_id, |t| {
                if t.is_terminal() {
                    return false;
                }
                t.plan = Some(plan.clone());
                t.advance(TurnStatus::Executing);
                true
            })
            .await;

        if !matches!(stored, Ok(true)) {
            return;
        }

        // Reference behavior: publish every step event up front, in index
        // order; the per-turn sequencer serializes execution.
        for step in steps {
            let step_id = step.step_id.clone();
            let envelope = EventEnvelope::new(
                EventKind::StepExecute,
                turn.trace_id.clone(),
                turn.turn_id.clone(),
                serde_json::json!({
                    "step": step,
                    "personality_id": personality.id.clone(),
                }),
            )
            .with_plan(plan.plan_id.clone())
            .with_step(step_id);
            self.bus.publish(envelope);
        }
    }
}

#[async_trait]
impl EventHandler for PlanExecutor {
    fn name(&self) -> &str {
        "plan_executor"
    }

    async fn handle(&self, envelope: EventEnvelope) -> Result<()> {
        self.run(&envelope).await;
        Ok(())
    }
}

/// Assemble the planning prompt body.
fn build_planning_prompt(
    turn: &Turn,
    personality: &PersonalityInstance,
    memory_context: &str,
) -> String {
    let mut prompt = String::new();

    if !memory_context.is_empty() {
        prompt.push_str(memory_context);
        prompt.push('\n');
    }

    prompt.push_str(
        "You are an expert planning agent. Based on the user request and conversation \
         history, produce a step-by-step plan that fulfills the request.\n\n",
    );

    prompt.push_str("Available tools (for TOOL_CALL steps):\n");
    let catalog = personality.tool_catalog();
    if catalog.is_empty() {
        prompt.push_str("  (none)\n");
    }
    for (name, description) in catalog {
        prompt.push_str(&format!("  - {name}: {description}\n"));
    }

    prompt.push_str("\nMemory operations (for MEMORY_OP steps):\n");
    for (op, description) in MEMORY_PRIMITIVES {
        prompt.push_str(&format!("  - {op}: {description}\n"));
    }

    if let Some(instructions) = personality
        .planning
        .as_ref()
        .and_then(|p| p.instructions.as_deref())
    {
        prompt.push_str("\nAdditional planning instructions:\n");
        prompt.push_str(instructions);
        prompt.push('\n');
    }

    if !turn.conversation_history.is_empty() {
        prompt.push_str("\nConversation history:\n");
        for message in &turn.conversation_history {
            prompt.push_str(&format!("{:?}: {}\n", message.role, message.content));
        }
    }

    prompt.push_str(&format!("\nUser request:\n{}\n", turn.user_input.content));

    prompt.push_str(
        "\nRespond ONLY with a JSON object of the form:\n\
         {\"steps\": [{\"step_type\": \"LLM_CALL\" | \"TOOL_CALL\" | \"MEMORY_OP\", \
         \"description\": \"...\", \"parameters\": {...}}]}\n\
         LLM_CALL parameters: {\"prompt\": string} (optional \"model\", \"options\").\n\
         TOOL_CALL parameters: {\"tool_name\": string, \"arguments\": object}.\n\
         MEMORY_OP parameters: {\"operation\": \"search\" | \"retrieve\" | \"store\", \
         \"payload\": object}.\n",
    );

    prompt
}

#[derive(serde::Deserialize)]
struct PlanDraft {
    steps: Vec<StepDraft>,
}

#[derive(serde::Deserialize)]
struct StepDraft {
    step_type: String,
    #[serde(default)]
    description: Option<String>,
    #[serde(default)]
    parameters: Option<serde_json::Map<String, serde_json::Value>>,
}

/// Models wrap JSON in markdown fences often enough to handle it here.
fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let without_open = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    without_open
        .strip_suffix("```")
        .unwrap_or(without_open)
        .trim()
}

/// Parse and validate the raw plan response into a Plan.
fn parse_plan(
    raw: &str,
    turn: &Turn,
    personality: &PersonalityInstance,
    max_steps: usize,
) -> std::result::Result<Plan, String> {
    let draft: PlanDraft = serde_json::from_str(strip_code_fences(raw))
        .map_err(|e| format!("plan is not valid JSON with a 'steps' array: {e}"))?;

    if draft.steps.is_empty() {
        return Err("plan contains zero steps".into());
    }
    if draft.steps.len() > max_steps {
        return Err(format!(
            "plan has {} steps, exceeding the maximum of {max_steps}",
            draft.steps.len()
        ));
    }

    let plan_id = turnloom_core::models::plan_id_for(&turn.turn_id);
    let mut steps = Vec::with_capacity(draft.steps.len());

    for (index, draft_step) in draft.steps.into_iter().enumerate() {
        let step_type = StepType::from_str(&draft_step.step_type)
            .map_err(|e| format!("step {index}: {e}"))?;
        let parameters = draft_step.parameters.unwrap_or_default();

        match step_type {
            StepType::ToolCall => {
                let tool_name = parameters
                    .get("tool_name")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| format!("step {index}: TOOL_CALL is missing 'tool_name'"))?;
                if !personality.has_tool(tool_name) {
                    return Err(format!(
                        "step {index}: tool '{tool_name}' is not available to this personality"
                    ));
                }
            }
            StepType::MemoryOp => {
                let operation = parameters
                    .get("operation")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| format!("step {index}: MEMORY_OP is missing 'operation'"))?;
                if !matches!(operation, "search" | "retrieve" | "store" | "delete") {
                    return Err(format!(
                        "step {index}: unknown memory operation '{operation}'"
                    ));
                }
            }
            StepType::LlmCall => {
                if !parameters.contains_key("prompt") && !parameters.contains_key("messages") {
                    return Err(format!(
                        "step {index}: LLM_CALL needs 'prompt' or 'messages'"
                    ));
                }
            }
        }

        steps.push(Step {
            step_id: turnloom_core::models::step_id_for(&plan_id, index),
            plan_id: plan_id.clone(),
            turn_id: turn.turn_id.clone(),
            step_index: index,
            step_type,
            description: draft_step.description.unwrap_or_default(),
            parameters,
            status: StepStatus::Pending,
            result: None,
        });
    }

    Ok(Plan::new(turn.turn_id.clone(), steps))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use turnloom_personality::{default_tool_library, PersonalityPackManager};

    async fn personality_with(tools: &[&str]) -> Arc<PersonalityInstance> {
        let dir = tempfile::tempdir().unwrap();
        let pack = dir.path().join("planner_test");
        std::fs::create_dir_all(&pack).unwrap();
        let tools_yaml: String = tools.iter().map(|t| format!("  - name: {t}\n")).collect();
        let manifest = if tools.is_empty() {
            "id: planner_test\nname: T\nversion: \"1\"\n".to_string()
        } else {
            format!("id: planner_test\nname: T\nversion: \"1\"\ntools:\n{tools_yaml}")
        };
        std::fs::write(pack.join("manifest.yaml"), manifest).unwrap();
        let config = turnloom_config::PersonalitiesConfig {
            directory: dir.path().display().to_string(),
            default_personality_id: None,
        };
        let manager = PersonalityPackManager::new(&config, Arc::new(default_tool_library()));
        manager.reload().await.unwrap();
        manager.get_exact("planner_test").unwrap()
    }

    fn turn() -> Turn {
        Turn::new("planner_test", ChatMessage::user("What is the weather in Berlin?"))
    }

    #[test]
    fn fence_stripping() {
        assert_eq!(strip_code_fences("{\"a\":1}"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```\n{\"a\":1}\n```"), "{\"a\":1}");
    }

    #[tokio::test]
    async fn parses_valid_plan() {
        let personality = personality_with(&["get_weather"]).await;
        let turn = turn();
        let raw = r#"{"steps": [
            {"step_type": "TOOL_CALL", "description": "look up weather",
             "parameters": {"tool_name": "get_weather", "arguments": {"city": "Berlin"}}},
            {"step_type": "LLM_CALL", "parameters": {"prompt": "Summarize the weather"}}
        ]}"#;

        let plan = parse_plan(raw, &turn, &personality, 25).unwrap();
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.steps[0].step_type, StepType::ToolCall);
        assert_eq!(plan.steps[0].step_index, 0);
        assert_eq!(plan.steps[1].step_id, format!("step_{}_1", plan.plan_id));
        assert_eq!(plan.turn_id, turn.turn_id);
    }

    #[tokio::test]
    async fn rejects_empty_plan() {
        let personality = personality_with(&[]).await;
        let err = parse_plan(r#"{"steps": []}"#, &turn(), &personality, 25).unwrap_err();
        assert!(err.contains("zero steps"));
    }

    #[tokio::test]
    async fn rejects_too_many_steps() {
        let personality = personality_with(&[]).await;
        let steps: Vec<String> = (0..3)
            .map(|_| r#"{"step_type": "LLM_CALL", "parameters": {"prompt": "x"}}"#.to_string())
            .collect();
        let raw = format!(r#"{{"steps": [{}]}}"#, steps.join(","));
        let err = parse_plan(&raw, &turn(), &personality, 2).unwrap_err();
        assert!(err.contains("exceeding"));
    }

    #[tokio::test]
    async fn rejects_unknown_step_type() {
        let personality = personality_with(&[]).await;
        let raw = r#"{"steps": [{"step_type": "EXTERNAL_API", "parameters": {}}]}"#;
        let err = parse_plan(raw, &turn(), &personality, 25).unwrap_err();
        assert!(err.contains("unknown step type"));
    }

    #[tokio::test]
    async fn rejects_unavailable_tool() {
        let personality = personality_with(&["calculator"]).await;
        let raw = r#"{"steps": [{"step_type": "TOOL_CALL",
            "parameters": {"tool_name": "get_weather", "arguments": {}}}]}"#;
        let err = parse_plan(raw, &turn(), &personality, 25).unwrap_err();
        assert!(err.contains("not available"));
    }

    #[tokio::test]
    async fn rejects_bad_memory_operation() {
        let personality = personality_with(&[]).await;
        let raw = r#"{"steps": [{"step_type": "MEMORY_OP",
            "parameters": {"operation": "compact", "payload": {}}}]}"#;
        let err = parse_plan(raw, &turn(), &personality, 25).unwrap_err();
        assert!(err.contains("unknown memory operation"));
    }

    #[tokio::test]
    async fn fenced_plan_parses() {
        let personality = personality_with(&[]).await;
        let raw = "```json\n{\"steps\": [{\"step_type\": \"LLM_CALL\", \"parameters\": {\"prompt\": \"hi\"}}]}\n```";
        let plan = parse_plan(raw, &turn(), &personality, 25).unwrap();
        assert_eq!(plan.steps.len(), 1);
    }

    #[tokio::test]
    async fn prompt_lists_tools_and_memory_ops() {
        let personality = personality_with(&["get_weather", "calculator"]).await;
        let prompt = build_planning_prompt(&turn(), &personality, "");
        assert!(prompt.contains("- calculator:"));
        assert!(prompt.contains("- get_weather:"));
        assert!(prompt.contains("- search:"));
        assert!(prompt.contains("User request:\nWhat is the weather in Berlin?"));
    }
}
