//! Turn orchestration engine for Turnloom.
//!
//! Wires the event-driven pipeline together: `TurnManager` accepts user
//! input and publishes `turn.start`; `PlanExecutor` turns it into a Plan
//! and publishes the step events; `StepProcessor` executes steps in order
//! and publishes `step.result`; `TurnManager` aggregates results into
//! exactly one terminal `turn.completed` or `turn.failed` per turn.

pub mod context;
mod finalize;
pub mod planner;
pub mod sequencer;
pub mod step_processor;
pub mod turn_manager;

pub use context::ContextManager;
pub use planner::PlanExecutor;
pub use sequencer::TurnSequencer;
pub use step_processor::StepProcessor;
pub use turn_manager::{StartTurnRequest, StartedTurn, TurnManager};

use std::sync::Arc;
use std::time::Duration;

use turnloom_core::{EventBus, EventKind, MemoryBackend, RuntimeError, ToolLibrary, Turn};
use turnloom_memory::{InMemoryStore, MemoryManager};
use turnloom_personality::PersonalityPackManager;
use turnloom_providers::ProviderRouter;

/// The assembled core runtime.
///
/// Construction subscribes every handler; afterwards the only entry point
/// an API layer needs is [`Runtime::start_turn`] plus the turn snapshots
/// served by the context manager.
pub struct Runtime {
    bus: Arc<EventBus>,
    context: Arc<ContextManager>,
    personalities: Arc<PersonalityPackManager>,
    providers: Arc<ProviderRouter>,
    turn_manager: Arc<TurnManager>,
    config: Arc<turnloom_config::AppConfig>,
}

impl Runtime {
    /// Assemble a runtime from explicit collaborators. The personality
    /// registry is loaded as part of construction.
    pub async fn build(
        config: turnloom_config::AppConfig,
        providers: ProviderRouter,
        library: ToolLibrary,
        memory_backend: Arc<dyn MemoryBackend>,
    ) -> Result<Self, RuntimeError> {
        let config = Arc::new(config);
        let bus = Arc::new(EventBus::new());
        let memory = Arc::new(MemoryManager::new(memory_backend));
        let context = Arc::new(ContextManager::new(memory));
        let sequencer = Arc::new(TurnSequencer::new());
        let providers = Arc::new(providers);

        let personalities = Arc::new(PersonalityPackManager::new(
            &config.personalities,
            Arc::new(library),
        ));
        personalities
            .reload()
            .await
            .map_err(|e| RuntimeError::Validation(e.to_string()))?;

        let plan_executor = Arc::new(PlanExecutor::new(
            Arc::clone(&context),
            Arc::clone(&providers),
            Arc::clone(&bus),
            Arc::clone(&sequencer),
            Arc::clone(&config),
        ));
        bus.subscribe(EventKind::TurnStart, plan_executor);

        let step_processor = Arc::new(StepProcessor::new(
            Arc::clone(&context),
            Arc::clone(&providers),
            Arc::clone(&bus),
            Arc::clone(&sequencer),
            Arc::clone(&config),
        ));
        bus.subscribe(EventKind::StepExecute, step_processor);

        let turn_manager = Arc::new(TurnManager::new(
            Arc::clone(&context),
            Arc::clone(&personalities),
            Arc::clone(&bus),
            Arc::clone(&sequencer),
            Arc::clone(&config),
        ));
        bus.subscribe(EventKind::StepResult, Arc::clone(&turn_manager) as _);

        Ok(Self {
            bus,
            context,
            personalities,
            providers,
            turn_manager,
            config,
        })
    }

    /// Assemble with the stock collaborators: providers from config, the
    /// built-in tool library, and the in-memory store.
    pub async fn build_with_defaults(
        config: turnloom_config::AppConfig,
    ) -> Result<Self, RuntimeError> {
        let providers = turnloom_providers::router::build_from_config(&config);
        Self::build(
            config,
            providers,
            turnloom_personality::default_tool_library(),
            Arc::new(InMemoryStore::new()),
        )
        .await
    }

    pub async fn start_turn(
        &self,
        request: StartTurnRequest,
    ) -> Result<StartedTurn, RuntimeError> {
        self.turn_manager.start_turn(request).await
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    pub fn context(&self) -> &Arc<ContextManager> {
        &self.context
    }

    pub fn personalities(&self) -> &Arc<PersonalityPackManager> {
        &self.personalities
    }

    pub fn providers(&self) -> &Arc<ProviderRouter> {
        &self.providers
    }

    pub fn config(&self) -> &turnloom_config::AppConfig {
        &self.config
    }

    /// Poll until the turn reaches a terminal state or the deadline
    /// passes. Returns the final turn snapshot, or the latest snapshot on
    /// timeout. Intended for API layers and tests that await an outcome.
    pub async fn wait_for_turn(&self, turn_id: &str, timeout: Duration) -> Option<Turn> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let snapshot = self.context.get_turn(turn_id).await;
            if let Some(turn) = &snapshot {
                if turn.is_terminal() {
                    return snapshot;
                }
            }
            if tokio::time::Instant::now() >= deadline {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
