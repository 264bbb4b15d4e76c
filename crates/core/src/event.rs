//! Event envelope and the in-process publish/subscribe bus.
//!
//! Every cross-component message is an [`EventEnvelope`] routed by
//! [`EventKind`]. The bus dispatches in parallel: each publish spawns one
//! task per registered handler and returns immediately. Ordering between
//! events of the same turn is enforced by the consumers (per-turn locks and
//! the step sequencer), not by the bus.

use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use crate::error::Result;
use crate::models::new_event_id;

/// Envelope schema version stamped on every event.
pub const SPEC_VERSION: &str = "1.0.0";

/// The event topics in the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    #[serde(rename = "turn.start")]
    TurnStart,
    #[serde(rename = "step.execute")]
    StepExecute,
    #[serde(rename = "step.result")]
    StepResult,
    #[serde(rename = "turn.completed")]
    TurnCompleted,
    #[serde(rename = "turn.failed")]
    TurnFailed,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::TurnStart => "turn.start",
            Self::StepExecute => "step.execute",
            Self::StepResult => "step.result",
            Self::TurnCompleted => "turn.completed",
            Self::TurnFailed => "turn.failed",
        };
        f.write_str(s)
    }
}

/// The common wrapper for every cross-component event: routing metadata
/// plus a type-specific JSON payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_id: String,
    pub event_type: EventKind,
    pub spec_version: String,
    pub timestamp: DateTime<Utc>,
    pub trace_id: String,
    pub turn_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    pub fn new(
        event_type: EventKind,
        trace_id: impl Into<String>,
        turn_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            event_id: new_event_id(),
            event_type,
            spec_version: SPEC_VERSION.into(),
            timestamp: Utc::now(),
            trace_id: trace_id.into(),
            turn_id: turn_id.into(),
            plan_id: None,
            step_id: None,
            payload,
        }
    }

    pub fn with_plan(mut self, plan_id: impl Into<String>) -> Self {
        self.plan_id = Some(plan_id.into());
        self
    }

    pub fn with_step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }
}

/// A subscriber on the bus. Handlers must be cheap to clone behind an Arc
/// and safe to invoke concurrently; the bus gives no ordering guarantees.
#[async_trait::async_trait]
pub trait EventHandler: Send + Sync {
    /// Handler name, used in logs when a handler fails.
    fn name(&self) -> &str;

    async fn handle(&self, envelope: EventEnvelope) -> Result<()>;
}

type SubscriberMap = HashMap<EventKind, Vec<Arc<dyn EventHandler>>>;

/// In-process pub/sub with per-topic fan-out and parallel dispatch.
///
/// Subscriptions are write-rare: `subscribe` rebuilds the map and swaps a
/// single `Arc`, so `publish` never holds a lock across dispatch. Errors in
/// one handler are logged and counted; they never reach the publisher or
/// other handlers. A panicking handler aborts only its own invocation.
pub struct EventBus {
    subscribers: RwLock<Arc<SubscriberMap>>,
    handler_errors: Arc<AtomicU64>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: RwLock::new(Arc::new(HashMap::new())),
            handler_errors: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Register a handler for an event kind. Intended for startup wiring.
    pub fn subscribe(&self, kind: EventKind, handler: Arc<dyn EventHandler>) {
        let mut guard = self.subscribers.write().expect("subscriber lock poisoned");
        let mut map: SubscriberMap = (**guard).clone();
        map.entry(kind).or_default().push(handler);
        *guard = Arc::new(map);
    }

    /// Publish an envelope: one task is spawned per registered handler and
    /// the call returns without waiting for any of them.
    pub fn publish(&self, envelope: EventEnvelope) {
        let snapshot = {
            let guard = self.subscribers.read().expect("subscriber lock poisoned");
            Arc::clone(&guard)
        };

        let Some(handlers) = snapshot.get(&envelope.event_type) else {
            tracing::trace!(event_type = %envelope.event_type, "No subscribers for event");
            return;
        };

        for handler in handlers {
            let handler = Arc::clone(handler);
            let envelope = envelope.clone();
            let errors = Arc::clone(&self.handler_errors);
            tokio::spawn(async move {
                let outcome = std::panic::AssertUnwindSafe(handler.handle(envelope.clone()))
                    .catch_unwind()
                    .await;
                match outcome {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        errors.fetch_add(1, Ordering::Relaxed);
                        tracing::error!(
                            handler = handler.name(),
                            event_type = %envelope.event_type,
                            trace_id = %envelope.trace_id,
                            turn_id = %envelope.turn_id,
                            error = %e,
                            "Event handler failed"
                        );
                    }
                    Err(_) => {
                        errors.fetch_add(1, Ordering::Relaxed);
                        tracing::error!(
                            handler = handler.name(),
                            event_type = %envelope.event_type,
                            trace_id = %envelope.trace_id,
                            "Event handler panicked"
                        );
                    }
                }
            });
        }
    }

    /// Total handler failures (errors + panics) since bus creation.
    pub fn handler_error_count(&self) -> u64 {
        self.handler_errors.load(Ordering::Relaxed)
    }

    /// Number of handlers registered for a kind.
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.subscribers
            .read()
            .expect("subscriber lock poisoned")
            .get(&kind)
            .map_or(0, Vec::len)
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
