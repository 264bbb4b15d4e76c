//! Terminal turn transitions.
//!
//! Every path that ends a turn (aggregation, plan failure, watchdog) goes
//! through these helpers: compare-and-set under the turn lock, publish the
//! terminal event only on CAS win, release the step sequencer so queued
//! steps wake and drop. Losers of the race do nothing, which is what makes
//! duplicate deliveries and timeout races safe.

use std::sync::Arc;
use tracing::info;

use crate::context::ContextManager;
use crate::sequencer::TurnSequencer;
use turnloom_core::{ChatMessage, ErrorInfo, EventBus, EventEnvelope, EventKind};

/// Fail the turn. Returns true if this call performed the transition.
pub(crate) async fn fail_turn(
    context: &ContextManager,
    bus: &EventBus,
    sequencer: &Arc<TurnSequencer>,
    turn_id: &str,
    error: ErrorInfo,
) -> bool {
    let won = context
        .update_turn(turn_id, |turn| {
            turn.try_fail(error.clone())
                .then(|| (turn.trace_id.clone(), turn.metrics.clone()))
        })
        .await;

    let Ok(Some((trace_id, metrics))) = won else {
        return false;
    };

    sequencer.release(turn_id).await;
    info!(turn_id, trace_id = %trace_id, kind = %error.kind, "Turn failed");
    bus.publish(EventEnvelope::new(
        EventKind::TurnFailed,
        trace_id,
        turn_id,
        serde_json::json!({ "error": error, "metrics": metrics }),
    ));
    true
}

/// Complete the turn with its final response. Returns true on CAS win.
pub(crate) async fn complete_turn(
    context: &ContextManager,
    bus: &EventBus,
    sequencer: &Arc<TurnSequencer>,
    turn_id: &str,
    response: ChatMessage,
) -> bool {
    let won = context
        .update_turn(turn_id, |turn| {
            turn.try_complete(response.clone()).then(|| {
                (
                    turn.trace_id.clone(),
                    turn.metrics.clone(),
                    turn.session_id.clone(),
                    turn.user_input.clone(),
                )
            })
        })
        .await;

    let Ok(Some((trace_id, metrics, session_id, user_input))) = won else {
        return false;
    };

    sequencer.release(turn_id).await;

    if let Some(session_id) = session_id {
        context
            .append_history(&session_id, vec![user_input, response.clone()])
            .await;
    }

    info!(turn_id, trace_id = %trace_id, "Turn completed");
    bus.publish(EventEnvelope::new(
        EventKind::TurnCompleted,
        trace_id,
        turn_id,
        serde_json::json!({ "final_response": response, "metrics": metrics }),
    ));
    true
}
