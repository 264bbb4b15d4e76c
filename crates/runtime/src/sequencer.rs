//! Per-turn step sequencing.
//!
//! All step events for a plan are published up front; this gate makes sure
//! step N+1 executes only after step N's result was published, even though
//! the bus dispatches every step event concurrently. A released turn
//! (terminal) opens the gate completely so queued steps wake, re-check the
//! turn status, and drop.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};

struct Gate {
    next_index: Mutex<usize>,
    advanced: Notify,
}

#[derive(Default)]
pub struct TurnSequencer {
    gates: Mutex<HashMap<String, Arc<Gate>>>,
}

impl TurnSequencer {
    pub fn new() -> Self {
        Self::default()
    }

    async fn gate(&self, turn_id: &str) -> Arc<Gate> {
        let mut gates = self.gates.lock().await;
        Arc::clone(gates.entry(turn_id.to_string()).or_insert_with(|| {
            Arc::new(Gate {
                next_index: Mutex::new(0),
                advanced: Notify::new(),
            })
        }))
    }

    /// Wait until the turn's cursor reaches `step_index`.
    pub async fn wait_for(&self, turn_id: &str, step_index: usize) {
        let gate = self.gate(turn_id).await;
        loop {
            // Register with the Notify before checking the cursor; an
            // advance between the check and the await is not missed.
            let notified = gate.advanced.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if *gate.next_index.lock().await >= step_index {
                return;
            }
            notified.await;
        }
    }

    /// Move the cursor past `step_index`, waking waiters for the next step.
    pub async fn advance(&self, turn_id: &str, step_index: usize) {
        let gate = self.gate(turn_id).await;
        {
            let mut next = gate.next_index.lock().await;
            if *next == step_index {
                *next = step_index + 1;
            }
        }
        gate.advanced.notify_waiters();
    }

    /// Open the gate fully and forget the turn. Waiters wake immediately;
    /// they are expected to re-check the turn status and drop.
    pub async fn release(&self, turn_id: &str) {
        let gate = { self.gates.lock().await.remove(turn_id) };
        if let Some(gate) = gate {
            *gate.next_index.lock().await = usize::MAX;
            gate.advanced.notify_waiters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn steps_pass_in_index_order() {
        let sequencer = Arc::new(TurnSequencer::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        // Spawn out of order: 2, 0, 1
        for index in [2usize, 0, 1] {
            let sequencer = Arc::clone(&sequencer);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                sequencer.wait_for("turn_1", index).await;
                order.lock().await.push(index);
                sequencer.advance("turn_1", index).await;
            }));
        }

        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*order.lock().await, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn release_wakes_all_waiters() {
        let sequencer = Arc::new(TurnSequencer::new());
        let woken = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for index in [1usize, 2, 3] {
            let sequencer = Arc::clone(&sequencer);
            let woken = Arc::clone(&woken);
            handles.push(tokio::spawn(async move {
                sequencer.wait_for("turn_1", index).await;
                woken.fetch_add(1, Ordering::SeqCst);
            }));
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(woken.load(Ordering::SeqCst), 0);

        sequencer.release("turn_1").await;
        for handle in handles {
            tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .expect("waiter did not wake on release")
                .unwrap();
        }
        assert_eq!(woken.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn turns_are_independent() {
        let sequencer = TurnSequencer::new();
        sequencer.advance("turn_a", 0).await;
        // turn_b's cursor is untouched by turn_a's advance
        sequencer.wait_for("turn_a", 1).await;
        let blocked =
            tokio::time::timeout(Duration::from_millis(50), sequencer.wait_for("turn_b", 1)).await;
        assert!(blocked.is_err());
    }

    #[tokio::test]
    async fn double_advance_of_same_index_is_idempotent() {
        let sequencer = TurnSequencer::new();
        sequencer.advance("turn_1", 0).await;
        sequencer.advance("turn_1", 0).await;
        // Cursor moved past 0 exactly once; step 2 must still block
        sequencer.wait_for("turn_1", 1).await;
        let blocked =
            tokio::time::timeout(Duration::from_millis(50), sequencer.wait_for("turn_1", 2)).await;
        assert!(blocked.is_err());
    }
}
