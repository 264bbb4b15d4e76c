//! Per-turn state store and session history.
//!
//! Turns live in process memory behind striped locks: an outer read-mostly
//! map hands out one `Arc<Mutex<Turn>>` per turn, so mutations on
//! different turns never contend and a step result cannot race a timeout
//! on the same turn. The personality snapshot captured at turn start is
//! kept alongside so reloads never change an in-flight turn's behavior.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

use turnloom_core::{ChatMessage, RuntimeError, Turn};
use turnloom_memory::MemoryManager;
use turnloom_personality::PersonalityInstance;

pub struct ContextManager {
    turns: RwLock<HashMap<String, Arc<Mutex<Turn>>>>,
    /// Personality snapshot per turn, captured at turn start.
    snapshots: RwLock<HashMap<String, Arc<PersonalityInstance>>>,
    /// Conversation history per session, appended on turn completion.
    sessions: RwLock<HashMap<String, Vec<ChatMessage>>>,
    memory: Arc<MemoryManager>,
}

impl ContextManager {
    pub fn new(memory: Arc<MemoryManager>) -> Self {
        Self {
            turns: RwLock::new(HashMap::new()),
            snapshots: RwLock::new(HashMap::new()),
            sessions: RwLock::new(HashMap::new()),
            memory,
        }
    }

    pub fn memory(&self) -> &Arc<MemoryManager> {
        &self.memory
    }

    /// Store a new turn. Re-submitting a known turn id is rejected.
    pub async fn create_turn(
        &self,
        turn: Turn,
        personality: Arc<PersonalityInstance>,
    ) -> Result<(), RuntimeError> {
        let turn_id = turn.turn_id.clone();
        {
            let mut turns = self.turns.write().await;
            if turns.contains_key(&turn_id) {
                return Err(RuntimeError::DuplicateTurn(turn_id));
            }
            turns.insert(turn_id.clone(), Arc::new(Mutex::new(turn)));
        }
        self.snapshots.write().await.insert(turn_id, personality);
        Ok(())
    }

    pub async fn contains_turn(&self, turn_id: &str) -> bool {
        self.turns.read().await.contains_key(turn_id)
    }

    /// A point-in-time copy of the turn.
    pub async fn get_turn(&self, turn_id: &str) -> Option<Turn> {
        let entry = self.turns.read().await.get(turn_id).cloned()?;
        let turn = entry.lock().await;
        Some(turn.clone())
    }

    /// Run a mutation under the turn's lock. The outer map lock is released
    /// before the entry lock is taken, so other turns proceed unblocked.
    pub async fn update_turn<F, R>(&self, turn_id: &str, mutator: F) -> Result<R, RuntimeError>
    where
        F: FnOnce(&mut Turn) -> R,
    {
        let entry = self
            .turns
            .read()
            .await
            .get(turn_id)
            .cloned()
            .ok_or_else(|| RuntimeError::TurnNotFound(turn_id.to_string()))?;
        let mut turn = entry.lock().await;
        Ok(mutator(&mut turn))
    }

    /// Replace a stored turn wholesale, under its lock. Callers that read,
    /// modify, and write back race with concurrent mutators; prefer
    /// [`ContextManager::update_turn`] inside the runtime.
    pub async fn save_turn(&self, turn: Turn) -> Result<(), RuntimeError> {
        let turn_id = turn.turn_id.clone();
        self.update_turn(&turn_id, move |stored| *stored = turn)
            .await
    }

    /// The personality snapshot captured when the turn was accepted.
    pub async fn personality_for_turn(&self, turn_id: &str) -> Option<Arc<PersonalityInstance>> {
        self.snapshots.read().await.get(turn_id).cloned()
    }

    /// Recent conversation history for a session, most recent last.
    pub async fn get_history(&self, session_id: &str, limit: usize) -> Vec<ChatMessage> {
        let sessions = self.sessions.read().await;
        match sessions.get(session_id) {
            Some(messages) => {
                let skip = messages.len().saturating_sub(limit);
                messages[skip..].to_vec()
            }
            None => Vec::new(),
        }
    }

    /// Append messages to a session's history.
    pub async fn append_history(&self, session_id: &str, messages: Vec<ChatMessage>) {
        let mut sessions = self.sessions.write().await;
        sessions.entry(session_id.to_string()).or_default().extend(messages);
    }
}
