//! Memory backend trait — long-term storage consumed by the core.
//!
//! The core only needs `search`/`retrieve`/`store` (plus `delete`).
//! Production backends pair a cache with a vector store; the contract is
//! the same either way and timeouts are enforced by the caller.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MemoryError;

/// A stored memory record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRecord {
    pub id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// A search hit with its relevance score.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryHit {
    pub id: String,
    pub text: String,
    pub score: f32,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// The storage backend behind the memory manager.
#[async_trait]
pub trait MemoryBackend: Send + Sync {
    /// The backend name (e.g. "in_memory").
    fn name(&self) -> &str;

    /// Store a text with metadata, returning the new record id.
    async fn store(
        &self,
        text: String,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> std::result::Result<String, MemoryError>;

    /// Search records by relevance to a query.
    async fn search(
        &self,
        query: &str,
        limit: usize,
        filter: Option<&serde_json::Map<String, serde_json::Value>>,
    ) -> std::result::Result<Vec<MemoryHit>, MemoryError>;

    /// Fetch a record by id. Fails with [`MemoryError::NotFound`] for
    /// unknown ids.
    async fn retrieve(&self, id: &str) -> std::result::Result<MemoryRecord, MemoryError>;

    /// Delete a record. Returns whether it existed.
    async fn delete(&self, id: &str) -> std::result::Result<bool, MemoryError>;
}
