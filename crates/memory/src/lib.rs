//! Memory manager facade and the in-memory store.
//!
//! The core consumes `search`/`retrieve`/`store` (plus `delete`). Search
//! is best-effort: a backend failure degrades to an empty result set and a
//! counter bump instead of failing the caller; retrieve and store surface
//! their errors. Production deployments put a cache + vector store behind
//! the same [`MemoryBackend`] trait.

pub mod store;

pub use store::InMemoryStore;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::warn;

use turnloom_core::{MemoryBackend, MemoryError, MemoryHit, MemoryRecord};

/// Facade over the configured memory backend.
pub struct MemoryManager {
    backend: Arc<dyn MemoryBackend>,
    search_failures: AtomicU64,
}

impl MemoryManager {
    pub fn new(backend: Arc<dyn MemoryBackend>) -> Self {
        Self {
            backend,
            search_failures: AtomicU64::new(0),
        }
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    /// Best-effort search: backend errors degrade to an empty hit list.
    pub async fn search(
        &self,
        query: &str,
        limit: usize,
        filter: Option<&serde_json::Map<String, serde_json::Value>>,
    ) -> Vec<MemoryHit> {
        match self.backend.search(query, limit, filter).await {
            Ok(hits) => hits,
            Err(e) => {
                self.search_failures.fetch_add(1, Ordering::Relaxed);
                warn!(backend = self.backend.name(), error = %e, "Memory search degraded to empty result");
                Vec::new()
            }
        }
    }

    /// Fetch a record by id; unknown ids are an error.
    pub async fn retrieve(&self, id: &str) -> Result<MemoryRecord, MemoryError> {
        self.backend.retrieve(id).await
    }

    /// Store a text with metadata, returning the new record id.
    pub async fn store(
        &self,
        text: String,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> Result<String, MemoryError> {
        self.backend.store(text, metadata).await
    }

    /// Delete a record. Returns whether it existed.
    pub async fn delete(&self, id: &str) -> Result<bool, MemoryError> {
        self.backend.delete(id).await
    }

    /// How many searches degraded since startup.
    pub fn search_failure_count(&self) -> u64 {
        self.search_failures.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct BrokenBackend;

    #[async_trait]
    impl MemoryBackend for BrokenBackend {
        fn name(&self) -> &str {
            "broken"
        }

        async fn store(
            &self,
            _text: String,
            _metadata: serde_json::Map<String, serde_json::Value>,
        ) -> Result<String, MemoryError> {
            Err(MemoryError::Backend("disk on fire".into()))
        }

        async fn search(
            &self,
            _query: &str,
            _limit: usize,
            _filter: Option<&serde_json::Map<String, serde_json::Value>>,
        ) -> Result<Vec<MemoryHit>, MemoryError> {
            Err(MemoryError::Backend("disk on fire".into()))
        }

        async fn retrieve(&self, id: &str) -> Result<MemoryRecord, MemoryError> {
            Err(MemoryError::NotFound(id.into()))
        }

        async fn delete(&self, _id: &str) -> Result<bool, MemoryError> {
            Err(MemoryError::Backend("disk on fire".into()))
        }
    }

    #[tokio::test]
    async fn search_degrades_to_empty_on_backend_error() {
        let manager = MemoryManager::new(Arc::new(BrokenBackend));
        let hits = manager.search("anything", 5, None).await;
        assert!(hits.is_empty());
        assert_eq!(manager.search_failure_count(), 1);
    }

    #[tokio::test]
    async fn retrieve_and_store_surface_errors() {
        let manager = MemoryManager::new(Arc::new(BrokenBackend));
        assert!(manager.retrieve("mem_x").await.is_err());
        assert!(manager
            .store("text".into(), serde_json::Map::new())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn happy_path_via_in_memory_store() {
        let manager = MemoryManager::new(Arc::new(InMemoryStore::new()));
        let id = manager
            .store("Rust ownership notes".into(), serde_json::Map::new())
            .await
            .unwrap();

        let record = manager.retrieve(&id).await.unwrap();
        assert_eq!(record.text, "Rust ownership notes");

        let hits = manager.search("ownership", 5, None).await;
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, id);
        assert_eq!(manager.search_failure_count(), 0);
    }
}
