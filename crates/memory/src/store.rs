//! In-memory storage backend.
//!
//! Search scores by token overlap between query and record text — crude
//! next to a vector store, but deterministic and good enough for the
//! runtime's best-effort recall. Metadata filters require exact equality
//! on every filter key.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use tokio::sync::RwLock;
use uuid::Uuid;

use turnloom_core::{MemoryBackend, MemoryError, MemoryHit, MemoryRecord};

#[derive(Default)]
pub struct InMemoryStore {
    records: RwLock<HashMap<String, MemoryRecord>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(String::from)
        .collect()
}

/// Fraction of query tokens present in the record text.
fn overlap_score(query_tokens: &[String], text: &str) -> f32 {
    if query_tokens.is_empty() {
        return 0.0;
    }
    let text_tokens = tokenize(text);
    let matched = query_tokens
        .iter()
        .filter(|t| text_tokens.contains(t))
        .count();
    matched as f32 / query_tokens.len() as f32
}

fn matches_filter(
    record: &MemoryRecord,
    filter: Option<&serde_json::Map<String, serde_json::Value>>,
) -> bool {
    match filter {
        None => true,
        Some(filter) => filter
            .iter()
            .all(|(key, value)| record.metadata.get(key) == Some(value)),
    }
}

#[async_trait]
impl MemoryBackend for InMemoryStore {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn store(
        &self,
        text: String,
        metadata: serde_json::Map<String, serde_json::Value>,
    ) -> Result<String, MemoryError> {
        let id = format!("mem_{}", Uuid::new_v4());
        let record = MemoryRecord {
            id: id.clone(),
            text,
            metadata,
            created_at: Utc::now(),
        };
        self.records.write().await.insert(id.clone(), record);
        Ok(id)
    }

    async fn search(
        &self,
        query: &str,
        limit: usize,
        filter: Option<&serde_json::Map<String, serde_json::Value>>,
    ) -> Result<Vec<MemoryHit>, MemoryError> {
        let query_tokens = tokenize(query);
        let records = self.records.read().await;

        let mut hits: Vec<MemoryHit> = records
            .values()
            .filter(|r| matches_filter(r, filter))
            .filter_map(|r| {
                let score = overlap_score(&query_tokens, &r.text);
                (score > 0.0).then(|| MemoryHit {
                    id: r.id.clone(),
                    text: r.text.clone(),
                    score,
                    metadata: r.metadata.clone(),
                })
            })
            .collect();

        hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        hits.truncate(limit);
        Ok(hits)
    }

    async fn retrieve(&self, id: &str) -> Result<MemoryRecord, MemoryError> {
        self.records
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| MemoryError::NotFound(id.to_string()))
    }

    async fn delete(&self, id: &str) -> Result<bool, MemoryError> {
        Ok(self.records.write().await.remove(id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn store_then_retrieve() {
        let store = InMemoryStore::new();
        let id = store
            .store("Berlin is rainy in autumn".into(), serde_json::Map::new())
            .await
            .unwrap();
        assert!(id.starts_with("mem_"));

        let record = store.retrieve(&id).await.unwrap();
        assert_eq!(record.text, "Berlin is rainy in autumn");
    }

    #[tokio::test]
    async fn retrieve_unknown_id_fails() {
        let store = InMemoryStore::new();
        assert!(matches!(
            store.retrieve("mem_nope").await,
            Err(MemoryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn search_ranks_by_overlap() {
        let store = InMemoryStore::new();
        store
            .store("the weather in Berlin".into(), serde_json::Map::new())
            .await
            .unwrap();
        store
            .store("weather forecast models".into(), serde_json::Map::new())
            .await
            .unwrap();
        store
            .store("completely unrelated text".into(), serde_json::Map::new())
            .await
            .unwrap();

        let hits = store.search("weather in Berlin", 10, None).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert!(hits[0].text.contains("Berlin"));
        assert!(hits[0].score > hits[1].score);
    }

    #[tokio::test]
    async fn search_respects_limit_and_filter() {
        let store = InMemoryStore::new();
        let mut meta_a = serde_json::Map::new();
        meta_a.insert("session".into(), serde_json::json!("a"));
        let mut meta_b = serde_json::Map::new();
        meta_b.insert("session".into(), serde_json::json!("b"));

        store.store("note one".into(), meta_a.clone()).await.unwrap();
        store.store("note two".into(), meta_a.clone()).await.unwrap();
        store.store("note three".into(), meta_b).await.unwrap();

        let all = store.search("note", 2, None).await.unwrap();
        assert_eq!(all.len(), 2);

        let filtered = store.search("note", 10, Some(&meta_a)).await.unwrap();
        assert_eq!(filtered.len(), 2);
        assert!(filtered.iter().all(|h| h.metadata["session"] == "a"));
    }

    #[tokio::test]
    async fn delete_reports_existence() {
        let store = InMemoryStore::new();
        let id = store
            .store("ephemeral".into(), serde_json::Map::new())
            .await
            .unwrap();
        assert!(store.delete(&id).await.unwrap());
        assert!(!store.delete(&id).await.unwrap());
        assert!(store.is_empty().await);
    }
}
