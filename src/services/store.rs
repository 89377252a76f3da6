// Document Store Interface
// External per-user document storage, consumed (not owned) by the core

use std::collections::HashMap;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::RwLock;

/// The slice of the external document store the core depends on.
///
/// Documents are JSON values addressed by slash-separated paths, e.g.
/// `users/{uid}/destinations/{platform}`. There are no cross-operation
/// transactions; each call is individually atomic.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, path: &str) -> Result<Option<Value>, String>;

    /// Write a document. With `merge`, top-level fields are merged into the
    /// existing document; otherwise the document is replaced.
    async fn set(&self, path: &str, value: Value, merge: bool) -> Result<(), String>;

    /// Delete a document. Deleting an absent document succeeds.
    async fn delete(&self, path: &str) -> Result<(), String>;

    /// Atomically add `delta` to a numeric field, creating the document and
    /// field as needed.
    async fn increment(&self, path: &str, field: &str, delta: i64) -> Result<i64, String>;

    /// List the documents directly under a collection path as (id, value)
    /// pairs.
    async fn list(&self, collection: &str) -> Result<Vec<(String, Value)>, String>;
}

/// In-memory store used in development and tests.
pub struct MemoryStore {
    documents: RwLock<HashMap<String, Value>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            documents: RwLock::new(HashMap::new()),
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, path: &str) -> Result<Option<Value>, String> {
        Ok(self.documents.read().await.get(path).cloned())
    }

    async fn set(&self, path: &str, value: Value, merge: bool) -> Result<(), String> {
        let mut documents = self.documents.write().await;
        match documents.get_mut(path) {
            Some(existing) if merge => {
                if let (Some(target), Some(incoming)) =
                    (existing.as_object_mut(), value.as_object())
                {
                    for (key, field) in incoming {
                        target.insert(key.clone(), field.clone());
                    }
                } else {
                    *existing = value;
                }
            }
            _ => {
                documents.insert(path.to_string(), value);
            }
        }
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), String> {
        self.documents.write().await.remove(path);
        Ok(())
    }

    async fn increment(&self, path: &str, field: &str, delta: i64) -> Result<i64, String> {
        let mut documents = self.documents.write().await;
        let document = documents
            .entry(path.to_string())
            .or_insert_with(|| json!({}));
        let object = document
            .as_object_mut()
            .ok_or_else(|| format!("Document at {path} is not an object"))?;
        let current = object.get(field).and_then(Value::as_i64).unwrap_or(0);
        let next = current + delta;
        object.insert(field.to_string(), json!(next));
        Ok(next)
    }

    async fn list(&self, collection: &str) -> Result<Vec<(String, Value)>, String> {
        let prefix = format!("{}/", collection.trim_end_matches('/'));
        let documents = self.documents.read().await;
        let mut entries: Vec<(String, Value)> = documents
            .iter()
            .filter_map(|(path, value)| {
                let id = path.strip_prefix(&prefix)?;
                // Only direct children, not nested collections.
                if id.contains('/') {
                    return None;
                }
                Some((id.to_string(), value.clone()))
            })
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_set_merge_keeps_existing_fields() {
        let store = MemoryStore::new();
        store
            .set("users/u1", json!({"name": "a", "plan": "free"}), false)
            .await
            .unwrap();
        store
            .set("users/u1", json!({"plan": "pro"}), true)
            .await
            .unwrap();

        let doc = store.get("users/u1").await.unwrap().unwrap();
        assert_eq!(doc["name"], "a");
        assert_eq!(doc["plan"], "pro");
    }

    #[tokio::test]
    async fn test_delete_absent_succeeds() {
        let store = MemoryStore::new();
        assert!(store.delete("users/missing").await.is_ok());
    }

    #[tokio::test]
    async fn test_increment_creates_and_adds() {
        let store = MemoryStore::new();
        assert_eq!(store.increment("users/u1", "goLiveCount", 1).await.unwrap(), 1);
        assert_eq!(store.increment("users/u1", "goLiveCount", 2).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_list_returns_direct_children_only() {
        let store = MemoryStore::new();
        store
            .set("users/u1/destinations/youtube", json!({"provider": "youtube"}), false)
            .await
            .unwrap();
        store
            .set("users/u1/destinations/twitch", json!({"provider": "twitch"}), false)
            .await
            .unwrap();
        store
            .set("users/u1/destinations/twitch/extra/doc", json!({}), false)
            .await
            .unwrap();
        store.set("users/u2/destinations/youtube", json!({}), false).await.unwrap();

        let entries = store.list("users/u1/destinations").await.unwrap();
        let ids: Vec<&str> = entries.iter().map(|(id, _)| id.as_str()).collect();
        assert_eq!(ids, vec!["twitch", "youtube"]);
    }
}
