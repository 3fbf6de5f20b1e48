use crate::store::traits::{
    document_id, DocumentStore, Filter, ListOptions, StoreError, StoreResult,
};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap};
use tokio::sync::RwLock;

/// In-memory document store. Used by the test suite and for running the
/// gateway without a database; all guarantees of the trait hold because
/// every write takes the single write lock.
#[derive(Debug, Default)]
pub struct MemoryStore {
    collections: RwLock<HashMap<String, BTreeMap<String, Value>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn sort_key(document: &Value, field: &str) -> String {
    match document.get(field) {
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

#[async_trait::async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self, collection: &str, id: &str) -> StoreResult<Value> {
        let collections = self.collections.read().await;
        collections
            .get(collection)
            .and_then(|docs| docs.get(id))
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn find_one(&self, collection: &str, filter: &Filter) -> StoreResult<Value> {
        let collections = self.collections.read().await;
        collections
            .get(collection)
            .and_then(|docs| docs.values().find(|doc| filter.matches(doc)))
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn insert(&self, collection: &str, document: Value) -> StoreResult<()> {
        let id = document_id(&document)?.to_string();
        let mut collections = self.collections.write().await;
        let docs = collections.entry(collection.to_string()).or_default();
        if docs.contains_key(&id) {
            return Err(StoreError::IdConflict);
        }
        docs.insert(id, document);
        Ok(())
    }

    async fn update(&self, collection: &str, id: &str, patch: Value) -> StoreResult<()> {
        let mut collections = self.collections.write().await;
        let document = collections
            .get_mut(collection)
            .and_then(|docs| docs.get_mut(id))
            .ok_or(StoreError::NotFound)?;
        if let (Value::Object(target), Value::Object(fields)) = (document, patch) {
            for (key, value) in fields {
                target.insert(key, value);
            }
            Ok(())
        } else {
            Err(StoreError::Backend(anyhow::anyhow!(
                "update patch must be a JSON object"
            )))
        }
    }

    async fn list(
        &self,
        collection: &str,
        filter: &Filter,
        options: &ListOptions,
    ) -> StoreResult<(Vec<Value>, u64)> {
        let collections = self.collections.read().await;
        let mut matched: Vec<Value> = collections
            .get(collection)
            .map(|docs| {
                docs.values()
                    .filter(|doc| filter.matches(doc))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        if let Some(field) = &options.sort {
            matched.sort_by_key(|doc| sort_key(doc, field));
        }
        let total = matched.len() as u64;
        let page: Vec<Value> = matched
            .into_iter()
            .skip(options.skip)
            .take(options.limit.unwrap_or(usize::MAX))
            .collect();
        Ok((page, total))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Arc;

    #[tokio::test]
    async fn insert_then_get_round_trips() {
        let store = MemoryStore::new();
        store
            .insert("gateways", json!({"id": "g1", "database_ids": ["a"]}))
            .await
            .unwrap();
        let doc = store.get("gateways", "g1").await.unwrap();
        assert_eq!(doc["database_ids"], json!(["a"]));
    }

    #[tokio::test]
    async fn insert_conflicts_on_duplicate_id() {
        let store = MemoryStore::new();
        store.insert("gateways", json!({"id": "g1"})).await.unwrap();
        let err = store.insert("gateways", json!({"id": "g1"})).await.unwrap_err();
        assert!(matches!(err, StoreError::IdConflict));
    }

    #[tokio::test]
    async fn concurrent_inserts_with_same_id_let_exactly_one_win() {
        let store = Arc::new(MemoryStore::new());
        let mut handles = Vec::new();
        for n in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.insert("queries", json!({"id": "q1", "n": n})).await
            }));
        }
        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn find_one_matches_on_array_equality() {
        let store = MemoryStore::new();
        store
            .insert("gateways", json!({"id": "g1", "database_ids": ["a", "b"]}))
            .await
            .unwrap();
        let filter = Filter::new().eq("database_ids", json!(["a", "b"]));
        assert_eq!(store.find_one("gateways", &filter).await.unwrap()["id"], "g1");

        // Containment is not equality.
        let sub = Filter::new().eq("database_ids", json!(["a"]));
        assert!(matches!(
            store.find_one("gateways", &sub).await.unwrap_err(),
            StoreError::NotFound
        ));
    }

    #[tokio::test]
    async fn update_merges_top_level_fields() {
        let store = MemoryStore::new();
        store
            .insert("queries", json!({"id": "q1", "state": "created", "response": null}))
            .await
            .unwrap();
        store
            .update("queries", "q1", json!({"state": "started"}))
            .await
            .unwrap();
        let doc = store.get("queries", "q1").await.unwrap();
        assert_eq!(doc["state"], "started");
        assert_eq!(doc["response"], Value::Null);
    }

    #[tokio::test]
    async fn update_missing_document_is_not_found() {
        let store = MemoryStore::new();
        let err = store
            .update("queries", "nope", json!({"state": "started"}))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound));
    }

    #[tokio::test]
    async fn list_pages_and_counts() {
        let store = MemoryStore::new();
        for n in 0..5 {
            store
                .insert("gateways", json!({"id": format!("g{n}"), "created_at": format!("2024-01-0{}", n + 1)}))
                .await
                .unwrap();
        }
        let options = ListOptions {
            sort: Some("created_at".into()),
            skip: 1,
            limit: Some(2),
        };
        let (page, total) = store
            .list("gateways", &Filter::new(), &options)
            .await
            .unwrap();
        assert_eq!(total, 5);
        assert_eq!(page.len(), 2);
        assert_eq!(page[0]["id"], "g1");
        assert_eq!(page[1]["id"], "g2");
    }
}
