use serde_json::Value;
use std::collections::BTreeMap;
use thiserror::Error;

/// Collection holding gateway records.
pub const GATEWAYS: &str = "gateways";
/// Collection holding query records.
pub const QUERIES: &str = "queries";
/// Collection holding registered database descriptors.
pub const DATABASES: &str = "databases";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("document not found")]
    NotFound,
    #[error("a document with this id already exists")]
    IdConflict,
    #[error("document store backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Equality filter over top-level document fields.
#[derive(Debug, Clone, Default)]
pub struct Filter(pub BTreeMap<String, Value>);

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, field: &str, value: Value) -> Self {
        self.0.insert(field.to_string(), value);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn matches(&self, document: &Value) -> bool {
        self.0
            .iter()
            .all(|(field, expected)| document.get(field) == Some(expected))
    }
}

/// Paging and ordering for `list`.
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    /// Top-level field to order by, ascending (stringified comparison).
    pub sort: Option<String>,
    pub skip: usize,
    pub limit: Option<usize>,
}

/// A named collection of JSON documents keyed by their `"id"` field.
///
/// `insert` is atomic with respect to the id: of two concurrent inserts with
/// the same id exactly one succeeds, the other observes `IdConflict` and is
/// expected to re-read. No cross-collection transactions exist.
#[async_trait::async_trait]
pub trait DocumentStore: Send + Sync {
    async fn get(&self, collection: &str, id: &str) -> StoreResult<Value>;

    async fn find_one(&self, collection: &str, filter: &Filter) -> StoreResult<Value>;

    async fn insert(&self, collection: &str, document: Value) -> StoreResult<()>;

    /// Merge `patch`'s top-level fields into the stored document.
    async fn update(&self, collection: &str, id: &str, patch: Value) -> StoreResult<()>;

    /// Matching documents plus the total match count before paging.
    async fn list(
        &self,
        collection: &str,
        filter: &Filter,
        options: &ListOptions,
    ) -> StoreResult<(Vec<Value>, u64)>;
}

/// Pull the mandatory `"id"` field out of a document.
pub fn document_id(document: &Value) -> StoreResult<&str> {
    document
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| StoreError::Backend(anyhow::anyhow!("document is missing a string \"id\"")))
}
