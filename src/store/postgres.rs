use anyhow::{anyhow, Context, Result};
use serde_json::Value;
use sqlx::{postgres::PgPoolOptions, PgPool, Row};

use crate::store::traits::{
    document_id, DocumentStore, Filter, ListOptions, StoreError, StoreResult,
};

/// Document store on a single Postgres JSONB table.
///
/// Documents live in `documents (collection, id, doc)`; the primary key on
/// `(collection, id)` is what makes `insert` atomic with respect to the id.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Create a new PostgreSQL store with the given database URL.
    pub async fn new(database_url: &str, max_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .context("Failed to create PostgreSQL connection pool")?;

        Ok(Self { pool })
    }

    /// Create the documents table and the interning index.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                collection TEXT NOT NULL,
                id TEXT NOT NULL,
                doc JSONB NOT NULL,
                PRIMARY KEY (collection, id)
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create documents table")?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS documents_gateway_id_set
                ON documents ((doc->'database_ids'))
                WHERE collection = 'gateways'
            "#,
        )
        .execute(&self.pool)
        .await
        .context("Failed to create gateway id-set index")?;

        Ok(())
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// `WHERE` clause for an equality filter, with placeholders starting
    /// after the `collection` bind at `$1`.
    fn filter_clause(filter: &Filter) -> String {
        let mut clause = String::from("collection = $1");
        for (position, field) in filter.0.keys().enumerate() {
            // Field names come from code, never from request input.
            clause.push_str(&format!(" AND doc->'{field}' = ${}", position + 2));
            debug_assert!(field.chars().all(|c| c.is_ascii_alphanumeric() || c == '_'));
        }
        clause
    }
}

#[async_trait::async_trait]
impl DocumentStore for PostgresStore {
    async fn get(&self, collection: &str, id: &str) -> StoreResult<Value> {
        let row = sqlx::query("SELECT doc FROM documents WHERE collection = $1 AND id = $2")
            .bind(collection)
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .context("Failed to fetch document")?;

        let Some(row) = row else {
            return Err(StoreError::NotFound);
        };
        let doc: Value = row.try_get("doc").context("Failed to decode document")?;
        Ok(doc)
    }

    async fn find_one(&self, collection: &str, filter: &Filter) -> StoreResult<Value> {
        let sql = format!(
            "SELECT doc FROM documents WHERE {} LIMIT 1",
            Self::filter_clause(filter)
        );
        let mut query = sqlx::query(&sql).bind(collection);
        for value in filter.0.values() {
            query = query.bind(value);
        }
        let row = query
            .fetch_optional(&self.pool)
            .await
            .context("Failed to run find_one query")?;

        let Some(row) = row else {
            return Err(StoreError::NotFound);
        };
        let doc: Value = row.try_get("doc").context("Failed to decode document")?;
        Ok(doc)
    }

    async fn insert(&self, collection: &str, document: Value) -> StoreResult<()> {
        let id = document_id(&document)?.to_string();
        let result = sqlx::query(
            r#"
            INSERT INTO documents (collection, id, doc)
            VALUES ($1, $2, $3)
            ON CONFLICT (collection, id) DO NOTHING
            "#,
        )
        .bind(collection)
        .bind(&id)
        .bind(&document)
        .execute(&self.pool)
        .await
        .context("Failed to insert document")?;

        if result.rows_affected() == 0 {
            return Err(StoreError::IdConflict);
        }
        Ok(())
    }

    async fn update(&self, collection: &str, id: &str, patch: Value) -> StoreResult<()> {
        if !patch.is_object() {
            return Err(StoreError::Backend(anyhow!(
                "update patch must be a JSON object"
            )));
        }
        let result = sqlx::query(
            "UPDATE documents SET doc = doc || $3 WHERE collection = $1 AND id = $2",
        )
        .bind(collection)
        .bind(id)
        .bind(&patch)
        .execute(&self.pool)
        .await
        .context("Failed to update document")?;

        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound);
        }
        Ok(())
    }

    async fn list(
        &self,
        collection: &str,
        filter: &Filter,
        options: &ListOptions,
    ) -> StoreResult<(Vec<Value>, u64)> {
        let clause = Self::filter_clause(filter);

        let count_sql = format!("SELECT COUNT(*) AS total FROM documents WHERE {clause}");
        let mut count_query = sqlx::query(&count_sql).bind(collection);
        for value in filter.0.values() {
            count_query = count_query.bind(value);
        }
        let total: i64 = count_query
            .fetch_one(&self.pool)
            .await
            .context("Failed to count documents")?
            .try_get("total")
            .context("Failed to decode document count")?;

        let order = match &options.sort {
            Some(field) => format!(" ORDER BY doc->>'{field}'"),
            None => " ORDER BY id".to_string(),
        };
        let limit = options
            .limit
            .map(|n| format!(" LIMIT {n}"))
            .unwrap_or_default();
        let sql = format!(
            "SELECT doc FROM documents WHERE {clause}{order} OFFSET {}{limit}",
            options.skip
        );
        let mut query = sqlx::query(&sql).bind(collection);
        for value in filter.0.values() {
            query = query.bind(value);
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .context("Failed to list documents")?;

        let documents = rows
            .into_iter()
            .map(|row| row.try_get("doc").context("Failed to decode document"))
            .collect::<Result<Vec<Value>>>()?;

        Ok((documents, total as u64))
    }
}
