//! Postgres-backed document store.
//!
//! One `documents` table holds every collection as JSONB rows keyed by
//! `(collection, id)`; `ON CONFLICT DO UPDATE` gives the upsert semantics the
//! contract requires. Filters use the JSONB containment operator so a
//! top-level equality filter maps to `doc @> $filter`.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::postgres::{PgPool, PgPoolOptions};

use super::{DocumentStore, StoreError};

pub struct PgDocumentStore {
    pool: PgPool,
}

impl PgDocumentStore {
    pub async fn new(url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(url)
            .await
            .map_err(|error| StoreError::Connection(error.to_string()))?;

        Ok(Self::from_pool(pool))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the embedded migrations. Called once by each service at startup;
    /// concurrent callers serialize on sqlx's migration lock.
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|error| StoreError::Query {
                command: "MIGRATE".to_owned(),
                error: error.to_string(),
            })
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn upsert(&self, collection: &str, id: &str, doc: Value) -> Result<(), StoreError> {
        sqlx::query(
            r#"
INSERT INTO documents (collection, id, doc)
VALUES ($1, $2, $3)
ON CONFLICT (collection, id)
DO UPDATE SET doc = EXCLUDED.doc, updated_at = NOW()
            "#,
        )
        .bind(collection)
        .bind(id)
        .bind(sqlx::types::Json(doc))
        .execute(&self.pool)
        .await
        .map_err(|error| StoreError::Query {
            command: "INSERT".to_owned(),
            error: error.to_string(),
        })?;

        Ok(())
    }

    async fn get(&self, collection: &str, id: &str) -> Result<Option<Value>, StoreError> {
        let row: Option<(sqlx::types::Json<Value>,)> = sqlx::query_as(
            r#"
SELECT doc FROM documents WHERE collection = $1 AND id = $2
            "#,
        )
        .bind(collection)
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|error| StoreError::Query {
            command: "SELECT".to_owned(),
            error: error.to_string(),
        })?;

        Ok(row.map(|(doc,)| doc.0))
    }

    async fn find(&self, collection: &str, filter: &Value) -> Result<Vec<Value>, StoreError> {
        let rows: Vec<(sqlx::types::Json<Value>,)> = sqlx::query_as(
            r#"
SELECT doc FROM documents
WHERE collection = $1 AND doc @> $2
ORDER BY id
            "#,
        )
        .bind(collection)
        .bind(sqlx::types::Json(filter.clone()))
        .fetch_all(&self.pool)
        .await
        .map_err(|error| StoreError::Query {
            command: "SELECT".to_owned(),
            error: error.to_string(),
        })?;

        Ok(rows.into_iter().map(|(doc,)| doc.0).collect())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
DELETE FROM documents WHERE collection = $1 AND id = $2
            "#,
        )
        .bind(collection)
        .bind(id)
        .execute(&self.pool)
        .await
        .map_err(|error| StoreError::Query {
            command: "DELETE".to_owned(),
            error: error.to_string(),
        })?;

        Ok(result.rows_affected() > 0)
    }
}
