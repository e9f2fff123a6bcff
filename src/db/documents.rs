use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::PgPool;

use crate::feed::DocumentStore;

/// Documents kept in the `documents` table. Writes reach subscribers through
/// the table's notify trigger.
#[derive(Clone)]
pub struct PgDocuments {
    pool: PgPool,
}

impl PgDocuments {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl DocumentStore for PgDocuments {
    async fn load(&self, collection: &str, id: &str) -> Result<Option<Value>> {
        let row: Option<(Value,)> =
            sqlx::query_as("SELECT data FROM documents WHERE collection = $1 AND id = $2")
                .bind(collection)
                .bind(id)
                .fetch_optional(&self.pool)
                .await
                .with_context(|| format!("failed to load {collection}/{id}"))?;
        Ok(row.map(|(data,)| data))
    }

    async fn list(&self, collection: &str) -> Result<Vec<(String, Value)>> {
        sqlx::query_as("SELECT id, data FROM documents WHERE collection = $1 ORDER BY id")
            .bind(collection)
            .fetch_all(&self.pool)
            .await
            .with_context(|| format!("failed to list {collection}"))
    }

    async fn save(&self, collection: &str, id: &str, doc: Value) -> Result<()> {
        sqlx::query(
            "INSERT INTO documents (collection, id, data) VALUES ($1, $2, $3) \
             ON CONFLICT (collection, id) \
             DO UPDATE SET data = EXCLUDED.data, updated_at = now()",
        )
        .bind(collection)
        .bind(id)
        .bind(doc)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to save {collection}/{id}"))?;
        Ok(())
    }

    async fn delete(&self, collection: &str, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM documents WHERE collection = $1 AND id = $2")
            .bind(collection)
            .bind(id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to delete {collection}/{id}"))?;
        Ok(())
    }
}
