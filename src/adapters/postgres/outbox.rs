//! PostgreSQL implementation of the OutboxStore port.
//!
//! Persists staged payloads in the `pubsub_payloads` table. The fetch+delete
//! pair is collapsed into one `DELETE ... RETURNING` statement so at most
//! one consumer obtains a given row.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sqlx::{PgPool, Row};

use crate::error::EngineError;
use crate::ports::{OutboxRecord, OutboxStore};

/// PostgreSQL-backed outbox store.
#[derive(Clone)]
pub struct PostgresOutboxStore {
    pool: PgPool,
}

impl PostgresOutboxStore {
    /// Creates a store over the given pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl OutboxStore for PostgresOutboxStore {
    async fn ensure_schema(&self) -> Result<(), EngineError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS pubsub_payloads (
                id BIGSERIAL PRIMARY KEY,
                trigger VARCHAR(255) NOT NULL,
                payload JSONB NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| EngineError::Schema(e.to_string()))?;

        Ok(())
    }

    async fn insert(&self, trigger: &str, payload: &JsonValue) -> Result<i64, EngineError> {
        let id: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO pubsub_payloads (trigger, payload)
            VALUES ($1, $2)
            RETURNING id
            "#,
        )
        .bind(trigger)
        .bind(payload)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| EngineError::store_write(trigger, e))?;

        Ok(id)
    }

    async fn fetch(&self, id: i64) -> Result<OutboxRecord, EngineError> {
        let row = sqlx::query(
            r#"
            SELECT id, trigger, payload, created_at
            FROM pubsub_payloads
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| EngineError::store_read(id, e))?;

        match row {
            Some(row) => Ok(OutboxRecord {
                id: row.get("id"),
                trigger: row.get("trigger"),
                payload: row.get("payload"),
                created_at: row.get("created_at"),
            }),
            None => Err(EngineError::RecordMissing { id }),
        }
    }

    async fn fetch_and_remove(&self, id: i64) -> Result<JsonValue, EngineError> {
        let payload: Option<JsonValue> = sqlx::query_scalar(
            r#"
            DELETE FROM pubsub_payloads
            WHERE id = $1
            RETURNING payload
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| EngineError::store_read(id, e))?;

        payload.ok_or(EngineError::RecordMissing { id })
    }
}
