//! OutboxStore port - Interface for durable payload staging.
//!
//! The notification transport only carries short string payloads, so every
//! published payload is staged as a row in an auxiliary table and only the
//! row id travels through the channel. Consumers fetch the full payload by
//! id; iterator consumers also remove the row while fetching it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::EngineError;

/// A staged payload row.
///
/// Created by `insert`, read by `fetch`, consumed by `fetch_and_remove`.
/// Never updated in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxRecord {
    /// Store-assigned, monotonically increasing identifier.
    pub id: i64,

    /// Trigger name the payload was published under.
    pub trigger: String,

    /// The staged payload.
    pub payload: JsonValue,

    /// When the row was written.
    pub created_at: DateTime<Utc>,
}

/// Port for the outbox table.
///
/// The table is shared by every engine instance pointed at the same database.
/// No transaction wraps the fetch+delete pair against the insert+notify pair;
/// the observable contract is fetch-then-gone: once `fetch_and_remove`
/// succeeds for an id, every later read of that id fails with
/// [`EngineError::RecordMissing`].
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Idempotently creates the table if absent.
    ///
    /// Safe to call concurrently from multiple engine instances.
    async fn ensure_schema(&self) -> Result<(), EngineError>;

    /// Stages a payload and returns the assigned row id.
    ///
    /// Fails with [`EngineError::StoreWrite`] on connectivity or constraint
    /// failure; the caller must not notify the channel when this fails.
    async fn insert(&self, trigger: &str, payload: &JsonValue) -> Result<i64, EngineError>;

    /// Reads a row without consuming it.
    ///
    /// Fails with [`EngineError::RecordMissing`] if the row is gone.
    async fn fetch(&self, id: i64) -> Result<OutboxRecord, EngineError>;

    /// Reads and deletes a row in one observable step.
    ///
    /// At most one caller obtains the payload for a given id; every other
    /// caller fails with [`EngineError::RecordMissing`]. That failure is a
    /// designed outcome of same-trigger consumer races, not an anomaly.
    async fn fetch_and_remove(&self, id: i64) -> Result<JsonValue, EngineError>;
}
