//! In-memory adapters for testing.
//!
//! Provide synchronous, deterministic loopback delivery for unit and
//! integration tests: a notification "transport" that dispatches straight to
//! the local bus, and an outbox held in a map. Both expose failure toggles so
//! tests can simulate connectivity outages.
//!
//! These adapters are for testing only; production engines use the
//! PostgreSQL adapters.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value as JsonValue;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use tokio::sync::RwLock;

use crate::bus::{BusEvent, LocalEventBus};
use crate::error::EngineError;
use crate::ports::{Notification, NotificationChannel, OutboxRecord, OutboxStore};

/// Loopback notification channel.
///
/// `notify` dispatches synchronously to the bound bus, but only for channel
/// names currently listened on, mirroring the transport's wake-listeners
/// semantics. Tests get deterministic delivery: once `notify` returns, every
/// local listener has run.
pub struct InMemoryNotifyChannel {
    bus: OnceLock<Weak<LocalEventBus>>,
    listening: RwLock<HashSet<String>>,
    notify_count: AtomicUsize,
    fail_notify: AtomicBool,
}

impl InMemoryNotifyChannel {
    /// Creates an unbound channel. Call [`bind`](Self::bind) once the bus
    /// exists; notifications sent before binding are dropped.
    pub fn new() -> Self {
        Self {
            bus: OnceLock::new(),
            listening: RwLock::new(HashSet::new()),
            notify_count: AtomicUsize::new(0),
            fail_notify: AtomicBool::new(false),
        }
    }

    /// Connects the loopback to the bus it should dispatch into.
    pub fn bind(&self, bus: &Arc<LocalEventBus>) {
        let _ = self.bus.set(Arc::downgrade(bus));
    }

    /// Number of notifications sent so far (for test assertions).
    pub fn notify_count(&self) -> usize {
        self.notify_count.load(Ordering::SeqCst)
    }

    /// Makes subsequent `notify` calls fail.
    pub fn fail_notify(&self, fail: bool) {
        self.fail_notify.store(fail, Ordering::SeqCst);
    }
}

impl Default for InMemoryNotifyChannel {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NotificationChannel for InMemoryNotifyChannel {
    async fn notify(&self, channel: &str, payload: &str) -> Result<(), EngineError> {
        if self.fail_notify.load(Ordering::SeqCst) {
            return Err(EngineError::notify_delivery(channel, "simulated outage"));
        }
        self.notify_count.fetch_add(1, Ordering::SeqCst);

        if !self.listening.read().await.contains(channel) {
            return Ok(());
        }
        if let Some(bus) = self.bus.get().and_then(Weak::upgrade) {
            bus.emit(
                channel,
                BusEvent::Notify(Notification {
                    channel: channel.to_string(),
                    payload: payload.to_string(),
                }),
            )
            .await;
        }
        Ok(())
    }

    async fn listen(&self, channel: &str) -> Result<(), EngineError> {
        self.listening.write().await.insert(channel.to_string());
        Ok(())
    }

    async fn unlisten(&self, channel: &str) -> Result<(), EngineError> {
        self.listening.write().await.remove(channel);
        Ok(())
    }
}

/// Map-backed outbox with store-assigned monotonic ids.
pub struct InMemoryOutboxStore {
    rows: RwLock<BTreeMap<i64, OutboxRecord>>,
    next_id: AtomicI64,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
}

impl InMemoryOutboxStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            rows: RwLock::new(BTreeMap::new()),
            next_id: AtomicI64::new(0),
            fail_writes: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
        }
    }

    /// Number of staged rows (for test assertions).
    pub async fn row_count(&self) -> usize {
        self.rows.read().await.len()
    }

    /// Makes subsequent `insert` calls fail.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Makes subsequent `fetch`/`fetch_and_remove` calls fail.
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }
}

impl Default for InMemoryOutboxStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl OutboxStore for InMemoryOutboxStore {
    async fn ensure_schema(&self) -> Result<(), EngineError> {
        Ok(())
    }

    async fn insert(&self, trigger: &str, payload: &JsonValue) -> Result<i64, EngineError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(EngineError::store_write(trigger, "simulated outage"));
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.rows.write().await.insert(
            id,
            OutboxRecord {
                id,
                trigger: trigger.to_string(),
                payload: payload.clone(),
                created_at: Utc::now(),
            },
        );
        Ok(id)
    }

    async fn fetch(&self, id: i64) -> Result<OutboxRecord, EngineError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(EngineError::store_read(id, "simulated outage"));
        }
        self.rows
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(EngineError::RecordMissing { id })
    }

    async fn fetch_and_remove(&self, id: i64) -> Result<JsonValue, EngineError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(EngineError::store_read(id, "simulated outage"));
        }
        self.rows
            .write()
            .await
            .remove(&id)
            .map(|record| record.payload)
            .ok_or(EngineError::RecordMissing { id })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn insert_assigns_monotonic_ids() {
        let store = InMemoryOutboxStore::new();
        let a = store.insert("orders", &json!(1)).await.unwrap();
        let b = store.insert("orders", &json!(2)).await.unwrap();
        assert!(b > a);
    }

    #[tokio::test]
    async fn fetch_and_remove_consumes_exactly_once() {
        let store = InMemoryOutboxStore::new();
        let id = store.insert("orders", &json!({"a": 1})).await.unwrap();

        assert_eq!(store.fetch_and_remove(id).await.unwrap(), json!({"a": 1}));
        assert_eq!(
            store.fetch_and_remove(id).await,
            Err(EngineError::RecordMissing { id })
        );
    }

    #[tokio::test]
    async fn fetch_does_not_consume() {
        let store = InMemoryOutboxStore::new();
        let id = store.insert("orders", &json!({"a": 1})).await.unwrap();

        let record = store.fetch(id).await.unwrap();
        assert_eq!(record.trigger, "orders");
        assert_eq!(store.row_count().await, 1);
    }

    #[tokio::test]
    async fn notify_without_listen_is_not_delivered() {
        let channel = Arc::new(InMemoryNotifyChannel::new());
        let bus = Arc::new(LocalEventBus::new(channel.clone()));
        channel.bind(&bus);

        channel.notify("orders", "1").await.unwrap();
        assert_eq!(channel.notify_count(), 1);
    }
}
