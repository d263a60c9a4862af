//! Local event bus - in-process fan-out of channel notifications.
//!
//! The bus turns incoming transport notifications into ordinary in-process
//! event deliveries, one event name per trigger name. It does not interpret
//! payload contents; it only routes by name and invokes every registered
//! listener sequentially, in registration order. Listener faults are isolated
//! at the bus boundary: a failing listener never prevents the remaining
//! listeners on the same event from running.
//!
//! The bus also owns the trigger-name refcount against the notification
//! channel: the first listener on a trigger starts the transport-level
//! listen, removal of the last one stops it.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::ports::{Notification, NotificationChannel};

/// Default cap on per-trigger listener count.
///
/// Purely an early-warning guard against leaked sessions, not a limit:
/// exceeding it logs a warning and registration still succeeds.
pub const DEFAULT_MAX_LISTENERS: usize = 15;

/// An event dispatched to bus listeners.
#[derive(Debug, Clone)]
pub enum BusEvent {
    /// A notification arrived from the transport. The payload is the short
    /// string form of an outbox row id, not the staged payload itself.
    Notify(Notification),

    /// The transport failed; fanned out so every consumer learns about it.
    Error(EngineError),
}

/// Listener registered on the bus for one trigger name.
#[async_trait]
pub trait BusListener: Send + Sync {
    /// Processes one event. Runs to completion before the next listener on
    /// the same event is invoked.
    async fn on_event(&self, event: BusEvent) -> Result<(), EngineError>;

    /// Listener name for log labels.
    fn name(&self) -> &'static str;
}

/// Opaque handle issued at registration time.
///
/// Removal goes through the handle rather than listener reference equality,
/// so two registrations of the same listener are independently removable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerHandle {
    trigger: String,
    id: u64,
}

impl ListenerHandle {
    /// The trigger this handle is registered under.
    pub fn trigger(&self) -> &str {
        &self.trigger
    }
}

struct Registered {
    id: u64,
    listener: Arc<dyn BusListener>,
}

#[derive(Default)]
struct BusInner {
    /// Trigger name -> listeners in registration order.
    listeners: HashMap<String, Vec<Registered>>,

    /// Trigger names currently listened on at the transport level.
    active: HashSet<String>,
}

/// In-process fan-out bus wrapping the notification channel's subscription
/// primitive.
pub struct LocalEventBus {
    channel: Arc<dyn NotificationChannel>,
    inner: Mutex<BusInner>,
    max_listeners: AtomicUsize,
    next_listener_id: AtomicU64,
}

impl LocalEventBus {
    /// Creates a bus over the given channel with the default listener cap.
    pub fn new(channel: Arc<dyn NotificationChannel>) -> Self {
        Self::with_max_listeners(channel, DEFAULT_MAX_LISTENERS)
    }

    /// Creates a bus with a custom listener cap.
    pub fn with_max_listeners(channel: Arc<dyn NotificationChannel>, max_listeners: usize) -> Self {
        Self {
            channel,
            inner: Mutex::new(BusInner::default()),
            max_listeners: AtomicUsize::new(max_listeners),
            next_listener_id: AtomicU64::new(0),
        }
    }

    /// Adjusts the per-trigger listener warning threshold.
    pub fn set_max_listeners(&self, max_listeners: usize) {
        self.max_listeners.store(max_listeners, Ordering::Relaxed);
    }

    /// Registers a listener for a trigger and returns its removal handle.
    ///
    /// The first listener on a trigger starts the transport-level listen for
    /// that name; registration is rolled back if that fails.
    pub async fn add_listener(
        &self,
        trigger: &str,
        listener: Arc<dyn BusListener>,
    ) -> Result<ListenerHandle, EngineError> {
        let id = self.next_listener_id.fetch_add(1, Ordering::Relaxed);
        let needs_listen = {
            let mut inner = self.inner.lock().await;
            let entries = inner.listeners.entry(trigger.to_string()).or_default();
            entries.push(Registered {
                id,
                listener,
            });
            let count = entries.len();
            let max = self.max_listeners.load(Ordering::Relaxed);
            if count > max {
                warn!(
                    trigger,
                    count, max, "listener count exceeds max_listeners; possible leaked sessions"
                );
            }
            !inner.active.contains(trigger)
        };

        if needs_listen {
            // Not held across the await: the dispatch task calls emit() and
            // must be able to take the lock while a listen is in flight.
            if let Err(error) = self.channel.listen(trigger).await {
                self.forget(trigger, id).await;
                return Err(error);
            }
            self.inner.lock().await.active.insert(trigger.to_string());
        }

        Ok(ListenerHandle {
            trigger: trigger.to_string(),
            id,
        })
    }

    /// Removes a previously registered listener. Idempotent: removing an
    /// already-removed handle is a no-op.
    ///
    /// Removing the last listener on a trigger stops the transport-level
    /// listen for that name.
    pub async fn remove_listener(&self, handle: &ListenerHandle) -> Result<(), EngineError> {
        let unlisten = {
            let mut inner = self.inner.lock().await;
            let Some(entries) = inner.listeners.get_mut(&handle.trigger) else {
                return Ok(());
            };
            let before = entries.len();
            entries.retain(|r| r.id != handle.id);
            if entries.len() == before {
                return Ok(());
            }
            if entries.is_empty() {
                inner.listeners.remove(&handle.trigger);
                inner.active.remove(&handle.trigger)
            } else {
                false
            }
        };

        if unlisten {
            self.channel.unlisten(&handle.trigger).await?;
        }
        Ok(())
    }

    /// Dispatches an event to every listener of the trigger, in registration
    /// order. A failing listener is logged and skipped, never allowed to
    /// block the rest.
    pub async fn emit(&self, trigger: &str, event: BusEvent) {
        let snapshot: Vec<Arc<dyn BusListener>> = {
            let inner = self.inner.lock().await;
            inner
                .listeners
                .get(trigger)
                .map(|entries| entries.iter().map(|r| Arc::clone(&r.listener)).collect())
                .unwrap_or_default()
        };

        if snapshot.is_empty() {
            debug!(trigger, "notification with no local listeners");
            return;
        }

        for listener in snapshot {
            if let Err(error) = listener.on_event(event.clone()).await {
                warn!(
                    trigger,
                    listener = listener.name(),
                    %error,
                    "bus listener failed; continuing with remaining listeners"
                );
            }
        }
    }

    /// Fans a transport failure out to every listener on every trigger.
    pub async fn broadcast_error(&self, error: EngineError) {
        let triggers: Vec<String> = {
            let inner = self.inner.lock().await;
            inner.listeners.keys().cloned().collect()
        };
        for trigger in triggers {
            self.emit(&trigger, BusEvent::Error(error.clone())).await;
        }
    }

    /// Number of listeners currently registered for a trigger.
    pub async fn listener_count(&self, trigger: &str) -> usize {
        let inner = self.inner.lock().await;
        inner.listeners.get(trigger).map_or(0, Vec::len)
    }

    async fn forget(&self, trigger: &str, id: u64) {
        let mut inner = self.inner.lock().await;
        if let Some(entries) = inner.listeners.get_mut(trigger) {
            entries.retain(|r| r.id != id);
            if entries.is_empty() {
                inner.listeners.remove(trigger);
            }
        }
    }
}
