//! Pub/Sub engine over the outbox store and notification channel.
//!
//! Publish stages the payload as an outbox row, then sends only the row id
//! through the channel named after the trigger. Subscribe registers a
//! wrapper callback on the local bus; `event_stream` delegates to the
//! push-to-pull bridge. All registry state is instance-owned so multiple
//! engines coexist in one process without interference.

use serde_json::Value as JsonValue;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::adapters::postgres::{PostgresNotifyChannel, PostgresOutboxStore};
use crate::bus::{BusEvent, BusListener, ListenerHandle, LocalEventBus};
use crate::config::PubSubConfig;
use crate::engine::EventStream;
use crate::error::EngineError;
use crate::ports::{
    MessageHandler, NotificationChannel, OutboxStore, PubSubEngine, SubscriberCallback,
};

/// Engine construction options.
#[derive(Clone)]
pub struct EngineOptions {
    /// Per-trigger listener cap for the early-warning guard. Default 15.
    pub max_listeners: usize,

    /// Transformation applied to every delivered payload before it reaches
    /// a consumer. Default identity.
    pub message_handler: MessageHandler,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            max_listeners: crate::bus::DEFAULT_MAX_LISTENERS,
            message_handler: Arc::new(|message| message),
        }
    }
}

impl EngineOptions {
    /// Create options with a custom listener cap.
    pub fn with_max_listeners(mut self, max_listeners: usize) -> Self {
        self.max_listeners = max_listeners;
        self
    }

    /// Create options with a common message handler.
    pub fn with_message_handler(mut self, handler: MessageHandler) -> Self {
        self.message_handler = handler;
        self
    }
}

struct SubscriptionEntry {
    trigger: String,
    handle: ListenerHandle,
}

/// Pub/sub engine backed by an outbox store and a notification channel.
///
/// The registry of callback subscriptions and the subscription id counter
/// are owned by the instance; ids increase monotonically and are never
/// reused, so a stale id can never address a later subscription.
pub struct PostgresPubSub {
    store: Arc<dyn OutboxStore>,
    channel: Arc<dyn NotificationChannel>,
    bus: Arc<LocalEventBus>,
    message_handler: MessageHandler,
    subscriptions: Mutex<HashMap<u64, SubscriptionEntry>>,
    next_subscription_id: AtomicU64,
}

impl PostgresPubSub {
    /// Connects to PostgreSQL using the given configuration and wires the
    /// full pipeline: pool, outbox schema, notification dispatch task.
    pub async fn connect(config: &PubSubConfig) -> Result<Self, EngineError> {
        config
            .validate()
            .map_err(|e| EngineError::Config(e.to_string()))?;

        let pool = PgPoolOptions::new()
            .min_connections(config.database.min_connections)
            .max_connections(config.database.max_connections)
            .acquire_timeout(config.database.acquire_timeout())
            .idle_timeout(config.database.idle_timeout())
            .max_lifetime(config.database.max_lifetime())
            .connect(&config.database.url)
            .await
            .map_err(EngineError::transport)?;

        let options = EngineOptions::default().with_max_listeners(config.max_listeners);
        Self::with_pool(pool, options).await
    }

    /// Builds an engine over a pre-existing connection pool, reusing it
    /// instead of creating one.
    pub async fn with_pool(pool: PgPool, options: EngineOptions) -> Result<Self, EngineError> {
        let store = Arc::new(PostgresOutboxStore::new(pool.clone()));
        store.ensure_schema().await?;

        let channel = Arc::new(PostgresNotifyChannel::new(pool));
        let engine = Self::from_parts(store, channel.clone(), options);
        channel.start(Arc::downgrade(&engine.bus)).await?;
        Ok(engine)
    }

    /// Assembles an engine from already-constructed collaborators. Intended
    /// for tests and custom wiring; loopback channels must still be bound
    /// to [`bus`](Self::bus) by the caller.
    pub fn from_parts(
        store: Arc<dyn OutboxStore>,
        channel: Arc<dyn NotificationChannel>,
        options: EngineOptions,
    ) -> Self {
        let bus = Arc::new(LocalEventBus::with_max_listeners(
            channel.clone(),
            options.max_listeners,
        ));
        Self {
            store,
            channel,
            bus,
            message_handler: options.message_handler,
            subscriptions: Mutex::new(HashMap::new()),
            next_subscription_id: AtomicU64::new(0),
        }
    }

    /// The engine's local event bus.
    pub fn bus(&self) -> &Arc<LocalEventBus> {
        &self.bus
    }

    /// Releases the notification transport. Open streams terminate through
    /// the transport failure path; callback subscriptions simply stop
    /// receiving events.
    pub async fn close(&self) -> Result<(), EngineError> {
        self.channel.close().await
    }

    /// Stages the payload and notifies the trigger's channel with the row
    /// id. When staging fails no notification is sent; when notification
    /// fails the row stays behind as an orphan until external cleanup.
    pub async fn publish(&self, trigger: &str, payload: JsonValue) -> Result<(), EngineError> {
        let id = self.store.insert(trigger, &payload).await?;
        debug!(trigger, id, "payload staged");
        self.channel.notify(trigger, &id.to_string()).await
    }

    /// Registers a callback for a trigger and returns its subscription id.
    ///
    /// The id is reserved before the bus registration completes, so
    /// concurrent subscribers always receive distinct handles.
    pub async fn subscribe(
        &self,
        trigger: &str,
        on_message: SubscriberCallback,
    ) -> Result<u64, EngineError> {
        let id = self.next_subscription_id.fetch_add(1, Ordering::SeqCst) + 1;
        let listener = Arc::new(SubscriptionListener {
            store: self.store.clone(),
            handler: self.message_handler.clone(),
            on_message,
        });
        let handle = self.bus.add_listener(trigger, listener).await?;
        self.subscriptions.lock().await.insert(
            id,
            SubscriptionEntry {
                trigger: trigger.to_string(),
                handle,
            },
        );
        debug!(trigger, subscription = id, "callback subscribed");
        Ok(id)
    }

    /// Removes a subscription and deregisters its bus listener.
    pub async fn unsubscribe(&self, subscription_id: u64) -> Result<(), EngineError> {
        let entry = self
            .subscriptions
            .lock()
            .await
            .remove(&subscription_id)
            .ok_or(EngineError::UnknownSubscription {
                id: subscription_id,
            })?;
        debug!(
            trigger = %entry.trigger,
            subscription = subscription_id,
            "callback unsubscribed"
        );
        self.bus.remove_listener(&entry.handle).await
    }

    /// Opens a push-to-pull session over the given triggers.
    pub async fn event_stream(&self, triggers: &[&str]) -> Result<EventStream, EngineError> {
        EventStream::open(
            self.bus.clone(),
            self.store.clone(),
            self.message_handler.clone(),
            triggers.iter().map(|t| t.to_string()).collect(),
        )
        .await
    }
}

#[async_trait::async_trait]
impl PubSubEngine for PostgresPubSub {
    async fn publish(&self, trigger: &str, payload: JsonValue) -> Result<(), EngineError> {
        PostgresPubSub::publish(self, trigger, payload).await
    }

    async fn subscribe(
        &self,
        trigger: &str,
        on_message: SubscriberCallback,
    ) -> Result<u64, EngineError> {
        PostgresPubSub::subscribe(self, trigger, on_message).await
    }

    async fn unsubscribe(&self, subscription_id: u64) -> Result<(), EngineError> {
        PostgresPubSub::unsubscribe(self, subscription_id).await
    }

    async fn event_stream(&self, triggers: &[&str]) -> Result<EventStream, EngineError> {
        PostgresPubSub::event_stream(self, triggers).await
    }
}

/// Wrapper listener registered by `subscribe`.
///
/// Reads the staged row without consuming it, so callback subscribers keep
/// broadcast-to-many semantics and never compete with iterator sessions for
/// the row. Errors delivered on the bus are forwarded to the callback as-is.
struct SubscriptionListener {
    store: Arc<dyn OutboxStore>,
    handler: MessageHandler,
    on_message: SubscriberCallback,
}

#[async_trait::async_trait]
impl BusListener for SubscriptionListener {
    async fn on_event(&self, event: BusEvent) -> Result<(), EngineError> {
        match event {
            BusEvent::Notify(notification) => {
                let id: i64 = match notification.payload.parse() {
                    Ok(id) => id,
                    Err(_) => {
                        warn!(
                            channel = %notification.channel,
                            payload = %notification.payload,
                            "non-numeric notification payload; dropping"
                        );
                        return Ok(());
                    }
                };
                match self.store.fetch(id).await {
                    Ok(record) => (self.on_message)(Ok((self.handler)(record.payload))),
                    Err(error) if error.is_record_missing() => {
                        // An iterator session on the same trigger consumed
                        // the row first.
                        debug!(id, "outbox row already consumed; dropping event");
                    }
                    Err(error) => (self.on_message)(Err(error)),
                }
                Ok(())
            }
            BusEvent::Error(error) => {
                (self.on_message)(Err(error));
                Ok(())
            }
        }
    }

    fn name(&self) -> &'static str {
        "Subscription"
    }
}
