//! Push-to-pull bridge - sequential consumption over bus notifications.
//!
//! Each stream is one consumer's cancellable view over the triggers it was
//! opened for. Incoming notifications are resolved to full payloads via the
//! outbox and buffered in a two-queue state machine: a queue of values
//! already pushed but not yet pulled, and a queue of pull requests waiting
//! for a value. At most one of the two queues is non-empty at any time; an
//! arriving value is handed directly to the oldest waiting puller when one
//! exists.
//!
//! Session lifecycle is `listening -> closed`, driven only by explicit
//! `close`/`fail` calls or a transport failure. There is no timeout: a
//! consumer that abandons a stream without closing it leaks one bus listener
//! per trigger, which the bus's max-listener guard exists to surface.

use futures::stream::{self, Stream};
use serde_json::Value as JsonValue;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, warn};

use crate::bus::{BusEvent, BusListener, ListenerHandle, LocalEventBus};
use crate::error::EngineError;
use crate::ports::{MessageHandler, OutboxStore};

type PullReply = Result<Option<JsonValue>, EngineError>;

/// Two-queue session state. All transitions happen under one lock.
struct Gate {
    /// Values pushed but not yet pulled. Unbounded: the bridge does not
    /// apply backpressure toward the producer side.
    values: VecDeque<JsonValue>,

    /// Pull requests waiting for a value, oldest first.
    pullers: VecDeque<oneshot::Sender<PullReply>>,

    /// Cleared exactly once, by whichever teardown path runs first.
    listening: bool,

    /// Transport failure waiting to be surfaced by the next pull, when the
    /// failure arrived while no pull was pending.
    failure: Option<EngineError>,

    /// Bus registrations to drop at teardown.
    handles: Vec<ListenerHandle>,
}

impl Gate {
    fn new() -> Self {
        Self {
            values: VecDeque::new(),
            pullers: VecDeque::new(),
            listening: true,
            failure: None,
            handles: Vec::new(),
        }
    }
}

struct StreamShared {
    bus: Arc<LocalEventBus>,
    store: Arc<dyn OutboxStore>,
    handler: MessageHandler,
    gate: Mutex<Gate>,
}

impl StreamShared {
    /// Hands a value to the oldest waiting puller, or queues it.
    async fn deliver(&self, value: JsonValue) {
        let mut gate = self.gate.lock().await;
        if !gate.listening {
            debug!("value arrived after stream close; dropping");
            return;
        }
        let mut value = value;
        while let Some(puller) = gate.pullers.pop_front() {
            match puller.send(Ok(Some(value))) {
                Ok(()) => return,
                // The puller's future was dropped; reclaim the value and
                // offer it to the next one.
                Err(Ok(Some(reclaimed))) => value = reclaimed,
                Err(_) => return,
            }
        }
        gate.values.push_back(value);
    }

    /// Tears the session down exactly once: deregisters bus listeners,
    /// resolves pending pulls, clears both queues.
    ///
    /// With `failure` set, pending pulls receive the error (or it is parked
    /// for the next pull); otherwise they resolve with a done signal.
    async fn shutdown(&self, failure: Option<EngineError>) {
        let (handles, pullers) = {
            let mut gate = self.gate.lock().await;
            if !gate.listening {
                return;
            }
            gate.listening = false;
            gate.values.clear();
            if let Some(ref error) = failure {
                if gate.pullers.is_empty() {
                    gate.failure = Some(error.clone());
                }
            }
            (
                std::mem::take(&mut gate.handles),
                std::mem::take(&mut gate.pullers),
            )
        };

        for handle in &handles {
            if let Err(error) = self.bus.remove_listener(handle).await {
                warn!(trigger = handle.trigger(), %error, "failed to deregister stream listener");
            }
        }

        let reply: PullReply = match failure {
            Some(error) => Err(error),
            None => Ok(None),
        };
        for puller in pullers {
            let _ = puller.send(reply.clone());
        }
    }
}

/// Bus listener feeding one stream session.
struct StreamListener {
    shared: Arc<StreamShared>,
}

#[async_trait::async_trait]
impl BusListener for StreamListener {
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
                match self.shared.store.fetch_and_remove(id).await {
                    Ok(payload) => {
                        let value = (self.shared.handler)(payload);
                        self.shared.deliver(value).await;
                    }
                    Err(error) if error.is_record_missing() => {
                        // Another session on the same trigger won the race
                        // for this row. Nothing left to deliver here.
                        debug!(id, "outbox row already consumed; dropping event");
                    }
                    Err(error) => {
                        warn!(id, %error, "failed to load outbox row; dropping event");
                    }
                }
                Ok(())
            }
            BusEvent::Error(error) => {
                self.shared.shutdown(Some(error)).await;
                Ok(())
            }
        }
    }

    fn name(&self) -> &'static str {
        "EventStream"
    }
}

/// Sequential consumption handle over a set of triggers.
///
/// # Example
///
/// ```ignore
/// let stream = engine.event_stream(&["orders"]).await?;
/// while let Some(value) = stream.next().await? {
///     process(value);
/// }
/// stream.close().await;
/// ```
pub struct EventStream {
    shared: Arc<StreamShared>,
}

impl EventStream {
    /// Registers one bus listener per trigger and returns the session.
    pub(crate) async fn open(
        bus: Arc<LocalEventBus>,
        store: Arc<dyn OutboxStore>,
        handler: MessageHandler,
        triggers: Vec<String>,
    ) -> Result<Self, EngineError> {
        let shared = Arc::new(StreamShared {
            bus,
            store,
            handler,
            gate: Mutex::new(Gate::new()),
        });

        let mut handles = Vec::with_capacity(triggers.len());
        for trigger in &triggers {
            let listener = Arc::new(StreamListener {
                shared: Arc::clone(&shared),
            });
            match shared.bus.add_listener(trigger, listener).await {
                Ok(handle) => handles.push(handle),
                Err(error) => {
                    for handle in &handles {
                        let _ = shared.bus.remove_listener(handle).await;
                    }
                    return Err(error);
                }
            }
        }

        // A transport failure fanned out during registration may already
        // have closed the gate; those listeners must not stay behind.
        let leftover = {
            let mut gate = shared.gate.lock().await;
            if gate.listening {
                gate.handles = handles;
                Vec::new()
            } else {
                handles
            }
        };
        for handle in &leftover {
            let _ = shared.bus.remove_listener(handle).await;
        }

        Ok(Self { shared })
    }

    /// Pulls the next value.
    ///
    /// Resolves immediately when a value is queued; otherwise suspends until
    /// a value arrives or the session closes. Returns `Ok(None)` once the
    /// session is closed, and a pending transport failure exactly once
    /// before the done signal.
    pub async fn next(&self) -> Result<Option<JsonValue>, EngineError> {
        let receiver = {
            let mut gate = self.shared.gate.lock().await;
            if !gate.listening {
                return match gate.failure.take() {
                    Some(error) => Err(error),
                    None => Ok(None),
                };
            }
            if let Some(value) = gate.values.pop_front() {
                return Ok(Some(value));
            }
            let (sender, receiver) = oneshot::channel();
            gate.pullers.push_back(sender);
            receiver
        };

        match receiver.await {
            Ok(reply) => reply,
            // Session state dropped without resolving: treat as closed.
            Err(_) => Ok(None),
        }
    }

    /// Closes the session. Idempotent: repeated calls are no-ops, and every
    /// pull issued after close resolves with the done signal.
    pub async fn close(&self) {
        self.shared.shutdown(None).await;
    }

    /// Closes the session and hands the error back for propagation, so the
    /// caller can terminate its own consumer with a failure instead of a
    /// normal completion. Pending pulls still resolve with the done signal.
    pub async fn fail(&self, error: EngineError) -> Result<(), EngineError> {
        self.shared.shutdown(None).await;
        Err(error)
    }

    /// Adapts the session to a standard `futures` stream. The stream ends
    /// after the done signal; a transport failure is yielded as one `Err`
    /// item before the end.
    pub fn into_stream(self) -> impl Stream<Item = Result<JsonValue, EngineError>> {
        stream::unfold(self, |session| async move {
            match session.next().await {
                Ok(Some(value)) => Some((Ok(value), session)),
                Ok(None) => None,
                Err(error) => Some((Err(error), session)),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::{InMemoryNotifyChannel, InMemoryOutboxStore};
    use crate::ports::NotificationChannel;
    use futures::StreamExt;
    use proptest::prelude::*;
    use serde_json::json;
    use std::time::Duration;

    fn identity_handler() -> MessageHandler {
        Arc::new(|value| value)
    }

    struct Fixture {
        bus: Arc<LocalEventBus>,
        store: Arc<InMemoryOutboxStore>,
        channel: Arc<InMemoryNotifyChannel>,
    }

    fn fixture() -> Fixture {
        let channel = Arc::new(InMemoryNotifyChannel::new());
        let bus = Arc::new(LocalEventBus::new(channel.clone()));
        channel.bind(&bus);
        Fixture {
            bus,
            store: Arc::new(InMemoryOutboxStore::new()),
            channel,
        }
    }

    async fn open_stream(fx: &Fixture, triggers: &[&str]) -> EventStream {
        EventStream::open(
            fx.bus.clone(),
            fx.store.clone(),
            identity_handler(),
            triggers.iter().map(|t| t.to_string()).collect(),
        )
        .await
        .unwrap()
    }

    /// Stages a payload and pushes its id through the loopback channel.
    async fn publish(fx: &Fixture, trigger: &str, payload: JsonValue) {
        let id = fx.store.insert(trigger, &payload).await.unwrap();
        fx.channel.notify(trigger, &id.to_string()).await.unwrap();
    }

    #[tokio::test]
    async fn value_before_pull_is_buffered() {
        let fx = fixture();
        let stream = open_stream(&fx, &["orders"]).await;

        publish(&fx, "orders", json!({"a": 1})).await;

        assert_eq!(stream.next().await.unwrap(), Some(json!({"a": 1})));
    }

    #[tokio::test]
    async fn pull_before_value_is_resolved_on_arrival() {
        let fx = fixture();
        let stream = Arc::new(open_stream(&fx, &["orders"]).await);

        let puller = {
            let stream = stream.clone();
            tokio::spawn(async move { stream.next().await })
        };
        // Let the pull enqueue before the value arrives.
        tokio::time::sleep(Duration::from_millis(10)).await;

        publish(&fx, "orders", json!({"a": 1})).await;

        assert_eq!(puller.await.unwrap().unwrap(), Some(json!({"a": 1})));
    }

    #[tokio::test]
    async fn values_come_out_in_notification_order() {
        let fx = fixture();
        let stream = open_stream(&fx, &["orders"]).await;

        for i in 0..5 {
            publish(&fx, "orders", json!({"seq": i})).await;
        }

        for i in 0..5 {
            assert_eq!(stream.next().await.unwrap(), Some(json!({"seq": i})));
        }
    }

    #[tokio::test]
    async fn handler_is_applied_to_fetched_payload() {
        let fx = fixture();
        let handler: MessageHandler = Arc::new(|value| json!({ "wrapped": value }));
        let stream = EventStream::open(
            fx.bus.clone(),
            fx.store.clone(),
            handler,
            vec!["orders".to_string()],
        )
        .await
        .unwrap();

        publish(&fx, "orders", json!(1)).await;

        assert_eq!(
            stream.next().await.unwrap(),
            Some(json!({"wrapped": 1}))
        );
    }

    #[tokio::test]
    async fn close_is_idempotent_and_drains_pullers() {
        let fx = fixture();
        let stream = Arc::new(open_stream(&fx, &["orders"]).await);

        let pending = {
            let stream = stream.clone();
            tokio::spawn(async move { stream.next().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        stream.close().await;
        stream.close().await;

        assert_eq!(pending.await.unwrap().unwrap(), None);
        assert_eq!(stream.next().await.unwrap(), None);
        assert_eq!(fx.bus.listener_count("orders").await, 0);
    }

    #[tokio::test]
    async fn next_after_close_never_reregisters() {
        let fx = fixture();
        let stream = open_stream(&fx, &["orders"]).await;

        stream.close().await;
        assert_eq!(stream.next().await.unwrap(), None);
        assert_eq!(fx.bus.listener_count("orders").await, 0);

        // A payload published after close is staged but never delivered.
        publish(&fx, "orders", json!({"a": 1})).await;
        assert_eq!(stream.next().await.unwrap(), None);
        assert_eq!(fx.store.row_count().await, 1);
    }

    #[tokio::test]
    async fn fail_tears_down_and_returns_the_error() {
        let fx = fixture();
        let stream = open_stream(&fx, &["orders"]).await;

        let result = stream.fail(EngineError::transport("injected")).await;

        assert_eq!(result, Err(EngineError::transport("injected")));
        assert_eq!(stream.next().await.unwrap(), None);
        assert_eq!(fx.bus.listener_count("orders").await, 0);
    }

    #[tokio::test]
    async fn missing_row_is_dropped_and_session_stays_open() {
        let fx = fixture();
        let stream = open_stream(&fx, &["orders"]).await;

        // Notification for a row nobody staged.
        fx.channel.notify("orders", "999").await.unwrap();

        publish(&fx, "orders", json!({"a": 1})).await;
        assert_eq!(stream.next().await.unwrap(), Some(json!({"a": 1})));
    }

    #[tokio::test]
    async fn fetch_failure_is_dropped_and_session_stays_open() {
        let fx = fixture();
        let stream = open_stream(&fx, &["orders"]).await;

        fx.store.fail_reads(true);
        publish(&fx, "orders", json!({"lost": true})).await;
        fx.store.fail_reads(false);

        publish(&fx, "orders", json!({"a": 1})).await;
        assert_eq!(stream.next().await.unwrap(), Some(json!({"a": 1})));
    }

    #[tokio::test]
    async fn transport_error_surfaces_once_then_done() {
        let fx = fixture();
        let stream = open_stream(&fx, &["orders"]).await;

        fx.bus
            .broadcast_error(EngineError::transport("connection lost"))
            .await;

        assert_eq!(
            stream.next().await,
            Err(EngineError::transport("connection lost"))
        );
        assert_eq!(stream.next().await.unwrap(), None);
    }

    #[tokio::test]
    async fn concurrent_sessions_on_one_trigger_race_for_each_row() {
        let fx = fixture();
        let first = open_stream(&fx, &["orders"]).await;
        let second = open_stream(&fx, &["orders"]).await;

        publish(&fx, "orders", json!({"a": 1})).await;

        // The loopback channel delivers synchronously, so by now exactly one
        // session holds the value and the other observed a missing row.
        let got_first = first.next().await.unwrap();
        second.close().await;
        assert_eq!(got_first, Some(json!({"a": 1})));
        assert_eq!(fx.store.row_count().await, 0);
    }

    #[tokio::test]
    async fn multi_trigger_session_receives_from_all_triggers() {
        let fx = fixture();
        let stream = open_stream(&fx, &["orders", "invoices"]).await;

        publish(&fx, "orders", json!({"t": "o"})).await;
        publish(&fx, "invoices", json!({"t": "i"})).await;

        assert_eq!(stream.next().await.unwrap(), Some(json!({"t": "o"})));
        assert_eq!(stream.next().await.unwrap(), Some(json!({"t": "i"})));

        stream.close().await;
        assert_eq!(fx.bus.listener_count("orders").await, 0);
        assert_eq!(fx.bus.listener_count("invoices").await, 0);
    }

    #[tokio::test]
    async fn into_stream_yields_values_until_close() {
        let fx = fixture();
        let stream = open_stream(&fx, &["orders"]).await;

        publish(&fx, "orders", json!(1)).await;
        publish(&fx, "orders", json!(2)).await;
        stream.close().await;

        // close() clears the buffered values, so the adapted stream ends
        // immediately.
        let collected: Vec<_> = stream.into_stream().collect().await;
        assert!(collected.is_empty());
    }

    #[tokio::test]
    async fn into_stream_drains_before_reporting_done() {
        let fx = fixture();
        let stream = open_stream(&fx, &["orders"]).await;

        publish(&fx, "orders", json!(1)).await;

        let mut adapted = Box::pin(stream.into_stream());
        assert_eq!(adapted.next().await, Some(Ok(json!(1))));
    }

    proptest! {
        /// Whatever the interleaving of pushes and pulls: at most one of the
        /// two queues is ever non-empty, and the delivered values are exactly
        /// the oldest pushed ones, none lost, none duplicated.
        #[test]
        fn pushes_and_pulls_lose_nothing(ops in proptest::collection::vec(any::<bool>(), 1..40)) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_time()
                .build()
                .unwrap();
            rt.block_on(async move {
                let fx = fixture();
                let stream = Arc::new(open_stream(&fx, &["orders"]).await);

                let mut pushed = 0u32;
                let mut pending = Vec::new();
                for push in ops {
                    if push {
                        publish(&fx, "orders", json!(pushed)).await;
                        pushed += 1;
                    } else {
                        let stream = stream.clone();
                        pending.push(tokio::spawn(async move { stream.next().await }));
                        tokio::task::yield_now().await;
                    }
                    let gate = stream.shared.gate.lock().await;
                    prop_assert!(gate.values.is_empty() || gate.pullers.is_empty());
                    drop(gate);
                }

                stream.close().await;
                let mut received = Vec::new();
                for task in pending {
                    if let Some(value) = task.await.unwrap().unwrap() {
                        received.push(value.as_u64().unwrap() as u32);
                    }
                }
                received.sort_unstable();
                let expected: Vec<u32> = (0..received.len() as u32).collect();
                prop_assert_eq!(received, expected);
                Ok(())
            })?;
        }
    }
}
