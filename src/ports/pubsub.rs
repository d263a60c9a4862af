//! PubSubEngine port - The capability set consumers program against.
//!
//! Callers that feed a subscription API depend on this trait rather than on
//! a concrete engine, so the engine can be swapped for a test double.

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use std::sync::Arc;

use crate::engine::EventStream;
use crate::error::EngineError;

/// Transformation applied to every delivered payload before it reaches a
/// consumer. Default is identity.
pub type MessageHandler = Arc<dyn Fn(JsonValue) -> JsonValue + Send + Sync>;

/// What a callback subscriber receives: a handled payload, or an error
/// forwarded through the failure channel.
pub type Delivery = Result<JsonValue, EngineError>;

/// Callback registered by `subscribe`.
pub type SubscriberCallback = Arc<dyn Fn(Delivery) + Send + Sync>;

/// Port for pub/sub engines.
///
/// # Example
///
/// ```ignore
/// engine.publish("orders", json!({"a": 1})).await?;
///
/// let sub_id = engine
///     .subscribe("orders", Arc::new(|delivery| println!("{delivery:?}")))
///     .await?;
/// engine.unsubscribe(sub_id).await?;
///
/// let stream = engine.event_stream(&["orders"]).await?;
/// while let Some(value) = stream.next().await? {
///     // backpressure-aware sequential consumption
/// }
/// ```
#[async_trait]
pub trait PubSubEngine: Send + Sync {
    /// Stages the payload in the outbox, then notifies the channel named
    /// `trigger` with the new row id. No notification is sent when staging
    /// fails (no partial publish).
    async fn publish(&self, trigger: &str, payload: JsonValue) -> Result<(), EngineError>;

    /// Registers a callback for a trigger and returns a fresh subscription
    /// handle. Handles are per-engine-instance monotonic counters and are
    /// never reused, even after `unsubscribe`.
    async fn subscribe(
        &self,
        trigger: &str,
        on_message: SubscriberCallback,
    ) -> Result<u64, EngineError>;

    /// Removes a subscription. Fails with
    /// [`EngineError::UnknownSubscription`] when the id was never issued or
    /// was already unsubscribed; double-unsubscribe is a caller bug worth
    /// surfacing.
    async fn unsubscribe(&self, subscription_id: u64) -> Result<(), EngineError>;

    /// Opens a cancellable, sequential view over the given triggers. The
    /// preferred integration point for consumers that want backpressure
    /// rather than fire-and-forget callbacks.
    async fn event_stream(&self, triggers: &[&str]) -> Result<EventStream, EngineError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    // Compile-time check that the trait is object-safe
    #[allow(dead_code)]
    fn assert_object_safe(_: &dyn PubSubEngine) {}

    #[allow(dead_code)]
    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn pubsub_engine_is_send_sync() {
        fn check<T: PubSubEngine>() {
            assert_send_sync::<T>();
        }
    }
}
