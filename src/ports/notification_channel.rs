//! NotificationChannel port - Interface for the external broadcast primitive.
//!
//! Publishing a short string on a named channel wakes every process currently
//! listening on that channel name. The payload must stay within the
//! transport's short-message limit; that limit is the entire reason payloads
//! are staged out of band in the outbox.

use async_trait::async_trait;

use crate::error::EngineError;

/// A notification as it arrives from the transport.
///
/// Channel name equals trigger name; the payload is the decimal string form
/// of an outbox row id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    /// The channel the notification arrived on.
    pub channel: String,

    /// The short string payload.
    pub payload: String,
}

/// Port for the process-external notification channel.
///
/// Implementations multiplex one physical listening connection across many
/// channel names; `listen`/`unlisten` adjust that set at runtime.
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    /// Broadcasts a short payload on the named channel.
    async fn notify(&self, channel: &str, payload: &str) -> Result<(), EngineError>;

    /// Starts receiving notifications for the named channel.
    async fn listen(&self, channel: &str) -> Result<(), EngineError>;

    /// Stops receiving notifications for the named channel.
    async fn unlisten(&self, channel: &str) -> Result<(), EngineError>;

    /// Releases transport resources. Default is a no-op for adapters with
    /// nothing to tear down.
    async fn close(&self) -> Result<(), EngineError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Compile-time check that the trait is object-safe
    #[allow(dead_code)]
    fn assert_object_safe(_: &dyn NotificationChannel) {}

    #[allow(dead_code)]
    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn notification_channel_is_send_sync() {
        fn check<T: NotificationChannel>() {
            assert_send_sync::<T>();
        }
    }
}
