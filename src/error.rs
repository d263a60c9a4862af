//! Error types for the delivery pipeline.

use thiserror::Error;

/// Errors surfaced by the pub/sub engine and its collaborators.
///
/// Variants are `Clone` because a single transport failure is fanned out to
/// every registered listener and every open stream session.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EngineError {
    /// Staging a payload in the outbox failed. Publish aborts and no
    /// notification is sent.
    #[error("failed to stage payload for trigger '{trigger}': {reason}")]
    StoreWrite { trigger: String, reason: String },

    /// Reading an outbox row failed for a reason other than the row being
    /// gone (connectivity, malformed data).
    #[error("failed to read outbox row {id}: {reason}")]
    StoreRead { id: i64, reason: String },

    /// No outbox row exists for the given id: already consumed by another
    /// session, or never written. A designed failure path, absorbed as a
    /// dropped event on the consumer side.
    #[error("outbox row {id} not found")]
    RecordMissing { id: i64 },

    /// `unsubscribe` was given an id that is not in the registry.
    #[error("unknown subscription id {id}")]
    UnknownSubscription { id: u64 },

    /// The channel send failed after a successful outbox write. The payload
    /// is durably stored but never delivered (orphaned row).
    #[error("failed to notify channel '{channel}': {reason}")]
    NotifyDelivery { channel: String, reason: String },

    /// Idempotent schema creation failed.
    #[error("failed to ensure outbox schema: {0}")]
    Schema(String),

    /// The notification transport failed: connection lost, dispatch task
    /// gone, or a listen/unlisten command could not be executed.
    #[error("notification transport failed: {0}")]
    Transport(String),

    /// Engine construction was given an invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl EngineError {
    /// Creates a store write error with source context.
    pub fn store_write(trigger: impl Into<String>, reason: impl ToString) -> Self {
        EngineError::StoreWrite {
            trigger: trigger.into(),
            reason: reason.to_string(),
        }
    }

    /// Creates a store read error with source context.
    pub fn store_read(id: i64, reason: impl ToString) -> Self {
        EngineError::StoreRead {
            id,
            reason: reason.to_string(),
        }
    }

    /// Creates a notify delivery error with source context.
    pub fn notify_delivery(channel: impl Into<String>, reason: impl ToString) -> Self {
        EngineError::NotifyDelivery {
            channel: channel.into(),
            reason: reason.to_string(),
        }
    }

    /// Creates a transport error with source context.
    pub fn transport(reason: impl ToString) -> Self {
        EngineError::Transport(reason.to_string())
    }

    /// True when the error means the row was already gone rather than a
    /// genuine read failure.
    pub fn is_record_missing(&self) -> bool {
        matches!(self, EngineError::RecordMissing { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_write_displays_trigger_and_reason() {
        let err = EngineError::store_write("orders", "connection refused");
        assert_eq!(
            format!("{}", err),
            "failed to stage payload for trigger 'orders': connection refused"
        );
    }

    #[test]
    fn record_missing_is_detectable() {
        assert!(EngineError::RecordMissing { id: 7 }.is_record_missing());
        assert!(!EngineError::transport("gone").is_record_missing());
    }

    #[test]
    fn unknown_subscription_displays_id() {
        let err = EngineError::UnknownSubscription { id: 42 };
        assert_eq!(format!("{}", err), "unknown subscription id 42");
    }
}
