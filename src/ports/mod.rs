//! Ports - Interfaces for external collaborators.
//!
//! Following hexagonal architecture, ports define the contracts between the
//! delivery pipeline and the outside world. Adapters implement these ports.
//!
//! - `OutboxStore` - Durable staging of payloads too large for the
//!   notification transport
//! - `NotificationChannel` - Process-external short-message broadcast
//! - `PubSubEngine` - The capability set consumers program against

mod notification_channel;
mod outbox_store;
mod pubsub;

pub use notification_channel::{Notification, NotificationChannel};
pub use outbox_store::{OutboxRecord, OutboxStore};
pub use pubsub::{Delivery, MessageHandler, PubSubEngine, SubscriberCallback};
