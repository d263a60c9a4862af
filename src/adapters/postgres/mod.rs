//! PostgreSQL adapters - LISTEN/NOTIFY transport and outbox persistence.
//!
//! - `PostgresOutboxStore` - staged payload rows in `pubsub_payloads`
//! - `PostgresNotifyChannel` - `pg_notify` sends plus a dispatch task that
//!   fans incoming notifications out to the local bus

mod channel;
mod outbox;

pub use channel::PostgresNotifyChannel;
pub use outbox::PostgresOutboxStore;
