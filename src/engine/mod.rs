//! Pub/Sub engine - publish, subscribe, and iterator-based consumption.
//!
//! - `PostgresPubSub` - orchestrates the outbox-backed publish path and the
//!   subscription registry
//! - `EventStream` - the push-to-pull bridge behind `event_stream`

mod pubsub;
mod stream;

pub use pubsub::{EngineOptions, PostgresPubSub};
pub use stream::EventStream;
