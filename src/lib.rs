//! pgcourier - PostgreSQL LISTEN/NOTIFY pub/sub with outbox-backed payloads.
//!
//! The notification transport only carries short strings, so published
//! payloads are staged in an auxiliary table and only row ids travel through
//! the channel. Consumers receive payloads through callback subscriptions or
//! backpressure-aware event streams.

pub mod adapters;
pub mod bus;
pub mod config;
pub mod engine;
pub mod error;
pub mod ports;
