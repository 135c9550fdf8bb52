//! Tenant-scoped durable event bus for Switchboard.
//!
//! Events are published to logical streams that are physically prefixed with
//! the bus's tenant (`{tenant}:{stream}`). Consumers read through consumer
//! groups with at-least-once delivery; failed messages are retried with
//! exponential backoff and finally isolated in a dead-letter stream
//! (`{tenant}:{stream}:dlq`) from which they can be replayed.
//!
//! # Main types
//!
//! - [`Event`]: immutable cross-worker record, flattened by [`codec`] for transport.
//! - [`EventBus`]: publish / subscribe / acknowledge / reclaim / retry / DLQ.
//! - [`StreamTransport`]: the durable log interface, with
//!   [`InMemoryStreamTransport`] and the journaling [`FileStreamTransport`].
//! - [`BusConsumer`]: a polling loop driving an [`EventHandler`].

/// The tenant-bound [`EventBus`].
pub mod bus;
/// Event to transport-field encoding.
pub mod codec;
/// Polling consumers.
pub mod consumer;
/// The event envelope.
pub mod event;
/// JSONL-journaled transport.
pub mod file;
/// Stream transport trait and the in-memory log.
pub mod transport;

pub use bus::{DeadLetter, Delivery, EventBus, FailureOutcome};
pub use codec::Fields;
pub use consumer::{BusConsumer, ConsumerStats, EventHandler};
pub use event::{Event, EventKind, PayloadRef, Priority, SCHEMA_VERSION};
pub use file::FileStreamTransport;
pub use transport::{InMemoryStreamTransport, PendingEntry, StreamEntry, StreamId, StreamTransport};
