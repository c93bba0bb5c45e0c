//! Transactional outbox and idempotent consumption.
//!
//! A service records the events produced by a state change in its own
//! outbox table, inside the same transaction as the change. The
//! [`OutboxPublisher`] relays committed rows to the [`MessageTransport`]
//! and flags them published, which yields at-least-once delivery. Consumers
//! neutralize the resulting duplicates by claiming a deterministic
//! [`EventKey`] before acting.

pub mod error;
pub mod idempotency;
pub mod memory;
pub mod postgres;
pub mod publisher;
pub mod record;
pub mod store;
pub mod transport;

pub use error::{OutboxError, Result};
pub use idempotency::{ConsumeOutcome, EventKey, IdempotencyGuard};
pub use memory::{
    InMemoryDatabase, InMemoryTransaction, Journaled, OutboxTable, ProcessedKeys, Table, Tables,
};
pub use postgres::PostgresOutbox;
pub use publisher::{OutboxPublisher, PublishReport, PublisherConfig};
pub use record::{OutboxId, OutboxRecord, OutboxRecordBuilder, RoutedMessage};
pub use store::OutboxStore;
pub use transport::{Delivery, InMemoryBroker, MessageTransport, TransportError};
