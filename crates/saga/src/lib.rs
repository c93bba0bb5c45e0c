//! Order service: the order saga state machine.
//!
//! Orders move through their fulfillment saga by reacting to ingress
//! commands and to replies from the inventory and courier services. Each
//! step is a pure decision persisted with an optimistic token check and
//! published through the outbox; a reaper fails steps whose reply never
//! arrives.

pub mod error;
pub mod memory;
pub mod postgres;
pub mod reaper;
pub mod repository;
pub mod service;

pub use error::{Result, SagaError};
pub use memory::{InMemoryOrderRepository, OrderTables};
pub use postgres::PostgresOrderRepository;
pub use reaper::{ReaperConfig, SagaReaper, TIMED_OUT};
pub use repository::{OrderRepository, SaveOutcome};
pub use service::{
    DEFAULT_MAX_RETRIES, OrderSaga, courier_assigned_key, courier_assignment_failed_key,
    stock_reservation_failed_key, stock_reserved_key,
};
