//! Courier service: the courier assignment engine.
//!
//! Available couriers are ranked by great-circle distance to the pickup and
//! bound one at a time under a row lock, so a courier is never handed two
//! orders. Delivery, cancellation and explicit release requests free it.

pub mod error;
pub mod memory;
pub mod postgres;
pub mod replies;
pub mod repository;
pub mod service;

pub use error::{CourierError, Result};
pub use memory::{CourierTables, InMemoryCourierRepository};
pub use postgres::PostgresCourierRepository;
pub use repository::{AssignAttempt, CourierRepository, ReleaseOutcome};
pub use service::{
    CourierService, DEFAULT_MAX_CANDIDATES, NO_COURIER_AVAILABLE, assign_key, release_key,
};
