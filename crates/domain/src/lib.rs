//! Pure domain layer for order fulfillment.
//!
//! This crate provides:
//! - `Order` and its `OrderStatus` lifecycle
//! - the saga reducer [`decide`], a pure `(order, input) -> decision` function
//! - stock and courier entities, including great-circle courier ranking
//! - the message contracts exchanged between services
//!
//! Nothing in here performs I/O.

pub mod courier;
pub mod error;
pub mod messages;
pub mod order;
pub mod stock;

pub use courier::{Candidate, Courier, CourierStatus, rank_candidates};
pub use error::DomainError;
pub use order::{
    Decision, Emission, Order, OrderError, OrderItem, OrderStatus, Party, SagaInput, decide,
    merge_lines,
};
pub use stock::{Product, ReservationFailure, ReservationState, ReserveOne};
