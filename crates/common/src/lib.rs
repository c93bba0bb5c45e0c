//! Shared identifiers and value types.
//!
//! Everything in here crosses a service boundary, either in a message
//! payload or as a primary key, so all types serialize transparently.

pub mod geo;
pub mod types;

pub use geo::{Address, GeoPoint};
pub use types::{ConcurrencyToken, CourierId, OrderId, ProductId, StoreId, UserId};
