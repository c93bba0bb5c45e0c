//! Order entity, lifecycle and saga reducer.

mod aggregate;
mod saga;
mod state;

pub use aggregate::{Order, OrderItem, merge_lines};
pub use saga::{AGGREGATE_TYPE, Decision, Emission, SagaInput, decide};
pub use state::{OrderStatus, Party};

use thiserror::Error;

/// Errors that can occur when placing an order.
#[derive(Debug, Error)]
pub enum OrderError {
    /// Order has no items.
    #[error("Order has no items")]
    NoItems,

    /// A line asks for nothing.
    #[error("Invalid quantity for {product_id} (must be greater than 0)")]
    InvalidQuantity { product_id: String },

    /// Merged lines for one product exceed what a line can carry.
    #[error("Total quantity for {product_id} is too large")]
    QuantityOverflow { product_id: String },
}
