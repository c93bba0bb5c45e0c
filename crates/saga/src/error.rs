//! Saga error types.

use common::OrderId;
use domain::{DomainError, OrderError, OrderStatus};
use outbox::OutboxError;
use thiserror::Error;

/// Errors that can occur in the order service.
#[derive(Debug, Error)]
pub enum SagaError {
    /// An order referenced by a command or an inbound event does not exist.
    #[error("Unknown order: {0}")]
    UnknownOrder(OrderId),

    /// A command does not apply to the order's current status.
    #[error("Cannot {action} an order in status {status}")]
    InvalidTransition {
        status: OrderStatus,
        action: &'static str,
    },

    /// Concurrent writers kept moving the order; gave up re-deciding.
    #[error("Order {0} is under contention")]
    Contention(OrderId),

    /// The order was rejected at placement.
    #[error("Invalid order: {0}")]
    InvalidOrder(#[from] OrderError),

    /// Outbox or idempotency store error.
    #[error("Outbox error: {0}")]
    Outbox(#[from] OutboxError),

    /// Database error.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A stored value could not be decoded.
    #[error("Domain error: {0}")]
    Domain(#[from] DomainError),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl SagaError {
    /// Returns true for errors that retrying the same message cannot fix.
    pub fn is_invariant_violation(&self) -> bool {
        matches!(self, SagaError::UnknownOrder(_))
    }
}

/// Convenience type alias for saga results.
pub type Result<T> = std::result::Result<T, SagaError>;
