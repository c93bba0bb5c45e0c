//! Inventory error types.

use common::ProductId;
use domain::DomainError;
use outbox::OutboxError;
use thiserror::Error;

/// Errors that can occur in the inventory service.
///
/// Refused reservations are not errors; they come back as
/// [`ReservationOutcome::Refused`](crate::ReservationOutcome::Refused).
#[derive(Debug, Error)]
pub enum InventoryError {
    /// The product does not exist.
    #[error("Unknown product: {0}")]
    UnknownProduct(ProductId),

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

/// Convenience type alias for inventory results.
pub type Result<T> = std::result::Result<T, InventoryError>;
