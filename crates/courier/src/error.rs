//! Courier error types.

use common::CourierId;
use domain::DomainError;
use outbox::OutboxError;
use thiserror::Error;

/// Errors that can occur in the courier service.
#[derive(Debug, Error)]
pub enum CourierError {
    /// The courier does not exist.
    #[error("Unknown courier: {0}")]
    UnknownCourier(CourierId),

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

/// Convenience type alias for courier results.
pub type Result<T> = std::result::Result<T, CourierError>;
