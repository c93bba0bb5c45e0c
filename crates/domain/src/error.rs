//! Domain error types.

use thiserror::Error;

/// Errors raised when decoding stored domain values.
#[derive(Debug, Error)]
pub enum DomainError {
    /// A persisted order status is not one we know.
    #[error("Unknown order status: {0}")]
    UnknownOrderStatus(String),

    /// A persisted courier status is not one we know.
    #[error("Unknown courier status: {0}")]
    UnknownCourierStatus(String),

    /// A persisted reservation state is not one we know.
    #[error("Unknown reservation state: {0}")]
    UnknownReservationState(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
