use thiserror::Error;

use crate::transport::TransportError;

/// Errors raised by the outbox, its publisher and the idempotency guard.
#[derive(Debug, Error)]
pub enum OutboxError {
    /// A database error occurred.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A payload could not be serialized or deserialized.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The message transport refused or failed a send.
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Result type for outbox operations.
pub type Result<T> = std::result::Result<T, OutboxError>;
