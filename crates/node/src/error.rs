//! Startup and wiring failures of the node binary.

use thiserror::Error;

use crate::config::ConfigError;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("order schema setup failed: {0}")]
    Saga(#[from] saga::SagaError),

    #[error("inventory schema setup failed: {0}")]
    Inventory(#[from] inventory::InventoryError),

    #[error("courier schema setup failed: {0}")]
    Courier(#[from] courier::CourierError),

    #[error("metrics recorder: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),

    #[error("tracing subscriber: {0}")]
    Tracing(#[from] tracing_subscriber::util::TryInitError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
