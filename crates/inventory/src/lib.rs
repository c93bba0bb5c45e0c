//! Inventory service: the stock reservation engine.
//!
//! Reservations are conditional decrements, all-or-nothing per order
//! attempt, recorded in a ledger so that compensation restores exactly what
//! was taken and nothing when nothing was.

pub mod error;
pub mod memory;
pub mod postgres;
pub mod replies;
pub mod repository;
pub mod service;

pub use error::{InventoryError, Result};
pub use memory::{InMemoryStockRepository, StockTables};
pub use postgres::PostgresStockRepository;
pub use repository::{ReleaseOutcome, ReservationOutcome, StockRepository, StockReservation};
pub use service::{StockService, reserve_key, restore_key};
