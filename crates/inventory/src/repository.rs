//! Stock persistence seam.

use async_trait::async_trait;
use common::{OrderId, ProductId};
use domain::messages::StockReservationRequested;
use domain::{OrderItem, Product, ReservationFailure, ReservationState, ReserveOne};
use outbox::EventKey;

use crate::Result;

/// Stock held (or formerly held) for one order attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StockReservation {
    pub order_id: OrderId,
    pub attempt: u32,
    pub lines: Vec<OrderItem>,
    pub state: ReservationState,
}

/// Result of a batched reservation for one order attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReservationOutcome {
    /// Every line was decremented and `stock.reserved` was enqueued.
    Reserved { lines: Vec<OrderItem> },
    /// Nothing was decremented and `stock.reservation.failed` was enqueued.
    Refused(ReservationFailure),
    /// The attempt was already handled.
    Duplicate,
}

/// Result of giving an attempt's stock back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The ledger quantities were added back.
    Restored { lines: Vec<OrderItem> },
    /// No reserved ledger row exists for the attempt; nothing was written.
    NothingHeld,
    /// The restoration was already claimed.
    Duplicate,
}

/// Persistence for products, the reservation ledger, and the inventory
/// service's outbox.
///
/// Each method that acts on a message runs as one transaction: the
/// idempotency claim, the stock writes, the ledger and the reply row commit
/// or roll back together.
#[async_trait]
pub trait StockRepository: Send + Sync {
    /// Creates or overwrites a product.
    async fn upsert_product(&self, product: &Product) -> Result<()>;

    async fn product(&self, id: &ProductId) -> Result<Option<Product>>;

    /// One conditional decrement: applied only if enough is available at
    /// the moment of the write.
    async fn reserve(&self, id: &ProductId, quantity: u32) -> Result<ReserveOne>;

    /// Reserves every line of `request` or none of them, records the
    /// ledger, and enqueues the matching reply.
    async fn reserve_for_order(
        &self,
        key: &EventKey,
        request: &StockReservationRequested,
    ) -> Result<ReservationOutcome>;

    /// Restores exactly what the ledger holds for the attempt and flips the
    /// ledger to released.
    async fn release_for_order(
        &self,
        key: &EventKey,
        order_id: OrderId,
        attempt: u32,
    ) -> Result<ReleaseOutcome>;

    async fn reservation(&self, order_id: OrderId, attempt: u32)
    -> Result<Option<StockReservation>>;
}
