//! Stock reservation engine.

use common::{OrderId, ProductId};
use domain::messages::{OrderCancelled, StockReleaseRequested, StockReservationRequested};
use domain::{Product, ReserveOne};
use outbox::{ConsumeOutcome, EventKey};

use crate::Result;
use crate::repository::{ReleaseOutcome, ReservationOutcome, StockRepository};

/// Idempotency key of a reservation attempt.
pub fn reserve_key(order_id: OrderId, attempt: u32) -> EventKey {
    EventKey::new("RESERVE_STOCK", format!("{order_id}:{attempt}"))
}

/// Idempotency key of the restoration of a reservation attempt.
///
/// Shared by cancellation and explicit release so the two cannot both
/// restore the same stock.
pub fn restore_key(order_id: OrderId, attempt: u32) -> EventKey {
    EventKey::new("RESTORE_STOCK", format!("{order_id}:{attempt}"))
}

/// Consumes stock messages for the inventory service.
pub struct StockService<R: StockRepository> {
    repository: R,
}

impl<R: StockRepository> StockService<R> {
    pub fn new(repository: R) -> Self {
        Self { repository }
    }

    pub fn repository(&self) -> &R {
        &self.repository
    }

    /// Creates or overwrites a product.
    pub async fn upsert_product(&self, product: &Product) -> Result<()> {
        self.repository.upsert_product(product).await
    }

    /// One conditional decrement outside any order.
    pub async fn reserve(&self, product_id: &ProductId, quantity: u32) -> Result<ReserveOne> {
        self.repository.reserve(product_id, quantity).await
    }

    /// Handles `stock.reservation.requested`.
    #[tracing::instrument(skip(self, request), fields(order_id = %request.order_id, attempt = request.attempt))]
    pub async fn handle_reservation_request(
        &self,
        request: &StockReservationRequested,
    ) -> Result<ConsumeOutcome> {
        let key = reserve_key(request.order_id, request.attempt);
        let outcome = self.repository.reserve_for_order(&key, request).await?;

        let label = match &outcome {
            ReservationOutcome::Reserved { lines } => {
                tracing::info!(lines = lines.len(), "stock reserved");
                "reserved"
            }
            ReservationOutcome::Refused(failure) => {
                tracing::info!(
                    product_id = %failure.product_id(),
                    reason = failure.reason(),
                    "stock reservation refused"
                );
                "refused"
            }
            ReservationOutcome::Duplicate => "duplicate",
        };
        metrics::counter!("stock_reservations_total", "outcome" => label).increment(1);

        Ok(match outcome {
            ReservationOutcome::Duplicate => ConsumeOutcome::Duplicate,
            _ => ConsumeOutcome::Applied,
        })
    }

    /// Handles `order.cancelled`: gives stock back only if the order had
    /// stock deducted before it was cancelled.
    #[tracing::instrument(skip(self, msg), fields(order_id = %msg.order_id, old_status = %msg.old_status))]
    pub async fn handle_order_cancelled(&self, msg: &OrderCancelled) -> Result<ConsumeOutcome> {
        if !msg.old_status.has_deducted_stock() {
            tracing::debug!("no stock was deducted; nothing to restore");
            return Ok(ConsumeOutcome::Discarded);
        }
        self.restore(msg.order_id, msg.attempt).await
    }

    /// Handles `stock.release.requested`.
    #[tracing::instrument(skip(self, msg), fields(order_id = %msg.order_id, attempt = msg.attempt))]
    pub async fn handle_release_requested(
        &self,
        msg: &StockReleaseRequested,
    ) -> Result<ConsumeOutcome> {
        tracing::warn!(reason = %msg.reason, "releasing stock of an abandoned reservation");
        self.restore(msg.order_id, msg.attempt).await
    }

    async fn restore(&self, order_id: OrderId, attempt: u32) -> Result<ConsumeOutcome> {
        let key = restore_key(order_id, attempt);
        match self
            .repository
            .release_for_order(&key, order_id, attempt)
            .await?
        {
            ReleaseOutcome::Restored { lines } => {
                metrics::counter!("stock_restorations_total").increment(1);
                tracing::info!(lines = lines.len(), "stock restored");
                Ok(ConsumeOutcome::Applied)
            }
            ReleaseOutcome::NothingHeld => {
                tracing::debug!("no reserved stock for this attempt");
                Ok(ConsumeOutcome::Discarded)
            }
            ReleaseOutcome::Duplicate => Ok(ConsumeOutcome::Duplicate),
        }
    }
}
