//! Courier persistence seam.

use async_trait::async_trait;
use common::{CourierId, GeoPoint, OrderId};
use domain::{Candidate, Courier};
use outbox::{EventKey, OutboxRecord};

use crate::Result;

/// Result of trying to bind one candidate to an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssignAttempt {
    /// The courier flipped to BUSY and `courier.assigned` was enqueued.
    Assigned,
    /// The courier changed since it was ranked; nothing was written.
    Stale,
    /// The order was already handled.
    Duplicate,
}

/// Result of freeing the courier bound to an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    Released { courier_id: CourierId },
    /// No matching courier is bound to the order; nothing was written.
    NotBound,
    Duplicate,
}

/// Persistence for couriers and the courier service's outbox.
#[async_trait]
pub trait CourierRepository: Send + Sync {
    /// Creates or overwrites a courier.
    async fn upsert(&self, courier: &Courier) -> Result<()>;

    async fn get(&self, id: CourierId) -> Result<Option<Courier>>;

    /// Couriers currently AVAILABLE, least recently updated first.
    async fn available(&self) -> Result<Vec<Courier>>;

    /// Records telemetry. Does not move the token: only availability
    /// changes do.
    async fn update_location(&self, id: CourierId, location: GeoPoint) -> Result<()>;

    /// Moves an idle courier between AVAILABLE and OFFLINE. Returns false if
    /// the courier is BUSY.
    async fn set_on_duty(&self, id: CourierId, on_duty: bool) -> Result<bool>;

    /// Locks the candidate's row, checks it is still AVAILABLE at the ranked
    /// token, flips it to BUSY for `order_id` and enqueues `assigned`, all
    /// in one transaction together with the claim of `key`.
    async fn try_assign(
        &self,
        key: &EventKey,
        candidate: &Candidate,
        order_id: OrderId,
        assigned: OutboxRecord,
    ) -> Result<AssignAttempt>;

    /// Claims `key` and enqueues `failed`. Returns false on a duplicate.
    async fn record_failure(&self, key: &EventKey, failed: OutboxRecord) -> Result<bool>;

    /// Frees the courier bound to `order_id` (optionally only if it is
    /// `courier_id`), claiming `key` only when something is freed.
    async fn release(
        &self,
        key: &EventKey,
        order_id: OrderId,
        courier_id: Option<CourierId>,
    ) -> Result<ReleaseOutcome>;
}
