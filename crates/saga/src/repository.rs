//! Order persistence seam.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{ConcurrencyToken, OrderId};
use domain::{Order, OrderStatus};
use outbox::{EventKey, OutboxRecord};

use crate::Result;

/// Result of a conditional order write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveOutcome {
    Saved,
    /// The stored token moved since the order was read; nothing was written.
    Conflict,
    /// The claim key was already taken; nothing was written.
    Duplicate,
}

/// Persistence for orders and the order service's outbox.
#[async_trait]
pub trait OrderRepository: Send + Sync {
    /// Stores a new order.
    async fn insert(&self, order: &Order) -> Result<()>;

    async fn get(&self, id: OrderId) -> Result<Option<Order>>;

    /// Overwrites the order with `next` if its stored token still equals
    /// `expected`, enqueueing `outbox` and claiming `claim` in the same
    /// transaction.
    async fn save(
        &self,
        next: &Order,
        expected: ConcurrencyToken,
        claim: Option<&EventKey>,
        outbox: &[OutboxRecord],
    ) -> Result<SaveOutcome>;

    /// Returns whether `key` was already claimed. Takes no claim.
    async fn is_claimed(&self, key: &EventKey) -> Result<bool>;

    /// Orders in one of `statuses` whose last write is older than
    /// `updated_before`, oldest first.
    async fn find_stalled(
        &self,
        statuses: &[OrderStatus],
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Order>>;
}
