//! In-memory order repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{ConcurrencyToken, OrderId};
use domain::{Order, OrderStatus};
use outbox::{EventKey, InMemoryDatabase, Journaled, OutboxRecord, Table};

use crate::Result;
use crate::repository::{OrderRepository, SaveOutcome};

/// Business tables of the order service.
#[derive(Debug, Clone, Default)]
pub struct OrderTables {
    orders: Table<OrderId, Order>,
}

impl Journaled for OrderTables {
    fn rollback(&mut self) {
        self.orders.rollback();
    }

    fn commit(&mut self) {
        self.orders.commit();
    }
}

/// Order repository over an [`InMemoryDatabase`].
#[derive(Debug, Clone, Default)]
pub struct InMemoryOrderRepository {
    db: InMemoryDatabase<OrderTables>,
}

impl InMemoryOrderRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn database(&self) -> &InMemoryDatabase<OrderTables> {
        &self.db
    }
}

#[async_trait]
impl OrderRepository for InMemoryOrderRepository {
    async fn insert(&self, order: &Order) -> Result<()> {
        let mut tx = self.db.begin().await;
        tx.data.orders.insert(order.id, order.clone());
        tx.commit();
        Ok(())
    }

    async fn get(&self, id: OrderId) -> Result<Option<Order>> {
        Ok(self.db.read(|t| t.data.orders.get(&id).cloned()).await)
    }

    async fn save(
        &self,
        next: &Order,
        expected: ConcurrencyToken,
        claim: Option<&EventKey>,
        outbox: &[OutboxRecord],
    ) -> Result<SaveOutcome> {
        let mut tx = self.db.begin().await;
        if let Some(key) = claim {
            if !tx.processed.claim(key) {
                return Ok(SaveOutcome::Duplicate);
            }
        }

        match tx.data.orders.get_mut(&next.id) {
            Some(stored) if stored.token == expected => *stored = next.clone(),
            _ => return Ok(SaveOutcome::Conflict),
        }
        tx.outbox.enqueue_all(outbox.iter().cloned());
        tx.commit();
        Ok(SaveOutcome::Saved)
    }

    async fn is_claimed(&self, key: &EventKey) -> Result<bool> {
        Ok(self.db.read(|t| t.processed.contains(key)).await)
    }

    async fn find_stalled(
        &self,
        statuses: &[OrderStatus],
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Order>> {
        let mut stalled: Vec<Order> = self
            .db
            .read(|t| {
                t.data
                    .orders
                    .values()
                    .filter(|o| statuses.contains(&o.status) && o.updated_at < updated_before)
                    .cloned()
                    .collect()
            })
            .await;
        stalled.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then(a.id.cmp(&b.id)));
        stalled.truncate(limit);
        Ok(stalled)
    }
}
