//! In-memory courier repository.

use async_trait::async_trait;
use chrono::Utc;
use common::{CourierId, GeoPoint, OrderId};
use domain::{Candidate, Courier, CourierStatus};
use outbox::{EventKey, InMemoryDatabase, Journaled, OutboxRecord, Table};

use crate::repository::{AssignAttempt, CourierRepository, ReleaseOutcome};
use crate::{CourierError, Result};

/// Business tables of the courier service.
#[derive(Debug, Clone, Default)]
pub struct CourierTables {
    couriers: Table<CourierId, Courier>,
}

impl Journaled for CourierTables {
    fn rollback(&mut self) {
        self.couriers.rollback();
    }

    fn commit(&mut self) {
        self.couriers.commit();
    }
}

/// Courier repository over an [`InMemoryDatabase`].
///
/// The transaction lock stands in for the row lock: the read-check-write of
/// an assignment happens while no other writer can run.
#[derive(Debug, Clone, Default)]
pub struct InMemoryCourierRepository {
    db: InMemoryDatabase<CourierTables>,
}

impl InMemoryCourierRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn database(&self) -> &InMemoryDatabase<CourierTables> {
        &self.db
    }
}

#[async_trait]
impl CourierRepository for InMemoryCourierRepository {
    async fn upsert(&self, courier: &Courier) -> Result<()> {
        let mut tx = self.db.begin().await;
        tx.data.couriers.insert(courier.id, courier.clone());
        tx.commit();
        Ok(())
    }

    async fn get(&self, id: CourierId) -> Result<Option<Courier>> {
        Ok(self.db.read(|t| t.data.couriers.get(&id).cloned()).await)
    }

    async fn available(&self) -> Result<Vec<Courier>> {
        let mut couriers: Vec<Courier> = self
            .db
            .read(|t| {
                t.data
                    .couriers
                    .values()
                    .filter(|c| c.is_available())
                    .cloned()
                    .collect()
            })
            .await;
        couriers.sort_by(|a, b| a.updated_at.cmp(&b.updated_at).then(a.id.cmp(&b.id)));
        Ok(couriers)
    }

    async fn update_location(&self, id: CourierId, location: GeoPoint) -> Result<()> {
        let mut tx = self.db.begin().await;
        let courier = tx
            .data
            .couriers
            .get_mut(&id)
            .ok_or(CourierError::UnknownCourier(id))?;
        courier.location = Some(location);
        courier.updated_at = Utc::now();
        tx.commit();
        Ok(())
    }

    async fn set_on_duty(&self, id: CourierId, on_duty: bool) -> Result<bool> {
        let mut tx = self.db.begin().await;
        let courier = tx
            .data
            .couriers
            .get_mut(&id)
            .ok_or(CourierError::UnknownCourier(id))?;
        if courier.status == CourierStatus::Busy {
            return Ok(false);
        }
        courier.status = if on_duty {
            CourierStatus::Available
        } else {
            CourierStatus::Offline
        };
        courier.token = courier.token.next();
        courier.updated_at = Utc::now();
        tx.commit();
        Ok(true)
    }

    async fn try_assign(
        &self,
        key: &EventKey,
        candidate: &Candidate,
        order_id: OrderId,
        assigned: OutboxRecord,
    ) -> Result<AssignAttempt> {
        let mut tx = self.db.begin().await;
        if !tx.processed.claim(key) {
            return Ok(AssignAttempt::Duplicate);
        }

        let Some(courier) = tx.data.couriers.get_mut(&candidate.courier_id) else {
            return Ok(AssignAttempt::Stale);
        };
        if !courier.is_available() || courier.token != candidate.token {
            return Ok(AssignAttempt::Stale);
        }
        courier.status = CourierStatus::Busy;
        courier.current_order_id = Some(order_id);
        courier.token = courier.token.next();
        courier.updated_at = Utc::now();

        tx.outbox.enqueue(assigned);
        tx.commit();
        Ok(AssignAttempt::Assigned)
    }

    async fn record_failure(&self, key: &EventKey, failed: OutboxRecord) -> Result<bool> {
        let mut tx = self.db.begin().await;
        if !tx.processed.claim(key) {
            return Ok(false);
        }
        tx.outbox.enqueue(failed);
        tx.commit();
        Ok(true)
    }

    async fn release(
        &self,
        key: &EventKey,
        order_id: OrderId,
        courier_id: Option<CourierId>,
    ) -> Result<ReleaseOutcome> {
        let mut tx = self.db.begin().await;
        let bound = tx
            .data
            .couriers
            .values()
            .find(|c| {
                c.current_order_id == Some(order_id) && courier_id.is_none_or(|id| id == c.id)
            })
            .map(|c| c.id);
        let Some(bound) = bound else {
            return Ok(ReleaseOutcome::NotBound);
        };
        if !tx.processed.claim(key) {
            return Ok(ReleaseOutcome::Duplicate);
        }

        if let Some(courier) = tx.data.couriers.get_mut(&bound) {
            courier.status = CourierStatus::Available;
            courier.current_order_id = None;
            courier.token = courier.token.next();
            courier.updated_at = Utc::now();
        }
        tx.commit();
        Ok(ReleaseOutcome::Released { courier_id: bound })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> OutboxRecord {
        OutboxRecord::builder()
            .aggregate_type("Courier")
            .aggregate_id("o-1")
            .event_type("courier.assigned")
            .payload_raw(serde_json::json!({}))
            .try_build()
            .unwrap()
    }

    fn candidate(courier: &Courier) -> Candidate {
        Candidate {
            courier_id: courier.id,
            token: courier.token,
            distance_km: None,
        }
    }

    #[tokio::test]
    async fn stale_token_is_refused_and_rolls_back_the_claim() {
        let repo = InMemoryCourierRepository::new();
        let courier = Courier::new("ana", None);
        repo.upsert(&courier).await.unwrap();
        let ranked = candidate(&courier);

        // Someone moves the row after ranking.
        repo.set_on_duty(courier.id, false).await.unwrap();
        repo.set_on_duty(courier.id, true).await.unwrap();

        let key = EventKey::new("ASSIGN_COURIER", OrderId::new());
        let attempt = repo
            .try_assign(&key, &ranked, OrderId::new(), record())
            .await
            .unwrap();
        assert_eq!(attempt, AssignAttempt::Stale);
        repo.database()
            .read(|t| {
                assert!(!t.processed.contains(&key));
                assert!(t.outbox.records().is_empty());
            })
            .await;
    }

    #[tokio::test]
    async fn concurrent_assignments_flip_a_courier_once() {
        let repo = InMemoryCourierRepository::new();
        let courier = Courier::new("ana", None);
        repo.upsert(&courier).await.unwrap();
        let ranked = candidate(&courier);

        let attempts = (0..8).map(|_| {
            let repo = repo.clone();
            let order_id = OrderId::new();
            tokio::spawn(async move {
                let key = EventKey::new("ASSIGN_COURIER", order_id);
                repo.try_assign(&key, &ranked, order_id, record())
                    .await
                    .unwrap()
            })
        });
        let results = futures_util::future::join_all(attempts).await;
        let winners = results
            .into_iter()
            .filter(|r| *r.as_ref().unwrap() == AssignAttempt::Assigned)
            .count();

        assert_eq!(winners, 1);
        let stored = repo.get(courier.id).await.unwrap().unwrap();
        assert_eq!(stored.status, CourierStatus::Busy);
        assert!(repo.available().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn release_only_frees_the_courier_bound_to_the_order() {
        let repo = InMemoryCourierRepository::new();
        let courier = Courier::new("ana", None);
        repo.upsert(&courier).await.unwrap();
        let order_id = OrderId::new();
        repo.try_assign(
            &EventKey::new("ASSIGN_COURIER", order_id),
            &candidate(&courier),
            order_id,
            record(),
        )
        .await
        .unwrap();

        let key = EventKey::new("RELEASE_COURIER", order_id);
        let other = OrderId::new();
        assert_eq!(
            repo.release(&EventKey::new("RELEASE_COURIER", other), other, None)
                .await
                .unwrap(),
            ReleaseOutcome::NotBound
        );
        assert_eq!(
            repo.release(&key, order_id, Some(CourierId::new()))
                .await
                .unwrap(),
            ReleaseOutcome::NotBound
        );
        assert_eq!(
            repo.release(&key, order_id, Some(courier.id)).await.unwrap(),
            ReleaseOutcome::Released {
                courier_id: courier.id
            }
        );

        let stored = repo.get(courier.id).await.unwrap().unwrap();
        assert_eq!(stored.status, CourierStatus::Available);
        assert!(stored.current_order_id.is_none());
    }

    #[tokio::test]
    async fn busy_courier_cannot_go_offline() {
        let repo = InMemoryCourierRepository::new();
        let mut courier = Courier::new("ana", None);
        courier.status = CourierStatus::Busy;
        repo.upsert(&courier).await.unwrap();

        assert!(!repo.set_on_duty(courier.id, false).await.unwrap());
        assert!(matches!(
            repo.set_on_duty(CourierId::new(), true).await,
            Err(CourierError::UnknownCourier(_))
        ));
    }

    #[tokio::test]
    async fn location_update_keeps_token() {
        let repo = InMemoryCourierRepository::new();
        let courier = Courier::new("ana", None);
        repo.upsert(&courier).await.unwrap();

        repo.update_location(courier.id, GeoPoint::new(1.0, 2.0))
            .await
            .unwrap();
        let stored = repo.get(courier.id).await.unwrap().unwrap();
        assert_eq!(stored.location, Some(GeoPoint::new(1.0, 2.0)));
        assert_eq!(stored.token, courier.token);
    }
}
