//! Courier assignment engine.

use common::{CourierId, GeoPoint, OrderId};
use domain::messages::{CourierReleaseRequested, OrderCancelled, OrderPreparing, OrderStatusChanged};
use domain::{Courier, OrderStatus, rank_candidates};
use outbox::{ConsumeOutcome, EventKey};

use crate::repository::{AssignAttempt, CourierRepository, ReleaseOutcome};
use crate::{Result, replies};

/// Candidates tried per assignment before giving up.
pub const DEFAULT_MAX_CANDIDATES: usize = 5;

/// Reason carried by `courier.assignment.failed` when nobody could be bound.
pub const NO_COURIER_AVAILABLE: &str = "no courier available";

/// Idempotency key of the assignment for an order.
pub fn assign_key(order_id: OrderId) -> EventKey {
    EventKey::new("ASSIGN_COURIER", order_id)
}

/// Idempotency key of freeing the courier of an order.
pub fn release_key(order_id: OrderId) -> EventKey {
    EventKey::new("RELEASE_COURIER", order_id)
}

/// Consumes courier messages and serves courier self-service updates.
pub struct CourierService<R: CourierRepository> {
    repository: R,
    max_candidates: usize,
}

impl<R: CourierRepository> CourierService<R> {
    pub fn new(repository: R) -> Self {
        Self {
            repository,
            max_candidates: DEFAULT_MAX_CANDIDATES,
        }
    }

    pub fn with_max_candidates(mut self, max_candidates: usize) -> Self {
        self.max_candidates = max_candidates.max(1);
        self
    }

    pub fn repository(&self) -> &R {
        &self.repository
    }

    /// Registers a courier (or overwrites an existing one).
    pub async fn register(&self, courier: &Courier) -> Result<()> {
        self.repository.upsert(courier).await
    }

    pub async fn update_location(&self, id: CourierId, location: GeoPoint) -> Result<()> {
        self.repository.update_location(id, location).await
    }

    /// Goes on or off duty. Returns false while the courier is delivering.
    pub async fn set_on_duty(&self, id: CourierId, on_duty: bool) -> Result<bool> {
        self.repository.set_on_duty(id, on_duty).await
    }

    /// Handles `order.preparing`: binds the nearest available courier, or
    /// reports that none could be bound.
    #[tracing::instrument(skip(self, msg), fields(order_id = %msg.order_id))]
    pub async fn handle_order_preparing(&self, msg: &OrderPreparing) -> Result<ConsumeOutcome> {
        let key = assign_key(msg.order_id);
        let available = self.repository.available().await?;
        let ranked = rank_candidates(
            &available,
            msg.pickup_address.location.as_ref(),
            self.max_candidates,
        );

        for candidate in &ranked {
            let record = replies::assigned(msg, candidate.courier_id)?;
            match self
                .repository
                .try_assign(&key, candidate, msg.order_id, record)
                .await?
            {
                AssignAttempt::Assigned => {
                    tracing::info!(
                        courier_id = %candidate.courier_id,
                        distance_km = candidate.distance_km,
                        "courier assigned"
                    );
                    metrics::counter!("courier_assignments_total", "outcome" => "assigned")
                        .increment(1);
                    return Ok(ConsumeOutcome::Applied);
                }
                AssignAttempt::Duplicate => return Ok(ConsumeOutcome::Duplicate),
                AssignAttempt::Stale => {
                    tracing::debug!(courier_id = %candidate.courier_id, "candidate taken, trying next");
                }
            }
        }

        if !self
            .repository
            .record_failure(&key, replies::failed(msg, NO_COURIER_AVAILABLE)?)
            .await?
        {
            return Ok(ConsumeOutcome::Duplicate);
        }
        tracing::warn!(candidates = ranked.len(), "no courier could be assigned");
        metrics::counter!("courier_assignments_total", "outcome" => "failed").increment(1);
        Ok(ConsumeOutcome::Applied)
    }

    /// Handles `order.delivered`: the courier is free again.
    #[tracing::instrument(skip(self, msg), fields(order_id = %msg.order_id))]
    pub async fn handle_order_delivered(&self, msg: &OrderStatusChanged) -> Result<ConsumeOutcome> {
        if msg.new_status != OrderStatus::Delivered {
            return Ok(ConsumeOutcome::Discarded);
        }
        self.release(msg.order_id, msg.courier_id).await
    }

    /// Handles `order.cancelled`: frees the courier if one was bound.
    #[tracing::instrument(skip(self, msg), fields(order_id = %msg.order_id, old_status = %msg.old_status))]
    pub async fn handle_order_cancelled(&self, msg: &OrderCancelled) -> Result<ConsumeOutcome> {
        self.release(msg.order_id, msg.courier_id).await
    }

    /// Handles `courier.release.requested` for a confirmation the order no
    /// longer wanted.
    #[tracing::instrument(skip(self, msg), fields(order_id = %msg.order_id, courier_id = %msg.courier_id))]
    pub async fn handle_release_requested(
        &self,
        msg: &CourierReleaseRequested,
    ) -> Result<ConsumeOutcome> {
        tracing::warn!(reason = %msg.reason, "releasing courier of a rejected assignment");
        self.release(msg.order_id, Some(msg.courier_id)).await
    }

    async fn release(
        &self,
        order_id: OrderId,
        courier_id: Option<CourierId>,
    ) -> Result<ConsumeOutcome> {
        match self
            .repository
            .release(&release_key(order_id), order_id, courier_id)
            .await?
        {
            ReleaseOutcome::Released { courier_id } => {
                tracing::info!(%courier_id, "courier released");
                metrics::counter!("courier_releases_total").increment(1);
                Ok(ConsumeOutcome::Applied)
            }
            ReleaseOutcome::NotBound => {
                tracing::debug!("no courier bound to this order");
                Ok(ConsumeOutcome::Discarded)
            }
            ReleaseOutcome::Duplicate => Ok(ConsumeOutcome::Duplicate),
        }
    }
}

#[cfg(test)]
mod tests {
    use common::{Address, StoreId, UserId};
    use domain::CourierStatus;
    use domain::messages::routing;

    use super::*;
    use crate::InMemoryCourierRepository;

    fn service() -> CourierService<InMemoryCourierRepository> {
        CourierService::new(InMemoryCourierRepository::new())
    }

    fn preparing(pickup: Option<GeoPoint>) -> OrderPreparing {
        let pickup_address = match pickup {
            Some(at) => Address::at("1 Store St", at),
            None => Address::new("1 Store St"),
        };
        OrderPreparing {
            order_id: OrderId::new(),
            store_id: StoreId::new(),
            user_id: UserId::new(),
            pickup_address,
            shipping_address: Address::new("2 Home Rd"),
        }
    }

    async fn register(svc: &CourierService<InMemoryCourierRepository>, name: &str, at: GeoPoint) -> Courier {
        let courier = Courier::new(name, Some(at));
        svc.register(&courier).await.unwrap();
        courier
    }

    async fn outbox_types(svc: &CourierService<InMemoryCourierRepository>) -> Vec<String> {
        svc.repository()
            .database()
            .read(|t| {
                t.outbox
                    .records()
                    .iter()
                    .map(|r| r.event_type.clone())
                    .collect()
            })
            .await
    }

    #[test]
    fn key_formats() {
        let order_id = OrderId::new();
        assert_eq!(assign_key(order_id).as_str(), format!("ASSIGN_COURIER:{order_id}"));
        assert_eq!(release_key(order_id).as_str(), format!("RELEASE_COURIER:{order_id}"));
    }

    #[tokio::test]
    async fn assigns_the_nearest_courier() {
        let svc = service();
        let store = GeoPoint::new(40.4168, -3.7038);
        let far = register(&svc, "far", GeoPoint::new(41.3874, 2.1686)).await;
        let near = register(&svc, "near", GeoPoint::new(40.42, -3.70)).await;

        let msg = preparing(Some(store));
        assert_eq!(
            svc.handle_order_preparing(&msg).await.unwrap(),
            ConsumeOutcome::Applied
        );

        let near = svc.repository().get(near.id).await.unwrap().unwrap();
        assert_eq!(near.status, CourierStatus::Busy);
        assert_eq!(near.current_order_id, Some(msg.order_id));
        let far = svc.repository().get(far.id).await.unwrap().unwrap();
        assert_eq!(far.status, CourierStatus::Available);
        assert_eq!(outbox_types(&svc).await, vec![routing::COURIER_ASSIGNED]);
    }

    #[tokio::test]
    async fn redelivered_order_preparing_is_a_duplicate() {
        let svc = service();
        register(&svc, "a", GeoPoint::new(0.0, 0.0)).await;
        register(&svc, "b", GeoPoint::new(0.0, 0.1)).await;

        let msg = preparing(None);
        svc.handle_order_preparing(&msg).await.unwrap();
        assert_eq!(
            svc.handle_order_preparing(&msg).await.unwrap(),
            ConsumeOutcome::Duplicate
        );
        assert_eq!(svc.repository().available().await.unwrap().len(), 1);
        assert_eq!(outbox_types(&svc).await.len(), 1);
    }

    #[tokio::test]
    async fn no_courier_reports_failure_once() {
        let svc = service();
        let msg = preparing(None);

        assert_eq!(
            svc.handle_order_preparing(&msg).await.unwrap(),
            ConsumeOutcome::Applied
        );
        assert_eq!(
            svc.handle_order_preparing(&msg).await.unwrap(),
            ConsumeOutcome::Duplicate
        );
        assert_eq!(
            outbox_types(&svc).await,
            vec![routing::COURIER_ASSIGNMENT_FAILED]
        );
    }

    #[tokio::test]
    async fn concurrent_orders_never_share_a_courier() {
        let svc = std::sync::Arc::new(service());
        for i in 0..3 {
            register(&svc, &format!("c{i}"), GeoPoint::new(0.0, 0.01 * i as f64)).await;
        }

        let handles = (0..6).map(|_| {
            let svc = svc.clone();
            tokio::spawn(async move { svc.handle_order_preparing(&preparing(None)).await.unwrap() })
        });
        futures_util::future::join_all(handles).await;

        let types = outbox_types(&svc).await;
        let assigned = types.iter().filter(|t| *t == routing::COURIER_ASSIGNED).count();
        let failed = types
            .iter()
            .filter(|t| *t == routing::COURIER_ASSIGNMENT_FAILED)
            .count();
        assert_eq!(assigned, 3);
        assert_eq!(failed, 3);
        assert!(svc.repository().available().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn delivery_frees_the_courier() {
        let svc = service();
        let courier = register(&svc, "a", GeoPoint::new(0.0, 0.0)).await;
        let msg = preparing(None);
        svc.handle_order_preparing(&msg).await.unwrap();

        let delivered = OrderStatusChanged {
            order_id: msg.order_id,
            store_id: msg.store_id,
            user_id: msg.user_id,
            courier_id: Some(courier.id),
            old_status: OrderStatus::OnTheWay,
            new_status: OrderStatus::Delivered,
        };
        assert_eq!(
            svc.handle_order_delivered(&delivered).await.unwrap(),
            ConsumeOutcome::Applied
        );
        assert_eq!(
            svc.handle_order_delivered(&delivered).await.unwrap(),
            ConsumeOutcome::Discarded
        );
        let stored = svc.repository().get(courier.id).await.unwrap().unwrap();
        assert_eq!(stored.status, CourierStatus::Available);
    }

    #[tokio::test]
    async fn release_request_for_another_courier_is_ignored() {
        let svc = service();
        let courier = register(&svc, "a", GeoPoint::new(0.0, 0.0)).await;
        let msg = preparing(None);
        svc.handle_order_preparing(&msg).await.unwrap();

        let wrong = CourierReleaseRequested {
            order_id: msg.order_id,
            courier_id: CourierId::new(),
            reason: "order is CANCELLED".into(),
        };
        assert_eq!(
            svc.handle_release_requested(&wrong).await.unwrap(),
            ConsumeOutcome::Discarded
        );
        let stored = svc.repository().get(courier.id).await.unwrap().unwrap();
        assert_eq!(stored.status, CourierStatus::Busy);
    }

    #[tokio::test]
    async fn cancellation_without_courier_is_discarded() {
        let svc = service();
        let cancelled = OrderCancelled {
            order_id: OrderId::new(),
            store_id: StoreId::new(),
            user_id: UserId::new(),
            courier_id: None,
            old_status: OrderStatus::Preparing,
            attempt: 1,
            items: vec![],
            reason: "changed my mind".into(),
        };
        assert_eq!(
            svc.handle_order_cancelled(&cancelled).await.unwrap(),
            ConsumeOutcome::Discarded
        );
    }
}
