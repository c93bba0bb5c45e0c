//! Order saga service.
//!
//! Loads an order, runs the pure reducer, and writes the next state together
//! with the emitted messages under an optimistic token check. Commands come
//! from the ingress and report precondition failures; reply events are
//! claimed under their own keys and never fail on a stale state.

use chrono::Utc;
use common::{Address, OrderId, StoreId, UserId};
use domain::messages::{
    CourierAssigned, CourierAssignmentFailed, StockReservationFailed, StockReserved,
};
use domain::{Decision, Emission, Order, OrderItem, OrderStatus, Party, SagaInput, decide};
use outbox::{ConsumeOutcome, EventKey, OutboxRecord};

use crate::repository::{OrderRepository, SaveOutcome};
use crate::{Result, SagaError};

/// Re-decisions after a token conflict before giving up.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

pub fn stock_reserved_key(order_id: OrderId, attempt: u32) -> EventKey {
    EventKey::new("STOCK_RESERVED", format!("{order_id}:{attempt}"))
}

pub fn stock_reservation_failed_key(order_id: OrderId, attempt: u32) -> EventKey {
    EventKey::new("STOCK_RESERVATION_FAILED", format!("{order_id}:{attempt}"))
}

pub fn courier_assigned_key(order_id: OrderId) -> EventKey {
    EventKey::new("COURIER_ASSIGNED", order_id)
}

pub fn courier_assignment_failed_key(order_id: OrderId) -> EventKey {
    EventKey::new("COURIER_ASSIGNMENT_FAILED", order_id)
}

/// What happened when an input was applied.
#[derive(Debug, Clone, PartialEq)]
enum Applied {
    Advanced(Order),
    /// The input did not apply; `order` is the state it was checked against.
    Discarded {
        reason: &'static str,
        order: Order,
    },
    Duplicate,
}

impl Applied {
    fn consume_outcome(&self) -> ConsumeOutcome {
        match self {
            Applied::Advanced(_) => ConsumeOutcome::Applied,
            Applied::Discarded { .. } => ConsumeOutcome::Discarded,
            Applied::Duplicate => ConsumeOutcome::Duplicate,
        }
    }
}

/// The order service: owns orders and drives their saga.
pub struct OrderSaga<R: OrderRepository> {
    repository: R,
    max_retries: u32,
}

impl<R: OrderRepository> OrderSaga<R> {
    pub fn new(repository: R) -> Self {
        Self {
            repository,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn repository(&self) -> &R {
        &self.repository
    }

    pub async fn get(&self, id: OrderId) -> Result<Option<Order>> {
        self.repository.get(id).await
    }

    /// Creates a PENDING order.
    #[tracing::instrument(skip(self, items, pickup_address, shipping_address))]
    pub async fn place_order(
        &self,
        user_id: UserId,
        store_id: StoreId,
        items: Vec<OrderItem>,
        pickup_address: Address,
        shipping_address: Address,
    ) -> Result<Order> {
        let order = Order::place(user_id, store_id, items, pickup_address, shipping_address)?;
        self.repository.insert(&order).await?;
        metrics::counter!("orders_placed_total").increment(1);
        tracing::info!(order_id = %order.id, "order placed");
        Ok(order)
    }

    /// The store accepts the order; stock reservation is requested.
    pub async fn accept(&self, id: OrderId) -> Result<Order> {
        self.command(id, SagaInput::Accept).await
    }

    /// The store finished preparing; the order waits for a courier.
    pub async fn mark_ready(&self, id: OrderId) -> Result<Order> {
        self.command(id, SagaInput::MarkReady).await
    }

    pub async fn confirm_pickup(&self, id: OrderId) -> Result<Order> {
        self.command(id, SagaInput::PickupConfirmed).await
    }

    pub async fn confirm_delivery(&self, id: OrderId) -> Result<Order> {
        self.command(id, SagaInput::DeliveryConfirmed).await
    }

    pub async fn cancel(&self, id: OrderId, by: Party, reason: impl Into<String>) -> Result<Order> {
        let reason = reason.into();
        self.command(id, SagaInput::Cancel { by, reason }).await
    }

    /// Handles `stock.reserved`.
    #[tracing::instrument(skip(self, msg), fields(order_id = %msg.order_id, attempt = msg.attempt))]
    pub async fn handle_stock_reserved(&self, msg: &StockReserved) -> Result<ConsumeOutcome> {
        let input = SagaInput::StockReserved {
            attempt: msg.attempt,
        };
        let key = stock_reserved_key(msg.order_id, msg.attempt);
        self.event(msg.order_id, input, key).await
    }

    /// Handles `stock.reservation.failed`.
    #[tracing::instrument(skip(self, msg), fields(order_id = %msg.order_id, attempt = msg.attempt))]
    pub async fn handle_stock_reservation_failed(
        &self,
        msg: &StockReservationFailed,
    ) -> Result<ConsumeOutcome> {
        let input = SagaInput::StockReservationFailed {
            attempt: msg.attempt,
            reason: msg.reason.clone(),
        };
        let key = stock_reservation_failed_key(msg.order_id, msg.attempt);
        self.event(msg.order_id, input, key).await
    }

    /// Handles `courier.assigned`.
    #[tracing::instrument(skip(self, msg), fields(order_id = %msg.order_id, courier_id = %msg.courier_id))]
    pub async fn handle_courier_assigned(&self, msg: &CourierAssigned) -> Result<ConsumeOutcome> {
        let input = SagaInput::CourierAssigned {
            courier_id: msg.courier_id,
        };
        self.event(msg.order_id, input, courier_assigned_key(msg.order_id))
            .await
    }

    /// Handles `courier.assignment.failed`.
    #[tracing::instrument(skip(self, msg), fields(order_id = %msg.order_id))]
    pub async fn handle_courier_assignment_failed(
        &self,
        msg: &CourierAssignmentFailed,
    ) -> Result<ConsumeOutcome> {
        let input = SagaInput::CourierAssignmentFailed {
            reason: msg.reason.clone(),
        };
        self.event(msg.order_id, input, courier_assignment_failed_key(msg.order_id))
            .await
    }

    /// Treats a stalled step of `order` as if its failure reply arrived.
    /// Claims the same key the real reply would, so whichever comes second
    /// is a duplicate.
    pub(crate) async fn time_out(&self, order: &Order, reason: &str) -> Result<ConsumeOutcome> {
        let (input, key) = match order.status {
            OrderStatus::ReservingStock => (
                SagaInput::StockReservationFailed {
                    attempt: order.reservation_attempt,
                    reason: reason.to_string(),
                },
                stock_reservation_failed_key(order.id, order.reservation_attempt),
            ),
            _ => (
                SagaInput::CourierAssignmentFailed {
                    reason: reason.to_string(),
                },
                courier_assignment_failed_key(order.id),
            ),
        };
        self.event(order.id, input, key).await
    }

    async fn command(&self, id: OrderId, input: SagaInput) -> Result<Order> {
        match self.apply(id, &input, None).await? {
            Applied::Advanced(order) => Ok(order),
            Applied::Discarded { order, .. } => Err(SagaError::InvalidTransition {
                status: order.status,
                action: input.name(),
            }),
            Applied::Duplicate => Err(SagaError::Contention(id)),
        }
    }

    async fn event(&self, id: OrderId, input: SagaInput, key: EventKey) -> Result<ConsumeOutcome> {
        match self.apply(id, &input, Some(&key)).await {
            Ok(applied) => Ok(applied.consume_outcome()),
            Err(err @ SagaError::UnknownOrder(_)) => {
                tracing::error!(event_key = %key, "reply for an order that does not exist");
                Err(err)
            }
            Err(err) => Err(err),
        }
    }

    /// Load, decide, write; on a token conflict start over from a fresh read.
    async fn apply(
        &self,
        id: OrderId,
        input: &SagaInput,
        claim: Option<&EventKey>,
    ) -> Result<Applied> {
        for attempt in 0..=self.max_retries {
            let order = self
                .repository
                .get(id)
                .await?
                .ok_or(SagaError::UnknownOrder(id))?;

            let (mut next, emit, discarded) = match decide(&order, input) {
                Decision::Advance { next, emit } => (next, emit, None),
                Decision::Discard { reason, emit } if emit.is_empty() => {
                    // Nothing to write, so no claim; a key taken earlier
                    // still marks this input as a redelivery.
                    if let Some(key) = claim {
                        if self.repository.is_claimed(key).await? {
                            return Ok(Applied::Duplicate);
                        }
                    }
                    tracing::debug!(status = %order.status, input = input.name(), reason, "input discarded");
                    metrics::counter!("saga_stale_events_total", "input" => input.name())
                        .increment(1);
                    return Ok(Applied::Discarded { reason, order });
                }
                Decision::Discard { reason, emit } => (order.clone(), emit, Some(reason)),
            };

            next.token = order.token.next();
            if discarded.is_none() {
                next.updated_at = Utc::now();
            }
            let records = emit
                .iter()
                .map(Emission::to_record)
                .collect::<std::result::Result<Vec<OutboxRecord>, _>>()?;

            match self
                .repository
                .save(&next, order.token, claim, &records)
                .await?
            {
                SaveOutcome::Saved => {}
                SaveOutcome::Duplicate => return Ok(Applied::Duplicate),
                SaveOutcome::Conflict => {
                    tracing::debug!(attempt, input = input.name(), "order moved concurrently, re-deciding");
                    continue;
                }
            }

            return Ok(match discarded {
                None => {
                    tracing::info!(from = %order.status, to = %next.status, input = input.name(), "order advanced");
                    metrics::counter!(
                        "saga_transitions_total",
                        "input" => input.name(),
                        "to" => next.status.as_str()
                    )
                    .increment(1);
                    Applied::Advanced(next)
                }
                Some(reason) => {
                    for compensation in emit.iter().filter(|e| e.is_compensation()) {
                        tracing::error!(
                            status = %order.status,
                            input = input.name(),
                            compensation = compensation.routing_key(),
                            "remote effect arrived after the order moved on; compensating"
                        );
                    }
                    metrics::counter!("saga_compensations_total", "input" => input.name())
                        .increment(1);
                    Applied::Discarded { reason, order }
                }
            });
        }

        tracing::warn!(input = input.name(), "gave up after repeated token conflicts");
        Err(SagaError::Contention(id))
    }
}

#[cfg(test)]
mod tests {
    use common::CourierId;
    use domain::messages::routing;

    use super::*;
    use crate::InMemoryOrderRepository;

    type Saga = OrderSaga<InMemoryOrderRepository>;

    async fn placed(saga: &Saga) -> Order {
        saga.place_order(
            UserId::new(),
            StoreId::new(),
            vec![OrderItem::new("P1", 3)],
            Address::new("1 Store St"),
            Address::new("2 Home Rd"),
        )
        .await
        .unwrap()
    }

    async fn outbox_types(saga: &Saga) -> Vec<String> {
        saga.repository()
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

    fn reserved(order: &Order, attempt: u32) -> StockReserved {
        StockReserved {
            order_id: order.id,
            store_id: order.store_id,
            user_id: order.user_id,
            attempt,
            pickup_address: order.pickup_address.clone(),
            shipping_address: order.shipping_address.clone(),
        }
    }

    fn assigned(order: &Order, courier_id: CourierId) -> CourierAssigned {
        CourierAssigned {
            order_id: order.id,
            courier_id,
            store_id: order.store_id,
            user_id: order.user_id,
        }
    }

    /// Drives an order to PREPARING.
    async fn preparing(saga: &Saga) -> Order {
        let order = placed(saga).await;
        saga.accept(order.id).await.unwrap();
        saga.handle_stock_reserved(&reserved(&order, 1))
            .await
            .unwrap();
        saga.get(order.id).await.unwrap().unwrap()
    }

    #[test]
    fn key_formats() {
        let id = OrderId::new();
        assert_eq!(
            stock_reserved_key(id, 2).as_str(),
            format!("STOCK_RESERVED:{id}:2")
        );
        assert_eq!(
            courier_assignment_failed_key(id).as_str(),
            format!("COURIER_ASSIGNMENT_FAILED:{id}")
        );
    }

    #[tokio::test]
    async fn place_rejects_empty_orders() {
        let saga = OrderSaga::new(InMemoryOrderRepository::new());
        let result = saga
            .place_order(
                UserId::new(),
                StoreId::new(),
                vec![],
                Address::new("a"),
                Address::new("b"),
            )
            .await;
        assert!(matches!(result, Err(SagaError::InvalidOrder(_))));
    }

    #[tokio::test]
    async fn accept_bumps_token_and_enqueues_request() {
        let saga = OrderSaga::new(InMemoryOrderRepository::new());
        let order = placed(&saga).await;

        let accepted = saga.accept(order.id).await.unwrap();
        assert_eq!(accepted.status, OrderStatus::ReservingStock);
        assert_eq!(accepted.token, order.token.next());
        assert_eq!(saga.get(order.id).await.unwrap().unwrap(), accepted);
        assert_eq!(
            outbox_types(&saga).await,
            vec![routing::STOCK_RESERVATION_REQUESTED]
        );
    }

    #[tokio::test]
    async fn commands_report_invalid_transitions() {
        let saga = OrderSaga::new(InMemoryOrderRepository::new());
        let order = placed(&saga).await;

        let err = saga.confirm_pickup(order.id).await.unwrap_err();
        assert!(matches!(
            err,
            SagaError::InvalidTransition {
                status: OrderStatus::Pending,
                action: "pickup_confirmed"
            }
        ));
        assert!(matches!(
            saga.accept(OrderId::new()).await,
            Err(SagaError::UnknownOrder(_))
        ));
    }

    #[tokio::test]
    async fn redelivered_reply_is_a_duplicate() {
        let saga = OrderSaga::new(InMemoryOrderRepository::new());
        let order = preparing(&saga).await;
        assert_eq!(order.status, OrderStatus::Preparing);

        // A second copy of the same reply: the claim is already taken, the
        // reducer sees it as applied. Either way nothing is written.
        let again = saga
            .handle_stock_reserved(&reserved(&order, 1))
            .await
            .unwrap();
        assert_ne!(again, ConsumeOutcome::Applied);
        assert_eq!(
            outbox_types(&saga).await,
            vec![routing::STOCK_RESERVATION_REQUESTED, routing::ORDER_PREPARING]
        );
    }

    #[tokio::test]
    async fn stale_reply_is_discarded_without_a_claim() {
        let saga = OrderSaga::new(InMemoryOrderRepository::new());
        let order = placed(&saga).await;

        // Nothing is in flight for a PENDING order.
        let failed = StockReservationFailed {
            order_id: order.id,
            user_id: order.user_id,
            attempt: 1,
            reason: "insufficient stock".into(),
        };
        assert_eq!(
            saga.handle_stock_reservation_failed(&failed).await.unwrap(),
            ConsumeOutcome::Discarded
        );
        let key = stock_reservation_failed_key(order.id, 1);
        assert!(!saga.repository().is_claimed(&key).await.unwrap());

        // The same attempt's reply still applies once the request is out.
        saga.accept(order.id).await.unwrap();
        assert_eq!(
            saga.handle_stock_reservation_failed(&failed).await.unwrap(),
            ConsumeOutcome::Applied
        );
        assert!(saga.repository().is_claimed(&key).await.unwrap());
    }

    #[tokio::test]
    async fn insufficient_stock_reverts_to_pending() {
        let saga = OrderSaga::new(InMemoryOrderRepository::new());
        let order = placed(&saga).await;
        saga.accept(order.id).await.unwrap();

        let failed = StockReservationFailed {
            order_id: order.id,
            user_id: order.user_id,
            attempt: 1,
            reason: "insufficient stock".into(),
        };
        assert_eq!(
            saga.handle_stock_reservation_failed(&failed).await.unwrap(),
            ConsumeOutcome::Applied
        );
        assert_eq!(
            saga.handle_stock_reservation_failed(&failed).await.unwrap(),
            ConsumeOutcome::Duplicate
        );
        let stored = saga.get(order.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Pending);
        assert_eq!(
            outbox_types(&saga).await,
            vec![routing::STOCK_RESERVATION_REQUESTED, routing::ORDER_CANCELLED]
        );
    }

    #[tokio::test]
    async fn courier_failure_cancels_with_preparing() {
        let saga = OrderSaga::new(InMemoryOrderRepository::new());
        let order = preparing(&saga).await;

        let failed = CourierAssignmentFailed {
            order_id: order.id,
            user_id: order.user_id,
            store_id: order.store_id,
            reason: "no courier available".into(),
        };
        saga.handle_courier_assignment_failed(&failed).await.unwrap();

        let stored = saga.get(order.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Cancelled);
        let cancelled = saga
            .repository()
            .database()
            .read(|t| {
                t.outbox
                    .with_event_type(routing::ORDER_CANCELLED)
                    .next()
                    .cloned()
            })
            .await
            .unwrap();
        assert_eq!(cancelled.payload["oldStatus"], "PREPARING");
    }

    #[tokio::test]
    async fn late_courier_is_released_once() {
        let saga = OrderSaga::new(InMemoryOrderRepository::new());
        let order = preparing(&saga).await;
        saga.cancel(order.id, Party::User, "changed my mind")
            .await
            .unwrap();

        let late = assigned(&order, CourierId::new());
        assert_eq!(
            saga.handle_courier_assigned(&late).await.unwrap(),
            ConsumeOutcome::Discarded
        );
        assert_eq!(
            saga.handle_courier_assigned(&late).await.unwrap(),
            ConsumeOutcome::Duplicate
        );

        let stored = saga.get(order.id).await.unwrap().unwrap();
        assert_eq!(stored.status, OrderStatus::Cancelled);
        assert!(stored.courier_id.is_none());
        assert_eq!(
            outbox_types(&saga).await.last().map(String::as_str),
            Some(routing::COURIER_RELEASE_REQUESTED)
        );
    }

    #[tokio::test]
    async fn happy_path_reaches_delivered() {
        let saga = OrderSaga::new(InMemoryOrderRepository::new());
        let order = preparing(&saga).await;
        let courier_id = CourierId::new();

        saga.mark_ready(order.id).await.unwrap();
        saga.handle_courier_assigned(&assigned(&order, courier_id))
            .await
            .unwrap();
        saga.confirm_pickup(order.id).await.unwrap();
        let delivered = saga.confirm_delivery(order.id).await.unwrap();

        assert_eq!(delivered.status, OrderStatus::Delivered);
        assert_eq!(delivered.courier_id, Some(courier_id));
        assert_eq!(
            outbox_types(&saga).await,
            vec![
                routing::STOCK_RESERVATION_REQUESTED,
                routing::ORDER_PREPARING,
                routing::ORDER_AWAITING_COURIER,
                routing::ORDER_ASSIGNED,
                routing::ORDER_ON_THE_WAY,
                routing::ORDER_DELIVERED,
            ]
        );
    }

    #[tokio::test]
    async fn concurrent_commands_apply_once() {
        let saga = std::sync::Arc::new(OrderSaga::new(InMemoryOrderRepository::new()));
        let order = placed(&saga).await;

        let accepts = (0..8).map(|_| {
            let saga = saga.clone();
            tokio::spawn(async move { saga.accept(order.id).await.is_ok() })
        });
        let ok = futures_util::future::join_all(accepts)
            .await
            .into_iter()
            .filter(|r| *r.as_ref().unwrap())
            .count();

        assert_eq!(ok, 1);
        let stored = saga.get(order.id).await.unwrap().unwrap();
        assert_eq!(stored.reservation_attempt, 1);
        assert_eq!(outbox_types(&saga).await.len(), 1);
    }
}
