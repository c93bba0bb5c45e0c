//! The order saga as a pure reducer.
//!
//! [`decide`] maps the current order and one input to either the next order
//! state plus the messages to enqueue with it, or a discard. The caller owns
//! persistence, idempotency and concurrency control; this module never
//! touches I/O, so every transition is testable on plain values.

use common::CourierId;
use outbox::{OutboxRecord, RoutedMessage};

use super::{Order, OrderStatus, Party};
use crate::messages::{
    CourierReleaseRequested, OrderCancelled, OrderPreparing, OrderStatusChanged,
    StockReleaseRequested, StockReservationRequested,
};

/// Aggregate type stamped on every outbox row the order service writes.
pub const AGGREGATE_TYPE: &str = "Order";

/// Something that happened to an order: an ingress command or a reply event.
#[derive(Debug, Clone, PartialEq)]
pub enum SagaInput {
    /// The store accepted the order.
    Accept,
    StockReserved {
        attempt: u32,
    },
    StockReservationFailed {
        attempt: u32,
        reason: String,
    },
    CourierAssigned {
        courier_id: CourierId,
    },
    CourierAssignmentFailed {
        reason: String,
    },
    /// The store finished preparing and waits for a courier.
    MarkReady,
    PickupConfirmed,
    DeliveryConfirmed,
    Cancel {
        by: Party,
        reason: String,
    },
}

impl SagaInput {
    /// Short name used in logs and metric labels.
    pub fn name(&self) -> &'static str {
        match self {
            SagaInput::Accept => "accept",
            SagaInput::StockReserved { .. } => "stock_reserved",
            SagaInput::StockReservationFailed { .. } => "stock_reservation_failed",
            SagaInput::CourierAssigned { .. } => "courier_assigned",
            SagaInput::CourierAssignmentFailed { .. } => "courier_assignment_failed",
            SagaInput::MarkReady => "mark_ready",
            SagaInput::PickupConfirmed => "pickup_confirmed",
            SagaInput::DeliveryConfirmed => "delivery_confirmed",
            SagaInput::Cancel { .. } => "cancel",
        }
    }
}

/// A message the saga wants enqueued alongside its write.
#[derive(Debug, Clone, PartialEq)]
pub enum Emission {
    StockReservationRequested(StockReservationRequested),
    OrderPreparing(OrderPreparing),
    StatusChanged(OrderStatusChanged),
    OrderCancelled(OrderCancelled),
    StockReleaseRequested(StockReleaseRequested),
    CourierReleaseRequested(CourierReleaseRequested),
}

impl Emission {
    pub fn routing_key(&self) -> &'static str {
        match self {
            Emission::StockReservationRequested(m) => m.routing_key(),
            Emission::OrderPreparing(m) => m.routing_key(),
            Emission::StatusChanged(m) => m.routing_key(),
            Emission::OrderCancelled(m) => m.routing_key(),
            Emission::StockReleaseRequested(m) => m.routing_key(),
            Emission::CourierReleaseRequested(m) => m.routing_key(),
        }
    }

    /// Returns true for messages that undo a remote effect the order no
    /// longer wants.
    pub fn is_compensation(&self) -> bool {
        matches!(
            self,
            Emission::StockReleaseRequested(_) | Emission::CourierReleaseRequested(_)
        )
    }

    /// Serializes the message into an unpublished outbox row.
    pub fn to_record(&self) -> Result<OutboxRecord, serde_json::Error> {
        match self {
            Emission::StockReservationRequested(m) => OutboxRecord::for_message(AGGREGATE_TYPE, m),
            Emission::OrderPreparing(m) => OutboxRecord::for_message(AGGREGATE_TYPE, m),
            Emission::StatusChanged(m) => OutboxRecord::for_message(AGGREGATE_TYPE, m),
            Emission::OrderCancelled(m) => OutboxRecord::for_message(AGGREGATE_TYPE, m),
            Emission::StockReleaseRequested(m) => OutboxRecord::for_message(AGGREGATE_TYPE, m),
            Emission::CourierReleaseRequested(m) => OutboxRecord::for_message(AGGREGATE_TYPE, m),
        }
    }
}

/// Outcome of applying one input to one order.
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    /// Persist `next` (status, courier, attempt) and enqueue `emit` with it.
    Advance { next: Order, emit: Vec<Emission> },

    /// The input does not apply to the current state. `emit` is non-empty
    /// only when a remote effect must be compensated.
    Discard {
        reason: &'static str,
        emit: Vec<Emission>,
    },
}

impl Decision {
    pub fn emissions(&self) -> &[Emission] {
        match self {
            Decision::Advance { emit, .. } | Decision::Discard { emit, .. } => emit,
        }
    }

    pub fn is_advance(&self) -> bool {
        matches!(self, Decision::Advance { .. })
    }

    fn discard(reason: &'static str) -> Self {
        Decision::Discard {
            reason,
            emit: Vec::new(),
        }
    }
}

/// Applies `input` to `order`.
///
/// Every branch first checks the order's status against the input's
/// precondition; a mismatch is a stale or duplicate input and yields
/// [`Decision::Discard`].
pub fn decide(order: &Order, input: &SagaInput) -> Decision {
    match input {
        SagaInput::Accept => {
            if !order.status.can_accept() {
                return Decision::discard("order is not pending");
            }
            let mut next = moved(order, OrderStatus::ReservingStock);
            next.reservation_attempt = order.reservation_attempt + 1;
            let emit = vec![Emission::StockReservationRequested(
                StockReservationRequested {
                    order_id: order.id,
                    store_id: order.store_id,
                    user_id: order.user_id,
                    attempt: next.reservation_attempt,
                    items: order.items.clone(),
                    pickup_address: order.pickup_address.clone(),
                    shipping_address: order.shipping_address.clone(),
                },
            )];
            Decision::Advance { next, emit }
        }

        SagaInput::StockReserved { attempt } => {
            if order.status.awaits_stock() && *attempt == order.reservation_attempt {
                let next = moved(order, OrderStatus::Preparing);
                let emit = vec![Emission::OrderPreparing(OrderPreparing {
                    order_id: order.id,
                    store_id: order.store_id,
                    user_id: order.user_id,
                    pickup_address: order.pickup_address.clone(),
                    shipping_address: order.shipping_address.clone(),
                })];
                return Decision::Advance { next, emit };
            }
            if *attempt == order.reservation_attempt && order.status.has_deducted_stock() {
                return Decision::discard("reservation already applied");
            }
            // The order stopped waiting for this reservation: give it back.
            Decision::Discard {
                reason: "reservation no longer wanted",
                emit: vec![Emission::StockReleaseRequested(StockReleaseRequested {
                    order_id: order.id,
                    attempt: *attempt,
                    reason: format!("order is {}", order.status),
                })],
            }
        }

        SagaInput::StockReservationFailed { attempt, reason } => {
            if !order.status.awaits_stock() || *attempt != order.reservation_attempt {
                return Decision::discard("no reservation in flight for this attempt");
            }
            let next = moved(order, OrderStatus::Pending);
            let emit = vec![cancellation(order, reason)];
            Decision::Advance { next, emit }
        }

        SagaInput::CourierAssigned { courier_id } => {
            if order.status.awaits_courier() {
                let mut next = moved(order, OrderStatus::Assigned);
                next.courier_id = Some(*courier_id);
                let emit = vec![status_changed(order, &next)];
                return Decision::Advance { next, emit };
            }
            if order.courier_id == Some(*courier_id) {
                return Decision::discard("courier already assigned");
            }
            Decision::Discard {
                reason: "courier no longer wanted",
                emit: vec![Emission::CourierReleaseRequested(CourierReleaseRequested {
                    order_id: order.id,
                    courier_id: *courier_id,
                    reason: format!("order is {}", order.status),
                })],
            }
        }

        SagaInput::CourierAssignmentFailed { reason } => {
            if !order.status.awaits_courier() {
                return Decision::discard("no courier assignment in flight");
            }
            let next = moved(order, OrderStatus::Cancelled);
            let emit = vec![cancellation(order, reason)];
            Decision::Advance { next, emit }
        }

        SagaInput::MarkReady => forward(order, order.status.can_mark_ready(), OrderStatus::AwaitingCourier),
        SagaInput::PickupConfirmed => forward(order, order.status.can_pick_up(), OrderStatus::OnTheWay),
        SagaInput::DeliveryConfirmed => forward(order, order.status.can_deliver(), OrderStatus::Delivered),

        SagaInput::Cancel { by, reason } => {
            if !order.status.can_be_cancelled_by(*by) {
                return Decision::discard("order cannot be cancelled in this state");
            }
            let next = moved(order, OrderStatus::Cancelled);
            let emit = vec![cancellation(order, reason)];
            Decision::Advance { next, emit }
        }
    }
}

fn moved(order: &Order, status: OrderStatus) -> Order {
    let mut next = order.clone();
    next.status = status;
    next
}

fn forward(order: &Order, allowed: bool, status: OrderStatus) -> Decision {
    if !allowed {
        return Decision::discard("order is not in the required state");
    }
    let next = moved(order, status);
    let emit = vec![status_changed(order, &next)];
    Decision::Advance { next, emit }
}

fn status_changed(order: &Order, next: &Order) -> Emission {
    Emission::StatusChanged(OrderStatusChanged {
        order_id: order.id,
        store_id: order.store_id,
        user_id: order.user_id,
        courier_id: next.courier_id,
        old_status: order.status,
        new_status: next.status,
    })
}

fn cancellation(order: &Order, reason: &str) -> Emission {
    Emission::OrderCancelled(OrderCancelled {
        order_id: order.id,
        store_id: order.store_id,
        user_id: order.user_id,
        courier_id: order.courier_id,
        old_status: order.status,
        attempt: order.reservation_attempt,
        items: order.items.clone(),
        reason: reason.to_string(),
    })
}
