//! Message contracts exchanged between the order, inventory and courier
//! services.
//!
//! Every contract serializes with camelCase field names and carries the
//! identifiers its receiver needs to correlate it; nothing is looked up
//! across service boundaries.

use common::{Address, CourierId, OrderId, StoreId, UserId};
use outbox::RoutedMessage;
use serde::{Deserialize, Serialize};

use crate::order::{OrderItem, OrderStatus};

/// Routing keys.
pub mod routing {
    pub const ORDER_PREPARING: &str = "order.preparing";
    pub const ORDER_AWAITING_COURIER: &str = "order.awaiting_courier";
    pub const ORDER_ASSIGNED: &str = "order.assigned";
    pub const ORDER_ON_THE_WAY: &str = "order.on_the_way";
    pub const ORDER_DELIVERED: &str = "order.delivered";
    pub const ORDER_CANCELLED: &str = "order.cancelled";
    pub const STOCK_RESERVATION_REQUESTED: &str = "stock.reservation.requested";
    pub const STOCK_RESERVED: &str = "stock.reserved";
    pub const STOCK_RESERVATION_FAILED: &str = "stock.reservation.failed";
    pub const STOCK_RELEASE_REQUESTED: &str = "stock.release.requested";
    pub const COURIER_ASSIGNED: &str = "courier.assigned";
    pub const COURIER_ASSIGNMENT_FAILED: &str = "courier.assignment.failed";
    pub const COURIER_RELEASE_REQUESTED: &str = "courier.release.requested";
}

/// Stock is deducted; the courier service should find a courier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderPreparing {
    pub order_id: OrderId,
    pub store_id: StoreId,
    pub user_id: UserId,
    pub pickup_address: Address,
    pub shipping_address: Address,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockReservationRequested {
    pub order_id: OrderId,
    pub store_id: StoreId,
    pub user_id: UserId,
    pub attempt: u32,
    pub items: Vec<OrderItem>,
    pub pickup_address: Address,
    pub shipping_address: Address,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockReserved {
    pub order_id: OrderId,
    pub store_id: StoreId,
    pub user_id: UserId,
    pub attempt: u32,
    pub pickup_address: Address,
    pub shipping_address: Address,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockReservationFailed {
    pub order_id: OrderId,
    pub user_id: UserId,
    pub attempt: u32,
    pub reason: String,
}

/// Compensation for a reservation the order no longer wants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StockReleaseRequested {
    pub order_id: OrderId,
    pub attempt: u32,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CourierAssigned {
    pub order_id: OrderId,
    pub courier_id: CourierId,
    pub store_id: StoreId,
    pub user_id: UserId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CourierAssignmentFailed {
    pub order_id: OrderId,
    pub user_id: UserId,
    pub store_id: StoreId,
    pub reason: String,
}

/// Compensation for a courier bound to an order that no longer needs one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CourierReleaseRequested {
    pub order_id: OrderId,
    pub courier_id: CourierId,
    pub reason: String,
}

/// Cancellation notice and compensation trigger.
///
/// `old_status` is the status the order held before this event. Receivers
/// restore stock only if that status had stock deducted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderCancelled {
    pub order_id: OrderId,
    pub store_id: StoreId,
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub courier_id: Option<CourierId>,
    pub old_status: OrderStatus,
    pub attempt: u32,
    pub items: Vec<OrderItem>,
    pub reason: String,
}

/// Forward progress notice. The routing key follows `new_status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderStatusChanged {
    pub order_id: OrderId,
    pub store_id: StoreId,
    pub user_id: UserId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub courier_id: Option<CourierId>,
    pub old_status: OrderStatus,
    pub new_status: OrderStatus,
}

macro_rules! routed {
    ($ty:ty, $key:expr) => {
        impl RoutedMessage for $ty {
            fn routing_key(&self) -> &'static str {
                $key
            }

            fn aggregate_id(&self) -> String {
                self.order_id.to_string()
            }
        }
    };
}

routed!(OrderPreparing, routing::ORDER_PREPARING);
routed!(StockReservationRequested, routing::STOCK_RESERVATION_REQUESTED);
routed!(StockReserved, routing::STOCK_RESERVED);
routed!(StockReservationFailed, routing::STOCK_RESERVATION_FAILED);
routed!(StockReleaseRequested, routing::STOCK_RELEASE_REQUESTED);
routed!(CourierAssigned, routing::COURIER_ASSIGNED);
routed!(CourierAssignmentFailed, routing::COURIER_ASSIGNMENT_FAILED);
routed!(CourierReleaseRequested, routing::COURIER_RELEASE_REQUESTED);
routed!(OrderCancelled, routing::ORDER_CANCELLED);

impl RoutedMessage for OrderStatusChanged {
    fn routing_key(&self) -> &'static str {
        match self.new_status {
            OrderStatus::AwaitingCourier => routing::ORDER_AWAITING_COURIER,
            OrderStatus::Assigned => routing::ORDER_ASSIGNED,
            OrderStatus::OnTheWay => routing::ORDER_ON_THE_WAY,
            OrderStatus::Delivered => routing::ORDER_DELIVERED,
            // Cancellation and reservation moves have dedicated contracts.
            OrderStatus::Pending
            | OrderStatus::ReservingStock
            | OrderStatus::Preparing
            | OrderStatus::Cancelled => "order.status_changed",
        }
    }

    fn aggregate_id(&self) -> String {
        self.order_id.to_string()
    }
}
