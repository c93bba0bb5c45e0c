//! Order lifecycle.

use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// Who asked for a cancellation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Party {
    User,
    Store,
}

/// The state of an order in its fulfillment saga.
///
/// State transitions:
/// ```text
/// Pending ──► ReservingStock ──► Preparing ──► AwaitingCourier ──► Assigned ──► OnTheWay ──► Delivered
///    ▲              │                │  └──────────────┬───────────────┘
///    └── failed ────┘                └─────────────────┴──► Cancelled
/// ```
///
/// `Cancelled` is reachable from every non-terminal state except
/// `ReservingStock`, whose reply is still in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    /// Placed, not yet accepted by the store.
    #[default]
    Pending,

    /// Accepted; waiting for the inventory service to reserve stock.
    ReservingStock,

    /// Stock deducted; the store is preparing the order.
    Preparing,

    /// Ready for pickup, no courier yet.
    AwaitingCourier,

    /// A courier has been bound to the order.
    Assigned,

    /// Picked up by the courier.
    OnTheWay,

    /// Handed to the customer (terminal state).
    Delivered,

    /// Cancelled (terminal state).
    Cancelled,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 8] = [
        OrderStatus::Pending,
        OrderStatus::ReservingStock,
        OrderStatus::Preparing,
        OrderStatus::AwaitingCourier,
        OrderStatus::Assigned,
        OrderStatus::OnTheWay,
        OrderStatus::Delivered,
        OrderStatus::Cancelled,
    ];

    /// Returns true if the store can accept the order in this state.
    pub fn can_accept(&self) -> bool {
        matches!(self, OrderStatus::Pending)
    }

    /// Returns true if a stock reply is expected in this state.
    pub fn awaits_stock(&self) -> bool {
        matches!(self, OrderStatus::ReservingStock)
    }

    /// Returns true if a courier reply is expected in this state.
    pub fn awaits_courier(&self) -> bool {
        matches!(self, OrderStatus::Preparing | OrderStatus::AwaitingCourier)
    }

    /// Returns true if the store can flag the order ready for pickup.
    pub fn can_mark_ready(&self) -> bool {
        matches!(self, OrderStatus::Preparing)
    }

    /// Returns true if the courier can pick the order up.
    pub fn can_pick_up(&self) -> bool {
        matches!(self, OrderStatus::Assigned)
    }

    /// Returns true if the order can be delivered.
    pub fn can_deliver(&self) -> bool {
        matches!(self, OrderStatus::OnTheWay)
    }

    /// Returns true if `party` may cancel the order in this state.
    pub fn can_be_cancelled_by(&self, party: Party) -> bool {
        match party {
            Party::User => matches!(
                self,
                OrderStatus::Pending | OrderStatus::Preparing | OrderStatus::AwaitingCourier
            ),
            Party::Store => matches!(
                self,
                OrderStatus::Pending
                    | OrderStatus::Preparing
                    | OrderStatus::AwaitingCourier
                    | OrderStatus::Assigned
                    | OrderStatus::OnTheWay
            ),
        }
    }

    /// Returns true if stock has been deducted for an order in this state.
    ///
    /// A cancellation restores stock only when its pre-cancellation status
    /// satisfies this.
    pub fn has_deducted_stock(&self) -> bool {
        matches!(
            self,
            OrderStatus::Preparing
                | OrderStatus::AwaitingCourier
                | OrderStatus::Assigned
                | OrderStatus::OnTheWay
                | OrderStatus::Delivered
        )
    }

    /// Returns true if this is a terminal state (no further transitions possible).
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Delivered | OrderStatus::Cancelled)
    }

    /// Returns the status name as stored and sent on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::ReservingStock => "RESERVING_STOCK",
            OrderStatus::Preparing => "PREPARING",
            OrderStatus::AwaitingCourier => "AWAITING_COURIER",
            OrderStatus::Assigned => "ASSIGNED",
            OrderStatus::OnTheWay => "ON_THE_WAY",
            OrderStatus::Delivered => "DELIVERED",
            OrderStatus::Cancelled => "CANCELLED",
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for OrderStatus {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OrderStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| DomainError::UnknownOrderStatus(s.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_status_is_pending() {
        assert_eq!(OrderStatus::default(), OrderStatus::Pending);
    }

    #[test]
    fn test_only_pending_can_accept() {
        for status in OrderStatus::ALL {
            assert_eq!(status.can_accept(), status == OrderStatus::Pending);
        }
    }

    #[test]
    fn test_courier_replies_expected_while_preparing() {
        assert!(OrderStatus::Preparing.awaits_courier());
        assert!(OrderStatus::AwaitingCourier.awaits_courier());
        assert!(!OrderStatus::ReservingStock.awaits_courier());
        assert!(!OrderStatus::Assigned.awaits_courier());
    }

    #[test]
    fn test_user_cancel_permissions() {
        let allowed: Vec<_> = OrderStatus::ALL
            .into_iter()
            .filter(|s| s.can_be_cancelled_by(Party::User))
            .collect();
        assert_eq!(
            allowed,
            vec![
                OrderStatus::Pending,
                OrderStatus::Preparing,
                OrderStatus::AwaitingCourier
            ]
        );
    }

    #[test]
    fn test_store_cancel_permissions() {
        assert!(OrderStatus::Assigned.can_be_cancelled_by(Party::Store));
        assert!(OrderStatus::OnTheWay.can_be_cancelled_by(Party::Store));
        assert!(!OrderStatus::ReservingStock.can_be_cancelled_by(Party::Store));
        assert!(!OrderStatus::Delivered.can_be_cancelled_by(Party::Store));
        assert!(!OrderStatus::Cancelled.can_be_cancelled_by(Party::Store));
    }

    #[test]
    fn test_stock_deducted_from_preparing_onwards() {
        assert!(!OrderStatus::Pending.has_deducted_stock());
        assert!(!OrderStatus::ReservingStock.has_deducted_stock());
        assert!(OrderStatus::Preparing.has_deducted_stock());
        assert!(OrderStatus::AwaitingCourier.has_deducted_stock());
        assert!(OrderStatus::Assigned.has_deducted_stock());
        assert!(OrderStatus::OnTheWay.has_deducted_stock());
        assert!(!OrderStatus::Cancelled.has_deducted_stock());
    }

    #[test]
    fn test_terminal_states() {
        let terminal: Vec<_> = OrderStatus::ALL
            .into_iter()
            .filter(OrderStatus::is_terminal)
            .collect();
        assert_eq!(terminal, vec![OrderStatus::Delivered, OrderStatus::Cancelled]);
    }

    #[test]
    fn test_wire_names_round_trip() {
        for status in OrderStatus::ALL {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
            assert_eq!(status.as_str().parse::<OrderStatus>().unwrap(), status);
        }
        assert!("SHIPPED".parse::<OrderStatus>().is_err());
    }
}
