//! Order entity.

use chrono::{DateTime, Utc};
use common::{Address, ConcurrencyToken, CourierId, OrderId, ProductId, StoreId, UserId};
use serde::{Deserialize, Serialize};

use super::{OrderError, OrderStatus};

/// One line of an order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItem {
    pub product_id: ProductId,
    pub quantity: u32,
}

impl OrderItem {
    pub fn new(product_id: impl Into<ProductId>, quantity: u32) -> Self {
        Self {
            product_id: product_id.into(),
            quantity,
        }
    }
}

/// An order as owned by the order service.
///
/// `token` is bumped by the repository on every write; a write carrying a
/// stale token is rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: OrderId,
    pub user_id: UserId,
    pub store_id: StoreId,
    pub courier_id: Option<CourierId>,
    pub items: Vec<OrderItem>,
    pub pickup_address: Address,
    pub shipping_address: Address,
    pub status: OrderStatus,

    /// Number of stock reservations requested so far. Correlates stock
    /// replies with the request they answer.
    pub reservation_attempt: u32,

    pub token: ConcurrencyToken,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Creates a pending order after validating its lines.
    pub fn place(
        user_id: UserId,
        store_id: StoreId,
        items: Vec<OrderItem>,
        pickup_address: Address,
        shipping_address: Address,
    ) -> Result<Self, OrderError> {
        if items.is_empty() {
            return Err(OrderError::NoItems);
        }
        if let Some(item) = items.iter().find(|i| i.quantity == 0) {
            return Err(OrderError::InvalidQuantity {
                product_id: item.product_id.to_string(),
            });
        }
        if let Some(product_id) = overflowing_product(&items) {
            return Err(OrderError::QuantityOverflow {
                product_id: product_id.to_string(),
            });
        }

        let now = Utc::now();
        Ok(Self {
            id: OrderId::new(),
            user_id,
            store_id,
            courier_id: None,
            items,
            pickup_address,
            shipping_address,
            status: OrderStatus::Pending,
            reservation_attempt: 0,
            token: ConcurrencyToken::initial(),
            created_at: now,
            updated_at: now,
        })
    }

    /// Total quantity per product, with duplicate lines merged.
    pub fn quantities(&self) -> Vec<OrderItem> {
        merge_lines(&self.items)
    }
}

/// Merges lines for the same product, keeping first-seen order.
///
/// Totals saturate at `u32::MAX`; `Order::place` refuses orders that would.
pub fn merge_lines(items: &[OrderItem]) -> Vec<OrderItem> {
    let mut merged: Vec<OrderItem> = Vec::with_capacity(items.len());
    for item in items {
        match merged.iter_mut().find(|m| m.product_id == item.product_id) {
            Some(existing) => existing.quantity = existing.quantity.saturating_add(item.quantity),
            None => merged.push(item.clone()),
        }
    }
    merged
}

fn overflowing_product(items: &[OrderItem]) -> Option<&ProductId> {
    let mut totals: Vec<(&ProductId, u32)> = Vec::with_capacity(items.len());
    for item in items {
        match totals.iter_mut().find(|(id, _)| **id == item.product_id) {
            Some((_, total)) => match total.checked_add(item.quantity) {
                Some(sum) => *total = sum,
                None => return Some(&item.product_id),
            },
            None => totals.push((&item.product_id, item.quantity)),
        }
    }
    None
}
