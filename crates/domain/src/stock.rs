//! Stock entities owned by the inventory service.

use common::{ProductId, StoreId};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;

/// A stockable product of one store.
///
/// `available_quantity` is unsigned: a decrement that would go below zero
/// is refused, never clamped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub id: ProductId,
    pub store_id: StoreId,
    pub available_quantity: u32,
}

impl Product {
    pub fn new(id: impl Into<ProductId>, store_id: StoreId, available_quantity: u32) -> Self {
        Self {
            id: id.into(),
            store_id,
            available_quantity,
        }
    }

    /// Decrements by `quantity` only if enough is available.
    ///
    /// The check and the write happen in one call; there is no separate
    /// read a caller could act on.
    pub fn try_reserve(&mut self, quantity: u32) -> ReserveOne {
        match self.available_quantity.checked_sub(quantity) {
            Some(remaining) => {
                self.available_quantity = remaining;
                ReserveOne::accepted(remaining)
            }
            None => ReserveOne::refused(self.available_quantity),
        }
    }

    /// Adds `quantity` back.
    pub fn restore(&mut self, quantity: u32) {
        self.available_quantity = self.available_quantity.saturating_add(quantity);
    }
}

/// Result of one conditional decrement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReserveOne {
    pub accepted: bool,
    /// Quantity left after the call (unchanged when refused).
    pub remaining: u32,
}

impl ReserveOne {
    pub fn accepted(remaining: u32) -> Self {
        Self {
            accepted: true,
            remaining,
        }
    }

    pub fn refused(remaining: u32) -> Self {
        Self {
            accepted: false,
            remaining,
        }
    }
}

/// Why a reservation batch was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReservationFailure {
    /// The product does not exist or belongs to another store.
    UnknownProduct { product_id: ProductId },

    /// Not enough stock at the moment of the write.
    InsufficientStock {
        product_id: ProductId,
        requested: u32,
        available: u32,
    },
}

impl ReservationFailure {
    /// Reason text carried on `stock.reservation.failed`.
    pub fn reason(&self) -> &'static str {
        match self {
            ReservationFailure::UnknownProduct { .. } => "unknown product",
            ReservationFailure::InsufficientStock { .. } => "insufficient stock",
        }
    }

    pub fn product_id(&self) -> &ProductId {
        match self {
            ReservationFailure::UnknownProduct { product_id }
            | ReservationFailure::InsufficientStock { product_id, .. } => product_id,
        }
    }
}

/// Ledger state of the stock held for one order attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReservationState {
    Reserved,
    Released,
}

impl ReservationState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReservationState::Reserved => "RESERVED",
            ReservationState::Released => "RELEASED",
        }
    }
}

impl std::str::FromStr for ReservationState {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "RESERVED" => Ok(ReservationState::Reserved),
            "RELEASED" => Ok(ReservationState::Released),
            other => Err(DomainError::UnknownReservationState(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_exact_quantity_leaves_zero() {
        let mut product = Product::new("P1", StoreId::new(), 2);
        assert_eq!(product.try_reserve(2), ReserveOne::accepted(0));
        assert_eq!(product.available_quantity, 0);
    }

    #[test]
    fn insufficient_reserve_changes_nothing() {
        let mut product = Product::new("P1", StoreId::new(), 2);
        assert_eq!(product.try_reserve(3), ReserveOne::refused(2));
        assert_eq!(product.available_quantity, 2);
    }

    #[test]
    fn restore_adds_back() {
        let mut product = Product::new("P1", StoreId::new(), 1);
        product.restore(3);
        assert_eq!(product.available_quantity, 4);
    }

    #[test]
    fn failure_reasons() {
        let unknown = ReservationFailure::UnknownProduct {
            product_id: "P9".into(),
        };
        let short = ReservationFailure::InsufficientStock {
            product_id: "P1".into(),
            requested: 3,
            available: 2,
        };
        assert_eq!(unknown.reason(), "unknown product");
        assert_eq!(short.reason(), "insufficient stock");
        assert_eq!(short.product_id().as_str(), "P1");
    }

    #[test]
    fn ledger_state_parses() {
        assert_eq!("RESERVED".parse::<ReservationState>().unwrap(), ReservationState::Reserved);
        assert_eq!(ReservationState::Released.as_str(), "RELEASED");
        assert!("HELD".parse::<ReservationState>().is_err());
    }
}
