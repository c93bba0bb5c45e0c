//! In-memory stock repository.

use async_trait::async_trait;
use common::{OrderId, ProductId, StoreId};
use domain::messages::StockReservationRequested;
use domain::{OrderItem, Product, ReservationFailure, ReservationState, ReserveOne, merge_lines};
use outbox::{EventKey, InMemoryDatabase, Journaled, Table};

use crate::repository::{ReleaseOutcome, ReservationOutcome, StockRepository, StockReservation};
use crate::{InventoryError, Result, replies};

/// Business tables of the inventory service.
#[derive(Debug, Clone, Default)]
pub struct StockTables {
    products: Table<ProductId, Product>,
    reservations: Table<(OrderId, u32), StockReservation>,
}

impl StockTables {
    /// Applies every line or none. On refusal `self` is left untouched.
    ///
    /// `lines` must hold one line per product, as [`merge_lines`] returns.
    fn reserve_all(
        &mut self,
        store_id: StoreId,
        lines: &[OrderItem],
    ) -> std::result::Result<(), ReservationFailure> {
        for line in lines {
            let product = self
                .products
                .get(&line.product_id)
                .filter(|p| p.store_id == store_id)
                .ok_or_else(|| ReservationFailure::UnknownProduct {
                    product_id: line.product_id.clone(),
                })?;
            if product.available_quantity < line.quantity {
                return Err(ReservationFailure::InsufficientStock {
                    product_id: line.product_id.clone(),
                    requested: line.quantity,
                    available: product.available_quantity,
                });
            }
        }
        for line in lines {
            if let Some(product) = self.products.get_mut(&line.product_id) {
                product.try_reserve(line.quantity);
            }
        }
        Ok(())
    }
}

impl Journaled for StockTables {
    fn rollback(&mut self) {
        self.products.rollback();
        self.reservations.rollback();
    }

    fn commit(&mut self) {
        self.products.commit();
        self.reservations.commit();
    }
}

/// Stock repository over an [`InMemoryDatabase`].
///
/// Clone the database handle with [`database`](Self::database) to give the
/// publisher the same outbox.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStockRepository {
    db: InMemoryDatabase<StockTables>,
}

impl InMemoryStockRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn database(&self) -> &InMemoryDatabase<StockTables> {
        &self.db
    }
}

#[async_trait]
impl StockRepository for InMemoryStockRepository {
    async fn upsert_product(&self, product: &Product) -> Result<()> {
        let mut tx = self.db.begin().await;
        tx.data.products.insert(product.id.clone(), product.clone());
        tx.commit();
        Ok(())
    }

    async fn product(&self, id: &ProductId) -> Result<Option<Product>> {
        Ok(self.db.read(|t| t.data.products.get(id).cloned()).await)
    }

    async fn reserve(&self, id: &ProductId, quantity: u32) -> Result<ReserveOne> {
        let mut tx = self.db.begin().await;
        let product = tx
            .data
            .products
            .get_mut(id)
            .ok_or_else(|| InventoryError::UnknownProduct(id.clone()))?;
        let outcome = product.try_reserve(quantity);
        tx.commit();
        Ok(outcome)
    }

    async fn reserve_for_order(
        &self,
        key: &EventKey,
        request: &StockReservationRequested,
    ) -> Result<ReservationOutcome> {
        let mut tx = self.db.begin().await;
        if !tx.processed.claim(key) {
            return Ok(ReservationOutcome::Duplicate);
        }

        let lines = merge_lines(&request.items);
        let outcome = match tx.data.reserve_all(request.store_id, &lines) {
            Ok(()) => {
                tx.data.reservations.insert(
                    (request.order_id, request.attempt),
                    StockReservation {
                        order_id: request.order_id,
                        attempt: request.attempt,
                        lines: lines.clone(),
                        state: ReservationState::Reserved,
                    },
                );
                tx.outbox.enqueue(replies::reserved(request)?);
                ReservationOutcome::Reserved { lines }
            }
            Err(failure) => {
                tx.outbox.enqueue(replies::refused(request, &failure)?);
                ReservationOutcome::Refused(failure)
            }
        };

        tx.commit();
        Ok(outcome)
    }

    async fn release_for_order(
        &self,
        key: &EventKey,
        order_id: OrderId,
        attempt: u32,
    ) -> Result<ReleaseOutcome> {
        let mut tx = self.db.begin().await;
        let held = match tx.data.reservations.get(&(order_id, attempt)) {
            Some(r) if r.state == ReservationState::Reserved => r.lines.clone(),
            _ => return Ok(ReleaseOutcome::NothingHeld),
        };
        if !tx.processed.claim(key) {
            return Ok(ReleaseOutcome::Duplicate);
        }

        for line in &held {
            if let Some(product) = tx.data.products.get_mut(&line.product_id) {
                product.restore(line.quantity);
            }
        }
        if let Some(reservation) = tx.data.reservations.get_mut(&(order_id, attempt)) {
            reservation.state = ReservationState::Released;
        }

        tx.commit();
        Ok(ReleaseOutcome::Restored { lines: held })
    }

    async fn reservation(
        &self,
        order_id: OrderId,
        attempt: u32,
    ) -> Result<Option<StockReservation>> {
        Ok(self
            .db
            .read(|t| t.data.reservations.get(&(order_id, attempt)).cloned())
            .await)
    }
}
