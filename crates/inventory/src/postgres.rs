//! PostgreSQL stock repository.

use async_trait::async_trait;
use common::{OrderId, ProductId, StoreId};
use domain::messages::StockReservationRequested;
use domain::{OrderItem, Product, ReservationFailure, ReservationState, ReserveOne, merge_lines};
use outbox::{EventKey, postgres as outbox_pg};
use sqlx::{Acquire, PgConnection, PgPool, Row};
use uuid::Uuid;

use crate::repository::{ReleaseOutcome, ReservationOutcome, StockRepository, StockReservation};
use crate::{InventoryError, Result, replies};

/// Schema for products and the reservation ledger.
pub const SCHEMA: &str = include_str!("../../../migrations/003_stock.sql");

/// PostgreSQL implementation of [`StockRepository`].
#[derive(Clone)]
pub struct PostgresStockRepository {
    pool: PgPool,
}

impl PostgresStockRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates the outbox and stock tables if they are missing.
    pub async fn ensure_schema(&self) -> Result<()> {
        outbox_pg::ensure_schema(&self.pool).await?;
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }
}

/// Conditional decrement. Returns the remaining quantity, or `None` when
/// the row is missing or short.
async fn decrement(
    conn: &mut PgConnection,
    id: &ProductId,
    store_id: Option<StoreId>,
    quantity: u32,
) -> Result<Option<u32>> {
    let remaining: Option<i64> = sqlx::query_scalar(
        r#"
        UPDATE products
        SET available_quantity = available_quantity - $2, updated_at = now()
        WHERE id = $1
          AND ($3::uuid IS NULL OR store_id = $3)
          AND available_quantity >= $2
        RETURNING available_quantity
        "#,
    )
    .bind(id.as_str())
    .bind(i64::from(quantity))
    .bind(store_id.map(|s| s.as_uuid()))
    .fetch_optional(&mut *conn)
    .await?;

    Ok(remaining.map(|r| r as u32))
}

async fn current_quantity(
    conn: &mut PgConnection,
    id: &ProductId,
    store_id: Option<StoreId>,
) -> Result<Option<u32>> {
    let quantity: Option<i64> = sqlx::query_scalar(
        "SELECT available_quantity FROM products WHERE id = $1 AND ($2::uuid IS NULL OR store_id = $2)",
    )
    .bind(id.as_str())
    .bind(store_id.map(|s| s.as_uuid()))
    .fetch_optional(&mut *conn)
    .await?;

    Ok(quantity.map(|q| q as u32))
}

/// Decrements every line; stops at the first refusal. The caller rolls
/// back the enclosing savepoint on `Err`.
async fn decrement_all(
    conn: &mut PgConnection,
    store_id: StoreId,
    lines: &[OrderItem],
) -> Result<std::result::Result<(), ReservationFailure>> {
    for line in lines {
        if decrement(conn, &line.product_id, Some(store_id), line.quantity)
            .await?
            .is_some()
        {
            continue;
        }
        let failure = match current_quantity(conn, &line.product_id, Some(store_id)).await? {
            None => ReservationFailure::UnknownProduct {
                product_id: line.product_id.clone(),
            },
            Some(available) => ReservationFailure::InsufficientStock {
                product_id: line.product_id.clone(),
                requested: line.quantity,
                available,
            },
        };
        return Ok(Err(failure));
    }
    Ok(Ok(()))
}

#[async_trait]
impl StockRepository for PostgresStockRepository {
    async fn upsert_product(&self, product: &Product) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO products (id, store_id, available_quantity)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO UPDATE
            SET store_id = EXCLUDED.store_id,
                available_quantity = EXCLUDED.available_quantity,
                updated_at = now()
            "#,
        )
        .bind(product.id.as_str())
        .bind(product.store_id.as_uuid())
        .bind(i64::from(product.available_quantity))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn product(&self, id: &ProductId) -> Result<Option<Product>> {
        let row = sqlx::query("SELECT id, store_id, available_quantity FROM products WHERE id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|row| -> Result<Product> {
            Ok(Product {
                id: ProductId::new(row.try_get::<String, _>("id")?),
                store_id: StoreId::from_uuid(row.try_get::<Uuid, _>("store_id")?),
                available_quantity: row.try_get::<i64, _>("available_quantity")? as u32,
            })
        })
        .transpose()
    }

    async fn reserve(&self, id: &ProductId, quantity: u32) -> Result<ReserveOne> {
        let mut conn = self.pool.acquire().await?;
        if let Some(remaining) = decrement(&mut conn, id, None, quantity).await? {
            return Ok(ReserveOne::accepted(remaining));
        }
        match current_quantity(&mut conn, id, None).await? {
            Some(available) => Ok(ReserveOne::refused(available)),
            None => Err(InventoryError::UnknownProduct(id.clone())),
        }
    }

    async fn reserve_for_order(
        &self,
        key: &EventKey,
        request: &StockReservationRequested,
    ) -> Result<ReservationOutcome> {
        let mut tx = self.pool.begin().await?;
        if !outbox_pg::try_claim(&mut tx, key).await? {
            return Ok(ReservationOutcome::Duplicate);
        }

        let mut lines = merge_lines(&request.items);
        // Fixed lock order so two batches over the same products cannot deadlock.
        lines.sort_by(|a, b| a.product_id.as_str().cmp(b.product_id.as_str()));
        let mut savepoint = tx.begin().await?;
        let outcome = match decrement_all(&mut savepoint, request.store_id, &lines).await? {
            Ok(()) => {
                for line in &lines {
                    sqlx::query(
                        r#"
                        INSERT INTO stock_reservations (order_id, attempt, product_id, quantity, state)
                        VALUES ($1, $2, $3, $4, $5)
                        "#,
                    )
                    .bind(request.order_id.as_uuid())
                    .bind(request.attempt as i32)
                    .bind(line.product_id.as_str())
                    .bind(i64::from(line.quantity))
                    .bind(ReservationState::Reserved.as_str())
                    .execute(&mut *savepoint)
                    .await?;
                }
                savepoint.commit().await?;
                outbox_pg::enqueue(&mut tx, &replies::reserved(request)?).await?;
                ReservationOutcome::Reserved { lines }
            }
            Err(failure) => {
                savepoint.rollback().await?;
                outbox_pg::enqueue(&mut tx, &replies::refused(request, &failure)?).await?;
                ReservationOutcome::Refused(failure)
            }
        };

        tx.commit().await?;
        Ok(outcome)
    }

    async fn release_for_order(
        &self,
        key: &EventKey,
        order_id: OrderId,
        attempt: u32,
    ) -> Result<ReleaseOutcome> {
        let mut tx = self.pool.begin().await?;
        let rows = sqlx::query(
            r#"
            SELECT product_id, quantity
            FROM stock_reservations
            WHERE order_id = $1 AND attempt = $2 AND state = $3
            ORDER BY product_id
            FOR UPDATE
            "#,
        )
        .bind(order_id.as_uuid())
        .bind(attempt as i32)
        .bind(ReservationState::Reserved.as_str())
        .fetch_all(&mut *tx)
        .await?;

        if rows.is_empty() {
            return Ok(ReleaseOutcome::NothingHeld);
        }
        if !outbox_pg::try_claim(&mut tx, key).await? {
            return Ok(ReleaseOutcome::Duplicate);
        }

        let mut lines = Vec::with_capacity(rows.len());
        for row in rows {
            let product_id = ProductId::new(row.try_get::<String, _>("product_id")?);
            let quantity = row.try_get::<i64, _>("quantity")?;
            // Saturates like `Product::restore`.
            sqlx::query(
                r#"
                UPDATE products
                SET available_quantity = LEAST(available_quantity + $2, $3), updated_at = now()
                WHERE id = $1
                "#,
            )
            .bind(product_id.as_str())
            .bind(quantity)
            .bind(i64::from(u32::MAX))
            .execute(&mut *tx)
            .await?;
            lines.push(OrderItem::new(product_id, quantity as u32));
        }

        sqlx::query(
            r#"
            UPDATE stock_reservations
            SET state = $3, released_at = now()
            WHERE order_id = $1 AND attempt = $2 AND state = $4
            "#,
        )
        .bind(order_id.as_uuid())
        .bind(attempt as i32)
        .bind(ReservationState::Released.as_str())
        .bind(ReservationState::Reserved.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(ReleaseOutcome::Restored { lines })
    }

    async fn reservation(
        &self,
        order_id: OrderId,
        attempt: u32,
    ) -> Result<Option<StockReservation>> {
        let rows = sqlx::query(
            r#"
            SELECT product_id, quantity, state
            FROM stock_reservations
            WHERE order_id = $1 AND attempt = $2
            ORDER BY product_id
            "#,
        )
        .bind(order_id.as_uuid())
        .bind(attempt as i32)
        .fetch_all(&self.pool)
        .await?;

        let Some(first) = rows.first() else {
            return Ok(None);
        };
        let state: ReservationState = first.try_get::<String, _>("state")?.parse()?;
        let lines = rows
            .iter()
            .map(|row| -> Result<OrderItem> {
                Ok(OrderItem::new(
                    ProductId::new(row.try_get::<String, _>("product_id")?),
                    row.try_get::<i64, _>("quantity")? as u32,
                ))
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Some(StockReservation {
            order_id,
            attempt,
            lines,
            state,
        }))
    }
}
