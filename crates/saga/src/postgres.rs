//! PostgreSQL order repository.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{Address, ConcurrencyToken, CourierId, OrderId, StoreId, UserId};
use domain::{Order, OrderItem, OrderStatus};
use outbox::{EventKey, OutboxRecord, postgres as outbox_pg};
use sqlx::types::Json;
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::Result;
use crate::repository::{OrderRepository, SaveOutcome};

/// Schema for orders.
pub const SCHEMA: &str = include_str!("../../../migrations/002_orders.sql");

const COLUMNS: &str = "id, user_id, store_id, courier_id, items, pickup_address, \
     shipping_address, status, reservation_attempt, token, created_at, updated_at";

/// PostgreSQL implementation of [`OrderRepository`].
#[derive(Clone)]
pub struct PostgresOrderRepository {
    pool: PgPool,
}

impl PostgresOrderRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates the outbox and order tables if they are missing.
    pub async fn ensure_schema(&self) -> Result<()> {
        outbox_pg::ensure_schema(&self.pool).await?;
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    fn row_to_order(row: PgRow) -> Result<Order> {
        Ok(Order {
            id: OrderId::from_uuid(row.try_get::<Uuid, _>("id")?),
            user_id: UserId::from_uuid(row.try_get::<Uuid, _>("user_id")?),
            store_id: StoreId::from_uuid(row.try_get::<Uuid, _>("store_id")?),
            courier_id: row
                .try_get::<Option<Uuid>, _>("courier_id")?
                .map(CourierId::from_uuid),
            items: row.try_get::<Json<Vec<OrderItem>>, _>("items")?.0,
            pickup_address: row.try_get::<Json<Address>, _>("pickup_address")?.0,
            shipping_address: row.try_get::<Json<Address>, _>("shipping_address")?.0,
            status: row.try_get::<String, _>("status")?.parse()?,
            reservation_attempt: row.try_get::<i32, _>("reservation_attempt")? as u32,
            token: ConcurrencyToken::new(row.try_get("token")?),
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl OrderRepository for PostgresOrderRepository {
    async fn insert(&self, order: &Order) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO orders ({COLUMNS}) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)"
        ))
        .bind(order.id.as_uuid())
        .bind(order.user_id.as_uuid())
        .bind(order.store_id.as_uuid())
        .bind(order.courier_id.map(|c| c.as_uuid()))
        .bind(Json(&order.items))
        .bind(Json(&order.pickup_address))
        .bind(Json(&order.shipping_address))
        .bind(order.status.as_str())
        .bind(order.reservation_attempt as i32)
        .bind(order.token.as_i64())
        .bind(order.created_at)
        .bind(order.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: OrderId) -> Result<Option<Order>> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM orders WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        row.map(Self::row_to_order).transpose()
    }

    async fn save(
        &self,
        next: &Order,
        expected: ConcurrencyToken,
        claim: Option<&EventKey>,
        outbox: &[OutboxRecord],
    ) -> Result<SaveOutcome> {
        let mut tx = self.pool.begin().await?;
        if let Some(key) = claim {
            if !outbox_pg::try_claim(&mut tx, key).await? {
                return Ok(SaveOutcome::Duplicate);
            }
        }

        let result = sqlx::query(
            r#"
            UPDATE orders
            SET status = $3,
                courier_id = $4,
                reservation_attempt = $5,
                token = $6,
                updated_at = $7
            WHERE id = $1 AND token = $2
            "#,
        )
        .bind(next.id.as_uuid())
        .bind(expected.as_i64())
        .bind(next.status.as_str())
        .bind(next.courier_id.map(|c| c.as_uuid()))
        .bind(next.reservation_attempt as i32)
        .bind(next.token.as_i64())
        .bind(next.updated_at)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(SaveOutcome::Conflict);
        }
        outbox_pg::enqueue_all(&mut tx, outbox).await?;
        tx.commit().await?;
        Ok(SaveOutcome::Saved)
    }

    async fn is_claimed(&self, key: &EventKey) -> Result<bool> {
        Ok(outbox_pg::is_claimed(&self.pool, key).await?)
    }

    async fn find_stalled(
        &self,
        statuses: &[OrderStatus],
        updated_before: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Order>> {
        let statuses: Vec<&str> = statuses.iter().map(|s| s.as_str()).collect();
        let rows = sqlx::query(&format!(
            r#"
            SELECT {COLUMNS} FROM orders
            WHERE status = ANY($1) AND updated_at < $2
            ORDER BY updated_at ASC, id ASC
            LIMIT $3
            "#
        ))
        .bind(&statuses)
        .bind(updated_before)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Self::row_to_order).collect()
    }
}
