//! PostgreSQL courier repository.

use async_trait::async_trait;
use common::{ConcurrencyToken, CourierId, GeoPoint, OrderId};
use domain::{Candidate, Courier, CourierStatus};
use outbox::{EventKey, OutboxRecord, postgres as outbox_pg};
use sqlx::{PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::repository::{AssignAttempt, CourierRepository, ReleaseOutcome};
use crate::{CourierError, Result};

/// Schema for couriers.
pub const SCHEMA: &str = include_str!("../../../migrations/004_couriers.sql");

const COLUMNS: &str =
    "id, name, status, latitude, longitude, current_order_id, token, updated_at";

/// PostgreSQL implementation of [`CourierRepository`].
#[derive(Clone)]
pub struct PostgresCourierRepository {
    pool: PgPool,
}

impl PostgresCourierRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Creates the outbox and courier tables if they are missing.
    pub async fn ensure_schema(&self) -> Result<()> {
        outbox_pg::ensure_schema(&self.pool).await?;
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }

    fn row_to_courier(row: PgRow) -> Result<Courier> {
        let latitude: Option<f64> = row.try_get("latitude")?;
        let longitude: Option<f64> = row.try_get("longitude")?;

        Ok(Courier {
            id: CourierId::from_uuid(row.try_get::<Uuid, _>("id")?),
            name: row.try_get("name")?,
            status: row.try_get::<String, _>("status")?.parse()?,
            location: latitude
                .zip(longitude)
                .map(|(lat, lon)| GeoPoint::new(lat, lon)),
            current_order_id: row
                .try_get::<Option<Uuid>, _>("current_order_id")?
                .map(OrderId::from_uuid),
            token: ConcurrencyToken::new(row.try_get("token")?),
            updated_at: row.try_get("updated_at")?,
        })
    }
}

#[async_trait]
impl CourierRepository for PostgresCourierRepository {
    async fn upsert(&self, courier: &Courier) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO couriers (id, name, status, latitude, longitude, current_order_id, token, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE
            SET name = EXCLUDED.name,
                status = EXCLUDED.status,
                latitude = EXCLUDED.latitude,
                longitude = EXCLUDED.longitude,
                current_order_id = EXCLUDED.current_order_id,
                token = EXCLUDED.token,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(courier.id.as_uuid())
        .bind(&courier.name)
        .bind(courier.status.as_str())
        .bind(courier.location.map(|l| l.latitude))
        .bind(courier.location.map(|l| l.longitude))
        .bind(courier.current_order_id.map(|o| o.as_uuid()))
        .bind(courier.token.as_i64())
        .bind(courier.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, id: CourierId) -> Result<Option<Courier>> {
        let row = sqlx::query(&format!("SELECT {COLUMNS} FROM couriers WHERE id = $1"))
            .bind(id.as_uuid())
            .fetch_optional(&self.pool)
            .await?;
        row.map(Self::row_to_courier).transpose()
    }

    async fn available(&self) -> Result<Vec<Courier>> {
        let rows = sqlx::query(&format!(
            "SELECT {COLUMNS} FROM couriers WHERE status = $1 ORDER BY updated_at ASC, id ASC"
        ))
        .bind(CourierStatus::Available.as_str())
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Self::row_to_courier).collect()
    }

    async fn update_location(&self, id: CourierId, location: GeoPoint) -> Result<()> {
        let result = sqlx::query(
            "UPDATE couriers SET latitude = $2, longitude = $3, updated_at = now() WHERE id = $1",
        )
        .bind(id.as_uuid())
        .bind(location.latitude)
        .bind(location.longitude)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CourierError::UnknownCourier(id));
        }
        Ok(())
    }

    async fn set_on_duty(&self, id: CourierId, on_duty: bool) -> Result<bool> {
        let status = if on_duty {
            CourierStatus::Available
        } else {
            CourierStatus::Offline
        };
        let result = sqlx::query(
            r#"
            UPDATE couriers
            SET status = $2, token = token + 1, updated_at = now()
            WHERE id = $1 AND status <> $3
            "#,
        )
        .bind(id.as_uuid())
        .bind(status.as_str())
        .bind(CourierStatus::Busy.as_str())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }
        match self.get(id).await? {
            Some(_) => Ok(false),
            None => Err(CourierError::UnknownCourier(id)),
        }
    }

    async fn try_assign(
        &self,
        key: &EventKey,
        candidate: &Candidate,
        order_id: OrderId,
        assigned: OutboxRecord,
    ) -> Result<AssignAttempt> {
        let mut tx = self.pool.begin().await?;
        if !outbox_pg::try_claim(&mut tx, key).await? {
            return Ok(AssignAttempt::Duplicate);
        }

        // Row lock for the whole read-check-write; a concurrent attempt on
        // the same courier waits here and then sees the new token.
        let row = sqlx::query("SELECT status, token FROM couriers WHERE id = $1 FOR UPDATE")
            .bind(candidate.courier_id.as_uuid())
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            return Ok(AssignAttempt::Stale);
        };
        let status: CourierStatus = row.try_get::<String, _>("status")?.parse()?;
        let token = ConcurrencyToken::new(row.try_get("token")?);
        if status != CourierStatus::Available || token != candidate.token {
            return Ok(AssignAttempt::Stale);
        }

        sqlx::query(
            r#"
            UPDATE couriers
            SET status = $2, current_order_id = $3, token = token + 1, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(candidate.courier_id.as_uuid())
        .bind(CourierStatus::Busy.as_str())
        .bind(order_id.as_uuid())
        .execute(&mut *tx)
        .await?;
        outbox_pg::enqueue(&mut tx, &assigned).await?;

        tx.commit().await?;
        Ok(AssignAttempt::Assigned)
    }

    async fn record_failure(&self, key: &EventKey, failed: OutboxRecord) -> Result<bool> {
        let mut tx = self.pool.begin().await?;
        if !outbox_pg::try_claim(&mut tx, key).await? {
            return Ok(false);
        }
        outbox_pg::enqueue(&mut tx, &failed).await?;
        tx.commit().await?;
        Ok(true)
    }

    async fn release(
        &self,
        key: &EventKey,
        order_id: OrderId,
        courier_id: Option<CourierId>,
    ) -> Result<ReleaseOutcome> {
        let mut tx = self.pool.begin().await?;
        let bound: Option<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM couriers
            WHERE current_order_id = $1 AND ($2::uuid IS NULL OR id = $2)
            FOR UPDATE
            "#,
        )
        .bind(order_id.as_uuid())
        .bind(courier_id.map(|c| c.as_uuid()))
        .fetch_optional(&mut *tx)
        .await?;

        let Some(bound) = bound else {
            return Ok(ReleaseOutcome::NotBound);
        };
        if !outbox_pg::try_claim(&mut tx, key).await? {
            return Ok(ReleaseOutcome::Duplicate);
        }

        sqlx::query(
            r#"
            UPDATE couriers
            SET status = $2, current_order_id = NULL, token = token + 1, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(bound)
        .bind(CourierStatus::Available.as_str())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(ReleaseOutcome::Released {
            courier_id: CourierId::from_uuid(bound),
        })
    }
}
