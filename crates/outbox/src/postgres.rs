//! PostgreSQL backend.
//!
//! Enqueueing and claiming take a `&mut PgConnection` so that callers pass
//! the transaction that carries their business write.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{PgConnection, PgPool, Row, postgres::PgRow};
use uuid::Uuid;

use crate::idempotency::record_duplicate;
use crate::{EventKey, IdempotencyGuard, OutboxId, OutboxRecord, OutboxStore, Result};

/// Schema for the outbox and processed-event tables.
pub const SCHEMA: &str = include_str!("../../../migrations/001_outbox.sql");

/// Creates the outbox tables if they are missing.
pub async fn ensure_schema(pool: &PgPool) -> Result<()> {
    sqlx::raw_sql(SCHEMA).execute(pool).await?;
    Ok(())
}

/// Appends an outbox row inside the caller's transaction.
pub async fn enqueue(conn: &mut PgConnection, record: &OutboxRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO outbox_records (id, aggregate_type, aggregate_id, event_type, payload, created_at)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(record.id.as_uuid())
    .bind(&record.aggregate_type)
    .bind(&record.aggregate_id)
    .bind(&record.event_type)
    .bind(&record.payload)
    .bind(record.created_at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Appends several outbox rows inside the caller's transaction.
pub async fn enqueue_all(conn: &mut PgConnection, records: &[OutboxRecord]) -> Result<()> {
    for record in records {
        enqueue(conn, record).await?;
    }
    Ok(())
}

/// Inserts `key` inside the caller's transaction.
///
/// Returns false when the key already exists. A single
/// `INSERT .. ON CONFLICT DO NOTHING`, so concurrent claimers cannot both win.
pub async fn try_claim(conn: &mut PgConnection, key: &EventKey) -> Result<bool> {
    let result = sqlx::query(
        "INSERT INTO processed_events (event_key) VALUES ($1) ON CONFLICT (event_key) DO NOTHING",
    )
    .bind(key.as_str())
    .execute(&mut *conn)
    .await?;

    let claimed = result.rows_affected() == 1;
    if !claimed {
        record_duplicate(key);
    }
    Ok(claimed)
}

/// Returns whether `key` was claimed already, without claiming it.
pub async fn is_claimed<'e, E>(executor: E, key: &EventKey) -> Result<bool>
where
    E: sqlx::PgExecutor<'e>,
{
    let claimed: bool =
        sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM processed_events WHERE event_key = $1)")
            .bind(key.as_str())
            .fetch_one(executor)
            .await?;
    if claimed {
        record_duplicate(key);
    }
    Ok(claimed)
}

/// Publisher and idempotency view over a service's PostgreSQL database.
#[derive(Clone)]
pub struct PostgresOutbox {
    pool: PgPool,
}

impl PostgresOutbox {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    fn row_to_record(row: PgRow) -> Result<OutboxRecord> {
        Ok(OutboxRecord {
            id: OutboxId::from_uuid(row.try_get::<Uuid, _>("id")?),
            aggregate_type: row.try_get("aggregate_type")?,
            aggregate_id: row.try_get("aggregate_id")?,
            event_type: row.try_get("event_type")?,
            payload: row.try_get("payload")?,
            created_at: row.try_get("created_at")?,
            published: row.try_get("published")?,
            published_at: row.try_get("published_at")?,
            claimed_until: row.try_get("claimed_until")?,
        })
    }
}

#[async_trait]
impl OutboxStore for PostgresOutbox {
    async fn claim_pending(
        &self,
        batch_size: usize,
        lease: Duration,
    ) -> Result<Vec<OutboxRecord>> {
        let lease_secs = lease.num_milliseconds() as f64 / 1000.0;

        // SKIP LOCKED lets concurrent publishers split the backlog instead of
        // queueing behind each other's claims.
        let rows = sqlx::query(
            r#"
            UPDATE outbox_records o
            SET claimed_until = now() + make_interval(secs => $2)
            FROM (
                SELECT id
                FROM outbox_records
                WHERE published = FALSE
                  AND (claimed_until IS NULL OR claimed_until <= now())
                ORDER BY created_at ASC, seq ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            ) claimable
            WHERE o.id = claimable.id
            RETURNING o.seq, o.id, o.aggregate_type, o.aggregate_id, o.event_type, o.payload,
                      o.created_at, o.published, o.published_at, o.claimed_until
            "#,
        )
        .bind(batch_size as i64)
        .bind(lease_secs)
        .fetch_all(&self.pool)
        .await?;

        let mut ordered = rows
            .into_iter()
            .map(|row| -> Result<(i64, OutboxRecord)> {
                let seq: i64 = row.try_get("seq")?;
                Ok((seq, Self::row_to_record(row)?))
            })
            .collect::<Result<Vec<_>>>()?;
        // RETURNING does not preserve the subquery order.
        ordered.sort_by(|(seq_a, a), (seq_b, b)| {
            a.created_at.cmp(&b.created_at).then(seq_a.cmp(seq_b))
        });

        Ok(ordered.into_iter().map(|(_, record)| record).collect())
    }

    async fn mark_published(&self, id: OutboxId) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE outbox_records
            SET published = TRUE, published_at = now(), claimed_until = NULL
            WHERE id = $1 AND published = FALSE
            "#,
        )
        .bind(id.as_uuid())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_claim(&self, id: OutboxId) -> Result<()> {
        sqlx::query(
            "UPDATE outbox_records SET claimed_until = NULL WHERE id = $1 AND published = FALSE",
        )
        .bind(id.as_uuid())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn purge_published(&self, older_than: DateTime<Utc>, batch_size: usize) -> Result<u64> {
        let result = sqlx::query(
            r#"
            DELETE FROM outbox_records
            WHERE id IN (
                SELECT id
                FROM outbox_records
                WHERE published = TRUE AND published_at < $1
                ORDER BY published_at ASC
                LIMIT $2
            )
            "#,
        )
        .bind(older_than)
        .bind(batch_size as i64)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    async fn pending_count(&self) -> Result<u64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM outbox_records WHERE published = FALSE")
                .fetch_one(&self.pool)
                .await?;
        Ok(count as u64)
    }
}

#[async_trait]
impl IdempotencyGuard for PostgresOutbox {
    async fn try_claim(&self, key: &EventKey) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        try_claim(&mut conn, key).await
    }

    async fn purge_claims(&self, older_than: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM processed_events WHERE created_at < $1")
            .bind(older_than)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
