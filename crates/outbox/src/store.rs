use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::{OutboxId, OutboxRecord, Result};

/// Publisher-side view of a service's outbox table.
///
/// Rows are never inserted through this trait: enqueueing is only possible
/// through a transaction handle of the owning service, so an outbox row
/// cannot outlive a rolled-back business write.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Claims up to `batch_size` committed, unpublished rows, oldest first.
    ///
    /// Claimed rows carry a lease of `lease` during which no other publisher
    /// instance will receive them. Rows whose lease expired are claimable
    /// again.
    async fn claim_pending(&self, batch_size: usize, lease: Duration)
    -> Result<Vec<OutboxRecord>>;

    /// Flags a row published. Returns false if it was already published.
    async fn mark_published(&self, id: OutboxId) -> Result<bool>;

    /// Drops the lease on a row so the next pass can retry it.
    async fn release_claim(&self, id: OutboxId) -> Result<()>;

    /// Deletes at most `batch_size` published rows published before
    /// `older_than`. Unpublished rows are never deleted.
    async fn purge_published(&self, older_than: DateTime<Utc>, batch_size: usize) -> Result<u64>;

    /// Number of rows still waiting for publication.
    async fn pending_count(&self) -> Result<u64>;
}
