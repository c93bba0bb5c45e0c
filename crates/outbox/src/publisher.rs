//! Relay from a service's outbox table to the message transport.

use std::time::{Duration as StdDuration, Instant};

use chrono::{Duration, Utc};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::{Delivery, MessageTransport, OutboxStore, Result};

/// Tuning for one publisher instance.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    /// Pause between publish passes.
    pub interval: StdDuration,
    /// Maximum rows claimed per pass.
    pub batch_size: usize,
    /// How long a claimed row is reserved for this instance.
    pub claim_lease: Duration,
    /// Published rows older than this are purged.
    pub retention: Duration,
    /// Pause between retention sweeps.
    pub purge_interval: StdDuration,
    /// Maximum rows deleted per purge statement.
    pub purge_batch_size: usize,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            interval: StdDuration::from_secs(2),
            batch_size: 100,
            claim_lease: Duration::seconds(30),
            retention: Duration::days(1),
            purge_interval: StdDuration::from_secs(3600),
            purge_batch_size: 500,
        }
    }
}

/// Outcome of one publish pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PublishReport {
    pub claimed: usize,
    pub published: usize,
    pub failed: usize,
}

/// Periodically forwards committed outbox rows and flags them published.
///
/// A row is flagged only after the transport accepted it. A crash between
/// the two steps re-sends the row on a later pass; consumers absorb the
/// duplicate.
pub struct OutboxPublisher<S, T> {
    service: &'static str,
    store: S,
    transport: T,
    config: PublisherConfig,
}

impl<S, T> OutboxPublisher<S, T>
where
    S: OutboxStore,
    T: MessageTransport,
{
    /// Creates a publisher for the outbox of `service`.
    pub fn new(service: &'static str, store: S, transport: T, config: PublisherConfig) -> Self {
        Self {
            service,
            store,
            transport,
            config,
        }
    }

    pub fn config(&self) -> &PublisherConfig {
        &self.config
    }

    /// Claims one batch of pending rows and relays each to the transport.
    ///
    /// Per-row failures are logged and the row's claim released so the next
    /// pass retries it. Only a failure to claim aborts the pass.
    #[tracing::instrument(skip(self), fields(service = self.service))]
    pub async fn publish_pending(&self) -> Result<PublishReport> {
        let start = Instant::now();
        let records = self
            .store
            .claim_pending(self.config.batch_size, self.config.claim_lease)
            .await?;

        let mut report = PublishReport {
            claimed: records.len(),
            ..PublishReport::default()
        };

        for record in records {
            match self.transport.send(Delivery::from_record(&record)).await {
                Ok(()) => match self.store.mark_published(record.id).await {
                    Ok(true) => report.published += 1,
                    Ok(false) => {
                        tracing::debug!(outbox_id = %record.id, "row already flagged published");
                    }
                    Err(e) => {
                        // The broker has it; the row stays pending and will be sent again.
                        report.failed += 1;
                        tracing::warn!(
                            outbox_id = %record.id,
                            routing_key = %record.event_type,
                            error = %e,
                            "sent but could not flag published"
                        );
                    }
                },
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(
                        outbox_id = %record.id,
                        routing_key = %record.event_type,
                        error = %e,
                        "publish failed, will retry"
                    );
                    if let Err(e) = self.store.release_claim(record.id).await {
                        tracing::warn!(outbox_id = %record.id, error = %e, "could not release claim");
                    }
                }
            }
        }

        metrics::counter!("outbox_published_total", "service" => self.service)
            .increment(report.published as u64);
        metrics::counter!("outbox_publish_failures_total", "service" => self.service)
            .increment(report.failed as u64);
        metrics::histogram!("outbox_publish_pass_seconds", "service" => self.service)
            .record(start.elapsed().as_secs_f64());

        if report.claimed > 0 {
            tracing::debug!(
                claimed = report.claimed,
                published = report.published,
                failed = report.failed,
                "publish pass finished"
            );
        }

        Ok(report)
    }

    /// Deletes published rows past the retention horizon, batch by batch.
    #[tracing::instrument(skip(self), fields(service = self.service))]
    pub async fn purge_expired(&self) -> Result<u64> {
        let horizon = Utc::now() - self.config.retention;
        let batch = self.config.purge_batch_size.max(1);
        let mut total = 0u64;

        loop {
            let removed = self.store.purge_published(horizon, batch).await?;
            total += removed;
            if removed < batch as u64 {
                break;
            }
        }

        if total > 0 {
            metrics::counter!("outbox_purged_total", "service" => self.service).increment(total);
            tracing::info!(removed = total, "purged published outbox rows");
        }
        Ok(total)
    }

    /// Runs publish passes and retention sweeps until `shutdown` flips to true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut publish_tick = tokio::time::interval(self.config.interval);
        publish_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut purge_tick = tokio::time::interval(self.config.purge_interval);
        purge_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!(service = self.service, "outbox publisher started");
        loop {
            tokio::select! {
                _ = publish_tick.tick() => {
                    if let Err(e) = self.publish_pending().await {
                        tracing::warn!(service = self.service, error = %e, "publish pass failed");
                    }
                }
                _ = purge_tick.tick() => {
                    if let Err(e) = self.purge_expired().await {
                        tracing::warn!(service = self.service, error = %e, "retention sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!(service = self.service, "outbox publisher stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::{InMemoryBroker, InMemoryDatabase, OutboxRecord, TransportError};

    type Db = InMemoryDatabase<()>;

    async fn seed(db: &Db, count: usize) {
        let mut tx = db.begin().await;
        for i in 0..count {
            tx.outbox.enqueue(
                OutboxRecord::builder()
                    .aggregate_type("Order")
                    .aggregate_id(i)
                    .event_type("order.preparing")
                    .payload_raw(serde_json::json!({ "n": i }))
                    .try_build()
                    .unwrap(),
            );
        }
        tx.commit();
    }

    fn config() -> PublisherConfig {
        PublisherConfig {
            batch_size: 10,
            ..PublisherConfig::default()
        }
    }

    /// Accepts every other message.
    #[derive(Clone, Default)]
    struct FlakyTransport {
        calls: Arc<AtomicUsize>,
        inner: InMemoryBroker,
    }

    #[async_trait]
    impl MessageTransport for FlakyTransport {
        async fn send(&self, delivery: Delivery) -> std::result::Result<(), TransportError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) % 2 == 1 {
                return Err(TransportError::Unavailable("flaky".into()));
            }
            self.inner.send(delivery).await
        }
    }

    #[tokio::test]
    async fn publishes_and_flags_rows() {
        let db = Db::new();
        let broker = InMemoryBroker::new();
        seed(&db, 3).await;

        let publisher = OutboxPublisher::new("orders", db.clone(), broker.clone(), config());
        let report = publisher.publish_pending().await.unwrap();

        assert_eq!(report.published, 3);
        assert_eq!(report.failed, 0);
        assert_eq!(db.pending_count().await.unwrap(), 0);
        assert_eq!(broker.queued().await, 3);

        // Nothing left for a second pass.
        let report = publisher.publish_pending().await.unwrap();
        assert_eq!(report, PublishReport::default());
    }

    #[tokio::test]
    async fn transport_outage_keeps_rows_pending() {
        let db = Db::new();
        let broker = InMemoryBroker::new();
        seed(&db, 2).await;
        broker.set_fail_sends(true).await;

        let publisher = OutboxPublisher::new("orders", db.clone(), broker.clone(), config());
        let report = publisher.publish_pending().await.unwrap();
        assert_eq!(report.failed, 2);
        assert_eq!(db.pending_count().await.unwrap(), 2);

        broker.set_fail_sends(false).await;
        let report = publisher.publish_pending().await.unwrap();
        assert_eq!(report.published, 2);
        assert_eq!(db.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn partial_failures_are_retried_next_pass() {
        let db = Db::new();
        let transport = FlakyTransport::default();
        seed(&db, 4).await;

        let publisher = OutboxPublisher::new("orders", db.clone(), transport.clone(), config());
        let first = publisher.publish_pending().await.unwrap();
        assert_eq!(first.published, 2);
        assert_eq!(first.failed, 2);

        let mut passes = 0;
        while db.pending_count().await.unwrap() > 0 && passes < 10 {
            publisher.publish_pending().await.unwrap();
            passes += 1;
        }
        assert_eq!(db.pending_count().await.unwrap(), 0);
        assert_eq!(transport.inner.accepted().await.len(), 4);
    }

    #[tokio::test]
    async fn lost_flag_means_resend_not_loss() {
        let db = Db::new();
        let broker = InMemoryBroker::new();
        seed(&db, 1).await;

        // Simulate a crash after the send: deliver, but never flag.
        let claimed = db.claim_pending(10, Duration::zero()).await.unwrap();
        broker.send(Delivery::from_record(&claimed[0])).await.unwrap();

        let publisher = OutboxPublisher::new("orders", db.clone(), broker.clone(), config());
        publisher.publish_pending().await.unwrap();

        let sent = broker.accepted().await;
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].message_id, sent[1].message_id);
        assert_eq!(db.pending_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn two_publishers_never_double_send() {
        let db = Db::new();
        let broker = InMemoryBroker::new();
        seed(&db, 20).await;

        let a = OutboxPublisher::new("orders", db.clone(), broker.clone(), config());
        let b = OutboxPublisher::new("orders", db.clone(), broker.clone(), config());
        while db.pending_count().await.unwrap() > 0 {
            let (ra, rb) = tokio::join!(a.publish_pending(), b.publish_pending());
            ra.unwrap();
            rb.unwrap();
        }

        let mut ids: Vec<_> = broker
            .accepted()
            .await
            .into_iter()
            .map(|d| d.message_id)
            .collect();
        let total = ids.len();
        ids.sort_by_key(|id| id.as_uuid());
        ids.dedup();
        assert_eq!(total, 20);
        assert_eq!(ids.len(), 20);
    }

    #[tokio::test]
    async fn purge_loops_over_batches() {
        let db = Db::new();
        let broker = InMemoryBroker::new();
        seed(&db, 5).await;

        let publisher = OutboxPublisher::new(
            "orders",
            db.clone(),
            broker,
            PublisherConfig {
                retention: Duration::seconds(-1),
                purge_batch_size: 2,
                ..config()
            },
        );
        publisher.publish_pending().await.unwrap();

        assert_eq!(publisher.purge_expired().await.unwrap(), 5);
        db.read(|t| assert!(t.outbox.records().is_empty())).await;
    }

    #[tokio::test]
    async fn run_stops_on_shutdown() {
        let db = Db::new();
        let broker = InMemoryBroker::new();
        seed(&db, 1).await;

        let (tx, rx) = watch::channel(false);
        let publisher = OutboxPublisher::new(
            "orders",
            db.clone(),
            broker.clone(),
            PublisherConfig {
                interval: StdDuration::from_millis(10),
                ..config()
            },
        );
        let handle = tokio::spawn(publisher.run(rx));

        let delivery = tokio::time::timeout(StdDuration::from_secs(5), broker.recv())
            .await
            .unwrap();
        assert_eq!(delivery.routing_key, "order.preparing");

        tx.send(true).unwrap();
        tokio::time::timeout(StdDuration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
