//! Timeout-driven compensation for saga steps whose reply never arrives.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use domain::OrderStatus;
use outbox::ConsumeOutcome;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::Result;
use crate::repository::OrderRepository;
use crate::service::OrderSaga;

/// Reason carried by the synthetic failure of a stalled step.
pub const TIMED_OUT: &str = "timed out";

/// Statuses in which the order waits on another service.
pub const WAITING_STATUSES: [OrderStatus; 3] = [
    OrderStatus::ReservingStock,
    OrderStatus::Preparing,
    OrderStatus::AwaitingCourier,
];

#[derive(Debug, Clone)]
pub struct ReaperConfig {
    /// A waiting order untouched for this long is failed.
    pub step_timeout: Duration,
    /// Pause between sweeps.
    pub interval: StdDuration,
    /// Maximum orders handled per sweep.
    pub batch_size: usize,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            step_timeout: Duration::minutes(5),
            interval: StdDuration::from_secs(30),
            batch_size: 100,
        }
    }
}

/// Fails stalled saga steps as if the matching failure reply had arrived.
pub struct SagaReaper<R: OrderRepository> {
    saga: Arc<OrderSaga<R>>,
    config: ReaperConfig,
}

impl<R: OrderRepository> SagaReaper<R> {
    pub fn new(saga: Arc<OrderSaga<R>>, config: ReaperConfig) -> Self {
        Self { saga, config }
    }

    /// One sweep. Returns how many orders were moved.
    pub async fn sweep(&self) -> Result<usize> {
        let cutoff = Utc::now() - self.config.step_timeout;
        let stalled = self
            .saga
            .repository()
            .find_stalled(&WAITING_STATUSES, cutoff, self.config.batch_size)
            .await?;

        let mut moved = 0;
        for order in &stalled {
            match self.saga.time_out(order, TIMED_OUT).await {
                Ok(ConsumeOutcome::Applied) => {
                    tracing::warn!(order_id = %order.id, status = %order.status, "saga step timed out");
                    metrics::counter!("saga_timeouts_total", "status" => order.status.as_str())
                        .increment(1);
                    moved += 1;
                }
                // A reply won the race.
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(order_id = %order.id, error = %e, "failed to time out saga step");
                }
            }
        }
        Ok(moved)
    }

    /// Sweeps on the configured interval until `shutdown` flips to true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(self.config.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        tracing::info!("saga reaper started");
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = self.sweep().await {
                        tracing::warn!(error = %e, "reaper sweep failed");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("saga reaper stopped");
    }
}
