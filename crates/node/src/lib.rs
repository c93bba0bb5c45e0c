//! Runnable fulfillment node.
//!
//! Hosts the order, inventory and courier services in one process, each
//! with its own store and outbox, connected through an in-process
//! at-least-once broker. Exposes `/health` and `/metrics`.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod routes;

use std::sync::Arc;
use std::time::Duration as StdDuration;

use axum::Router;
use axum::routing::get;
use chrono::{Duration, Utc};
use courier::{CourierRepository, CourierService, InMemoryCourierRepository, PostgresCourierRepository};
use inventory::{InMemoryStockRepository, PostgresStockRepository, StockRepository, StockService};
use metrics_exporter_prometheus::PrometheusHandle;
use outbox::{
    IdempotencyGuard, InMemoryBroker, InMemoryDatabase, OutboxPublisher, OutboxStore,
    PostgresOutbox, PublisherConfig,
};
use saga::{InMemoryOrderRepository, OrderRepository, OrderSaga, PostgresOrderRepository};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tower_http::trace::TraceLayer;

pub use config::Config;
pub use dispatch::{DispatchError, Dispatcher, Disposition};
pub use error::NodeError;
use routes::health::HealthState;

/// A repository that can hand out a publisher/idempotency view of the same
/// database it writes to.
pub trait Outboxed {
    type Store: OutboxStore + IdempotencyGuard + Clone + 'static;

    fn outbox_store(&self) -> Self::Store;
}

macro_rules! outboxed_in_memory {
    ($($repo:ty => $tables:ty),* $(,)?) => {
        $(
            impl Outboxed for $repo {
                type Store = InMemoryDatabase<$tables>;

                fn outbox_store(&self) -> Self::Store {
                    self.database().clone()
                }
            }
        )*
    };
}

macro_rules! outboxed_postgres {
    ($($repo:ty),* $(,)?) => {
        $(
            impl Outboxed for $repo {
                type Store = PostgresOutbox;

                fn outbox_store(&self) -> Self::Store {
                    PostgresOutbox::new(self.pool().clone())
                }
            }
        )*
    };
}

outboxed_in_memory!(
    InMemoryOrderRepository => saga::OrderTables,
    InMemoryStockRepository => inventory::StockTables,
    InMemoryCourierRepository => courier::CourierTables,
);
outboxed_postgres!(
    PostgresOrderRepository,
    PostgresStockRepository,
    PostgresCourierRepository,
);

/// The three services and the broker that connects them.
pub struct Node<O, S, C>
where
    O: OrderRepository + Outboxed,
    S: StockRepository + Outboxed,
    C: CourierRepository + Outboxed,
{
    pub saga: Arc<OrderSaga<O>>,
    pub stock: Arc<StockService<S>>,
    pub couriers: Arc<CourierService<C>>,
    pub broker: InMemoryBroker,
}

/// A node backed entirely by in-memory stores.
pub type InMemoryNode = Node<InMemoryOrderRepository, InMemoryStockRepository, InMemoryCourierRepository>;

/// A node backed by one PostgreSQL database per service.
pub type PostgresNode =
    Node<PostgresOrderRepository, PostgresStockRepository, PostgresCourierRepository>;

impl InMemoryNode {
    pub fn in_memory() -> Self {
        Node::new(
            InMemoryOrderRepository::new(),
            InMemoryStockRepository::new(),
            InMemoryCourierRepository::new(),
        )
    }
}

impl<O, S, C> Node<O, S, C>
where
    O: OrderRepository + Outboxed + 'static,
    S: StockRepository + Outboxed + 'static,
    C: CourierRepository + Outboxed + 'static,
{
    pub fn new(orders: O, stock: S, couriers: C) -> Self {
        Self {
            saga: Arc::new(OrderSaga::new(orders)),
            stock: Arc::new(StockService::new(stock)),
            couriers: Arc::new(CourierService::new(couriers)),
            broker: InMemoryBroker::new(),
        }
    }

    pub fn dispatcher(&self, max_attempts: u32) -> Dispatcher<O, S, C> {
        Dispatcher::new(
            self.saga.clone(),
            self.stock.clone(),
            self.couriers.clone(),
            self.broker.clone(),
            max_attempts,
        )
    }

    pub fn order_publisher(
        &self,
        config: PublisherConfig,
    ) -> OutboxPublisher<O::Store, InMemoryBroker> {
        OutboxPublisher::new(
            "orders",
            self.saga.repository().outbox_store(),
            self.broker.clone(),
            config,
        )
    }

    pub fn stock_publisher(
        &self,
        config: PublisherConfig,
    ) -> OutboxPublisher<S::Store, InMemoryBroker> {
        OutboxPublisher::new(
            "inventory",
            self.stock.repository().outbox_store(),
            self.broker.clone(),
            config,
        )
    }

    pub fn courier_publisher(
        &self,
        config: PublisherConfig,
    ) -> OutboxPublisher<C::Store, InMemoryBroker> {
        OutboxPublisher::new(
            "couriers",
            self.couriers.repository().outbox_store(),
            self.broker.clone(),
            config,
        )
    }

    pub fn health_state(&self) -> HealthState {
        let orders: Arc<dyn OutboxStore> = Arc::new(self.saga.repository().outbox_store());
        let inventory: Arc<dyn OutboxStore> = Arc::new(self.stock.repository().outbox_store());
        let couriers: Arc<dyn OutboxStore> = Arc::new(self.couriers.repository().outbox_store());
        HealthState {
            outboxes: vec![
                ("orders", orders),
                ("inventory", inventory),
                ("couriers", couriers),
            ],
        }
    }

    /// Starts the retention sweep of every service's processed keys.
    pub fn spawn_claim_retention(
        &self,
        retention: Duration,
        interval: StdDuration,
        shutdown: &watch::Receiver<bool>,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        vec![
            tokio::spawn(purge_claims_periodically(
                "orders",
                self.saga.repository().outbox_store(),
                retention,
                interval,
                shutdown.clone(),
            )),
            tokio::spawn(purge_claims_periodically(
                "inventory",
                self.stock.repository().outbox_store(),
                retention,
                interval,
                shutdown.clone(),
            )),
            tokio::spawn(purge_claims_periodically(
                "couriers",
                self.couriers.repository().outbox_store(),
                retention,
                interval,
                shutdown.clone(),
            )),
        ]
    }
}

async fn purge_claims_periodically<G: IdempotencyGuard + 'static>(
    service: &'static str,
    guard: G,
    retention: Duration,
    interval: StdDuration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = tick.tick() => {
                match guard.purge_claims(Utc::now() - retention).await {
                    Ok(0) => {}
                    Ok(removed) => tracing::info!(service, removed, "purged processed event keys"),
                    Err(e) => tracing::warn!(service, error = %e, "idempotency retention sweep failed"),
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
}

/// Creates the Axum application router.
pub fn create_app(health: HealthState, metrics_handle: PrometheusHandle) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::render))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .with_state(health)
        .merge(metrics_router)
        .layer(TraceLayer::new_for_http())
}
