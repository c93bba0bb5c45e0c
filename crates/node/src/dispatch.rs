//! Routes broker deliveries to the consuming services.

use std::sync::Arc;

use courier::{CourierError, CourierRepository, CourierService};
use domain::messages::routing;
use inventory::{InventoryError, StockRepository, StockService};
use outbox::{ConsumeOutcome, Delivery, InMemoryBroker};
use saga::{OrderRepository, OrderSaga, SagaError};
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::sync::watch;

/// Failure to consume one delivery.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The payload does not match the contract of its routing key.
    #[error("undecodable {routing_key} payload: {source}")]
    Decode {
        routing_key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Saga(#[from] SagaError),

    #[error(transparent)]
    Inventory(#[from] InventoryError),

    #[error(transparent)]
    Courier(#[from] CourierError),
}

impl DispatchError {
    /// Returns true when redelivering the same message cannot succeed.
    pub fn is_permanent(&self) -> bool {
        match self {
            DispatchError::Decode { .. } => true,
            DispatchError::Saga(e) => e.is_invariant_violation(),
            DispatchError::Inventory(_) | DispatchError::Courier(_) => false,
        }
    }
}

/// What the dispatcher did with one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Every consumer handled it; one outcome per consumer.
    Consumed(Vec<(&'static str, ConsumeOutcome)>),
    Requeued,
    DeadLettered,
}

/// Consumes the shared broker queue on behalf of every service.
pub struct Dispatcher<O, S, C>
where
    O: OrderRepository,
    S: StockRepository,
    C: CourierRepository,
{
    saga: Arc<OrderSaga<O>>,
    stock: Arc<StockService<S>>,
    couriers: Arc<CourierService<C>>,
    broker: InMemoryBroker,
    max_attempts: u32,
}

impl<O, S, C> Dispatcher<O, S, C>
where
    O: OrderRepository,
    S: StockRepository,
    C: CourierRepository,
{
    pub fn new(
        saga: Arc<OrderSaga<O>>,
        stock: Arc<StockService<S>>,
        couriers: Arc<CourierService<C>>,
        broker: InMemoryBroker,
        max_attempts: u32,
    ) -> Self {
        Self {
            saga,
            stock,
            couriers,
            broker,
            max_attempts: max_attempts.max(1),
        }
    }

    /// Hands one delivery to every consumer of its routing key.
    ///
    /// Keys nobody consumes here (status notices for clients) yield an empty
    /// list.
    pub async fn dispatch(
        &self,
        delivery: &Delivery,
    ) -> Result<Vec<(&'static str, ConsumeOutcome)>, DispatchError> {
        let outcomes = match delivery.routing_key.as_str() {
            routing::STOCK_RESERVATION_REQUESTED => vec![(
                "inventory",
                self.stock
                    .handle_reservation_request(&decode(delivery)?)
                    .await?,
            )],
            routing::STOCK_RELEASE_REQUESTED => vec![(
                "inventory",
                self.stock.handle_release_requested(&decode(delivery)?).await?,
            )],
            routing::ORDER_PREPARING => vec![(
                "courier",
                self.couriers.handle_order_preparing(&decode(delivery)?).await?,
            )],
            routing::ORDER_DELIVERED => vec![(
                "courier",
                self.couriers.handle_order_delivered(&decode(delivery)?).await?,
            )],
            routing::COURIER_RELEASE_REQUESTED => vec![(
                "courier",
                self.couriers
                    .handle_release_requested(&decode(delivery)?)
                    .await?,
            )],
            routing::ORDER_CANCELLED => {
                let msg = decode(delivery)?;
                vec![
                    ("inventory", self.stock.handle_order_cancelled(&msg).await?),
                    ("courier", self.couriers.handle_order_cancelled(&msg).await?),
                ]
            }
            routing::STOCK_RESERVED => vec![(
                "order",
                self.saga.handle_stock_reserved(&decode(delivery)?).await?,
            )],
            routing::STOCK_RESERVATION_FAILED => vec![(
                "order",
                self.saga
                    .handle_stock_reservation_failed(&decode(delivery)?)
                    .await?,
            )],
            routing::COURIER_ASSIGNED => vec![(
                "order",
                self.saga.handle_courier_assigned(&decode(delivery)?).await?,
            )],
            routing::COURIER_ASSIGNMENT_FAILED => vec![(
                "order",
                self.saga
                    .handle_courier_assignment_failed(&decode(delivery)?)
                    .await?,
            )],
            _ => Vec::new(),
        };
        Ok(outcomes)
    }

    /// Dispatches one delivery and settles it with the broker: transient
    /// failures are requeued until the attempt limit, everything else that
    /// fails is dead-lettered.
    #[tracing::instrument(skip(self, delivery), fields(routing_key = %delivery.routing_key, message_id = %delivery.message_id, attempt = delivery.attempt))]
    pub async fn handle(&self, delivery: Delivery) -> Disposition {
        match self.dispatch(&delivery).await {
            Ok(outcomes) => {
                for (consumer, outcome) in &outcomes {
                    tracing::debug!(consumer, outcome = outcome.as_str(), "delivery consumed");
                    metrics::counter!(
                        "messages_consumed_total",
                        "consumer" => *consumer,
                        "outcome" => outcome.as_str()
                    )
                    .increment(1);
                }
                Disposition::Consumed(outcomes)
            }
            Err(e) if e.is_permanent() => {
                tracing::error!(error = %e, "dead-lettering message that cannot be processed");
                metrics::counter!("messages_dead_lettered_total").increment(1);
                self.broker.dead_letter(delivery, e.to_string()).await;
                Disposition::DeadLettered
            }
            Err(e) if delivery.attempt >= self.max_attempts => {
                tracing::error!(error = %e, "giving up after repeated failures");
                metrics::counter!("messages_dead_lettered_total").increment(1);
                self.broker.dead_letter(delivery, e.to_string()).await;
                Disposition::DeadLettered
            }
            Err(e) => {
                tracing::warn!(error = %e, "consumer failed, requeueing");
                self.broker.requeue(delivery).await;
                Disposition::Requeued
            }
        }
    }

    /// Handles everything currently queued. Returns how many deliveries were
    /// taken off the queue.
    pub async fn drain(&self) -> usize {
        let mut handled = 0;
        while let Some(delivery) = self.broker.try_recv().await {
            self.handle(delivery).await;
            handled += 1;
        }
        handled
    }

    /// Consumes the queue until `shutdown` flips to true.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!("dispatcher started");
        loop {
            tokio::select! {
                delivery = self.broker.recv() => {
                    self.handle(delivery).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        tracing::info!("dispatcher stopped");
    }
}

fn decode<T: DeserializeOwned>(delivery: &Delivery) -> Result<T, DispatchError> {
    delivery.decode().map_err(|source| DispatchError::Decode {
        routing_key: delivery.routing_key.clone(),
        source,
    })
}
