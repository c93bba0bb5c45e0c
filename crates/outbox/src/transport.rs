//! Message transport seam and an in-process broker.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, Notify};

use crate::{OutboxId, OutboxRecord};

/// Errors reported by a message transport.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The broker could not be reached.
    #[error("transport unavailable: {0}")]
    Unavailable(String),

    /// The broker refused the message.
    #[error("message {routing_key} rejected: {reason}")]
    Rejected { routing_key: String, reason: String },
}

/// One message as seen on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    /// Outbox row the message was relayed from. Stable across redeliveries.
    pub message_id: OutboxId,
    pub routing_key: String,
    pub payload: serde_json::Value,
    /// 1 on first delivery, incremented on every redelivery.
    pub attempt: u32,
}

impl Delivery {
    pub fn from_record(record: &OutboxRecord) -> Self {
        Self {
            message_id: record.id,
            routing_key: record.event_type.clone(),
            payload: record.payload.clone(),
            attempt: 1,
        }
    }

    /// Deserializes the payload into a message contract.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.payload)
    }
}

/// Hands messages to the broker under their routing key.
///
/// Success means the broker accepted responsibility for the message. The
/// transport promises at-least-once delivery and per-queue ordering only.
#[async_trait]
pub trait MessageTransport: Send + Sync {
    async fn send(&self, delivery: Delivery) -> Result<(), TransportError>;
}

#[derive(Debug, Default)]
struct BrokerState {
    queue: VecDeque<Delivery>,
    accepted: Vec<Delivery>,
    dead_letters: Vec<(Delivery, String)>,
    fail_sends: bool,
}

/// In-process at-least-once broker.
///
/// A single queue shared by every consumer in the process; consumers fan
/// out by routing key themselves.
#[derive(Debug, Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    ready: Arc<Notify>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent send fail until reset.
    pub async fn set_fail_sends(&self, fail: bool) {
        self.state.lock().await.fail_sends = fail;
    }

    /// Takes the next queued message without waiting.
    pub async fn try_recv(&self) -> Option<Delivery> {
        self.state.lock().await.queue.pop_front()
    }

    /// Waits for the next queued message.
    pub async fn recv(&self) -> Delivery {
        loop {
            let ready = self.ready.notified();
            if let Some(delivery) = self.state.lock().await.queue.pop_front() {
                return delivery;
            }
            ready.await;
        }
    }

    /// Puts a message back at the tail of the queue for another attempt.
    pub async fn requeue(&self, mut delivery: Delivery) {
        delivery.attempt += 1;
        self.state.lock().await.queue.push_back(delivery);
        self.ready.notify_one();
    }

    /// Parks a message that must not be retried.
    pub async fn dead_letter(&self, delivery: Delivery, reason: impl Into<String>) {
        self.state
            .lock()
            .await
            .dead_letters
            .push((delivery, reason.into()));
    }

    pub async fn dead_letters(&self) -> Vec<(Delivery, String)> {
        self.state.lock().await.dead_letters.clone()
    }

    /// Number of messages waiting in the queue.
    pub async fn queued(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    /// Every message the broker ever accepted, in acceptance order.
    pub async fn accepted(&self) -> Vec<Delivery> {
        self.state.lock().await.accepted.clone()
    }

    /// Accepted messages with the given routing key.
    pub async fn accepted_with_key(&self, routing_key: &str) -> Vec<Delivery> {
        self.state
            .lock()
            .await
            .accepted
            .iter()
            .filter(|d| d.routing_key == routing_key)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl MessageTransport for InMemoryBroker {
    async fn send(&self, delivery: Delivery) -> Result<(), TransportError> {
        let mut state = self.state.lock().await;
        if state.fail_sends {
            return Err(TransportError::Unavailable("broker offline".to_string()));
        }
        state.accepted.push(delivery.clone());
        state.queue.push_back(delivery);
        drop(state);
        self.ready.notify_one();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn delivery(key: &str) -> Delivery {
        Delivery {
            message_id: OutboxId::new(),
            routing_key: key.to_string(),
            payload: serde_json::json!({ "orderId": "o-1" }),
            attempt: 1,
        }
    }

    #[tokio::test]
    async fn fifo_delivery() {
        let broker = InMemoryBroker::new();
        broker.send(delivery("a")).await.unwrap();
        broker.send(delivery("b")).await.unwrap();

        assert_eq!(broker.recv().await.routing_key, "a");
        assert_eq!(broker.try_recv().await.unwrap().routing_key, "b");
        assert!(broker.try_recv().await.is_none());
    }

    #[tokio::test]
    async fn recv_waits_for_send() {
        let broker = InMemoryBroker::new();
        let consumer = {
            let broker = broker.clone();
            tokio::spawn(async move { broker.recv().await })
        };
        tokio::task::yield_now().await;
        broker.send(delivery("late")).await.unwrap();

        assert_eq!(consumer.await.unwrap().routing_key, "late");
    }

    #[tokio::test]
    async fn failing_broker_accepts_nothing() {
        let broker = InMemoryBroker::new();
        broker.set_fail_sends(true).await;

        let result = broker.send(delivery("a")).await;
        assert!(matches!(result, Err(TransportError::Unavailable(_))));
        assert_eq!(broker.queued().await, 0);
        assert!(broker.accepted().await.is_empty());
    }

    #[tokio::test]
    async fn requeue_increments_attempt() {
        let broker = InMemoryBroker::new();
        broker.requeue(delivery("a")).await;
        assert_eq!(broker.recv().await.attempt, 2);
    }

    #[test]
    fn decode_payload() {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Msg {
            order_id: String,
        }

        let msg: Msg = delivery("a").decode().unwrap();
        assert_eq!(msg.order_id, "o-1");
    }
}
