//! Duplicate suppression for at-least-once delivery.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Result;

/// Deterministic identity of a logical effect, `"<OPERATION>:<subject>"`.
///
/// Derived from what the message means rather than from a transport message
/// id, so that every redelivery of the same effect collides on one key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventKey(String);

impl EventKey {
    /// Builds a key from an operation name and the subject it acts on.
    pub fn new(operation: &str, subject: impl std::fmt::Display) -> Self {
        Self(format!("{operation}:{subject}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EventKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a consumer did with one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumeOutcome {
    /// The effect was applied and committed.
    Applied,
    /// The key was already claimed; nothing was done.
    Duplicate,
    /// The message no longer matched the current state and was dropped.
    Discarded,
}

impl ConsumeOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConsumeOutcome::Applied => "applied",
            ConsumeOutcome::Duplicate => "duplicate",
            ConsumeOutcome::Discarded => "discarded",
        }
    }
}

/// Durable set of processed event keys.
///
/// `try_claim` is a single insert-or-detect-conflict; there is no separate
/// existence check a concurrent consumer could slip between.
#[async_trait]
pub trait IdempotencyGuard: Send + Sync {
    /// Persists `key` and returns true if it was not present; returns false
    /// and writes nothing otherwise.
    async fn try_claim(&self, key: &EventKey) -> Result<bool>;

    /// Deletes claims older than `older_than`. Returns the number removed.
    async fn purge_claims(&self, older_than: DateTime<Utc>) -> Result<u64>;
}

pub(crate) fn record_duplicate(key: &EventKey) {
    metrics::counter!("idempotency_duplicates_total").increment(1);
    tracing::debug!(event_key = %key, "duplicate delivery suppressed");
}
