use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for an outbox row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OutboxId(Uuid);

impl OutboxId {
    /// Creates a new random outbox ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Creates an outbox ID from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for OutboxId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for OutboxId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message that knows where it is routed and which aggregate it describes.
pub trait RoutedMessage: Serialize {
    /// Broker routing key, e.g. `"stock.reserved"`.
    fn routing_key(&self) -> &'static str;

    /// Identity of the aggregate the message is about.
    fn aggregate_id(&self) -> String;
}

/// A pending domain event in a service's outbox table.
///
/// Rows are appended inside the business transaction that produced them and
/// flipped to `published` exactly once by the publisher. A published row is
/// never rewritten; it only waits for the retention sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxRecord {
    /// Unique identifier for this row.
    pub id: OutboxId,

    /// The kind of aggregate that produced the event (e.g. "Order").
    pub aggregate_type: String,

    /// The aggregate instance the event describes.
    pub aggregate_id: String,

    /// Routing key the event is published under.
    pub event_type: String,

    /// Serialized event document; opaque to the outbox.
    pub payload: serde_json::Value,

    /// When the row was written.
    pub created_at: DateTime<Utc>,

    /// Whether the transport has accepted the event.
    pub published: bool,

    /// When the row was flagged published.
    pub published_at: Option<DateTime<Utc>>,

    /// Publisher lease; while in the future no other publisher may take the row.
    pub claimed_until: Option<DateTime<Utc>>,
}

impl OutboxRecord {
    /// Creates a new outbox record builder.
    pub fn builder() -> OutboxRecordBuilder {
        OutboxRecordBuilder::default()
    }

    /// Builds an unpublished record from a routed message.
    pub fn for_message<M: RoutedMessage>(
        aggregate_type: impl Into<String>,
        message: &M,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            id: OutboxId::new(),
            aggregate_type: aggregate_type.into(),
            aggregate_id: message.aggregate_id(),
            event_type: message.routing_key().to_string(),
            payload: serde_json::to_value(message)?,
            created_at: Utc::now(),
            published: false,
            published_at: None,
            claimed_until: None,
        })
    }

    /// Returns true if a publisher may claim this row at `now`.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        !self.published && self.claimed_until.is_none_or(|until| until <= now)
    }
}

/// Builder for constructing outbox records.
#[derive(Debug, Default)]
pub struct OutboxRecordBuilder {
    id: Option<OutboxId>,
    aggregate_type: Option<String>,
    aggregate_id: Option<String>,
    event_type: Option<String>,
    payload: Option<serde_json::Value>,
    created_at: Option<DateTime<Utc>>,
}

impl OutboxRecordBuilder {
    /// Sets the record ID. If not set, a new ID will be generated.
    pub fn id(mut self, id: OutboxId) -> Self {
        self.id = Some(id);
        self
    }

    /// Sets the aggregate type.
    pub fn aggregate_type(mut self, aggregate_type: impl Into<String>) -> Self {
        self.aggregate_type = Some(aggregate_type.into());
        self
    }

    /// Sets the aggregate ID.
    pub fn aggregate_id(mut self, aggregate_id: impl ToString) -> Self {
        self.aggregate_id = Some(aggregate_id.to_string());
        self
    }

    /// Sets the routing key.
    pub fn event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    /// Sets the creation time. If not set, the current time will be used.
    pub fn created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    /// Sets the payload from a serializable value.
    pub fn payload<T: Serialize>(mut self, payload: &T) -> Result<Self, serde_json::Error> {
        self.payload = Some(serde_json::to_value(payload)?);
        Ok(self)
    }

    /// Sets the payload from a raw JSON value.
    pub fn payload_raw(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }

    /// Tries to build the record, returning None if required fields are missing.
    pub fn try_build(self) -> Option<OutboxRecord> {
        Some(OutboxRecord {
            id: self.id.unwrap_or_default(),
            aggregate_type: self.aggregate_type?,
            aggregate_id: self.aggregate_id?,
            event_type: self.event_type?,
            payload: self.payload?,
            created_at: self.created_at.unwrap_or_else(Utc::now),
            published: false,
            published_at: None,
            claimed_until: None,
        })
    }
}
