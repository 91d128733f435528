use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for a subscriber.
///
/// This is a strongly-typed wrapper to avoid accidental mixing
/// of subscriber ids with other integer identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriberId(pub i64);

/// Unique identifier for a stored event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventId(pub i64);

/// Unique identifier for a delivery attempt row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AttemptId(pub i64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A downstream consumer of events.
///
/// Subscribers are created through the external management surface; the
/// relay only reads them. Each subscriber owns exactly one transport
/// binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subscriber {
    pub id: SubscriberId,

    /// Human-readable name, used only for logs and listings.
    pub name: String,

    /// Event types this subscriber receives. Never empty.
    pub event_types: Vec<String>,
}

impl Subscriber {
    pub fn accepts(&self, event_type: &str) -> bool {
        self.event_types.iter().any(|t| t == event_type)
    }
}

/// The delivery mechanism bound to a subscriber.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TransportKind {
    HttpWebhook,
    PubSub,
    LogStreamBroker,
    CloudQueue,
    CloudEventBus,
    AmqpBroker,
}

impl TransportKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransportKind::HttpWebhook => "http-webhook",
            TransportKind::PubSub => "pubsub",
            TransportKind::LogStreamBroker => "log-stream-broker",
            TransportKind::CloudQueue => "cloud-queue",
            TransportKind::CloudEventBus => "cloud-event-bus",
            TransportKind::AmqpBroker => "amqp-broker",
        }
    }
}

impl FromStr for TransportKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http-webhook" => Ok(TransportKind::HttpWebhook),
            "pubsub" => Ok(TransportKind::PubSub),
            "log-stream-broker" => Ok(TransportKind::LogStreamBroker),
            "cloud-queue" => Ok(TransportKind::CloudQueue),
            "cloud-event-bus" => Ok(TransportKind::CloudEventBus),
            "amqp-broker" => Ok(TransportKind::AmqpBroker),
            other => Err(format!("unknown transport kind: {other}")),
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transport configuration owned by a subscriber (1:1).
///
/// The `config` blob is the serialized, kind-specific configuration. It may
/// carry credentials, so `Debug` redacts it.
#[derive(Clone, Serialize, Deserialize)]
pub struct TransportBinding {
    pub id: i64,
    pub subscriber_id: SubscriberId,
    pub name: String,
    pub kind: TransportKind,
    pub config: String,
}

impl fmt::Debug for TransportBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportBinding")
            .field("id", &self.id)
            .field("subscriber_id", &self.subscriber_id)
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("config", &"<redacted>")
            .finish()
    }
}

/// Processing lifecycle of a stored event.
///
/// Transitions are monotone: `Pending -> Processing -> Completed | Failed |
/// DeadLetter`. Terminal states are immutable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    DeadLetter,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventStatus::Pending => "pending",
            EventStatus::Processing => "processing",
            EventStatus::Completed => "completed",
            EventStatus::Failed => "failed",
            EventStatus::DeadLetter => "dead_letter",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, EventStatus::Completed | EventStatus::DeadLetter)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(&self, next: EventStatus) -> bool {
        if *self == next {
            return true;
        }
        match self {
            EventStatus::Pending => matches!(
                next,
                EventStatus::Processing
                    | EventStatus::Completed
                    | EventStatus::Failed
                    | EventStatus::DeadLetter
            ),
            EventStatus::Processing => matches!(
                next,
                EventStatus::Completed | EventStatus::Failed | EventStatus::DeadLetter
            ),
            // A failed event may still be retried toward a terminal state.
            EventStatus::Failed => matches!(
                next,
                EventStatus::Processing | EventStatus::Completed | EventStatus::DeadLetter
            ),
            EventStatus::Completed | EventStatus::DeadLetter => false,
        }
    }
}

impl FromStr for EventStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(EventStatus::Pending),
            "processing" => Ok(EventStatus::Processing),
            "completed" => Ok(EventStatus::Completed),
            "failed" => Ok(EventStatus::Failed),
            "dead_letter" => Ok(EventStatus::DeadLetter),
            other => Err(format!("unknown event status: {other}")),
        }
    }
}

/// A durably stored upstream event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: EventId,

    /// Upstream delivery identifier; unique across all events and used as
    /// the idempotency key for replays.
    pub delivery_id: String,

    pub event_type: String,

    /// Hex-encoded SHA-256 of the raw payload bytes.
    pub payload_hash: String,

    pub payload_size: i64,

    /// Raw payload, stored verbatim.
    pub payload: String,

    /// Serialized `{encrypted, iv, tag, salt}` bundle of the captured
    /// request headers.
    pub encrypted_headers: String,

    pub received_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub status: EventStatus,
}

/// An event as produced by the ingest validator, before the store assigns
/// an id and a status.
#[derive(Debug, Clone)]
pub struct NewEvent {
    pub delivery_id: String,
    pub event_type: String,
    pub payload_hash: String,
    pub payload_size: i64,
    pub payload: String,
    pub encrypted_headers: String,
    pub received_at: DateTime<Utc>,
}

/// One delivery attempt for an (event, subscriber) pair.
///
/// Append-only, except `next_retry_at` which moves null -> scheduled ->
/// null. Attempt numbers are dense starting at 1 per pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryAttempt {
    pub id: AttemptId,
    pub event_id: EventId,
    pub subscriber_id: SubscriberId,
    pub attempt_number: u32,
    pub status_code: Option<u16>,
    pub error: Option<String>,
    pub attempted_at: DateTime<Utc>,
    pub duration_ms: Option<u64>,
    pub next_retry_at: Option<DateTime<Utc>>,
}

impl DeliveryAttempt {
    /// An attempt succeeded when it produced no error and either a 2xx
    /// status or an ack without a status (broker publish).
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
            && self
                .status_code
                .map(|c| (200..300).contains(&c))
                .unwrap_or(true)
    }
}

/// Input for `EventStore::record_attempt`.
#[derive(Debug, Clone)]
pub struct NewAttempt {
    pub event_id: EventId,
    pub subscriber_id: SubscriberId,
    pub attempt_number: u32,
    pub status_code: Option<u16>,
    pub error: Option<String>,
    pub attempted_at: DateTime<Utc>,
    pub duration_ms: Option<u64>,
    pub next_retry_at: Option<DateTime<Utc>>,
}

/// A due retry as returned by `EventStore::due_retries`: the scheduled
/// attempt row joined with enough event state to re-execute delivery.
#[derive(Debug, Clone)]
pub struct RetryTask {
    pub event_id: EventId,
    pub subscriber_id: SubscriberId,

    /// Attempt number of the row carrying the schedule.
    pub attempt_number: u32,

    /// Number the re-executed attempt will be recorded under.
    pub next_attempt: u32,

    /// The schedule value at poll time; compare value for the claim.
    pub scheduled_at: DateTime<Utc>,

    pub event_type: String,
    pub payload: String,
    pub encrypted_headers: String,
}

/// Fan-out job carried by queue messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanoutJob {
    pub event_id: EventId,
    pub event_type: String,
    pub delivery_id: String,
}

/// Aggregate event counts reported by the store.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct EventStats {
    pub total: u64,
    pub pending: u64,
    pub failed: u64,
    pub completed: u64,
}

/// Per-event outcome of one fan-out pass, aggregated across subscribers.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct DeliverySummary {
    pub subscribers: u32,
    pub successful: u32,
    pub failed: u32,
    pub retries: u32,
}

impl DeliverySummary {
    /// True when every matched subscriber failed with no retry scheduled.
    pub fn all_failed_permanently(&self) -> bool {
        self.subscribers > 0 && self.failed == self.subscribers && self.retries == 0
    }
}

/// Decrypted header map captured at ingest.
pub type CapturedHeaders = HashMap<String, String>;
