//! A central webhook router.
//!
//! The relay ingests signed webhook events from an upstream code-hosting
//! platform, persists them durably, fans them out to configured
//! subscribers over pluggable transports, and retries failed deliveries
//! with bounded backoff.
//!
//! ## Guarantees
//! - At-least-once delivery per matching subscriber
//! - Idempotent ingest keyed on the upstream delivery id
//! - Bounded retry with jittered backoff and dead-letter capture
//! - Captured request headers encrypted at rest
//!
//! ## Non-Guarantees
//! - Exactly-once delivery
//! - Ordering across subscribers
//! - Multi-tenant isolation
//!
//! The pipeline is: ingest validator -> event store -> queue -> worker
//! pool -> transport adapters, with a retry scheduler re-enqueueing due
//! retries from the store.

pub mod config;
mod crypto;
mod engine;
mod error;
mod ingest;
mod queue;
mod retry;
pub mod server;
mod store;
mod transport;
mod transport_http;
mod types;
mod worker;

#[cfg(feature = "redis")]
mod queue_redis;

#[cfg(feature = "redis")]
mod transport_redis;

#[cfg(feature = "postgres")]
mod store_postgres;

pub use config::{Config, QueueKind, StoreKind};
pub use crypto::{payload_hash, sign_payload, verify_signature, HeaderCipher};
pub use engine::{DeliveryEngine, RetryOutcome};
pub use error::{
    AdmissionError, CryptoError, QueueError, RelayError, StoreError, TransportError,
};
pub use ingest::{Admission, IngestResponse, DELIVERY_HEADER, EVENT_HEADER};
pub use queue::{Envelope, JobQueue, MemoryQueue, QueueMessage, QueueStats};
pub use retry::{Backoff, BackoffStrategy, RetryPolicy, RetryScheduler};
pub use server::Relay;
pub use store::{EventStore, MemoryStore, StoredEvent};
pub use transport::{
    BrokerEnvelope, DeliveryRequest, DeliveryResult, Transport, TransportRegistry,
};
pub use transport_http::{HttpWebhookTransport, RELAY_MARKER_HEADER, SIGNATURE_HEADER};
pub use types::{
    AttemptId, CapturedHeaders, DeliveryAttempt, DeliverySummary, Event, EventId, EventStats,
    EventStatus, FanoutJob, NewAttempt, NewEvent, RetryTask, Subscriber, SubscriberId,
    TransportBinding, TransportKind,
};
pub use worker::{CompletionHub, WorkerPool};

#[cfg(feature = "redis")]
pub use queue_redis::RedisQueue;

#[cfg(feature = "redis")]
pub use transport_redis::RedisPubSubTransport;

#[cfg(feature = "postgres")]
pub use store_postgres::PostgresStore;
