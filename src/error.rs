use thiserror::Error;

use crate::types::{EventId, SubscriberId};

/// Rejections produced by the ingest validator before anything is
/// persisted. Each maps to a fixed HTTP status.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("client ip not allowed")]
    IpNotAllowed,

    #[error("rate limit exceeded")]
    RateLimited,

    #[error("payload exceeds {limit} bytes")]
    PayloadTooLarge { limit: usize },

    #[error("missing required header: {0}")]
    MissingHeader(&'static str),

    #[error("signature verification failed")]
    InvalidSignature,

    #[error("request body is not valid JSON")]
    InvalidJson,
}

impl AdmissionError {
    /// The HTTP status this rejection is reported as.
    pub fn status(&self) -> u16 {
        match self {
            AdmissionError::IpNotAllowed => 403,
            AdmissionError::RateLimited => 429,
            AdmissionError::PayloadTooLarge { .. } => 413,
            AdmissionError::MissingHeader(_) => 400,
            AdmissionError::InvalidSignature => 401,
            AdmissionError::InvalidJson => 400,
        }
    }
}

/// Failures from the header encryption layer.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("header encryption failed")]
    Encrypt,

    #[error("header bundle could not be decrypted")]
    Decrypt,

    #[error("malformed header bundle: {0}")]
    Malformed(String),
}

/// Failures from the event store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("event {0} not found")]
    EventNotFound(EventId),

    #[error("invalid status transition for event {event}: {from} -> {to}")]
    InvalidTransition {
        event: EventId,
        from: &'static str,
        to: &'static str,
    },

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Failures from the queue layer.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue is closed")]
    Closed,

    #[error("message {0} not found")]
    MessageNotFound(String),

    #[error("queue backend error: {0}")]
    Backend(String),
}

/// Failures from transport adapters that prevent any delivery attempt.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid transport config: {0}")]
    InvalidConfig(String),

    #[error("no adapter available for transport kind {0}")]
    Unsupported(&'static str),
}

/// Top-level error for the relay pipeline.
///
/// The variants mirror the handling policy: admission errors map to HTTP
/// statuses, delivery errors are recorded per attempt, infrastructure
/// errors leave the queue message unacknowledged so it redelivers.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Admission(#[from] AdmissionError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("subscriber {0} disappeared before delivery")]
    SubscriberGone(SubscriberId),

    #[error("configuration error: {0}")]
    Config(String),
}
