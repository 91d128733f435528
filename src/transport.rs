use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::Config;
use crate::error::TransportError;
use crate::transport_http::HttpWebhookTransport;
use crate::types::{CapturedHeaders, EventId, TransportKind};

/// Everything an adapter needs to deliver one event to one subscriber.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    pub event_id: EventId,
    pub delivery_id: String,
    pub event_type: String,

    /// The original payload, forwarded verbatim.
    pub payload: String,

    /// Decrypted headers captured at ingest.
    pub headers: CapturedHeaders,

    pub received_at: DateTime<Utc>,
}

/// Outcome of a single delivery attempt through an adapter.
#[derive(Debug, Clone)]
pub struct DeliveryResult {
    pub success: bool,
    pub status_code: Option<u16>,
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl DeliveryResult {
    pub fn success(status_code: u16, duration_ms: u64) -> Self {
        Self {
            success: true,
            status_code: Some(status_code),
            error: None,
            duration_ms,
        }
    }

    /// Success without an HTTP status, e.g. a broker publish
    /// acknowledgment.
    pub fn published(duration_ms: u64) -> Self {
        Self {
            success: true,
            status_code: None,
            error: None,
            duration_ms,
        }
    }

    pub fn failure(
        status_code: Option<u16>,
        error: impl Into<String>,
        duration_ms: u64,
    ) -> Self {
        Self {
            success: false,
            status_code,
            error: Some(error.into()),
            duration_ms,
        }
    }
}

/// Canonical envelope published by broker-style adapters.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BrokerEnvelope<'a> {
    pub event: &'a str,
    pub payload: &'a str,
    pub headers: &'a CapturedHeaders,
    pub delivery_id: &'a str,
    pub timestamp: DateTime<Utc>,
}

impl<'a> BrokerEnvelope<'a> {
    pub fn from_request(request: &'a DeliveryRequest) -> Self {
        Self {
            event: &request.event_type,
            payload: &request.payload,
            headers: &request.headers,
            delivery_id: &request.delivery_id,
            timestamp: request.received_at,
        }
    }
}

/// A delivery mechanism. Adapters may cache connections per process and
/// must release them in `close`.
#[async_trait]
pub trait Transport: Send + Sync {
    fn kind(&self) -> TransportKind;

    /// Validate a kind-specific configuration blob. Called when bindings
    /// are created and again defensively before delivery.
    fn validate_config(&self, config: &serde_json::Value) -> Result<(), TransportError>;

    /// Attempt delivery. Never panics; all failure modes are folded into
    /// the result so the engine can apply the retry policy.
    async fn deliver(&self, request: &DeliveryRequest, config: &str) -> DeliveryResult;

    async fn close(&self);
}

/// Maps transport-kind tags to adapter instances. Selection is purely by
/// configuration tag.
pub struct TransportRegistry {
    adapters: HashMap<TransportKind, Arc<dyn Transport>>,
}

impl TransportRegistry {
    pub fn from_config(config: &Config) -> Self {
        let mut adapters: HashMap<TransportKind, Arc<dyn Transport>> = HashMap::new();

        adapters.insert(
            TransportKind::HttpWebhook,
            Arc::new(HttpWebhookTransport::new(
                config.delivery.http_timeout(),
                config.delivery.allow_insecure_urls,
            )),
        );

        #[cfg(feature = "redis")]
        if let Some(url) = config.queue.url.as_deref() {
            adapters.insert(
                TransportKind::PubSub,
                Arc::new(crate::transport_redis::RedisPubSubTransport::new(url)),
            );
        }

        Self { adapters }
    }

    #[cfg(test)]
    pub fn with_adapters(adapters: Vec<Arc<dyn Transport>>) -> Self {
        Self {
            adapters: adapters.into_iter().map(|a| (a.kind(), a)).collect(),
        }
    }

    pub fn adapter(&self, kind: TransportKind) -> Option<Arc<dyn Transport>> {
        self.adapters.get(&kind).cloned()
    }

    /// Validate a binding's config blob against its kind's adapter.
    pub fn validate(&self, kind: TransportKind, config: &str) -> Result<(), TransportError> {
        let adapter = self
            .adapters
            .get(&kind)
            .ok_or(TransportError::Unsupported(kind.as_str()))?;
        let value: serde_json::Value = serde_json::from_str(config)
            .map_err(|e| TransportError::InvalidConfig(e.to_string()))?;
        adapter.validate_config(&value)
    }

    pub async fn close_all(&self) {
        for adapter in self.adapters.values() {
            adapter.close().await;
        }
    }
}
