use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};

use axum::body::Bytes;
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::config::SecurityConfig;
use crate::crypto::{payload_hash, verify_signature};
use crate::error::AdmissionError;
use crate::queue::JobQueue as _;
use crate::server::AppState;
use crate::store::{EventStore as _, StoredEvent};
use crate::transport_http::SIGNATURE_HEADER;
use crate::types::{CapturedHeaders, DeliverySummary, FanoutJob, NewEvent};

/// Upstream event-type header.
pub const EVENT_HEADER: &str = "x-github-event";

/// Upstream delivery-id header; doubles as the idempotency key.
pub const DELIVERY_HEADER: &str = "x-github-delivery";

/// Request headers captured into the encrypted bundle. Everything else is
/// dropped at the door.
const CAPTURED_HEADERS: [&str; 5] = [
    EVENT_HEADER,
    SIGNATURE_HEADER,
    DELIVERY_HEADER,
    "content-type",
    "user-agent",
];

/// Token bucket refilled continuously at the configured per-minute rate.
#[derive(Debug)]
struct TokenBucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn new(per_minute: u32) -> Self {
        let capacity = per_minute.max(1) as f64;
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec: capacity / 60.0,
            last_refill: Instant::now(),
        }
    }

    fn try_take(&mut self) -> bool {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Admission control for the ingest endpoint.
///
/// Checks run in a fixed, short-circuiting order: ip allowlist, rate
/// limit, payload size, required headers, signature, JSON validity.
pub struct Admission {
    secret: Vec<u8>,
    max_bytes: usize,
    rate_limiting_enabled: bool,
    requests_per_minute: u32,
    ip_allowlist: Vec<String>,
    buckets: Mutex<HashMap<IpAddr, TokenBucket>>,
}

/// Everything admission extracts from an accepted request.
#[derive(Debug)]
pub struct Admitted {
    pub event_type: String,
    pub delivery_id: String,
    pub headers: CapturedHeaders,
}

impl Admission {
    pub fn new(secret: &str, security: &SecurityConfig) -> Self {
        Self {
            secret: secret.as_bytes().to_vec(),
            max_bytes: security.payload_size_limit_bytes(),
            rate_limiting_enabled: security.rate_limiting_enabled,
            requests_per_minute: security.requests_per_minute,
            ip_allowlist: security.ip_allowlist.clone(),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    pub async fn admit(
        &self,
        client_ip: IpAddr,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<Admitted, AdmissionError> {
        if !self.ip_allowlist.is_empty()
            && !self.ip_allowlist.iter().any(|ip| ip == &client_ip.to_string())
        {
            return Err(AdmissionError::IpNotAllowed);
        }

        if self.rate_limiting_enabled {
            let mut buckets = self.buckets.lock().await;
            let bucket = buckets
                .entry(client_ip)
                .or_insert_with(|| TokenBucket::new(self.requests_per_minute));
            if !bucket.try_take() {
                return Err(AdmissionError::RateLimited);
            }
        }

        if body.len() > self.max_bytes {
            return Err(AdmissionError::PayloadTooLarge {
                limit: self.max_bytes,
            });
        }

        let signature = require_header(headers, SIGNATURE_HEADER)?;
        let event_type = require_header(headers, EVENT_HEADER)?;
        let delivery_id = require_header(headers, DELIVERY_HEADER)?;

        // HMAC over the raw body bytes, before any parsing.
        if !verify_signature(&self.secret, body, &signature) {
            return Err(AdmissionError::InvalidSignature);
        }

        if serde_json::from_slice::<serde_json::Value>(body).is_err() {
            return Err(AdmissionError::InvalidJson);
        }

        let mut captured = CapturedHeaders::new();
        for name in CAPTURED_HEADERS {
            if let Some(value) = headers.get(name).and_then(|v| v.to_str().ok()) {
                captured.insert(name.to_string(), value.to_string());
            }
        }

        Ok(Admitted {
            event_type,
            delivery_id,
            headers: captured,
        })
    }
}

fn require_header(headers: &HeaderMap, name: &'static str) -> Result<String, AdmissionError> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string())
        .ok_or(AdmissionError::MissingHeader(name))
}

/// Body of every ingest response.
#[derive(Debug, Default, Serialize)]
pub struct IngestResponse {
    pub message: String,
    pub subscribers: u32,
    pub successful: u32,
    pub failed: u32,
    pub retries: u32,
}

impl IngestResponse {
    fn message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }

    fn from_summary(message: impl Into<String>, summary: DeliverySummary) -> Self {
        Self {
            message: message.into(),
            subscribers: summary.subscribers,
            successful: summary.successful,
            failed: summary.failed,
            retries: summary.retries,
        }
    }
}

/// `POST /webhook/{platform}`: validate, persist, enqueue, and report the
/// outcome of the first fan-out pass.
pub async fn ingest_webhook(
    Path(platform): Path<String>,
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> (StatusCode, Json<IngestResponse>) {
    if platform != state.platform {
        return (
            StatusCode::NOT_FOUND,
            Json(IngestResponse::message(format!(
                "unknown platform: {platform}"
            ))),
        );
    }

    let admitted = match state.admission.admit(addr.ip(), &headers, &body).await {
        Ok(admitted) => admitted,
        Err(e) => {
            info!(ip = %addr.ip(), reason = %e, kind = "admission", "webhook rejected");
            let status =
                StatusCode::from_u16(e.status()).unwrap_or(StatusCode::BAD_REQUEST);
            return (status, Json(IngestResponse::message(e.to_string())));
        }
    };

    let payload = match String::from_utf8(body.to_vec()) {
        Ok(payload) => payload,
        Err(_) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(IngestResponse::message(
                    AdmissionError::InvalidJson.to_string(),
                )),
            )
        }
    };

    let encrypted_headers = match state.cipher.seal(&admitted.headers) {
        Ok(sealed) => sealed,
        Err(e) => {
            warn!(error = %e, "failed to seal headers");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(IngestResponse::message("internal error")),
            );
        }
    };

    let draft = NewEvent {
        delivery_id: admitted.delivery_id.clone(),
        event_type: admitted.event_type.clone(),
        payload_hash: payload_hash(&body),
        payload_size: body.len() as i64,
        payload,
        encrypted_headers,
        received_at: Utc::now(),
    };

    let event = match state.store.store_event(draft).await {
        Ok(StoredEvent::Created(event)) => event,
        Ok(StoredEvent::Duplicate(id)) => {
            // Idempotent replay: answer success without a second row or a
            // second fan-out.
            info!(event = %id, delivery = %admitted.delivery_id, "duplicate delivery");
            return (
                StatusCode::OK,
                Json(IngestResponse::message("duplicate delivery")),
            );
        }
        Err(e) => {
            warn!(error = %e, kind = "infrastructure", "event store unavailable");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(IngestResponse::message("storage unavailable")),
            );
        }
    };

    let waiter = state.hub.register(event.id).await;

    let job = FanoutJob {
        event_id: event.id,
        event_type: event.event_type.clone(),
        delivery_id: event.delivery_id.clone(),
    };
    if let Err(e) = state.queue.send(job, None).await {
        warn!(event = %event.id, error = %e, kind = "infrastructure", "enqueue failed");
        state.hub.forget(event.id).await;
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(IngestResponse::message("queue unavailable")),
        );
    }

    info!(
        event = %event.id,
        delivery = %event.delivery_id,
        event_type = %event.event_type,
        "webhook accepted"
    );

    match tokio::time::timeout(state.response_wait, waiter).await {
        Ok(Ok(summary)) => {
            let status = if summary.retries > 0 {
                StatusCode::ACCEPTED
            } else if summary.all_failed_permanently() {
                StatusCode::INTERNAL_SERVER_ERROR
            } else {
                StatusCode::OK
            };
            let message = match status {
                StatusCode::ACCEPTED => "accepted with pending retries",
                StatusCode::INTERNAL_SERVER_ERROR => "all deliveries failed",
                _ => "processed",
            };
            (status, Json(IngestResponse::from_summary(message, summary)))
        }
        _ => {
            // The pass did not finish in time (or runs in another
            // process); the event is stored and queued, so this is an
            // accept.
            state.hub.forget(event.id).await;
            (
                StatusCode::ACCEPTED,
                Json(IngestResponse::message("accepted")),
            )
        }
    }
}
