use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::crypto::sign_payload;
use crate::error::TransportError;
use crate::transport::{DeliveryRequest, DeliveryResult, Transport};
use crate::types::TransportKind;

/// Header carrying the recomputed payload signature.
pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";

/// Marker set on every relayed request so receivers can distinguish relayed
/// traffic from direct upstream traffic.
pub const RELAY_MARKER_HEADER: &str = "x-webhook-relay";

#[derive(Debug, Deserialize)]
struct HttpTransportConfig {
    url: String,

    /// Per-subscriber webhook secret; the relay re-signs the payload with
    /// it so the subscriber can verify against its own secret.
    secret: String,

    #[serde(default)]
    allow_http: bool,
}

/// Delivers events as signed HTTP POSTs.
///
/// One `reqwest::Client` is cached per process and shared across
/// deliveries; per-request timeouts come from the delivery configuration.
pub struct HttpWebhookTransport {
    client: Client,
    timeout: Duration,
    allow_insecure: bool,
}

impl HttpWebhookTransport {
    pub fn new(timeout: Duration, allow_insecure: bool) -> Self {
        let client = Client::builder()
            .user_agent(concat!("webhook-relay/", env!("CARGO_PKG_VERSION")))
            .build()
            .unwrap_or_default();
        Self {
            client,
            timeout,
            allow_insecure,
        }
    }

    fn check_url(&self, url: &str, allow_http: bool) -> Result<(), TransportError> {
        if url.starts_with("https://") {
            return Ok(());
        }
        if url.starts_with("http://") && (allow_http || self.allow_insecure) {
            return Ok(());
        }
        Err(TransportError::InvalidConfig(format!(
            "url must be https (or explicitly allow http): {url}"
        )))
    }

    fn build_headers(
        &self,
        request: &DeliveryRequest,
        body: &[u8],
        secret: &str,
    ) -> HeaderMap {
        let mut headers = HeaderMap::new();

        for (name, value) in &request.headers {
            let name = name.to_ascii_lowercase();
            // The signature is replaced below and the length is set
            // precisely for the serialized body.
            if name == SIGNATURE_HEADER || name == "content-length" || name == "content-type" {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                headers.insert(name, value);
            }
        }

        let signature = sign_payload(secret.as_bytes(), body);
        if let Ok(value) = HeaderValue::from_str(&signature) {
            headers.insert(HeaderName::from_static(SIGNATURE_HEADER), value);
        }
        headers.insert(
            HeaderName::from_static(RELAY_MARKER_HEADER),
            HeaderValue::from_static("true"),
        );
        headers.insert(
            reqwest::header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        headers.insert(reqwest::header::CONTENT_LENGTH, HeaderValue::from(body.len()));

        headers
    }
}

#[async_trait]
impl Transport for HttpWebhookTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::HttpWebhook
    }

    fn validate_config(&self, config: &serde_json::Value) -> Result<(), TransportError> {
        let parsed: HttpTransportConfig = serde_json::from_value(config.clone())
            .map_err(|e| TransportError::InvalidConfig(e.to_string()))?;
        if parsed.secret.is_empty() {
            return Err(TransportError::InvalidConfig(
                "webhook secret must not be empty".to_string(),
            ));
        }
        self.check_url(&parsed.url, parsed.allow_http)
    }

    async fn deliver(&self, request: &DeliveryRequest, config: &str) -> DeliveryResult {
        let start = Instant::now();

        let parsed: HttpTransportConfig = match serde_json::from_str(config) {
            Ok(parsed) => parsed,
            Err(e) => {
                return DeliveryResult::failure(
                    None,
                    format!("invalid transport config: {e}"),
                    start.elapsed().as_millis() as u64,
                )
            }
        };
        if let Err(e) = self.check_url(&parsed.url, parsed.allow_http) {
            return DeliveryResult::failure(
                None,
                e.to_string(),
                start.elapsed().as_millis() as u64,
            );
        }

        let body = request.payload.clone().into_bytes();
        let headers = self.build_headers(request, &body, &parsed.secret);

        debug!(
            event = %request.event_id,
            url = %parsed.url,
            "delivering webhook"
        );

        let response = self
            .client
            .post(&parsed.url)
            .headers(headers)
            .body(body)
            .timeout(self.timeout)
            .send()
            .await;

        let duration_ms = start.elapsed().as_millis() as u64;

        match response {
            Ok(response) => {
                let code = response.status().as_u16();
                if response.status().is_success() {
                    DeliveryResult::success(code, duration_ms)
                } else {
                    DeliveryResult::failure(
                        Some(code),
                        format!("endpoint returned {code}"),
                        duration_ms,
                    )
                }
            }
            Err(e) => {
                warn!(event = %request.event_id, error = %e, "webhook delivery failed");
                let reason = if e.is_timeout() {
                    format!("request timed out after {:?}", self.timeout)
                } else if e.is_connect() {
                    format!("connection failed: {e}")
                } else {
                    e.to_string()
                };
                DeliveryResult::failure(None, reason, duration_ms)
            }
        }
    }

    async fn close(&self) {
        // reqwest clients release their pools on drop.
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn transport() -> HttpWebhookTransport {
        HttpWebhookTransport::new(Duration::from_secs(5), false)
    }

    #[test]
    fn validates_https_url_with_secret() {
        let t = transport();
        let config = json!({"url": "https://sink.test/wh", "secret": "sub-secret"});
        assert!(t.validate_config(&config).is_ok());
    }

    #[test]
    fn rejects_plain_http_unless_allowed() {
        let t = transport();
        let config = json!({"url": "http://sink.test/wh", "secret": "s"});
        assert!(t.validate_config(&config).is_err());

        let config = json!({"url": "http://sink.test/wh", "secret": "s", "allow_http": true});
        assert!(t.validate_config(&config).is_ok());

        let globally_insecure = HttpWebhookTransport::new(Duration::from_secs(5), true);
        let config = json!({"url": "http://sink.test/wh", "secret": "s"});
        assert!(globally_insecure.validate_config(&config).is_ok());
    }

    #[test]
    fn rejects_missing_fields_and_empty_secret() {
        let t = transport();
        assert!(t.validate_config(&json!({"url": "https://sink.test"})).is_err());
        assert!(t
            .validate_config(&json!({"url": "https://sink.test", "secret": ""}))
            .is_err());
        assert!(t.validate_config(&json!({"secret": "s"})).is_err());
    }

    #[test]
    fn headers_carry_fresh_signature_and_marker() {
        let t = transport();
        let mut captured = std::collections::HashMap::new();
        captured.insert("x-github-event".to_string(), "push".to_string());
        captured.insert(
            SIGNATURE_HEADER.to_string(),
            "sha256=stale-upstream-signature".to_string(),
        );
        captured.insert("user-agent".to_string(), "GitHub-Hookshot/1".to_string());

        let request = DeliveryRequest {
            event_id: crate::types::EventId(1),
            delivery_id: "D1".to_string(),
            event_type: "push".to_string(),
            payload: r#"{"ref":"refs/heads/main"}"#.to_string(),
            headers: captured,
            received_at: chrono::Utc::now(),
        };

        let body = request.payload.as_bytes();
        let headers = t.build_headers(&request, body, "sub-secret");

        let signature = headers.get(SIGNATURE_HEADER).unwrap().to_str().unwrap();
        assert_ne!(signature, "sha256=stale-upstream-signature");
        assert!(crate::crypto::verify_signature(
            b"sub-secret",
            body,
            signature
        ));

        assert_eq!(headers.get(RELAY_MARKER_HEADER).unwrap(), "true");
        assert_eq!(headers.get("content-type").unwrap(), "application/json");
        assert_eq!(
            headers.get("content-length").unwrap().to_str().unwrap(),
            body.len().to_string()
        );
        assert_eq!(headers.get("x-github-event").unwrap(), "push");
    }

    #[tokio::test]
    async fn invalid_config_fails_without_network() {
        let t = transport();
        let request = DeliveryRequest {
            event_id: crate::types::EventId(1),
            delivery_id: "D1".to_string(),
            event_type: "push".to_string(),
            payload: "{}".to_string(),
            headers: Default::default(),
            received_at: chrono::Utc::now(),
        };

        let result = t.deliver(&request, "not json").await;
        assert!(!result.success);
        assert!(result.status_code.is_none());
        assert!(result.error.unwrap().contains("invalid transport config"));
    }
}
