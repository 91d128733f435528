use std::time::Instant;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use crate::error::TransportError;
use crate::transport::{BrokerEnvelope, DeliveryRequest, DeliveryResult, Transport};
use crate::types::TransportKind;

#[derive(Debug, Deserialize)]
struct PubSubConfig {
    channel: String,
}

/// Publishes the canonical event envelope to a Redis channel.
///
/// Success is the broker's acknowledgment of the PUBLISH command; there is
/// no per-subscriber receipt beyond that.
pub struct RedisPubSubTransport {
    client: Option<redis::Client>,
}

impl RedisPubSubTransport {
    pub fn new(url: &str) -> Self {
        Self {
            client: redis::Client::open(url).ok(),
        }
    }
}

#[async_trait]
impl Transport for RedisPubSubTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::PubSub
    }

    fn validate_config(&self, config: &serde_json::Value) -> Result<(), TransportError> {
        let parsed: PubSubConfig = serde_json::from_value(config.clone())
            .map_err(|e| TransportError::InvalidConfig(e.to_string()))?;
        if parsed.channel.is_empty() {
            return Err(TransportError::InvalidConfig(
                "channel must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    async fn deliver(&self, request: &DeliveryRequest, config: &str) -> DeliveryResult {
        let start = Instant::now();

        let parsed: PubSubConfig = match serde_json::from_str(config) {
            Ok(parsed) => parsed,
            Err(e) => {
                return DeliveryResult::failure(
                    None,
                    format!("invalid transport config: {e}"),
                    start.elapsed().as_millis() as u64,
                )
            }
        };

        let Some(client) = &self.client else {
            return DeliveryResult::failure(
                None,
                "redis client not configured",
                start.elapsed().as_millis() as u64,
            );
        };

        let envelope = BrokerEnvelope::from_request(request);
        let payload = match serde_json::to_string(&envelope) {
            Ok(payload) => payload,
            Err(e) => {
                return DeliveryResult::failure(
                    None,
                    format!("envelope serialization failed: {e}"),
                    start.elapsed().as_millis() as u64,
                )
            }
        };

        let mut conn = match client.get_multiplexed_async_connection().await {
            Ok(conn) => conn,
            Err(e) => {
                return DeliveryResult::failure(
                    None,
                    format!("redis connection failed: {e}"),
                    start.elapsed().as_millis() as u64,
                )
            }
        };

        let publish: Result<i64, _> = redis::cmd("PUBLISH")
            .arg(&parsed.channel)
            .arg(payload)
            .query_async(&mut conn)
            .await;

        let duration_ms = start.elapsed().as_millis() as u64;
        match publish {
            Ok(receivers) => {
                debug!(
                    event = %request.event_id,
                    channel = %parsed.channel,
                    receivers,
                    "event published"
                );
                DeliveryResult::published(duration_ms)
            }
            Err(e) => DeliveryResult::failure(
                None,
                format!("publish failed: {e}"),
                duration_ms,
            ),
        }
    }

    async fn close(&self) {
        // Multiplexed connections are established per delivery and dropped
        // with it.
    }
}
