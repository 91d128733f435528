use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::AsyncCommands;
use tokio::time::Instant;

use crate::error::QueueError;
use crate::queue::{Envelope, JobQueue, QueueMessage, QueueStats};
use crate::types::FanoutJob;

const CLAIM_SCRIPT: &str = r#"
local due = redis.call('ZRANGEBYSCORE', KEYS[1], 0, ARGV[1], 'LIMIT', 0, ARGV[2])
local out = {}
for i, id in ipairs(due) do
    redis.call('ZADD', KEYS[1], ARGV[3], id)
    local env = redis.call('HGET', KEYS[2], id)
    if env then
        table.insert(out, env)
    end
end
return out
"#;

/// Redis-backed queue adapter.
///
/// Visibility is a sorted-set score: messages with a score at or below now
/// are receivable; claiming bumps the score past the visibility timeout.
/// The claim runs as a script so concurrent consumers never lease the same
/// message.
pub struct RedisQueue {
    client: redis::Client,
    prefix: String,
    closed: AtomicBool,
    visibility_timeout: Duration,
    max_attempts: u32,
}

impl RedisQueue {
    pub fn new(
        url: &str,
        visibility_timeout: Duration,
        max_attempts: u32,
    ) -> Result<Self, QueueError> {
        let client =
            redis::Client::open(url).map_err(|e| QueueError::Backend(e.to_string()))?;
        Ok(Self {
            client,
            prefix: "relay:queue".to_string(),
            closed: AtomicBool::new(false),
            visibility_timeout,
            max_attempts,
        })
    }

    fn visible_key(&self) -> String {
        format!("{}:visible", self.prefix)
    }

    fn messages_key(&self) -> String {
        format!("{}:messages", self.prefix)
    }

    async fn connection(&self) -> Result<redis::aio::MultiplexedConnection, QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::Closed);
        }
        self.client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))
    }
}

#[async_trait]
impl JobQueue for RedisQueue {
    async fn send(&self, job: FanoutJob, delay: Option<Duration>) -> Result<String, QueueError> {
        let envelope = Envelope::new(job, delay);
        let id = envelope.id.clone();
        let payload = serde_json::to_string(&envelope)
            .map_err(|e| QueueError::Backend(e.to_string()))?;
        let visible_at = envelope
            .delay_until
            .unwrap_or_else(Utc::now)
            .timestamp_millis();

        let mut conn = self.connection().await?;
        let _: () = conn
            .hset(self.messages_key(), &id, payload)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;
        let _: () = conn
            .zadd(self.visible_key(), &id, visible_at)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;
        Ok(id)
    }

    async fn receive(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        let deadline = Instant::now() + wait;
        let script = redis::Script::new(CLAIM_SCRIPT);

        loop {
            let mut conn = self.connection().await?;
            let now_ms = Utc::now().timestamp_millis();
            let lease_until =
                now_ms + self.visibility_timeout.as_millis() as i64;

            let claimed: Vec<String> = script
                .key(self.visible_key())
                .key(self.messages_key())
                .arg(now_ms)
                .arg(max_messages)
                .arg(lease_until)
                .invoke_async(&mut conn)
                .await
                .map_err(|e| QueueError::Backend(e.to_string()))?;

            if !claimed.is_empty() {
                let mut out = Vec::with_capacity(claimed.len());
                for raw in claimed {
                    let mut envelope: Envelope = serde_json::from_str(&raw)
                        .map_err(|e| QueueError::Backend(e.to_string()))?;
                    envelope.attempts += 1;
                    let payload = serde_json::to_string(&envelope)
                        .map_err(|e| QueueError::Backend(e.to_string()))?;
                    // The message is leased, so the write-back cannot race
                    // another consumer.
                    let _: () = conn
                        .hset(self.messages_key(), &envelope.id, payload)
                        .await
                        .map_err(|e| QueueError::Backend(e.to_string()))?;
                    out.push(QueueMessage {
                        id: envelope.id.clone(),
                        job: envelope.data.clone(),
                        timestamp: envelope.timestamp,
                        attempts: envelope.attempts,
                        max_attempts: self.max_attempts,
                    });
                }
                return Ok(out);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Vec::new());
            }
            tokio::time::sleep(remaining.min(Duration::from_millis(100))).await;
        }
    }

    async fn delete(&self, message_id: &str) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let removed: i64 = conn
            .zrem(self.visible_key(), message_id)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;
        let _: () = conn
            .hdel(self.messages_key(), message_id)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;
        if removed == 0 {
            return Err(QueueError::MessageNotFound(message_id.to_string()));
        }
        Ok(())
    }

    async fn change_visibility(
        &self,
        message_id: &str,
        visibility: Duration,
    ) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let visible_at = Utc::now().timestamp_millis() + visibility.as_millis() as i64;
        let updated: i64 = redis::cmd("ZADD")
            .arg(self.visible_key())
            .arg("XX")
            .arg("CH")
            .arg(visible_at)
            .arg(message_id)
            .query_async(&mut conn)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;
        if updated == 0 {
            // Score unchanged also reports 0; verify membership.
            let exists: Option<f64> = conn
                .zscore(self.visible_key(), message_id)
                .await
                .map_err(|e| QueueError::Backend(e.to_string()))?;
            if exists.is_none() {
                return Err(QueueError::MessageNotFound(message_id.to_string()));
            }
        }
        Ok(())
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let mut conn = self.connection().await?;
        let now_ms = Utc::now().timestamp_millis();
        let approximate: u64 = conn
            .zcount(self.visible_key(), 0, now_ms)
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;
        let hidden: u64 = conn
            .zcount(self.visible_key(), now_ms + 1, "+inf")
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;
        // Leased and delayed messages are indistinguishable here; both are
        // simply not yet visible.
        Ok(QueueStats {
            approximate,
            in_flight: hidden,
            delayed: 0,
        })
    }

    async fn purge(&self) -> Result<(), QueueError> {
        let mut conn = self.connection().await?;
        let _: () = conn
            .del(self.visible_key())
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;
        let _: () = conn
            .del(self.messages_key())
            .await
            .map_err(|e| QueueError::Backend(e.to_string()))?;
        Ok(())
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    fn kind(&self) -> &'static str {
        "redis"
    }
}
