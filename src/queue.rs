use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::QueueError;
use crate::types::FanoutJob;

/// Wire format of a queued fan-out job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub id: String,
    pub data: FanoutJob,
    pub timestamp: DateTime<Utc>,
    pub attempts: u32,
    pub delay_until: Option<DateTime<Utc>>,
}

impl Envelope {
    pub fn new(job: FanoutJob, delay: Option<Duration>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            data: job,
            timestamp: now,
            attempts: 0,
            delay_until: delay
                .map(|d| now + chrono::Duration::milliseconds(d.as_millis() as i64)),
        }
    }
}

/// A leased message handed to a worker.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub id: String,
    pub job: FanoutJob,
    pub timestamp: DateTime<Utc>,

    /// Times this message has been received, including this one.
    pub attempts: u32,

    /// Queue-level redelivery cap the worker enforces.
    pub max_attempts: u32,
}

/// Point-in-time queue counters.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct QueueStats {
    /// Messages receivable right now.
    pub approximate: u64,
    /// Messages currently leased to a consumer.
    pub in_flight: u64,
    /// Messages hidden by an initial delay.
    pub delayed: u64,
}

/// The durable boundary between ingest and workers.
///
/// Semantics are at-least-once: a received message is invisible for the
/// visibility timeout and becomes receivable again if not deleted in time.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Enqueue a job, optionally hidden for an initial delay. Returns the
    /// message id.
    async fn send(&self, job: FanoutJob, delay: Option<Duration>) -> Result<String, QueueError>;

    /// Receive up to `max_messages`, blocking up to `wait`. Each returned
    /// message is leased for the visibility timeout.
    async fn receive(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError>;

    /// Acknowledge a message; the broker may purge it afterwards.
    async fn delete(&self, message_id: &str) -> Result<(), QueueError>;

    /// Extend or shorten the current lease. Zero makes the message
    /// immediately receivable again.
    async fn change_visibility(
        &self,
        message_id: &str,
        visibility: Duration,
    ) -> Result<(), QueueError>;

    async fn stats(&self) -> Result<QueueStats, QueueError>;

    async fn purge(&self) -> Result<(), QueueError>;

    async fn close(&self) -> Result<(), QueueError>;

    fn is_connected(&self) -> bool;

    fn kind(&self) -> &'static str;
}

struct StoredMessage {
    envelope: Envelope,
    visible_at: DateTime<Utc>,
    leased: bool,
}

/// In-process queue adapter. Implements the full contract; durability is
/// process lifetime.
pub struct MemoryQueue {
    messages: Mutex<HashMap<String, StoredMessage>>,
    notify: Notify,
    closed: AtomicBool,
    visibility_timeout: Duration,
    max_attempts: u32,
}

impl MemoryQueue {
    pub fn new(visibility_timeout: Duration, max_attempts: u32) -> Self {
        Self {
            messages: Mutex::new(HashMap::new()),
            notify: Notify::new(),
            closed: AtomicBool::new(false),
            visibility_timeout,
            max_attempts,
        }
    }

    fn ensure_open(&self) -> Result<(), QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(QueueError::Closed)
        } else {
            Ok(())
        }
    }

    async fn take_due(&self, max_messages: usize) -> Vec<QueueMessage> {
        let now = Utc::now();
        let mut messages = self.messages.lock().await;

        let mut due: Vec<&String> = messages
            .iter()
            .filter(|(_, m)| m.visible_at <= now)
            .map(|(id, _)| id)
            .collect();
        due.sort();
        let picked: Vec<String> = due.into_iter().take(max_messages).cloned().collect();

        let mut out = Vec::with_capacity(picked.len());
        for id in picked {
            if let Some(stored) = messages.get_mut(&id) {
                stored.envelope.attempts += 1;
                stored.leased = true;
                stored.visible_at = now
                    + chrono::Duration::milliseconds(self.visibility_timeout.as_millis() as i64);
                out.push(QueueMessage {
                    id: stored.envelope.id.clone(),
                    job: stored.envelope.data.clone(),
                    timestamp: stored.envelope.timestamp,
                    attempts: stored.envelope.attempts,
                    max_attempts: self.max_attempts,
                });
            }
        }
        out
    }
}

#[async_trait]
impl JobQueue for MemoryQueue {
    async fn send(&self, job: FanoutJob, delay: Option<Duration>) -> Result<String, QueueError> {
        self.ensure_open()?;

        let envelope = Envelope::new(job, delay);
        let id = envelope.id.clone();
        let visible_at = envelope.delay_until.unwrap_or_else(Utc::now);

        let mut messages = self.messages.lock().await;
        messages.insert(
            id.clone(),
            StoredMessage {
                envelope,
                visible_at,
                leased: false,
            },
        );
        drop(messages);

        self.notify.notify_waiters();
        Ok(id)
    }

    async fn receive(
        &self,
        max_messages: usize,
        wait: Duration,
    ) -> Result<Vec<QueueMessage>, QueueError> {
        let deadline = Instant::now() + wait;

        loop {
            self.ensure_open()?;

            let batch = self.take_due(max_messages).await;
            if !batch.is_empty() {
                return Ok(batch);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Vec::new());
            }

            // Wake on new sends, but poll periodically so expired leases
            // and elapsed delays are noticed without a notification.
            let step = remaining.min(Duration::from_millis(50));
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(step) => {}
            }
        }
    }

    async fn delete(&self, message_id: &str) -> Result<(), QueueError> {
        let mut messages = self.messages.lock().await;
        messages
            .remove(message_id)
            .map(|_| ())
            .ok_or_else(|| QueueError::MessageNotFound(message_id.to_string()))
    }

    async fn change_visibility(
        &self,
        message_id: &str,
        visibility: Duration,
    ) -> Result<(), QueueError> {
        let mut messages = self.messages.lock().await;
        let stored = messages
            .get_mut(message_id)
            .ok_or_else(|| QueueError::MessageNotFound(message_id.to_string()))?;
        stored.visible_at =
            Utc::now() + chrono::Duration::milliseconds(visibility.as_millis() as i64);
        drop(messages);

        self.notify.notify_waiters();
        Ok(())
    }

    async fn stats(&self) -> Result<QueueStats, QueueError> {
        let now = Utc::now();
        let messages = self.messages.lock().await;

        let mut stats = QueueStats::default();
        for stored in messages.values() {
            if stored.visible_at <= now {
                stats.approximate += 1;
            } else if stored.leased {
                stats.in_flight += 1;
            } else {
                stats.delayed += 1;
            }
        }
        Ok(stats)
    }

    async fn purge(&self) -> Result<(), QueueError> {
        self.messages.lock().await.clear();
        Ok(())
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.closed.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
        Ok(())
    }

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::SeqCst)
    }

    fn kind(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::EventId;

    fn job(n: i64) -> FanoutJob {
        FanoutJob {
            event_id: EventId(n),
            event_type: "push".to_string(),
            delivery_id: format!("D{n}"),
        }
    }

    fn queue() -> MemoryQueue {
        MemoryQueue::new(Duration::from_millis(200), 5)
    }

    #[tokio::test]
    async fn send_receive_delete_round_trip() {
        let q = queue();
        let id = q.send(job(1), None).await.unwrap();

        let batch = q.receive(10, Duration::from_millis(100)).await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].id, id);
        assert_eq!(batch[0].job, job(1));
        assert_eq!(batch[0].attempts, 1);

        q.delete(&id).await.unwrap();
        let stats = q.stats().await.unwrap();
        assert_eq!(stats.approximate + stats.in_flight + stats.delayed, 0);
    }

    #[tokio::test]
    async fn leased_message_is_invisible_until_timeout() {
        let q = queue();
        q.send(job(1), None).await.unwrap();

        let first = q.receive(10, Duration::from_millis(50)).await.unwrap();
        assert_eq!(first.len(), 1);

        // Within the lease nothing is receivable.
        let empty = q.receive(10, Duration::from_millis(50)).await.unwrap();
        assert!(empty.is_empty());

        // After the lease expires the message comes back with a bumped
        // attempt counter.
        let redelivered = q.receive(10, Duration::from_millis(500)).await.unwrap();
        assert_eq!(redelivered.len(), 1);
        assert_eq!(redelivered[0].attempts, 2);
    }

    #[tokio::test]
    async fn delayed_message_stays_hidden() {
        let q = queue();
        q.send(job(1), Some(Duration::from_millis(150))).await.unwrap();

        let stats = q.stats().await.unwrap();
        assert_eq!(stats.delayed, 1);

        let early = q.receive(10, Duration::from_millis(30)).await.unwrap();
        assert!(early.is_empty());

        let late = q.receive(10, Duration::from_millis(500)).await.unwrap();
        assert_eq!(late.len(), 1);
    }

    #[tokio::test]
    async fn change_visibility_zero_returns_message_immediately() {
        let q = queue();
        let id = q.send(job(1), None).await.unwrap();

        let batch = q.receive(10, Duration::from_millis(50)).await.unwrap();
        assert_eq!(batch.len(), 1);

        q.change_visibility(&id, Duration::ZERO).await.unwrap();
        let back = q.receive(10, Duration::from_millis(50)).await.unwrap();
        assert_eq!(back.len(), 1);
    }

    #[tokio::test]
    async fn receive_blocks_until_send() {
        let q = std::sync::Arc::new(queue());
        let receiver = q.clone();
        let handle = tokio::spawn(async move {
            receiver.receive(1, Duration::from_secs(2)).await.unwrap()
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        q.send(job(1), None).await.unwrap();

        let batch = handle.await.unwrap();
        assert_eq!(batch.len(), 1);
    }

    #[tokio::test]
    async fn closed_queue_rejects_operations() {
        let q = queue();
        q.close().await.unwrap();
        assert!(!q.is_connected());
        assert!(matches!(
            q.send(job(1), None).await.unwrap_err(),
            QueueError::Closed
        ));
    }

    #[tokio::test]
    async fn purge_empties_the_queue() {
        let q = queue();
        q.send(job(1), None).await.unwrap();
        q.send(job(2), None).await.unwrap();
        q.purge().await.unwrap();
        let batch = q.receive(10, Duration::from_millis(30)).await.unwrap();
        assert!(batch.is_empty());
    }

    #[test]
    fn envelope_serializes_with_camel_case_delay_field() {
        let envelope = Envelope::new(job(1), None);
        let value = serde_json::to_value(&envelope).unwrap();
        assert!(value.get("delayUntil").is_some());
        assert!(value.get("attempts").is_some());
        assert!(value.get("timestamp").is_some());
    }
}
