use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::crypto::HeaderCipher;
use crate::error::RelayError;
use crate::retry::{Backoff, RetryPolicy};
use crate::store::EventStore;
use crate::transport::{DeliveryRequest, DeliveryResult, TransportRegistry};
use crate::types::{
    CapturedHeaders, DeliverySummary, Event, EventId, EventStatus, NewAttempt, RetryTask,
    Subscriber, SubscriberId,
};

/// What became of one retry task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Another poller claimed the row, or the event is already terminal.
    Skipped,
    Delivered,
    Rescheduled,
    PermanentFailure,
    /// The task could not be executed at all (corrupt headers).
    Abandoned,
}

#[derive(Default)]
struct SubscriberSnapshot {
    version: u64,
    subscribers: Vec<Subscriber>,
    loaded: bool,
}

/// Fans one event out to its matching subscribers and records every
/// attempt. Holds only transient references; the store owns all state.
pub struct DeliveryEngine {
    store: Arc<dyn EventStore>,
    transports: Arc<TransportRegistry>,
    cipher: HeaderCipher,
    policy: RetryPolicy,
    backoff: Backoff,
    dead_letter_threshold: u32,
    snapshot: RwLock<SubscriberSnapshot>,
}

impl DeliveryEngine {
    pub fn new(
        store: Arc<dyn EventStore>,
        transports: Arc<TransportRegistry>,
        config: &Config,
    ) -> Self {
        Self {
            store,
            transports,
            cipher: HeaderCipher::new(config.store.master_encryption_secret.clone()),
            policy: RetryPolicy::from_config(&config.retry),
            backoff: Backoff::from_config(&config.retry),
            dead_letter_threshold: config.queue.dead_letter_threshold,
            snapshot: RwLock::new(SubscriberSnapshot::default()),
        }
    }

    /// Subscribers whose event-type set contains `event_type`, served from
    /// a process-local snapshot invalidated by the store's version counter.
    async fn matching_subscribers(
        &self,
        event_type: &str,
    ) -> Result<Vec<Subscriber>, RelayError> {
        let current = self.store.subscribers_version();

        {
            let snapshot = self.snapshot.read().await;
            if snapshot.loaded && snapshot.version == current {
                return Ok(snapshot
                    .subscribers
                    .iter()
                    .filter(|s| s.accepts(event_type))
                    .cloned()
                    .collect());
            }
        }

        let subscribers = self.store.list_subscribers().await?;
        let mut snapshot = self.snapshot.write().await;
        snapshot.version = current;
        snapshot.subscribers = subscribers;
        snapshot.loaded = true;
        Ok(snapshot
            .subscribers
            .iter()
            .filter(|s| s.accepts(event_type))
            .cloned()
            .collect())
    }

    /// One fan-out pass over an event. Per-subscriber failures are
    /// isolated; only infrastructure errors propagate so the caller can
    /// leave the queue message unacknowledged.
    pub async fn process_event(&self, event: Event) -> Result<DeliverySummary, RelayError> {
        if event.status.is_terminal() {
            debug!(event = %event.id, status = event.status.as_str(), "event already terminal");
            return Ok(DeliverySummary::default());
        }

        self.store
            .set_event_status(event.id, EventStatus::Processing)
            .await?;

        let matching = self.matching_subscribers(&event.event_type).await?;
        let mut summary = DeliverySummary {
            subscribers: matching.len() as u32,
            ..Default::default()
        };

        if matching.is_empty() {
            self.store
                .set_event_status(event.id, EventStatus::Completed)
                .await?;
            info!(event = %event.id, event_type = %event.event_type, "no matching subscribers");
            return Ok(summary);
        }

        let headers = match self.cipher.open(&event.encrypted_headers) {
            Ok(headers) => headers,
            Err(e) => {
                warn!(event = %event.id, error = %e, kind = "decrypt", "abandoning event");
                for subscriber in &matching {
                    self.record_permanent_failure(
                        event.id,
                        subscriber.id,
                        "header decryption failed",
                    )
                    .await?;
                    summary.failed += 1;
                }
                self.store
                    .set_event_status(event.id, EventStatus::Failed)
                    .await?;
                return Ok(summary);
            }
        };

        for subscriber in &matching {
            let delivered = self
                .deliver_to_subscriber(&event, subscriber.id, &headers)
                .await?;
            match delivered {
                SubscriberOutcome::Success => summary.successful += 1,
                SubscriberOutcome::RetryScheduled => {
                    summary.failed += 1;
                    summary.retries += 1;
                }
                SubscriberOutcome::PermanentFailure => summary.failed += 1,
            }
        }

        let final_status = if summary.retries > 0 {
            // Stays `processing`; the retry scheduler finishes the job.
            None
        } else if summary.failed == 0 {
            Some(EventStatus::Completed)
        } else {
            Some(EventStatus::Failed)
        };
        if let Some(status) = final_status {
            self.store.set_event_status(event.id, status).await?;
        }

        info!(
            event = %event.id,
            subscribers = summary.subscribers,
            successful = summary.successful,
            failed = summary.failed,
            retries = summary.retries,
            "fan-out pass finished"
        );
        Ok(summary)
    }

    async fn deliver_to_subscriber(
        &self,
        event: &Event,
        subscriber_id: SubscriberId,
        headers: &CapturedHeaders,
    ) -> Result<SubscriberOutcome, RelayError> {
        let attempt_number = self.store.attempt_count(event.id, subscriber_id).await? + 1;

        let result = self
            .execute_delivery(event, subscriber_id, headers)
            .await?;

        match result {
            Executed::Permanent(reason) => {
                warn!(
                    event = %event.id,
                    subscriber = %subscriber_id,
                    attempt = attempt_number,
                    reason = %reason,
                    kind = "permanent",
                    "delivery not attempted"
                );
                self.record_permanent_failure(event.id, subscriber_id, &reason)
                    .await?;
                Ok(SubscriberOutcome::PermanentFailure)
            }
            Executed::Attempted(result) => {
                self.store
                    .record_attempt(NewAttempt {
                        event_id: event.id,
                        subscriber_id,
                        attempt_number,
                        status_code: result.status_code,
                        error: result.error.clone(),
                        attempted_at: Utc::now(),
                        duration_ms: Some(result.duration_ms),
                        next_retry_at: None,
                    })
                    .await?;

                if result.success {
                    return Ok(SubscriberOutcome::Success);
                }

                if self.policy.should_retry(result.status_code, attempt_number) {
                    let when = Utc::now()
                        + chrono::Duration::milliseconds(
                            self.backoff.delay(attempt_number).as_millis() as i64,
                        );
                    self.store
                        .schedule_retry(event.id, subscriber_id, attempt_number, when)
                        .await?;
                    debug!(
                        event = %event.id,
                        subscriber = %subscriber_id,
                        attempt = attempt_number,
                        retry_at = %when,
                        "retry scheduled"
                    );
                    Ok(SubscriberOutcome::RetryScheduled)
                } else {
                    warn!(
                        event = %event.id,
                        subscriber = %subscriber_id,
                        attempt = attempt_number,
                        status = ?result.status_code,
                        kind = "permanent",
                        "delivery failed, retry not admissible"
                    );
                    Ok(SubscriberOutcome::PermanentFailure)
                }
            }
        }
    }

    /// Resolve the transport chain and attempt delivery. Missing
    /// subscribers, missing bindings, unknown kinds, and invalid configs
    /// are permanent by definition.
    async fn execute_delivery(
        &self,
        event: &Event,
        subscriber_id: SubscriberId,
        headers: &CapturedHeaders,
    ) -> Result<Executed, RelayError> {
        let Some(binding) = self.store.transport_for(subscriber_id).await? else {
            return Ok(Executed::Permanent("transport binding missing".to_string()));
        };
        let Some(adapter) = self.transports.adapter(binding.kind) else {
            return Ok(Executed::Permanent(format!(
                "no adapter for transport kind {}",
                binding.kind
            )));
        };
        match serde_json::from_str::<serde_json::Value>(&binding.config)
            .map_err(|e| e.to_string())
            .and_then(|value| {
                adapter
                    .validate_config(&value)
                    .map_err(|e| e.to_string())
            }) {
            Ok(()) => {}
            Err(reason) => {
                return Ok(Executed::Permanent(format!(
                    "invalid transport config: {reason}"
                )))
            }
        }

        let request = DeliveryRequest {
            event_id: event.id,
            delivery_id: event.delivery_id.clone(),
            event_type: event.event_type.clone(),
            payload: event.payload.clone(),
            headers: headers.clone(),
            received_at: event.received_at,
        };
        Ok(Executed::Attempted(
            adapter.deliver(&request, &binding.config).await,
        ))
    }

    async fn record_permanent_failure(
        &self,
        event_id: EventId,
        subscriber_id: SubscriberId,
        reason: &str,
    ) -> Result<(), RelayError> {
        let attempt_number = self.store.attempt_count(event_id, subscriber_id).await? + 1;
        self.store
            .record_attempt(NewAttempt {
                event_id,
                subscriber_id,
                attempt_number,
                status_code: None,
                error: Some(reason.to_string()),
                attempted_at: Utc::now(),
                duration_ms: None,
                next_retry_at: None,
            })
            .await?;
        Ok(())
    }

    /// Re-execute one scheduled retry.
    ///
    /// The compare-and-swap claim makes concurrent schedulers safe: only
    /// the winner proceeds, and the cleared schedule is re-established on
    /// failure or left cleared on completion.
    pub async fn process_retry(&self, task: RetryTask) -> Result<RetryOutcome, RelayError> {
        let claimed = self
            .store
            .claim_retry(
                task.event_id,
                task.subscriber_id,
                task.attempt_number,
                task.scheduled_at,
            )
            .await?;
        if !claimed {
            debug!(
                event = %task.event_id,
                subscriber = %task.subscriber_id,
                "retry already claimed elsewhere"
            );
            return Ok(RetryOutcome::Skipped);
        }

        let Some(event) = self.store.event(task.event_id).await? else {
            warn!(event = %task.event_id, "retry task for unknown event");
            return Ok(RetryOutcome::Skipped);
        };
        if event.status.is_terminal() {
            debug!(
                event = %event.id,
                status = event.status.as_str(),
                "skipping retry for terminal event"
            );
            return Ok(RetryOutcome::Skipped);
        }

        self.store
            .set_event_status(event.id, EventStatus::Processing)
            .await?;

        let attempt_number = task.next_attempt;

        let headers = match self.cipher.open(&task.encrypted_headers) {
            Ok(headers) => headers,
            Err(e) => {
                warn!(
                    event = %event.id,
                    subscriber = %task.subscriber_id,
                    error = %e,
                    kind = "decrypt",
                    "abandoning retry task"
                );
                self.record_permanent_failure(
                    event.id,
                    task.subscriber_id,
                    "header decryption failed",
                )
                .await?;
                self.store
                    .set_event_status(event.id, EventStatus::Failed)
                    .await?;
                return Ok(RetryOutcome::Abandoned);
            }
        };

        // The subscriber may have disappeared between scheduling and now.
        if self.store.subscriber(task.subscriber_id).await?.is_none() {
            self.record_permanent_failure(event.id, task.subscriber_id, "subscriber removed")
                .await?;
            self.resolve_event_status(event.id).await?;
            return Ok(RetryOutcome::PermanentFailure);
        }

        let outcome = match self
            .execute_delivery(&event, task.subscriber_id, &headers)
            .await?
        {
            Executed::Permanent(reason) => {
                self.record_permanent_failure(event.id, task.subscriber_id, &reason)
                    .await?;
                RetryOutcome::PermanentFailure
            }
            Executed::Attempted(result) => {
                self.store
                    .record_attempt(NewAttempt {
                        event_id: event.id,
                        subscriber_id: task.subscriber_id,
                        attempt_number,
                        status_code: result.status_code,
                        error: result.error.clone(),
                        attempted_at: Utc::now(),
                        duration_ms: Some(result.duration_ms),
                        next_retry_at: None,
                    })
                    .await?;

                if result.success {
                    RetryOutcome::Delivered
                } else if attempt_number < self.dead_letter_threshold
                    && self.policy.should_retry(result.status_code, attempt_number)
                {
                    let when = Utc::now()
                        + chrono::Duration::milliseconds(
                            self.backoff.delay(attempt_number).as_millis() as i64,
                        );
                    self.store
                        .schedule_retry(event.id, task.subscriber_id, attempt_number, when)
                        .await?;
                    RetryOutcome::Rescheduled
                } else {
                    RetryOutcome::PermanentFailure
                }
            }
        };

        match outcome {
            RetryOutcome::Delivered | RetryOutcome::PermanentFailure => {
                self.resolve_event_status(event.id).await?;
            }
            _ => {}
        }

        info!(
            event = %event.id,
            subscriber = %task.subscriber_id,
            attempt = attempt_number,
            outcome = ?outcome,
            "retry processed"
        );
        Ok(outcome)
    }

    /// Derive the event status from all attempt rows.
    ///
    /// Completion reflects completion across every matched subscriber, not
    /// just the one whose retry succeeded: while any retry is scheduled the
    /// event stays `processing`; otherwise it completes only if each
    /// subscriber's latest attempt succeeded.
    async fn resolve_event_status(&self, event_id: EventId) -> Result<(), RelayError> {
        let attempts = self.store.attempts_for_event(event_id).await?;

        let mut latest: HashMap<SubscriberId, &crate::types::DeliveryAttempt> = HashMap::new();
        let mut counts: HashMap<SubscriberId, u32> = HashMap::new();
        for attempt in &attempts {
            if attempt.next_retry_at.is_some() {
                // Something is still scheduled; leave the event in flight.
                return Ok(());
            }
            *counts.entry(attempt.subscriber_id).or_default() += 1;
            let slot = latest.entry(attempt.subscriber_id).or_insert(attempt);
            if attempt.attempt_number >= slot.attempt_number {
                *slot = attempt;
            }
        }

        if latest.is_empty() {
            return Ok(());
        }

        let all_succeeded = latest.values().all(|a| a.succeeded());
        let status = if all_succeeded {
            EventStatus::Completed
        } else {
            let any_exhausted = latest.iter().any(|(sub, attempt)| {
                !attempt.succeeded()
                    && counts.get(sub).copied().unwrap_or(0) >= self.dead_letter_threshold
            });
            if any_exhausted {
                EventStatus::DeadLetter
            } else {
                EventStatus::Failed
            }
        };

        self.store.set_event_status(event_id, status).await?;
        Ok(())
    }
}

enum Executed {
    /// Delivery happened (or at least was attempted over the wire).
    Attempted(DeliveryResult),
    /// Delivery was impossible; the reason is permanent.
    Permanent(String),
}

enum SubscriberOutcome {
    Success,
    RetryScheduled,
    PermanentFailure,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{MemoryStore, StoredEvent};
    use crate::transport::Transport;
    use crate::types::{NewEvent, TransportKind};
    use async_trait::async_trait;
    use std::collections::{HashMap as StdHashMap, VecDeque};
    use std::sync::Mutex;

    /// Scripted adapter: pops one canned result per delivery.
    struct ScriptedTransport {
        results: Mutex<VecDeque<DeliveryResult>>,
        seen: Mutex<Vec<DeliveryRequest>>,
    }

    impl ScriptedTransport {
        fn new(results: Vec<DeliveryResult>) -> Arc<Self> {
            Arc::new(Self {
                results: Mutex::new(results.into()),
                seen: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        fn kind(&self) -> TransportKind {
            TransportKind::HttpWebhook
        }

        fn validate_config(&self, _config: &serde_json::Value) -> Result<(), crate::error::TransportError> {
            Ok(())
        }

        async fn deliver(&self, request: &DeliveryRequest, _config: &str) -> DeliveryResult {
            self.seen.lock().unwrap().push(request.clone());
            self.results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| DeliveryResult::failure(Some(500), "script exhausted", 1))
        }

        async fn close(&self) {}
    }

    fn test_config() -> Config {
        let mut overrides = StdHashMap::new();
        overrides.insert("retry.initial_delay_ms".to_string(), "10".to_string());
        overrides.insert("retry.max_delay_ms".to_string(), "50".to_string());
        overrides.insert("queue.dead_letter_threshold".to_string(), "3".to_string());
        Config::load_with_sources(Some(overrides)).unwrap()
    }

    async fn seed_event(store: &MemoryStore, config: &Config, delivery_id: &str) -> Event {
        let cipher = HeaderCipher::new(config.store.master_encryption_secret.clone());
        let mut headers = StdHashMap::new();
        headers.insert("x-github-event".to_string(), "push".to_string());

        let draft = NewEvent {
            delivery_id: delivery_id.to_string(),
            event_type: "push".to_string(),
            payload_hash: crate::crypto::payload_hash(b"{\"ref\":\"x\"}"),
            payload_size: 11,
            payload: "{\"ref\":\"x\"}".to_string(),
            encrypted_headers: cipher.seal(&headers).unwrap(),
            received_at: Utc::now(),
        };
        match store.store_event(draft).await.unwrap() {
            StoredEvent::Created(event) => event,
            StoredEvent::Duplicate(_) => panic!("expected fresh event"),
        }
    }

    fn engine_with(
        store: Arc<MemoryStore>,
        transport: Arc<ScriptedTransport>,
        config: &Config,
    ) -> DeliveryEngine {
        let registry = Arc::new(TransportRegistry::with_adapters(vec![transport]));
        DeliveryEngine::new(store, registry, config)
    }

    #[tokio::test]
    async fn no_matching_subscribers_completes_immediately() {
        let config = test_config();
        let store = Arc::new(MemoryStore::new());
        let transport = ScriptedTransport::new(vec![]);
        let engine = engine_with(store.clone(), transport, &config);

        let event = seed_event(&store, &config, "D1").await;
        let summary = engine.process_event(event.clone()).await.unwrap();

        assert_eq!(summary.subscribers, 0);
        let stored = store.event(event.id).await.unwrap().unwrap();
        assert_eq!(stored.status, EventStatus::Completed);
        assert!(store.attempts_for_event(event.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn successful_fan_out_records_attempt_and_completes() {
        let config = test_config();
        let store = Arc::new(MemoryStore::new());
        store
            .add_subscriber("a", vec!["push".into()], TransportKind::HttpWebhook, "{}")
            .await
            .unwrap();
        let transport = ScriptedTransport::new(vec![DeliveryResult::success(200, 4)]);
        let engine = engine_with(store.clone(), transport, &config);

        let event = seed_event(&store, &config, "D1").await;
        let summary = engine.process_event(event.clone()).await.unwrap();

        assert_eq!(summary.subscribers, 1);
        assert_eq!(summary.successful, 1);
        assert_eq!(summary.failed, 0);
        assert_eq!(summary.retries, 0);

        let attempts = store.attempts_for_event(event.id).await.unwrap();
        assert_eq!(attempts.len(), 1);
        assert_eq!(attempts[0].attempt_number, 1);
        assert_eq!(attempts[0].status_code, Some(200));
        assert!(attempts[0].error.is_none());
        assert!(attempts[0].next_retry_at.is_none());

        let stored = store.event(event.id).await.unwrap().unwrap();
        assert_eq!(stored.status, EventStatus::Completed);
    }

    #[tokio::test]
    async fn adapter_receives_payload_and_decrypted_headers() {
        let config = test_config();
        let store = Arc::new(MemoryStore::new());
        store
            .add_subscriber("a", vec!["push".into()], TransportKind::HttpWebhook, "{}")
            .await
            .unwrap();
        let transport = ScriptedTransport::new(vec![DeliveryResult::success(200, 1)]);
        let engine = engine_with(store.clone(), transport.clone(), &config);

        let event = seed_event(&store, &config, "D1").await;
        engine.process_event(event.clone()).await.unwrap();

        let seen = transport.seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].payload, event.payload);
        assert_eq!(seen[0].delivery_id, "D1");
        // Headers arrive decrypted.
        assert_eq!(seen[0].headers.get("x-github-event").map(String::as_str), Some("push"));
    }

    #[tokio::test]
    async fn mixed_outcomes_schedule_retry_and_keep_event_in_flight() {
        let config = test_config();
        let store = Arc::new(MemoryStore::new());
        store
            .add_subscriber("a", vec!["push".into()], TransportKind::HttpWebhook, "{}")
            .await
            .unwrap();
        store
            .add_subscriber(
                "b",
                vec!["push".into(), "pull_request".into()],
                TransportKind::HttpWebhook,
                "{}",
            )
            .await
            .unwrap();

        let transport = ScriptedTransport::new(vec![
            DeliveryResult::success(200, 3),
            DeliveryResult::failure(Some(502), "bad gateway", 3),
        ]);
        let engine = engine_with(store.clone(), transport, &config);

        let event = seed_event(&store, &config, "D1").await;
        let summary = engine.process_event(event.clone()).await.unwrap();

        assert_eq!(summary.subscribers, 2);
        assert_eq!(summary.successful, 1);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.retries, 1);

        let stored = store.event(event.id).await.unwrap().unwrap();
        assert_eq!(stored.status, EventStatus::Processing);

        let scheduled: Vec<_> = store
            .attempts_for_event(event.id)
            .await
            .unwrap()
            .into_iter()
            .filter(|a| a.next_retry_at.is_some())
            .collect();
        assert_eq!(scheduled.len(), 1);
        assert_eq!(scheduled[0].status_code, Some(502));
    }

    #[tokio::test]
    async fn non_retryable_status_fails_permanently() {
        let config = test_config();
        let store = Arc::new(MemoryStore::new());
        store
            .add_subscriber("a", vec!["push".into()], TransportKind::HttpWebhook, "{}")
            .await
            .unwrap();
        let transport =
            ScriptedTransport::new(vec![DeliveryResult::failure(Some(404), "gone", 2)]);
        let engine = engine_with(store.clone(), transport, &config);

        let event = seed_event(&store, &config, "D1").await;
        let summary = engine.process_event(event.clone()).await.unwrap();

        assert_eq!(summary.failed, 1);
        assert_eq!(summary.retries, 0);
        let stored = store.event(event.id).await.unwrap().unwrap();
        assert_eq!(stored.status, EventStatus::Failed);
    }

    #[tokio::test]
    async fn retry_success_completes_event() {
        let config = test_config();
        let store = Arc::new(MemoryStore::new());
        store
            .add_subscriber("a", vec!["push".into()], TransportKind::HttpWebhook, "{}")
            .await
            .unwrap();

        let transport = ScriptedTransport::new(vec![
            DeliveryResult::failure(Some(503), "unavailable", 2),
            DeliveryResult::success(200, 2),
        ]);
        let engine = engine_with(store.clone(), transport, &config);

        let event = seed_event(&store, &config, "D1").await;
        engine.process_event(event.clone()).await.unwrap();

        // Make the schedule due, then run it.
        let sub = store.list_subscribers().await.unwrap()[0].id;
        let past = Utc::now() - chrono::Duration::seconds(1);
        store.schedule_retry(event.id, sub, 1, past).await.unwrap();
        let tasks = store.due_retries(10).await.unwrap();
        assert_eq!(tasks.len(), 1);

        let outcome = engine.process_retry(tasks[0].clone()).await.unwrap();
        assert_eq!(outcome, RetryOutcome::Delivered);

        let attempts = store.attempts_for_event(event.id).await.unwrap();
        assert_eq!(attempts.len(), 2);
        assert_eq!(attempts[1].attempt_number, 2);
        assert_eq!(attempts[1].status_code, Some(200));
        assert!(attempts.iter().all(|a| a.next_retry_at.is_none()));

        let stored = store.event(event.id).await.unwrap().unwrap();
        assert_eq!(stored.status, EventStatus::Completed);
    }

    #[tokio::test]
    async fn exhausted_retries_dead_letter_the_event() {
        let config = test_config(); // max_attempts 3, threshold 3
        let store = Arc::new(MemoryStore::new());
        store
            .add_subscriber("a", vec!["push".into()], TransportKind::HttpWebhook, "{}")
            .await
            .unwrap();

        let transport = ScriptedTransport::new(vec![
            DeliveryResult::failure(Some(500), "boom", 1),
            DeliveryResult::failure(Some(500), "boom", 1),
            DeliveryResult::failure(Some(500), "boom", 1),
        ]);
        let engine = engine_with(store.clone(), transport, &config);

        let event = seed_event(&store, &config, "D1").await;
        engine.process_event(event.clone()).await.unwrap();
        let sub = store.list_subscribers().await.unwrap()[0].id;

        for expected_attempt in 2..=3u32 {
            let past = Utc::now() - chrono::Duration::seconds(1);
            store
                .schedule_retry(event.id, sub, expected_attempt - 1, past)
                .await
                .unwrap();
            let tasks = store.due_retries(10).await.unwrap();
            assert_eq!(tasks.len(), 1, "attempt {expected_attempt}");
            engine.process_retry(tasks[0].clone()).await.unwrap();
        }

        let attempts = store.attempts_for_event(event.id).await.unwrap();
        assert_eq!(attempts.len(), 3);
        assert!(attempts.iter().all(|a| a.status_code == Some(500)));
        assert!(attempts.iter().all(|a| a.next_retry_at.is_none()));

        let stored = store.event(event.id).await.unwrap().unwrap();
        assert_eq!(stored.status, EventStatus::DeadLetter);
    }

    #[tokio::test]
    async fn lost_claim_skips_task() {
        let config = test_config();
        let store = Arc::new(MemoryStore::new());
        store
            .add_subscriber("a", vec!["push".into()], TransportKind::HttpWebhook, "{}")
            .await
            .unwrap();
        let transport =
            ScriptedTransport::new(vec![DeliveryResult::failure(Some(503), "x", 1)]);
        let engine = engine_with(store.clone(), transport, &config);

        let event = seed_event(&store, &config, "D1").await;
        engine.process_event(event.clone()).await.unwrap();
        let sub = store.list_subscribers().await.unwrap()[0].id;

        let past = Utc::now() - chrono::Duration::seconds(1);
        store.schedule_retry(event.id, sub, 1, past).await.unwrap();
        let tasks = store.due_retries(10).await.unwrap();

        // Another poller claims first.
        assert!(store.claim_retry(event.id, sub, 1, past).await.unwrap());

        let outcome = engine.process_retry(tasks[0].clone()).await.unwrap();
        assert_eq!(outcome, RetryOutcome::Skipped);
        // No extra attempt row was written.
        assert_eq!(store.attempts_for_event(event.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn subscriber_removed_before_retry_is_permanent() {
        let config = test_config();
        let store = Arc::new(MemoryStore::new());
        let sub = store
            .add_subscriber("a", vec!["push".into()], TransportKind::HttpWebhook, "{}")
            .await
            .unwrap();
        let transport =
            ScriptedTransport::new(vec![DeliveryResult::failure(Some(503), "x", 1)]);
        let engine = engine_with(store.clone(), transport, &config);

        let event = seed_event(&store, &config, "D1").await;
        engine.process_event(event.clone()).await.unwrap();

        let past = Utc::now() - chrono::Duration::seconds(1);
        store.schedule_retry(event.id, sub.id, 1, past).await.unwrap();
        let tasks = store.due_retries(10).await.unwrap();

        store.remove_subscriber(sub.id).await;

        let outcome = engine.process_retry(tasks[0].clone()).await.unwrap();
        assert_eq!(outcome, RetryOutcome::PermanentFailure);

        let attempts = store.attempts_for_event(event.id).await.unwrap();
        assert_eq!(attempts.len(), 2);
        assert_eq!(
            attempts[1].error.as_deref(),
            Some("subscriber removed")
        );
        assert!(attempts[1].next_retry_at.is_none());
    }

    #[tokio::test]
    async fn snapshot_refreshes_when_version_advances() {
        let config = test_config();
        let store = Arc::new(MemoryStore::new());
        let transport = ScriptedTransport::new(vec![
            DeliveryResult::success(200, 1),
            DeliveryResult::success(200, 1),
        ]);
        let engine = engine_with(store.clone(), transport, &config);

        let event = seed_event(&store, &config, "D1").await;
        let summary = engine.process_event(event).await.unwrap();
        assert_eq!(summary.subscribers, 0);

        // Mutation bumps the version; the next pass must observe it.
        store
            .add_subscriber("late", vec!["push".into()], TransportKind::HttpWebhook, "{}")
            .await
            .unwrap();

        let event = seed_event(&store, &config, "D2").await;
        let summary = engine.process_event(event).await.unwrap();
        assert_eq!(summary.subscribers, 1);
        assert_eq!(summary.successful, 1);
    }
}
