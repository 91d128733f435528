use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::StoreError;
use crate::types::{
    AttemptId, DeliveryAttempt, Event, EventId, EventStats, EventStatus, NewAttempt, NewEvent,
    RetryTask, Subscriber, SubscriberId, TransportBinding, TransportKind,
};

/// Outcome of `EventStore::store_event`.
#[derive(Debug, Clone)]
pub enum StoredEvent {
    Created(Event),
    /// The upstream delivery id was seen before; carries the original row's
    /// id so the ingest path can answer idempotently.
    Duplicate(EventId),
}

/// Durable record of events, delivery attempts, and the subscriber
/// read-side. The relay owns every persisted row; the delivery engine holds
/// only transient references.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Atomically insert a new event with status `pending`. Duplicate
    /// upstream delivery ids yield `StoredEvent::Duplicate` instead of a
    /// second row.
    async fn store_event(&self, draft: NewEvent) -> Result<StoredEvent, StoreError>;

    async fn event(&self, id: EventId) -> Result<Option<Event>, StoreError>;

    /// Idempotent status update along the allowed state machine edges.
    /// Transitions out of a terminal state are ignored (logged); other
    /// disallowed transitions are an error. Terminal transitions stamp
    /// `processed_at`.
    async fn set_event_status(&self, id: EventId, status: EventStatus) -> Result<(), StoreError>;

    async fn event_stats(&self) -> Result<EventStats, StoreError>;

    /// Append a delivery attempt row.
    async fn record_attempt(&self, attempt: NewAttempt) -> Result<AttemptId, StoreError>;

    /// Number of attempts recorded for the pair so far. Used to keep
    /// attempt numbers dense across queue redeliveries.
    async fn attempt_count(
        &self,
        event: EventId,
        subscriber: SubscriberId,
    ) -> Result<u32, StoreError>;

    async fn attempts_for_event(&self, event: EventId)
        -> Result<Vec<DeliveryAttempt>, StoreError>;

    /// Set `next_retry_at` on the given attempt row. Any other scheduled
    /// row for the same pair is cleared first so at most one schedule
    /// exists per (event, subscriber).
    async fn schedule_retry(
        &self,
        event: EventId,
        subscriber: SubscriberId,
        attempt_number: u32,
        when: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Compare-and-swap claim: clear `next_retry_at` only if it still
    /// equals `expected`. Returns whether this caller won the row. Losing
    /// means another poller already owns the retry.
    async fn claim_retry(
        &self,
        event: EventId,
        subscriber: SubscriberId,
        attempt_number: u32,
        expected: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Scheduled retries due at or before now, joined with event payload
    /// and headers, ordered by schedule ascending.
    async fn due_retries(&self, limit: usize) -> Result<Vec<RetryTask>, StoreError>;

    /// Fraction of attempts since `since` that did not succeed. Input to
    /// the readiness check.
    async fn failure_rate_since(&self, since: DateTime<Utc>) -> Result<f64, StoreError>;

    // Subscriber read-side. Mutation happens through the external
    // management surface; the engine only reads, guided by the version
    // counter.

    async fn subscriber(&self, id: SubscriberId) -> Result<Option<Subscriber>, StoreError>;

    async fn list_subscribers(&self) -> Result<Vec<Subscriber>, StoreError>;

    async fn transport_for(
        &self,
        subscriber: SubscriberId,
    ) -> Result<Option<TransportBinding>, StoreError>;

    /// Monotone counter bumped on every subscriber mutation; the engine
    /// refreshes its snapshot whenever it advances.
    fn subscribers_version(&self) -> u64;
}

#[derive(Default)]
struct MemoryState {
    events: HashMap<EventId, Event>,
    delivery_index: HashMap<String, EventId>,
    attempts: Vec<DeliveryAttempt>,
    subscribers: BTreeMap<SubscriberId, Subscriber>,
    transports: HashMap<SubscriberId, TransportBinding>,
    next_event_id: i64,
    next_attempt_id: i64,
    next_subscriber_id: i64,
}

/// In-memory store for single-process deployments and tests. Durability is
/// process lifetime.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    version: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a subscriber with its transport binding (1:1). Used by
    /// process wiring and tests; production mutations arrive through the
    /// management surface.
    pub async fn add_subscriber(
        &self,
        name: impl Into<String>,
        event_types: Vec<String>,
        kind: TransportKind,
        transport_config: impl Into<String>,
    ) -> Result<Subscriber, StoreError> {
        if event_types.is_empty() {
            return Err(StoreError::Backend(
                "subscriber must declare at least one event type".to_string(),
            ));
        }

        let mut state = self.state.lock().await;
        state.next_subscriber_id += 1;
        let id = SubscriberId(state.next_subscriber_id);
        let name = name.into();

        let subscriber = Subscriber {
            id,
            name: name.clone(),
            event_types,
        };
        let binding = TransportBinding {
            id: state.next_subscriber_id,
            subscriber_id: id,
            name,
            kind,
            config: transport_config.into(),
        };

        state.subscribers.insert(id, subscriber.clone());
        state.transports.insert(id, binding);
        self.version.fetch_add(1, Ordering::SeqCst);
        Ok(subscriber)
    }

    /// Look up an event by its upstream delivery id.
    pub async fn event_by_delivery_id(&self, delivery_id: &str) -> Option<Event> {
        let state = self.state.lock().await;
        let id = state.delivery_index.get(delivery_id)?;
        state.events.get(id).cloned()
    }

    /// Delete a subscriber and, with it, its transport binding.
    pub async fn remove_subscriber(&self, id: SubscriberId) -> bool {
        let mut state = self.state.lock().await;
        let removed = state.subscribers.remove(&id).is_some();
        state.transports.remove(&id);
        if removed {
            self.version.fetch_add(1, Ordering::SeqCst);
        }
        removed
    }
}

#[async_trait]
impl EventStore for MemoryStore {
    async fn store_event(&self, draft: NewEvent) -> Result<StoredEvent, StoreError> {
        let mut state = self.state.lock().await;

        if let Some(existing) = state.delivery_index.get(&draft.delivery_id) {
            return Ok(StoredEvent::Duplicate(*existing));
        }

        state.next_event_id += 1;
        let id = EventId(state.next_event_id);
        let event = Event {
            id,
            delivery_id: draft.delivery_id.clone(),
            event_type: draft.event_type,
            payload_hash: draft.payload_hash,
            payload_size: draft.payload_size,
            payload: draft.payload,
            encrypted_headers: draft.encrypted_headers,
            received_at: draft.received_at,
            processed_at: None,
            status: EventStatus::Pending,
        };

        state.delivery_index.insert(draft.delivery_id, id);
        state.events.insert(id, event.clone());
        Ok(StoredEvent::Created(event))
    }

    async fn event(&self, id: EventId) -> Result<Option<Event>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.events.get(&id).cloned())
    }

    async fn set_event_status(&self, id: EventId, status: EventStatus) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let event = state
            .events
            .get_mut(&id)
            .ok_or(StoreError::EventNotFound(id))?;

        if event.status == status {
            return Ok(());
        }
        if event.status.is_terminal() {
            warn!(
                event = %id,
                from = event.status.as_str(),
                to = status.as_str(),
                "ignoring status change on terminal event"
            );
            return Ok(());
        }
        if !event.status.can_transition_to(status) {
            return Err(StoreError::InvalidTransition {
                event: id,
                from: event.status.as_str(),
                to: status.as_str(),
            });
        }

        event.status = status;
        if status.is_terminal() || status == EventStatus::Failed {
            event.processed_at = Some(Utc::now());
        }
        Ok(())
    }

    async fn event_stats(&self) -> Result<EventStats, StoreError> {
        let state = self.state.lock().await;
        let mut stats = EventStats {
            total: state.events.len() as u64,
            ..Default::default()
        };
        for event in state.events.values() {
            match event.status {
                EventStatus::Pending => stats.pending += 1,
                EventStatus::Failed => stats.failed += 1,
                EventStatus::Completed => stats.completed += 1,
                _ => {}
            }
        }
        Ok(stats)
    }

    async fn record_attempt(&self, attempt: NewAttempt) -> Result<AttemptId, StoreError> {
        let mut state = self.state.lock().await;
        if !state.events.contains_key(&attempt.event_id) {
            return Err(StoreError::EventNotFound(attempt.event_id));
        }

        state.next_attempt_id += 1;
        let id = AttemptId(state.next_attempt_id);
        state.attempts.push(DeliveryAttempt {
            id,
            event_id: attempt.event_id,
            subscriber_id: attempt.subscriber_id,
            attempt_number: attempt.attempt_number,
            status_code: attempt.status_code,
            error: attempt.error,
            attempted_at: attempt.attempted_at,
            duration_ms: attempt.duration_ms,
            next_retry_at: attempt.next_retry_at,
        });
        Ok(id)
    }

    async fn attempt_count(
        &self,
        event: EventId,
        subscriber: SubscriberId,
    ) -> Result<u32, StoreError> {
        let state = self.state.lock().await;
        Ok(state
            .attempts
            .iter()
            .filter(|a| a.event_id == event && a.subscriber_id == subscriber)
            .count() as u32)
    }

    async fn attempts_for_event(
        &self,
        event: EventId,
    ) -> Result<Vec<DeliveryAttempt>, StoreError> {
        let state = self.state.lock().await;
        let mut rows: Vec<DeliveryAttempt> = state
            .attempts
            .iter()
            .filter(|a| a.event_id == event)
            .cloned()
            .collect();
        rows.sort_by_key(|a| (a.subscriber_id, a.attempt_number));
        Ok(rows)
    }

    async fn schedule_retry(
        &self,
        event: EventId,
        subscriber: SubscriberId,
        attempt_number: u32,
        when: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let mut target_seen = false;

        for attempt in state
            .attempts
            .iter_mut()
            .filter(|a| a.event_id == event && a.subscriber_id == subscriber)
        {
            if attempt.attempt_number == attempt_number {
                attempt.next_retry_at = Some(when);
                target_seen = true;
            } else {
                // At most one scheduled row per pair.
                attempt.next_retry_at = None;
            }
        }

        if target_seen {
            Ok(())
        } else {
            Err(StoreError::Backend(format!(
                "no attempt row {attempt_number} for event {event} subscriber {subscriber}"
            )))
        }
    }

    async fn claim_retry(
        &self,
        event: EventId,
        subscriber: SubscriberId,
        attempt_number: u32,
        expected: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        for attempt in state.attempts.iter_mut() {
            if attempt.event_id == event
                && attempt.subscriber_id == subscriber
                && attempt.attempt_number == attempt_number
            {
                if attempt.next_retry_at == Some(expected) {
                    attempt.next_retry_at = None;
                    return Ok(true);
                }
                return Ok(false);
            }
        }
        Ok(false)
    }

    async fn due_retries(&self, limit: usize) -> Result<Vec<RetryTask>, StoreError> {
        let state = self.state.lock().await;
        let now = Utc::now();

        let mut due: Vec<(&DeliveryAttempt, DateTime<Utc>)> = state
            .attempts
            .iter()
            .filter_map(|a| a.next_retry_at.filter(|at| *at <= now).map(|at| (a, at)))
            .collect();
        due.sort_by_key(|(_, at)| *at);

        let tasks = due
            .into_iter()
            .take(limit)
            .filter_map(|(attempt, scheduled_at)| {
                let event = state.events.get(&attempt.event_id)?;
                Some(RetryTask {
                    event_id: attempt.event_id,
                    subscriber_id: attempt.subscriber_id,
                    attempt_number: attempt.attempt_number,
                    next_attempt: attempt.attempt_number + 1,
                    scheduled_at,
                    event_type: event.event_type.clone(),
                    payload: event.payload.clone(),
                    encrypted_headers: event.encrypted_headers.clone(),
                })
            })
            .collect();
        Ok(tasks)
    }

    async fn failure_rate_since(&self, since: DateTime<Utc>) -> Result<f64, StoreError> {
        let state = self.state.lock().await;
        let mut total = 0u64;
        let mut failed = 0u64;
        for attempt in state.attempts.iter().filter(|a| a.attempted_at >= since) {
            total += 1;
            if !attempt.succeeded() {
                failed += 1;
            }
        }
        if total == 0 {
            Ok(0.0)
        } else {
            Ok(failed as f64 / total as f64)
        }
    }

    async fn subscriber(&self, id: SubscriberId) -> Result<Option<Subscriber>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.subscribers.get(&id).cloned())
    }

    async fn list_subscribers(&self) -> Result<Vec<Subscriber>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.subscribers.values().cloned().collect())
    }

    async fn transport_for(
        &self,
        subscriber: SubscriberId,
    ) -> Result<Option<TransportBinding>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.transports.get(&subscriber).cloned())
    }

    fn subscribers_version(&self) -> u64 {
        self.version.load(Ordering::SeqCst)
    }
}
