use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_postgres::{Client, NoTls, Row};
use tracing::{error, warn};

use crate::error::{RelayError, StoreError};
use crate::store::{EventStore, StoredEvent};
use crate::types::{
    AttemptId, DeliveryAttempt, Event, EventId, EventStats, EventStatus, NewAttempt, NewEvent,
    RetryTask, Subscriber, SubscriberId, TransportBinding, TransportKind,
};

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS subscribers (
        id BIGSERIAL PRIMARY KEY,
        name TEXT NOT NULL,
        events TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS transports (
        id BIGSERIAL PRIMARY KEY,
        subscriber_id BIGINT NOT NULL REFERENCES subscribers(id) ON DELETE CASCADE,
        name TEXT NOT NULL,
        config TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS events (
        id BIGSERIAL PRIMARY KEY,
        upstream_delivery_id TEXT NOT NULL,
        event_type TEXT NOT NULL,
        payload_hash TEXT NOT NULL,
        payload_size BIGINT NOT NULL,
        payload_data TEXT NOT NULL,
        headers_data TEXT NOT NULL,
        received_at TIMESTAMPTZ NOT NULL,
        processed_at TIMESTAMPTZ,
        status TEXT NOT NULL
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS idx_events_delivery_id
        ON events(upstream_delivery_id)",
    "CREATE INDEX IF NOT EXISTS idx_events_status ON events(status)",
    "CREATE INDEX IF NOT EXISTS idx_events_received_at ON events(received_at DESC)",
    "CREATE TABLE IF NOT EXISTS delivery_attempts (
        id BIGSERIAL PRIMARY KEY,
        event_id BIGINT NOT NULL REFERENCES events(id),
        subscriber_id BIGINT NOT NULL,
        attempt_number INT NOT NULL,
        status_code INT,
        error_message TEXT,
        attempted_at TIMESTAMPTZ NOT NULL,
        duration_ms BIGINT,
        next_retry_at TIMESTAMPTZ
    )",
    "CREATE INDEX IF NOT EXISTS idx_attempts_event_subscriber
        ON delivery_attempts(event_id, subscriber_id)",
    "CREATE INDEX IF NOT EXISTS idx_attempts_next_retry
        ON delivery_attempts(next_retry_at) WHERE next_retry_at IS NOT NULL",
];

/// Postgres-backed event store.
///
/// Uniqueness of the upstream delivery id is enforced by a unique index;
/// the retry claim is a conditional update on `next_retry_at`, so
/// concurrent pollers coordinate through row-level atomicity alone.
pub struct PostgresStore {
    client: Client,
    version: AtomicU64,
}

impl PostgresStore {
    /// Connect and ensure the schema exists.
    pub async fn connect(connection_string: &str) -> Result<Self, RelayError> {
        let (client, connection) = tokio_postgres::connect(connection_string, NoTls)
            .await
            .map_err(|e| RelayError::Config(format!("postgres connect failed: {e}")))?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                error!(error = %e, "postgres connection terminated");
            }
        });

        let store = Self {
            client,
            version: AtomicU64::new(0),
        };
        store.ensure_schema().await.map_err(RelayError::Store)?;
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            self.client
                .execute(*statement, &[])
                .await
                .map_err(backend)?;
        }
        Ok(())
    }

    fn row_to_event(row: &Row) -> Result<Event, StoreError> {
        let status: String = row.get("status");
        Ok(Event {
            id: EventId(row.get("id")),
            delivery_id: row.get("upstream_delivery_id"),
            event_type: row.get("event_type"),
            payload_hash: row.get("payload_hash"),
            payload_size: row.get("payload_size"),
            payload: row.get("payload_data"),
            encrypted_headers: row.get("headers_data"),
            received_at: row.get("received_at"),
            processed_at: row.get("processed_at"),
            status: status.parse().map_err(StoreError::Backend)?,
        })
    }

    fn row_to_attempt(row: &Row) -> DeliveryAttempt {
        DeliveryAttempt {
            id: AttemptId(row.get("id")),
            event_id: EventId(row.get("event_id")),
            subscriber_id: SubscriberId(row.get("subscriber_id")),
            attempt_number: row.get::<_, i32>("attempt_number") as u32,
            status_code: row
                .get::<_, Option<i32>>("status_code")
                .map(|c| c as u16),
            error: row.get("error_message"),
            attempted_at: row.get("attempted_at"),
            duration_ms: row.get::<_, Option<i64>>("duration_ms").map(|d| d as u64),
            next_retry_at: row.get("next_retry_at"),
        }
    }

    fn row_to_subscriber(row: &Row) -> Result<Subscriber, StoreError> {
        let events: String = row.get("events");
        let event_types: Vec<String> =
            serde_json::from_str(&events).map_err(|e| StoreError::Backend(e.to_string()))?;
        Ok(Subscriber {
            id: SubscriberId(row.get("id")),
            name: row.get("name"),
            event_types,
        })
    }
}

fn backend(e: tokio_postgres::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

#[async_trait]
impl EventStore for PostgresStore {
    async fn store_event(&self, draft: NewEvent) -> Result<StoredEvent, StoreError> {
        let inserted = self
            .client
            .query_opt(
                "INSERT INTO events (upstream_delivery_id, event_type, payload_hash,
                    payload_size, payload_data, headers_data, received_at, status)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, 'pending')
                 ON CONFLICT (upstream_delivery_id) DO NOTHING
                 RETURNING id",
                &[
                    &draft.delivery_id,
                    &draft.event_type,
                    &draft.payload_hash,
                    &draft.payload_size,
                    &draft.payload,
                    &draft.encrypted_headers,
                    &draft.received_at,
                ],
            )
            .await
            .map_err(backend)?;

        match inserted {
            Some(row) => {
                let id = EventId(row.get(0));
                let event = self
                    .event(id)
                    .await?
                    .ok_or_else(|| StoreError::Backend("inserted row vanished".to_string()))?;
                Ok(StoredEvent::Created(event))
            }
            None => {
                let row = self
                    .client
                    .query_one(
                        "SELECT id FROM events WHERE upstream_delivery_id = $1",
                        &[&draft.delivery_id],
                    )
                    .await
                    .map_err(backend)?;
                Ok(StoredEvent::Duplicate(EventId(row.get(0))))
            }
        }
    }

    async fn event(&self, id: EventId) -> Result<Option<Event>, StoreError> {
        let row = self
            .client
            .query_opt("SELECT * FROM events WHERE id = $1", &[&id.0])
            .await
            .map_err(backend)?;
        row.map(|r| Self::row_to_event(&r)).transpose()
    }

    async fn set_event_status(&self, id: EventId, status: EventStatus) -> Result<(), StoreError> {
        let current = self
            .event(id)
            .await?
            .ok_or(StoreError::EventNotFound(id))?;

        if current.status == status {
            return Ok(());
        }
        if current.status.is_terminal() {
            warn!(
                event = %id,
                from = current.status.as_str(),
                to = status.as_str(),
                "ignoring status change on terminal event"
            );
            return Ok(());
        }
        if !current.status.can_transition_to(status) {
            return Err(StoreError::InvalidTransition {
                event: id,
                from: current.status.as_str(),
                to: status.as_str(),
            });
        }

        let stamp = status.is_terminal() || status == EventStatus::Failed;
        // Conditional on the observed status so racing writers cannot step
        // over a terminal transition.
        self.client
            .execute(
                "UPDATE events
                 SET status = $2,
                     processed_at = CASE WHEN $3 THEN now() ELSE processed_at END
                 WHERE id = $1 AND status = $4",
                &[&id.0, &status.as_str(), &stamp, &current.status.as_str()],
            )
            .await
            .map_err(backend)?;
        Ok(())
    }

    async fn event_stats(&self) -> Result<EventStats, StoreError> {
        let row = self
            .client
            .query_one(
                "SELECT count(*) AS total,
                        count(*) FILTER (WHERE status = 'pending') AS pending,
                        count(*) FILTER (WHERE status = 'failed') AS failed,
                        count(*) FILTER (WHERE status = 'completed') AS completed
                 FROM events",
                &[],
            )
            .await
            .map_err(backend)?;
        Ok(EventStats {
            total: row.get::<_, i64>("total") as u64,
            pending: row.get::<_, i64>("pending") as u64,
            failed: row.get::<_, i64>("failed") as u64,
            completed: row.get::<_, i64>("completed") as u64,
        })
    }

    async fn record_attempt(&self, attempt: NewAttempt) -> Result<AttemptId, StoreError> {
        let row = self
            .client
            .query_one(
                "INSERT INTO delivery_attempts (event_id, subscriber_id, attempt_number,
                    status_code, error_message, attempted_at, duration_ms, next_retry_at)
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                 RETURNING id",
                &[
                    &attempt.event_id.0,
                    &attempt.subscriber_id.0,
                    &(attempt.attempt_number as i32),
                    &attempt.status_code.map(|c| c as i32),
                    &attempt.error,
                    &attempt.attempted_at,
                    &attempt.duration_ms.map(|d| d as i64),
                    &attempt.next_retry_at,
                ],
            )
            .await
            .map_err(backend)?;
        Ok(AttemptId(row.get(0)))
    }

    async fn attempt_count(
        &self,
        event: EventId,
        subscriber: SubscriberId,
    ) -> Result<u32, StoreError> {
        let row = self
            .client
            .query_one(
                "SELECT count(*) FROM delivery_attempts
                 WHERE event_id = $1 AND subscriber_id = $2",
                &[&event.0, &subscriber.0],
            )
            .await
            .map_err(backend)?;
        Ok(row.get::<_, i64>(0) as u32)
    }

    async fn attempts_for_event(
        &self,
        event: EventId,
    ) -> Result<Vec<DeliveryAttempt>, StoreError> {
        let rows = self
            .client
            .query(
                "SELECT * FROM delivery_attempts
                 WHERE event_id = $1
                 ORDER BY subscriber_id, attempt_number",
                &[&event.0],
            )
            .await
            .map_err(backend)?;
        Ok(rows.iter().map(Self::row_to_attempt).collect())
    }

    async fn schedule_retry(
        &self,
        event: EventId,
        subscriber: SubscriberId,
        attempt_number: u32,
        when: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        // Clearing siblings and setting the target in one statement keeps
        // the one-scheduled-row-per-pair invariant without a transaction.
        let updated = self
            .client
            .execute(
                "UPDATE delivery_attempts
                 SET next_retry_at = CASE WHEN attempt_number = $3 THEN $4 ELSE NULL END
                 WHERE event_id = $1 AND subscriber_id = $2
                   AND (attempt_number = $3 OR next_retry_at IS NOT NULL)",
                &[&event.0, &subscriber.0, &(attempt_number as i32), &when],
            )
            .await
            .map_err(backend)?;

        if updated == 0 {
            return Err(StoreError::Backend(format!(
                "no attempt row {attempt_number} for event {event} subscriber {subscriber}"
            )));
        }
        Ok(())
    }

    async fn claim_retry(
        &self,
        event: EventId,
        subscriber: SubscriberId,
        attempt_number: u32,
        expected: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let claimed = self
            .client
            .execute(
                "UPDATE delivery_attempts
                 SET next_retry_at = NULL
                 WHERE event_id = $1 AND subscriber_id = $2
                   AND attempt_number = $3 AND next_retry_at = $4",
                &[&event.0, &subscriber.0, &(attempt_number as i32), &expected],
            )
            .await
            .map_err(backend)?;
        Ok(claimed == 1)
    }

    async fn due_retries(&self, limit: usize) -> Result<Vec<RetryTask>, StoreError> {
        let rows = self
            .client
            .query(
                "SELECT a.event_id, a.subscriber_id, a.attempt_number, a.next_retry_at,
                        e.event_type, e.payload_data, e.headers_data
                 FROM delivery_attempts a
                 JOIN events e ON e.id = a.event_id
                 WHERE a.next_retry_at IS NOT NULL AND a.next_retry_at <= now()
                 ORDER BY a.next_retry_at ASC
                 LIMIT $1",
                &[&(limit as i64)],
            )
            .await
            .map_err(backend)?;

        Ok(rows
            .iter()
            .map(|row| {
                let attempt_number = row.get::<_, i32>("attempt_number") as u32;
                RetryTask {
                    event_id: EventId(row.get("event_id")),
                    subscriber_id: SubscriberId(row.get("subscriber_id")),
                    attempt_number,
                    next_attempt: attempt_number + 1,
                    scheduled_at: row.get("next_retry_at"),
                    event_type: row.get("event_type"),
                    payload: row.get("payload_data"),
                    encrypted_headers: row.get("headers_data"),
                }
            })
            .collect())
    }

    async fn failure_rate_since(&self, since: DateTime<Utc>) -> Result<f64, StoreError> {
        let row = self
            .client
            .query_one(
                "SELECT count(*) AS total,
                        count(*) FILTER (
                            WHERE error_message IS NOT NULL
                               OR (status_code IS NOT NULL
                                   AND (status_code < 200 OR status_code >= 300))
                        ) AS failed
                 FROM delivery_attempts
                 WHERE attempted_at >= $1",
                &[&since],
            )
            .await
            .map_err(backend)?;

        let total = row.get::<_, i64>("total");
        if total == 0 {
            Ok(0.0)
        } else {
            Ok(row.get::<_, i64>("failed") as f64 / total as f64)
        }
    }

    async fn subscriber(&self, id: SubscriberId) -> Result<Option<Subscriber>, StoreError> {
        let row = self
            .client
            .query_opt("SELECT * FROM subscribers WHERE id = $1", &[&id.0])
            .await
            .map_err(backend)?;
        row.map(|r| Self::row_to_subscriber(&r)).transpose()
    }

    async fn list_subscribers(&self) -> Result<Vec<Subscriber>, StoreError> {
        let rows = self
            .client
            .query("SELECT * FROM subscribers ORDER BY id", &[])
            .await
            .map_err(backend)?;
        rows.iter().map(Self::row_to_subscriber).collect()
    }

    async fn transport_for(
        &self,
        subscriber: SubscriberId,
    ) -> Result<Option<TransportBinding>, StoreError> {
        let row = self
            .client
            .query_opt(
                "SELECT * FROM transports WHERE subscriber_id = $1",
                &[&subscriber.0],
            )
            .await
            .map_err(backend)?;

        row.map(|row| {
            let kind: String = row.get("name");
            let kind: TransportKind = kind.parse().map_err(StoreError::Backend)?;
            Ok(TransportBinding {
                id: row.get("id"),
                subscriber_id: SubscriberId(row.get("subscriber_id")),
                name: row.get("name"),
                kind,
                config: row.get("config"),
            })
        })
        .transpose()
    }

    fn subscribers_version(&self) -> u64 {
        // Subscriber mutations happen in another process, so there is no
        // local invalidation signal; advancing on every read makes the
        // engine re-snapshot each pass. Correct, at the cost of a query.
        self.version.fetch_add(1, Ordering::SeqCst) + 1
    }
}
