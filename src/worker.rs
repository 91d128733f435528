use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::engine::DeliveryEngine;
use crate::queue::{JobQueue, QueueMessage};
use crate::store::EventStore;
use crate::types::{DeliverySummary, EventId, EventStatus};

#[cfg(feature = "metrics")]
fn metric_inc(name: &'static str) {
    metrics::increment_counter!(name);
}

#[cfg(not(feature = "metrics"))]
fn metric_inc(_name: &'static str) {}

/// Lets the ingest handler wait for the first fan-out pass of an event so
/// the HTTP response can report real per-subscriber counts.
///
/// Purely in-process and best-effort: with an external queue the pass may
/// run elsewhere, in which case the waiter times out and the handler
/// answers a bare 202.
#[derive(Default)]
pub struct CompletionHub {
    waiters: Mutex<HashMap<EventId, oneshot::Sender<DeliverySummary>>>,
}

impl CompletionHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, event_id: EventId) -> oneshot::Receiver<DeliverySummary> {
        let (tx, rx) = oneshot::channel();
        self.waiters.lock().await.insert(event_id, tx);
        rx
    }

    pub async fn forget(&self, event_id: EventId) {
        self.waiters.lock().await.remove(&event_id);
    }

    pub async fn complete(&self, event_id: EventId, summary: DeliverySummary) {
        if let Some(tx) = self.waiters.lock().await.remove(&event_id) {
            let _ = tx.send(summary);
        }
    }
}

/// Queue consumers running the delivery engine, one message at a time per
/// worker.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    #[allow(clippy::too_many_arguments)]
    pub fn spawn(
        count: usize,
        queue: Arc<dyn JobQueue>,
        store: Arc<dyn EventStore>,
        engine: Arc<DeliveryEngine>,
        hub: Arc<CompletionHub>,
        shutdown: watch::Receiver<bool>,
        batch_size: usize,
        wait: Duration,
    ) -> Self {
        let mut handles = Vec::with_capacity(count);
        for worker_id in 0..count {
            handles.push(tokio::spawn(worker_loop(
                worker_id,
                queue.clone(),
                store.clone(),
                engine.clone(),
                hub.clone(),
                shutdown.clone(),
                batch_size.max(1),
                wait,
            )));
        }
        Self { handles }
    }

    /// Wait for every worker to drain and exit.
    pub async fn join(self) {
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn worker_loop(
    worker_id: usize,
    queue: Arc<dyn JobQueue>,
    store: Arc<dyn EventStore>,
    engine: Arc<DeliveryEngine>,
    hub: Arc<CompletionHub>,
    mut shutdown: watch::Receiver<bool>,
    batch_size: usize,
    wait: Duration,
) {
    debug!(worker = worker_id, "worker started");

    loop {
        if *shutdown.borrow() {
            break;
        }

        let batch = tokio::select! {
            received = queue.receive(batch_size, wait) => match received {
                Ok(batch) => batch,
                Err(e) => {
                    if queue.is_connected() {
                        error!(worker = worker_id, error = %e, "queue receive failed");
                        tokio::time::sleep(Duration::from_millis(250)).await;
                        continue;
                    }
                    break;
                }
            },
            _ = shutdown.changed() => continue,
        };

        for message in batch {
            if *shutdown.borrow() {
                // Return in-flight messages so another instance can pick
                // them up immediately.
                if let Err(e) = queue.change_visibility(&message.id, Duration::ZERO).await {
                    warn!(worker = worker_id, error = %e, "failed to release message");
                }
                continue;
            }
            handle_message(worker_id, &queue, &store, &engine, &hub, message).await;
        }
    }

    debug!(worker = worker_id, "worker stopped");
}

async fn handle_message(
    worker_id: usize,
    queue: &Arc<dyn JobQueue>,
    store: &Arc<dyn EventStore>,
    engine: &Arc<DeliveryEngine>,
    hub: &Arc<CompletionHub>,
    message: QueueMessage,
) {
    let event_id = message.job.event_id;

    let event = match store.event(event_id).await {
        Ok(event) => event,
        Err(e) => {
            // Store unreachable: leave the message unacknowledged so the
            // queue redelivers it after the visibility timeout.
            error!(worker = worker_id, event = %event_id, error = %e, kind = "infrastructure", "store lookup failed");
            return;
        }
    };

    let Some(event) = event else {
        warn!(worker = worker_id, event = %event_id, "job references unknown event, dropping");
        let _ = queue.delete(&message.id).await;
        hub.complete(event_id, DeliverySummary::default()).await;
        return;
    };

    if event.status.is_terminal() {
        debug!(worker = worker_id, event = %event_id, status = event.status.as_str(), "event already terminal, acknowledging");
        let _ = queue.delete(&message.id).await;
        hub.complete(event_id, DeliverySummary::default()).await;
        return;
    }

    // The queue increments attempts on every receive but never drops; the
    // redelivery cap is enforced here.
    if message.attempts > message.max_attempts {
        warn!(
            worker = worker_id,
            event = %event_id,
            attempts = message.attempts,
            max_attempts = message.max_attempts,
            "queue redelivery cap reached, dead-lettering event"
        );
        metric_inc("relay.queue.dead_letter");
        if let Err(e) = store.set_event_status(event_id, EventStatus::DeadLetter).await {
            error!(worker = worker_id, event = %event_id, error = %e, "failed to dead-letter event");
            return;
        }
        let _ = queue.delete(&message.id).await;
        hub.complete(event_id, DeliverySummary::default()).await;
        return;
    }

    match engine.process_event(event).await {
        Ok(summary) => {
            metric_inc("relay.event.processed");
            if let Err(e) = queue.delete(&message.id).await {
                warn!(worker = worker_id, event = %event_id, error = %e, "acknowledge failed; message may redeliver");
            }
            hub.complete(event_id, summary).await;
            info!(worker = worker_id, event = %event_id, "message handled");
        }
        Err(e) => {
            // Infrastructure failure mid-pass; no acknowledge so the
            // message survives and redelivers.
            metric_inc("relay.event.infrastructure_error");
            error!(worker = worker_id, event = %event_id, error = %e, kind = "infrastructure", "fan-out pass failed");
        }
    }
}
