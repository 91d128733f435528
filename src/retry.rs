use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::{ProcessingConfig, RetryConfig};
use crate::engine::DeliveryEngine;
use crate::store::EventStore;

/// Delay growth strategy between retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// `initial * n` for the n-th failure.
    Linear,
    /// `initial * 2^(n-1)` for the n-th failure.
    Exponential,
}

/// Computes retry delays, clamped to a maximum and jittered by ±10 %.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub strategy: BackoffStrategy,
    pub initial: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            strategy: config.backoff_strategy,
            initial: Duration::from_millis(config.initial_delay_ms),
            max: Duration::from_millis(config.max_delay_ms),
        }
    }

    /// Unjittered delay after `failed_attempts` consecutive failures
    /// (`failed_attempts >= 1`).
    pub fn base_delay(&self, failed_attempts: u32) -> Duration {
        let n = failed_attempts.max(1) as u64;
        let initial = self.initial.as_millis() as u64;

        let raw = match self.strategy {
            BackoffStrategy::Linear => initial.saturating_mul(n),
            BackoffStrategy::Exponential => {
                let pow = 1u64.checked_shl(n.saturating_sub(1) as u32).unwrap_or(u64::MAX);
                initial.saturating_mul(pow)
            }
        };

        Duration::from_millis(raw.min(self.max.as_millis() as u64))
    }

    /// Jittered delay: the base delay scaled uniformly within ±10 %.
    pub fn delay(&self, failed_attempts: u32) -> Duration {
        let base = self.base_delay(failed_attempts);
        let factor = 0.9 + fastrand::f64() * 0.2;
        base.mul_f64(factor)
    }
}

/// Decides whether a failed attempt is eligible for another try.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    retryable: HashSet<u16>,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, retryable_status_codes: &[u16]) -> Self {
        Self {
            max_attempts,
            retryable: retryable_status_codes.iter().copied().collect(),
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(config.max_attempts, &config.retryable_status_codes)
    }

    /// Retry iff the attempt budget is not exhausted and the failure looks
    /// transient. `status_code` of `None` means the request never produced
    /// a response (timeout, refused connection) and is always retryable.
    pub fn should_retry(&self, status_code: Option<u16>, attempts_made: u32) -> bool {
        if attempts_made >= self.max_attempts {
            return false;
        }
        match status_code {
            None => true,
            Some(code) => self.retryable.contains(&code),
        }
    }
}

/// Polls the store for due retries and re-executes them.
///
/// Safe to run in multiple processes: the store's compare-and-swap claim
/// makes exactly one poller win each scheduled row, and a crash mid-batch
/// leaves unclaimed rows scheduled for the next tick.
pub struct RetryScheduler {
    store: Arc<dyn EventStore>,
    engine: Arc<DeliveryEngine>,
    batch_size: usize,
    interval: Duration,
}

impl RetryScheduler {
    pub fn new(
        store: Arc<dyn EventStore>,
        engine: Arc<DeliveryEngine>,
        processing: &ProcessingConfig,
    ) -> Self {
        Self {
            store,
            engine,
            batch_size: processing.batch_size,
            interval: processing.poll_interval(),
        }
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval_ms = self.interval.as_millis() as u64, "retry scheduler started");
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.drain_due_batch().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("retry scheduler stopping");
                        break;
                    }
                }
            }
        }
    }

    async fn drain_due_batch(&self) {
        let tasks = match self.store.due_retries(self.batch_size).await {
            Ok(tasks) => tasks,
            Err(e) => {
                error!(error = %e, "failed to poll due retries");
                return;
            }
        };

        if tasks.is_empty() {
            return;
        }
        debug!(count = tasks.len(), "processing due retries");

        for task in tasks {
            let event_id = task.event_id;
            let subscriber_id = task.subscriber_id;
            if let Err(e) = self.engine.process_retry(task).await {
                warn!(
                    event = %event_id,
                    subscriber = %subscriber_id,
                    error = %e,
                    "retry execution failed"
                );
            }
        }
    }
}
