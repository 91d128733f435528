use std::collections::HashMap;
use std::time::Duration;

use config::{builder::DefaultState, Config as ConfigLib, ConfigBuilder, ConfigError, Environment};
use serde::Deserialize;

use crate::retry::BackoffStrategy;

/// Storage backend selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreKind {
    Memory,
    Postgres,
}

/// Queue backend selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueKind {
    Memory,
    Redis,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub ingest: IngestConfig,
    pub store: StoreConfig,
    pub queue: QueueConfig,
    pub delivery: DeliveryConfig,
    pub retry: RetryConfig,
    pub security: SecurityConfig,
    pub processing: ProcessingConfig,
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct IngestConfig {
    /// Upstream platform label; the ingest route only accepts
    /// `/webhook/{platform}`.
    pub platform: String,

    /// Shared secret the upstream signs payloads with.
    pub webhook_secret: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    pub kind: StoreKind,

    #[serde(default)]
    pub connection_string: Option<String>,

    /// Master secret for the encrypted header bundles.
    pub master_encryption_secret: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    pub kind: QueueKind,

    #[serde(default)]
    pub url: Option<String>,

    /// Queue-level redelivery cap. Enforced by the worker, not the queue.
    pub max_attempts: u32,

    pub visibility_timeout_ms: u64,
    pub default_wait_time_ms: u64,

    /// Attempt count at which an event is transitioned to dead-letter.
    pub dead_letter_threshold: u32,
}

impl QueueConfig {
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_millis(self.visibility_timeout_ms)
    }

    pub fn default_wait_time(&self) -> Duration {
        Duration::from_millis(self.default_wait_time_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    pub http_timeout_ms: u64,
    pub broker_timeout_ms: u64,

    /// Allow plain-http webhook targets (tests, internal sinks).
    pub allow_insecure_urls: bool,

    /// How long the ingest handler waits for the first fan-out pass before
    /// answering a bare 202.
    pub response_wait_ms: u64,
}

impl DeliveryConfig {
    pub fn http_timeout(&self) -> Duration {
        Duration::from_millis(self.http_timeout_ms)
    }

    pub fn response_wait(&self) -> Duration {
        Duration::from_millis(self.response_wait_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub backoff_strategy: BackoffStrategy,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub retryable_status_codes: Vec<u16>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    pub rate_limiting_enabled: bool,
    pub requests_per_minute: u32,
    pub payload_size_limit_mb: u64,

    /// Empty list means every client ip is accepted.
    pub ip_allowlist: Vec<String>,
}

impl SecurityConfig {
    pub fn payload_size_limit_bytes(&self) -> usize {
        (self.payload_size_limit_mb as usize) * 1024 * 1024
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProcessingConfig {
    pub worker_count: usize,
    pub batch_size: usize,
    pub poll_interval_ms: u64,
}

impl ProcessingConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MonitoringConfig {
    pub log_level: String,
    pub failed_delivery_alerts: bool,

    /// Readiness fails when the approximate queue depth exceeds this.
    pub queue_depth_threshold: u64,

    /// Readiness fails when the 1-hour attempt failure rate exceeds this.
    pub failure_rate_threshold: f64,
}

impl Config {
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_with_sources(None)
    }

    /// Load configuration from defaults plus either the given overrides
    /// (used by tests to avoid environment pollution) or `APP_*`
    /// environment variables in the form `APP_SERVER__PORT`.
    pub fn load_with_sources(
        env_vars: Option<HashMap<String, String>>,
    ) -> Result<Self, ConfigError> {
        let mut builder = Self::set_defaults()?;

        if let Some(vars) = env_vars {
            for (key, value) in vars {
                builder = builder.set_override(&key, value)?;
            }
        } else {
            builder = builder.add_source(
                Environment::with_prefix("APP")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("security.ip_allowlist")
                    .with_list_parse_key("retry.retryable_status_codes"),
            );
        }

        builder.build()?.try_deserialize()
    }

    fn set_defaults() -> Result<ConfigBuilder<DefaultState>, ConfigError> {
        ConfigLib::builder()
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("ingest.platform", "github")?
            .set_default("ingest.webhook_secret", "")?
            .set_default("store.kind", "memory")?
            .set_default("store.master_encryption_secret", "dev-master-secret")?
            .set_default("queue.kind", "memory")?
            .set_default("queue.max_attempts", 5)?
            .set_default("queue.visibility_timeout_ms", 30_000)?
            .set_default("queue.default_wait_time_ms", 1_000)?
            .set_default("queue.dead_letter_threshold", 5)?
            .set_default("delivery.http_timeout_ms", 30_000)?
            .set_default("delivery.broker_timeout_ms", 10_000)?
            .set_default("delivery.allow_insecure_urls", false)?
            .set_default("delivery.response_wait_ms", 30_000)?
            .set_default("retry.max_attempts", 3)?
            .set_default("retry.backoff_strategy", "exponential")?
            .set_default("retry.initial_delay_ms", 1_000)?
            .set_default("retry.max_delay_ms", 60_000)?
            .set_default(
                "retry.retryable_status_codes",
                vec![408, 429, 500, 502, 503, 504, 0],
            )?
            .set_default("security.rate_limiting_enabled", true)?
            .set_default("security.requests_per_minute", 120)?
            .set_default("security.payload_size_limit_mb", 5)?
            .set_default("security.ip_allowlist", Vec::<String>::new())?
            .set_default("processing.worker_count", 4)?
            .set_default("processing.batch_size", 10)?
            .set_default("processing.poll_interval_ms", 1_000)?
            .set_default("monitoring.log_level", "info")?
            .set_default("monitoring.failed_delivery_alerts", true)?
            .set_default("monitoring.queue_depth_threshold", 1_000)?
            .set_default("monitoring.failure_rate_threshold", 0.5)
    }
}
