use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde_json::json;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::config::{Config, MonitoringConfig};
use crate::crypto::HeaderCipher;
use crate::engine::DeliveryEngine;
use crate::error::RelayError;
use crate::ingest::{ingest_webhook, Admission};
use crate::queue::JobQueue;
use crate::retry::RetryScheduler;
use crate::store::EventStore;
use crate::transport::TransportRegistry;
use crate::worker::{CompletionHub, WorkerPool};

/// Shared state behind every request handler.
#[derive(Clone)]
pub struct AppState {
    pub platform: String,
    pub admission: Arc<Admission>,
    pub cipher: HeaderCipher,
    pub store: Arc<dyn EventStore>,
    pub queue: Arc<dyn JobQueue>,
    pub hub: Arc<CompletionHub>,
    pub response_wait: Duration,
    pub monitoring: MonitoringConfig,
}

/// The assembled relay: HTTP surface, worker pool, and retry scheduler.
pub struct Relay {
    listener: TcpListener,
    router: Router,
    workers: WorkerPool,
    scheduler: JoinHandle<()>,
    shutdown_tx: watch::Sender<bool>,
    transports: Arc<TransportRegistry>,
    queue: Arc<dyn JobQueue>,
}

impl Relay {
    pub async fn new(
        config: &Config,
        store: Arc<dyn EventStore>,
        queue: Arc<dyn JobQueue>,
    ) -> Result<Self, RelayError> {
        let transports = Arc::new(TransportRegistry::from_config(config));
        let engine = Arc::new(DeliveryEngine::new(
            store.clone(),
            transports.clone(),
            config,
        ));
        let hub = Arc::new(CompletionHub::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // Surface misconfigured bindings early; they would otherwise show
        // up as permanent delivery failures.
        for subscriber in store.list_subscribers().await? {
            if let Some(binding) = store.transport_for(subscriber.id).await? {
                if let Err(e) = transports.validate(binding.kind, &binding.config) {
                    warn!(
                        subscriber = %subscriber.id,
                        kind = %binding.kind,
                        error = %e,
                        "subscriber has invalid transport config"
                    );
                }
            }
        }

        let workers = WorkerPool::spawn(
            config.processing.worker_count.max(1),
            queue.clone(),
            store.clone(),
            engine.clone(),
            hub.clone(),
            shutdown_rx.clone(),
            config.processing.batch_size,
            config.queue.default_wait_time(),
        );

        let scheduler = RetryScheduler::new(store.clone(), engine, &config.processing);
        let scheduler = tokio::spawn(scheduler.run(shutdown_rx));

        let state = AppState {
            platform: config.ingest.platform.clone(),
            admission: Arc::new(Admission::new(
                &config.ingest.webhook_secret,
                &config.security,
            )),
            cipher: HeaderCipher::new(config.store.master_encryption_secret.clone()),
            store,
            queue: queue.clone(),
            hub,
            response_wait: config.delivery.response_wait(),
            monitoring: config.monitoring.clone(),
        };

        let trace_layer = TraceLayer::new_for_http().make_span_with(
            |request: &axum::extract::Request<_>| {
                let uri = request.uri().to_string();
                tracing::info_span!("request", method = %request.method(), uri)
            },
        );

        let router = Router::new()
            .route("/webhook/{platform}", post(ingest_webhook))
            .route("/healthz/live", get(liveness))
            .route("/healthz/ready", get(readiness))
            .layer(trace_layer)
            .with_state(state);

        let listener = TcpListener::bind(format!(
            "{}:{}",
            config.server.host, config.server.port
        ))
        .await
        .map_err(|e| RelayError::Config(format!("failed to bind: {e}")))?;

        Ok(Self {
            listener,
            router,
            workers,
            scheduler,
            shutdown_tx,
            transports,
            queue,
        })
    }

    pub fn port(&self) -> u16 {
        self.listener
            .local_addr()
            .map(|addr| addr.port())
            .unwrap_or_default()
    }

    /// Serve until a shutdown signal arrives, then drain workers and the
    /// retry scheduler before returning.
    pub async fn run(self) -> Result<(), RelayError> {
        info!(
            addr = %self.listener.local_addr().map(|a| a.to_string()).unwrap_or_default(),
            "relay listening"
        );

        let serve = axum::serve(
            self.listener,
            self.router
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown_signal());

        let result = serve.await;

        info!("signaling workers and scheduler to stop");
        let _ = self.shutdown_tx.send(true);
        self.workers.join().await;
        let _ = self.scheduler.await;

        self.transports.close_all().await;
        let _ = self.queue.close().await;
        info!("relay shut down");

        result.map_err(|e| RelayError::Config(format!("server error: {e}")))
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                warn!(error = %e, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = sigterm.recv() => info!("received SIGTERM"),
            result = tokio::signal::ctrl_c() => {
                if result.is_ok() {
                    info!("received SIGINT");
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

async fn liveness() -> (StatusCode, Json<serde_json::Value>) {
    (StatusCode::OK, Json(json!({"status": "up"})))
}

/// Readiness: store reachable, at least one subscriber, queue depth below
/// threshold, 1-hour failure rate below threshold. Reports every check;
/// the first failing one decides the 503.
async fn readiness(State(state): State<AppState>) -> (StatusCode, Json<serde_json::Value>) {
    let mut checks = serde_json::Map::new();
    let mut first_failure: Option<&'static str> = None;

    match state.store.event_stats().await {
        Ok(stats) => {
            checks.insert("store".to_string(), json!({"ok": true, "events": stats.total}));
        }
        Err(e) => {
            checks.insert(
                "store".to_string(),
                json!({"ok": false, "error": e.to_string()}),
            );
            first_failure.get_or_insert("store");
        }
    }

    match state.store.list_subscribers().await {
        Ok(subscribers) if !subscribers.is_empty() => {
            checks.insert(
                "subscribers".to_string(),
                json!({"ok": true, "active": subscribers.len()}),
            );
        }
        Ok(_) => {
            checks.insert(
                "subscribers".to_string(),
                json!({"ok": false, "active": 0}),
            );
            first_failure.get_or_insert("subscribers");
        }
        Err(e) => {
            checks.insert(
                "subscribers".to_string(),
                json!({"ok": false, "error": e.to_string()}),
            );
            first_failure.get_or_insert("subscribers");
        }
    }

    match state.queue.stats().await {
        Ok(stats) => {
            let depth = stats.approximate + stats.in_flight + stats.delayed;
            let ok = depth <= state.monitoring.queue_depth_threshold;
            checks.insert(
                "queue_depth".to_string(),
                json!({"ok": ok, "depth": depth, "threshold": state.monitoring.queue_depth_threshold}),
            );
            if !ok {
                first_failure.get_or_insert("queue_depth");
            }
        }
        Err(e) => {
            checks.insert(
                "queue_depth".to_string(),
                json!({"ok": false, "error": e.to_string()}),
            );
            first_failure.get_or_insert("queue_depth");
        }
    }

    let window_start = Utc::now() - chrono::Duration::hours(1);
    match state.store.failure_rate_since(window_start).await {
        Ok(rate) => {
            let ok = rate < state.monitoring.failure_rate_threshold;
            checks.insert(
                "failure_rate".to_string(),
                json!({"ok": ok, "rate": rate, "threshold": state.monitoring.failure_rate_threshold}),
            );
            if !ok {
                first_failure.get_or_insert("failure_rate");
            }
        }
        Err(e) => {
            checks.insert(
                "failure_rate".to_string(),
                json!({"ok": false, "error": e.to_string()}),
            );
            first_failure.get_or_insert("failure_rate");
        }
    }

    match first_failure {
        None => (
            StatusCode::OK,
            Json(json!({"status": "ready", "checks": checks})),
        ),
        Some(failed) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"status": "degraded", "failed": failed, "checks": checks})),
        ),
    }
}
