use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::Mutex;

use webhook_relay::config::Config;
use webhook_relay::server::Relay;
use webhook_relay::{sign_payload, JobQueue, MemoryQueue, MemoryStore};

/// One request as seen by a sink endpoint.
#[derive(Debug, Clone)]
pub struct ReceivedRequest {
    pub headers: HashMap<String, String>,
    pub body: String,
}

/// A scripted downstream webhook endpoint. Responds with the scripted
/// status codes in order, then 200 for every further request.
#[derive(Clone)]
pub struct Sink {
    pub url: String,
    received: Arc<Mutex<Vec<ReceivedRequest>>>,
    responses: Arc<Mutex<VecDeque<u16>>>,
}

impl Sink {
    pub async fn received(&self) -> Vec<ReceivedRequest> {
        self.received.lock().await.clone()
    }
}

async fn sink_handler(
    State(sink): State<Sink>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let mut captured = HashMap::new();
    for (name, value) in &headers {
        if let Ok(value) = value.to_str() {
            captured.insert(name.to_string(), value.to_string());
        }
    }
    sink.received.lock().await.push(ReceivedRequest {
        headers: captured,
        body: String::from_utf8_lossy(&body).to_string(),
    });

    let code = sink.responses.lock().await.pop_front().unwrap_or(200);
    StatusCode::from_u16(code).unwrap_or(StatusCode::OK)
}

pub async fn spawn_sink(responses: Vec<u16>) -> Sink {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind sink");
    let port = listener.local_addr().expect("sink addr").port();

    let sink = Sink {
        url: format!("http://127.0.0.1:{port}/wh"),
        received: Arc::new(Mutex::new(Vec::new())),
        responses: Arc::new(Mutex::new(responses.into())),
    };

    let app = Router::new()
        .route("/wh", post(sink_handler))
        .with_state(sink.clone());
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    sink
}

pub const CORE_SECRET: &str = "core-secret";

/// Configuration tuned for fast end-to-end tests: ephemeral port, plain
/// http sinks allowed, 100 ms initial backoff, 50 ms scheduler tick.
pub fn test_config(extra: HashMap<String, String>) -> Config {
    let mut vars = HashMap::new();
    vars.insert("server.port".to_string(), "0".to_string());
    vars.insert("ingest.webhook_secret".to_string(), CORE_SECRET.to_string());
    vars.insert("delivery.allow_insecure_urls".to_string(), "true".to_string());
    vars.insert("delivery.response_wait_ms".to_string(), "5000".to_string());
    vars.insert("retry.initial_delay_ms".to_string(), "100".to_string());
    vars.insert("retry.max_delay_ms".to_string(), "1000".to_string());
    vars.insert("processing.poll_interval_ms".to_string(), "50".to_string());
    vars.insert("queue.default_wait_time_ms".to_string(), "50".to_string());
    vars.extend(extra);
    Config::load_with_sources(Some(vars)).expect("test config")
}

/// Spin up a full relay on an ephemeral port. Returns the base url and the
/// store for direct state assertions.
pub async fn spawn_relay(config: Config) -> (String, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    let queue: Arc<dyn JobQueue> = Arc::new(MemoryQueue::new(
        config.queue.visibility_timeout(),
        config.queue.max_attempts,
    ));

    let relay = Relay::new(&config, store.clone(), queue)
        .await
        .expect("relay construction");
    let port = relay.port();
    tokio::spawn(relay.run());

    (format!("http://127.0.0.1:{port}"), store)
}

/// POST a signed webhook the way the upstream platform would.
pub async fn post_webhook(
    base_url: &str,
    event_type: &str,
    delivery_id: &str,
    body: &str,
    secret: &str,
) -> reqwest::Response {
    reqwest::Client::new()
        .post(format!("{base_url}/webhook/github"))
        .header("x-github-event", event_type)
        .header("x-github-delivery", delivery_id)
        .header(
            "x-hub-signature-256",
            sign_payload(secret.as_bytes(), body.as_bytes()),
        )
        .header("content-type", "application/json")
        .header("user-agent", "GitHub-Hookshot/test")
        .body(body.to_string())
        .send()
        .await
        .expect("request")
}
