mod utils;

use std::collections::HashMap;

use serde_json::json;
use webhook_relay::TransportKind;

use utils::{spawn_relay, spawn_sink, test_config};

#[tokio::test]
async fn liveness_reports_up() {
    let (base, _store) = spawn_relay(test_config(HashMap::new())).await;

    let response = reqwest::Client::new()
        .get(format!("{base}/healthz/live"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "up");
}

#[tokio::test]
async fn readiness_fails_without_subscribers() {
    let (base, _store) = spawn_relay(test_config(HashMap::new())).await;

    let response = reqwest::Client::new()
        .get(format!("{base}/healthz/ready"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 503);

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["failed"], "subscribers");
    assert_eq!(body["checks"]["subscribers"]["ok"], false);
    // The store itself is reachable.
    assert_eq!(body["checks"]["store"]["ok"], true);
}

#[tokio::test]
async fn readiness_passes_with_an_active_subscriber() {
    let sink = spawn_sink(vec![]).await;
    let (base, store) = spawn_relay(test_config(HashMap::new())).await;

    store
        .add_subscriber(
            "ci",
            vec!["push".to_string()],
            TransportKind::HttpWebhook,
            json!({"url": sink.url, "secret": "s"}).to_string(),
        )
        .await
        .unwrap();

    let response = reqwest::Client::new()
        .get(format!("{base}/healthz/ready"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    let body: serde_json::Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ready");
    assert_eq!(body["checks"]["subscribers"]["active"], 1);
    assert_eq!(body["checks"]["queue_depth"]["ok"], true);
    assert_eq!(body["checks"]["failure_rate"]["ok"], true);
}
