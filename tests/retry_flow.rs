mod utils;

use std::collections::HashMap;
use std::time::Duration;

use serde_json::json;
use webhook_relay::{EventStatus, EventStore, TransportKind};

use utils::{post_webhook, spawn_relay, spawn_sink, test_config, CORE_SECRET};

async fn wait_for_status(
    store: &webhook_relay::MemoryStore,
    delivery_id: &str,
    status: EventStatus,
    timeout: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if let Some(event) = store.event_by_delivery_id(delivery_id).await {
            if event.status == status {
                return true;
            }
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    false
}

#[tokio::test]
async fn retry_after_transient_failure_succeeds() {
    // 503 on the first attempt, 200 on the second.
    let sink = spawn_sink(vec![503]).await;
    let (base, store) = spawn_relay(test_config(HashMap::new())).await;

    let sub = store
        .add_subscriber(
            "ci",
            vec!["push".to_string()],
            TransportKind::HttpWebhook,
            json!({"url": sink.url, "secret": "sub-secret"}).to_string(),
        )
        .await
        .unwrap();

    let response = post_webhook(&base, "push", "D1", "{}", CORE_SECRET).await;
    assert_eq!(response.status(), 202);

    // The first attempt carries the schedule: 100 ms initial delay with
    // +/-10 % jitter.
    let event = store.event_by_delivery_id("D1").await.unwrap();
    let attempts = store.attempts_for_event(event.id).await.unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].status_code, Some(503));
    let scheduled = attempts[0].next_retry_at.expect("retry scheduled");
    let delta = (scheduled - attempts[0].attempted_at)
        .num_milliseconds();
    assert!((80..=130).contains(&delta), "unexpected backoff delta {delta}");

    assert!(wait_for_status(&store, "D1", EventStatus::Completed, Duration::from_secs(3)).await);

    let attempts = store.attempts_for_event(event.id).await.unwrap();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[0].attempt_number, 1);
    assert_eq!(attempts[1].attempt_number, 2);
    assert_eq!(attempts[1].subscriber_id, sub.id);
    assert_eq!(attempts[1].status_code, Some(200));
    assert!(attempts.iter().all(|a| a.next_retry_at.is_none()));

    assert_eq!(sink.received().await.len(), 2);
}

#[tokio::test]
async fn exhausted_retries_dead_letter_the_event() {
    let sink = spawn_sink(vec![500, 500, 500, 500]).await;
    let mut overrides = HashMap::new();
    overrides.insert("retry.max_attempts".to_string(), "3".to_string());
    overrides.insert("queue.dead_letter_threshold".to_string(), "3".to_string());
    let (base, store) = spawn_relay(test_config(overrides)).await;

    store
        .add_subscriber(
            "ci",
            vec!["push".to_string()],
            TransportKind::HttpWebhook,
            json!({"url": sink.url, "secret": "sub-secret"}).to_string(),
        )
        .await
        .unwrap();

    let response = post_webhook(&base, "push", "D1", "{}", CORE_SECRET).await;
    assert_eq!(response.status(), 202);

    assert!(wait_for_status(&store, "D1", EventStatus::DeadLetter, Duration::from_secs(5)).await);

    let event = store.event_by_delivery_id("D1").await.unwrap();
    let attempts = store.attempts_for_event(event.id).await.unwrap();
    assert_eq!(attempts.len(), 3);
    assert!(attempts.iter().all(|a| a.status_code == Some(500)));
    assert!(attempts.iter().all(|a| a.next_retry_at.is_none()));

    // No further deliveries arrive after the dead-letter transition.
    let delivered = sink.received().await.len();
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(sink.received().await.len(), delivered);
    assert_eq!(delivered, 3);
}

#[tokio::test]
async fn backoff_grows_between_attempts() {
    let sink = spawn_sink(vec![500, 500, 500, 500]).await;
    let mut overrides = HashMap::new();
    overrides.insert("retry.max_attempts".to_string(), "4".to_string());
    overrides.insert("queue.dead_letter_threshold".to_string(), "4".to_string());
    let (base, store) = spawn_relay(test_config(overrides)).await;

    store
        .add_subscriber(
            "ci",
            vec!["push".to_string()],
            TransportKind::HttpWebhook,
            json!({"url": sink.url, "secret": "sub-secret"}).to_string(),
        )
        .await
        .unwrap();

    post_webhook(&base, "push", "D1", "{}", CORE_SECRET).await;
    assert!(wait_for_status(&store, "D1", EventStatus::DeadLetter, Duration::from_secs(8)).await);

    let event = store.event_by_delivery_id("D1").await.unwrap();
    let attempts = store.attempts_for_event(event.id).await.unwrap();
    assert_eq!(attempts.len(), 4);

    // Exponential spacing: roughly 100, 200, 400 ms between attempts
    // (within jitter and scheduler-tick slack, monotone non-decreasing).
    let gaps: Vec<i64> = attempts
        .windows(2)
        .map(|pair| (pair[1].attempted_at - pair[0].attempted_at).num_milliseconds())
        .collect();
    assert_eq!(gaps.len(), 3);
    assert!(gaps[0] >= 80, "first gap too small: {gaps:?}");
    assert!(gaps[1] >= gaps[0], "gaps not monotone: {gaps:?}");
    assert!(gaps[2] >= gaps[1], "gaps not monotone: {gaps:?}");
}

#[tokio::test]
async fn subscriber_removed_mid_retry_fails_permanently() {
    let sink = spawn_sink(vec![503]).await;
    let (base, store) = spawn_relay(test_config(HashMap::new())).await;

    let sub = store
        .add_subscriber(
            "ci",
            vec!["push".to_string()],
            TransportKind::HttpWebhook,
            json!({"url": sink.url, "secret": "sub-secret"}).to_string(),
        )
        .await
        .unwrap();

    let response = post_webhook(&base, "push", "D1", "{}", CORE_SECRET).await;
    assert_eq!(response.status(), 202);

    // Remove the subscriber before the retry fires.
    store.remove_subscriber(sub.id).await;

    assert!(wait_for_status(&store, "D1", EventStatus::Failed, Duration::from_secs(3)).await);

    let event = store.event_by_delivery_id("D1").await.unwrap();
    let attempts = store.attempts_for_event(event.id).await.unwrap();
    assert_eq!(attempts.len(), 2);
    assert_eq!(
        attempts[1].error.as_deref(),
        Some("subscriber removed")
    );
    assert!(attempts[1].next_retry_at.is_none());

    // Only the original delivery reached the sink.
    assert_eq!(sink.received().await.len(), 1);
}
