//! Unit tests for the `SQLite` dead-letter queue.

use std::sync::Arc;

use chrono::{Duration, Utc};
use fleet_relay::models::failed_event::{FailedEvent, FailedEventStatus};
use fleet_relay::persistence::db;
use fleet_relay::persistence::dlq_repo::DeadLetterQueue;
use serde_json::json;

async fn queue() -> DeadLetterQueue {
    let pool = db::connect_memory().await.expect("db");
    DeadLetterQueue::new(Arc::new(pool))
}

fn failed(agent: &str) -> FailedEvent {
    FailedEvent::new(
        json!({"schema": "event_v1", "session_id": "s-1"}),
        agent,
        format!("http://{agent}.local/tasks"),
        "all 4 attempts failed: connection failed: refused",
        4,
    )
}

#[tokio::test]
async fn add_and_get_round_trip() {
    let dlq = queue().await;
    let event = failed("verifier").with_metadata("reason", json!("circuit_open"));
    dlq.add(&event).await.expect("add");

    let stored = dlq.get(&event.event_id).await.expect("get").expect("row exists");
    assert_eq!(stored.original_payload, event.original_payload);
    assert_eq!(stored.target_agent, "verifier");
    assert_eq!(stored.target_url, "http://verifier.local/tasks");
    assert_eq!(stored.failure_count, 4);
    assert_eq!(stored.status, FailedEventStatus::Pending);
    assert_eq!(stored.metadata["reason"], "circuit_open");
    assert!(stored.retry_after.is_none());
    assert!(
        (stored.first_failure - event.first_failure).num_milliseconds().abs() < 1,
        "timestamps survive storage at microsecond precision"
    );
}

#[tokio::test]
async fn get_unknown_row_is_none() {
    let dlq = queue().await;
    assert!(dlq.get("missing").await.expect("get").is_none());
}

#[tokio::test]
async fn pending_rows_are_ready_oldest_first() {
    let dlq = queue().await;
    let mut older = failed("ingest");
    older.last_failure = Utc::now() - Duration::minutes(10);
    let newer = failed("triage");
    dlq.add(&newer).await.expect("add");
    dlq.add(&older).await.expect("add");

    let ready = dlq.get_pending(10, Utc::now()).await.expect("pending");
    let ids: Vec<&str> = ready.iter().map(|e| e.event_id.as_str()).collect();
    assert_eq!(ids, vec![older.event_id.as_str(), newer.event_id.as_str()]);

    let limited = dlq.get_pending(1, Utc::now()).await.expect("pending");
    assert_eq!(limited.len(), 1);
}

#[tokio::test]
async fn retrying_rows_wait_for_retry_after() {
    let dlq = queue().await;
    let event = failed("summarizer");
    dlq.add(&event).await.expect("add");

    let now = Utc::now();
    let later = now + Duration::minutes(5);
    assert!(dlq
        .update_status(&event.event_id, FailedEventStatus::Retrying, Some(later))
        .await
        .expect("update"));

    assert!(dlq.get_pending(10, now).await.expect("pending").is_empty());
    let ready = dlq.get_pending(10, later).await.expect("pending");
    assert_eq!(ready.len(), 1);
}

#[tokio::test]
async fn failed_and_recovered_rows_are_never_ready() {
    let dlq = queue().await;
    let dead = failed("dispatcher");
    let done = failed("verifier");
    dlq.add(&dead).await.expect("add");
    dlq.add(&done).await.expect("add");
    dlq.update_status(&dead.event_id, FailedEventStatus::Failed, None)
        .await
        .expect("update");
    dlq.update_status(&done.event_id, FailedEventStatus::Recovered, None)
        .await
        .expect("update");

    let far_future = Utc::now() + Duration::days(365);
    assert!(dlq.get_pending(10, far_future).await.expect("pending").is_empty());
}

#[tokio::test]
async fn update_status_without_retry_after_keeps_the_old_one() {
    let dlq = queue().await;
    let event = failed("triage");
    dlq.add(&event).await.expect("add");
    let at = Utc::now() + Duration::minutes(1);
    dlq.update_status(&event.event_id, FailedEventStatus::Retrying, Some(at))
        .await
        .expect("update");
    dlq.update_status(&event.event_id, FailedEventStatus::Failed, None)
        .await
        .expect("update");

    let stored = dlq.get(&event.event_id).await.expect("get").expect("row");
    assert_eq!(stored.status, FailedEventStatus::Failed);
    assert!(stored.retry_after.is_some());
}

#[tokio::test]
async fn record_failure_increments_count() {
    let dlq = queue().await;
    let event = failed("ingest");
    dlq.add(&event).await.expect("add");

    let at = Utc::now();
    assert!(dlq
        .record_failure(&event.event_id, "http 503: busy", at)
        .await
        .expect("record"));

    let stored = dlq.get(&event.event_id).await.expect("get").expect("row");
    assert_eq!(stored.failure_count, 5);
    assert_eq!(stored.failure_reason, "http 503: busy");
    assert!(stored.last_failure >= event.last_failure);
}

#[tokio::test]
async fn mutations_on_unknown_rows_report_false() {
    let dlq = queue().await;
    assert!(!dlq
        .update_status("missing", FailedEventStatus::Failed, None)
        .await
        .expect("update"));
    assert!(!dlq
        .record_failure("missing", "x", Utc::now())
        .await
        .expect("record"));
    assert!(!dlq.remove("missing").await.expect("remove"));
}

#[tokio::test]
async fn remove_deletes_the_row() {
    let dlq = queue().await;
    let event = failed("ingest");
    dlq.add(&event).await.expect("add");
    assert!(dlq.remove(&event.event_id).await.expect("remove"));
    assert!(dlq.get(&event.event_id).await.expect("get").is_none());
}

#[tokio::test]
async fn stats_count_rows_by_status() {
    let dlq = queue().await;
    let empty = dlq.stats().await.expect("stats");
    assert_eq!(empty.total, 0);
    assert!(empty.oldest_failure.is_none());

    let a = failed("ingest");
    let b = failed("verifier");
    let c = failed("triage");
    for event in [&a, &b, &c] {
        dlq.add(event).await.expect("add");
    }
    dlq.update_status(&b.event_id, FailedEventStatus::Retrying, None)
        .await
        .expect("update");
    dlq.update_status(&c.event_id, FailedEventStatus::Failed, None)
        .await
        .expect("update");

    let stats = dlq.stats().await.expect("stats");
    assert_eq!(stats.pending, 1);
    assert_eq!(stats.retrying, 1);
    assert_eq!(stats.failed, 1);
    assert_eq!(stats.recovered, 0);
    assert_eq!(stats.total, 3);
    assert!(stats.oldest_failure.is_some());
}

#[tokio::test]
async fn file_backed_queue_survives_reconnect() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("nested").join("relay.db");
    let event = failed("dispatcher");

    {
        let pool = db::connect(&path).await.expect("db");
        DeadLetterQueue::new(Arc::new(pool.clone()))
            .add(&event)
            .await
            .expect("add");
        pool.close().await;
    }

    let pool = db::connect(&path).await.expect("db reopen");
    let dlq = DeadLetterQueue::new(Arc::new(pool));
    let stored = dlq.get(&event.event_id).await.expect("get");
    assert!(stored.is_some());
}
