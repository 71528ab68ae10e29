//! Integration tests for the five-stage pipeline orchestrator.
//!
//! Validates:
//! - A healthy run calls every stage once, in order, and completes the session
//! - A failing stage is retried, dead-lettered, and stops the run
//! - Repeated stage failures open the breaker and later calls are rejected
//! - Similar past incidents are attached before triage

use fleet_relay::models::session::SessionStatus;
use fleet_relay::models::stage::Stage;
use fleet_relay::resilience::circuit_breaker::CircuitState;
use fleet_relay::resilience::transport::DispatchError;
use serde_json::json;

use super::test_helpers::{
    harness, harness_with_registry, healthy_agents, stage_task, test_config, StaticRegistry,
};

#[tokio::test]
async fn healthy_run_completes_session_with_incident() {
    let h = harness(test_config()).await;
    healthy_agents(&h.transport);

    let outcome = h
        .pipeline
        .process_event(json!({"text": "water over the road"}), "sensor-7")
        .await;

    assert!(outcome.success, "{outcome:?}");
    assert_eq!(outcome.incident_id.as_deref(), Some("inc-42"));
    assert!(outcome.error.is_none());
    assert_eq!(outcome.result.as_ref().unwrap()["recommended_actions"][0], "close road");

    for stage in Stage::ALL {
        assert_eq!(h.transport.calls(&stage_task(stage)), 1, "{stage}");
    }

    let session = h.sessions.get_session(&outcome.session_id).await.expect("active");
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.incident_id.as_deref(), Some("inc-42"));
    assert_eq!(session.metadata["source_agent"], "sensor-7");
    assert_eq!(session.metadata["severity"], "HIGH");
    assert!(session.metadata.contains_key("pipeline_start"));
    let labels: Vec<&str> = session.events.iter().map(|e| e.label.as_str()).collect();
    assert_eq!(labels, vec!["ingest", "verify", "summarize", "triage", "dispatch"]);

    let stats = h.pipeline.stats();
    assert_eq!(stats.events_processed, 1);
    assert_eq!(stats.incidents_created, 1);
    assert_eq!(stats.errors, 0);
    assert_eq!(stats.retries, 0);
}

#[tokio::test]
async fn each_stage_receives_previous_output_in_its_envelope() {
    let h = harness(test_config()).await;
    healthy_agents(&h.transport);

    let outcome = h
        .pipeline
        .process_event(json!({"text": "water over the road"}), "sensor-7")
        .await;
    assert!(outcome.success);

    let ingest = &h.transport.sent_to(&stage_task(Stage::Ingest))[0];
    assert_eq!(ingest["schema"], "event_v1");
    assert_eq!(ingest["source_agent"], "test_pipeline");
    assert_eq!(ingest["session_id"], outcome.session_id.as_str());
    assert_eq!(ingest["payload"]["data"]["operation"], "normalize_event");
    assert_eq!(ingest["payload"]["data"]["event_data"]["text"], "water over the road");

    let verify = &h.transport.sent_to(&stage_task(Stage::Verify))[0];
    assert_eq!(verify["payload"]["data"]["event"]["source"], "sensor");

    let summarize = &h.transport.sent_to(&stage_task(Stage::Summarize))[0];
    assert_eq!(summarize["schema"], "verified_event_v1");
    assert_eq!(summarize["payload"]["data"]["event"]["verified"], true);

    let triage = &h.transport.sent_to(&stage_task(Stage::Triage))[0];
    assert_eq!(triage["schema"], "incident_brief_v1");
    assert_eq!(triage["payload"]["type"], "incident");
    assert_eq!(triage["payload"]["data"]["brief"]["title"], "Flood");
    assert_eq!(
        triage["payload"]["data"]["brief"]["memory_context"]["query_performed"],
        true
    );

    let dispatch = &h.transport.sent_to(&stage_task(Stage::Dispatch))[0];
    assert_eq!(dispatch["schema"], "triaged_incident_v1");
    assert_eq!(dispatch["payload"]["data"]["incident"]["severity"], "HIGH");
}

#[tokio::test]
async fn second_similar_event_sees_first_incident_in_memory() {
    let h = harness(test_config()).await;
    healthy_agents(&h.transport);

    assert!(h.pipeline.process_event(json!({"n": 1}), "sensor").await.success);
    assert_eq!(h.memory.len(), 1);
    assert!(h.pipeline.process_event(json!({"n": 2}), "sensor").await.success);

    let triage_calls = h.transport.sent_to(&stage_task(Stage::Triage));
    let first = &triage_calls[0]["payload"]["data"]["brief"]["memory_context"];
    let second = &triage_calls[1]["payload"]["data"]["brief"]["memory_context"];
    assert_eq!(first["similar_incidents"], json!([]));
    assert_eq!(second["similar_incidents"][0]["id"], "inc-42");
    assert_eq!(second["similar_incidents"][0]["metadata"]["severity"], "HIGH");
    assert_eq!(
        second["similar_incidents"][0]["metadata"]["actions"],
        json!(["close road"])
    );
}

#[tokio::test]
async fn envelope_responses_are_unwrapped_to_payload_data() {
    let h = harness(test_config()).await;
    healthy_agents(&h.transport);
    h.transport.always(
        &stage_task(Stage::Ingest),
        Ok(json!({
            "schema": "event_v1",
            "session_id": "agent-side",
            "timestamp": "2024-05-01T00:00:00Z",
            "source_agent": "ingest",
            "payload": {"type": "event", "data": {"content": "normalized"}}
        })),
    );

    assert!(h.pipeline.process_event(json!({}), "sensor").await.success);
    let verify = &h.transport.sent_to(&stage_task(Stage::Verify))[0];
    assert_eq!(verify["payload"]["data"]["event"], json!({"content": "normalized"}));
}

#[tokio::test]
async fn missing_incident_id_gets_generated() {
    let h = harness(test_config()).await;
    healthy_agents(&h.transport);
    h.transport
        .always(&stage_task(Stage::Dispatch), Ok(json!({"recommended_actions": []})));

    let outcome = h.pipeline.process_event(json!({}), "sensor").await;
    let incident_id = outcome.incident_id.expect("generated id");
    assert!(uuid::Uuid::parse_str(&incident_id).is_ok());
}

#[tokio::test]
async fn failing_stage_is_retried_then_dead_lettered() {
    let h = harness(test_config()).await;
    healthy_agents(&h.transport);
    h.transport.always(
        &stage_task(Stage::Verify),
        Err(DispatchError::Connection("refused".into())),
    );

    let outcome = h.pipeline.process_event(json!({"text": "x"}), "sensor").await;

    assert!(!outcome.success);
    let error = outcome.error.as_deref().expect("error message");
    assert!(error.contains("all 3 attempts failed"), "{error}");
    assert_eq!(h.transport.calls(&stage_task(Stage::Ingest)), 1);
    assert_eq!(h.transport.calls(&stage_task(Stage::Verify)), 3);
    for stage in [Stage::Summarize, Stage::Triage, Stage::Dispatch] {
        assert_eq!(h.transport.calls(&stage_task(stage)), 0, "{stage} must not run");
    }

    let session = h.sessions.get_session(&outcome.session_id).await.expect("active");
    assert_eq!(session.status, SessionStatus::Failed);
    assert_eq!(session.metadata["error"], error);
    assert_eq!(session.events.len(), 1);

    let dlq = h.dlq.stats().await.expect("dlq stats");
    assert_eq!(dlq.pending, 1);
    let rows = h.dlq.get_pending(10, chrono::Utc::now()).await.expect("rows");
    assert_eq!(rows[0].target_agent, "verifier");
    assert_eq!(rows[0].failure_count, 3);
    assert_eq!(rows[0].original_payload["session_id"], outcome.session_id.as_str());

    let stats = h.pipeline.stats();
    assert_eq!(stats.errors, 1);
    assert_eq!(stats.retries, 2);
    assert_eq!(stats.incidents_created, 0);
}

#[tokio::test]
async fn unreachable_triage_fails_run_with_one_dead_letter() {
    let h = harness(test_config()).await;
    healthy_agents(&h.transport);
    h.transport.always(
        &stage_task(Stage::Triage),
        Err(DispatchError::Connection("refused".into())),
    );

    let outcome = h
        .pipeline
        .process_event(
            json!({"source": "emergency", "content": "Major power outage across downtown"}),
            "sensor",
        )
        .await;

    assert!(!outcome.success);
    assert!(outcome.incident_id.is_none());
    assert!(outcome.error.is_some());
    assert_eq!(h.transport.calls(&stage_task(Stage::Triage)), 3);
    assert_eq!(h.transport.calls(&stage_task(Stage::Dispatch)), 0);

    let session = h.sessions.get_session(&outcome.session_id).await.expect("active");
    assert_eq!(session.status, SessionStatus::Failed);
    assert_eq!(session.events.len(), 3);

    let rows = h.dlq.get_pending(10, chrono::Utc::now()).await.expect("rows");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].target_agent, "triage");
    assert_eq!(rows[0].target_url, stage_task(Stage::Triage));
    assert_eq!(h.dlq.stats().await.expect("dlq stats").total, 1);
}

#[tokio::test]
async fn transient_failure_recovers_within_retry_budget() {
    let h = harness(test_config()).await;
    healthy_agents(&h.transport);
    h.transport.script(
        &stage_task(Stage::Summarize),
        vec![Err(DispatchError::Status {
            status: 503,
            body: "busy".into(),
        })],
    );

    let outcome = h.pipeline.process_event(json!({}), "sensor").await;

    assert!(outcome.success);
    assert_eq!(h.transport.calls(&stage_task(Stage::Summarize)), 2);
    assert_eq!(h.pipeline.stats().retries, 1);
    assert_eq!(h.dlq.stats().await.expect("dlq").total, 0);
}

#[tokio::test]
async fn repeated_failures_open_the_breaker_and_reject_without_calling() {
    let h = harness(test_config()).await;
    healthy_agents(&h.transport);
    h.transport.always(
        &stage_task(Stage::Triage),
        Err(DispatchError::Timeout(std::time::Duration::from_secs(1))),
    );

    for _ in 0..3 {
        assert!(!h.pipeline.process_event(json!({}), "sensor").await.success);
    }
    assert_eq!(h.breakers.state("triage"), CircuitState::Open);
    let calls_before = h.transport.calls(&stage_task(Stage::Triage));
    assert_eq!(calls_before, 9);

    let outcome = h.pipeline.process_event(json!({}), "sensor").await;
    assert!(!outcome.success);
    assert!(outcome.error.as_deref().unwrap().starts_with("circuit open: triage"));
    assert_eq!(h.transport.calls(&stage_task(Stage::Triage)), calls_before);

    let rows = h.dlq.get_pending(10, chrono::Utc::now()).await.expect("rows");
    let rejected: Vec<_> = rows
        .iter()
        .filter(|row| row.metadata.get("reason") == Some(&json!("circuit_open")))
        .collect();
    assert_eq!(rejected.len(), 1);
    assert_eq!(rejected[0].failure_count, 1);
    assert_eq!(rows.len(), 4);

    let stats = h.pipeline.stats();
    assert_eq!(stats.circuit_breaker_trips, 1);
    assert_eq!(stats.errors, 4);
}

#[tokio::test]
async fn unregistered_stage_fails_the_run() {
    let h = harness_with_registry(test_config(), StaticRegistry::without(Stage::Triage)).await;
    healthy_agents(&h.transport);

    let outcome = h.pipeline.process_event(json!({}), "sensor").await;

    assert!(!outcome.success);
    assert_eq!(
        outcome.error.as_deref(),
        Some("transport: no agent registered for triage")
    );
    assert_eq!(h.transport.calls(&stage_task(Stage::Dispatch)), 0);
}

#[tokio::test]
async fn agent_reported_failure_is_not_retried_when_disabled() {
    let mut config = test_config();
    config.retry.retry_agent_logic_errors = false;
    let h = harness(config).await;
    healthy_agents(&h.transport);
    h.transport.always(
        &stage_task(Stage::Verify),
        Err(DispatchError::AgentLogic("claims could not be verified".into())),
    );

    let outcome = h.pipeline.process_event(json!({}), "sensor").await;

    assert!(!outcome.success);
    assert!(outcome.error.as_deref().unwrap().starts_with("agent logic:"));
    assert_eq!(h.transport.calls(&stage_task(Stage::Verify)), 1);
    assert_eq!(h.dlq.stats().await.expect("dlq").pending, 1);
}

#[tokio::test]
async fn concurrent_runs_get_distinct_sessions() {
    let h = harness(test_config()).await;
    healthy_agents(&h.transport);

    let runs = (0..8).map(|n| h.pipeline.process_event(json!({ "n": n }), "sensor"));
    let outcomes = futures_util::future::join_all(runs).await;

    let mut ids: Vec<&str> = outcomes.iter().map(|o| o.session_id.as_str()).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 8);
    assert!(outcomes.iter().all(|o| o.success));
    assert_eq!(h.pipeline.stats().events_processed, 8);
    assert_eq!(h.sessions.active_count().await, 8);
}
