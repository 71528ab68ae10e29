//! Unit tests for envelope construction, parsing and validation.

use fleet_relay::models::envelope::{Envelope, EnvelopeSchema, JsonMap, Payload, PayloadKind};
use fleet_relay::AppError;
use serde_json::{json, Value};

fn data(value: Value) -> JsonMap {
    match value {
        Value::Object(map) => map,
        other => panic!("expected object, got {other}"),
    }
}

fn validation_message(result: fleet_relay::Result<Envelope>) -> String {
    match result {
        Err(AppError::Validation(msg)) => msg,
        other => panic!("expected validation error, got {other:?}"),
    }
}

fn wire_envelope() -> Value {
    json!({
        "schema": "event_v1",
        "session_id": "s-1",
        "timestamp": "2024-05-01T12:00:00Z",
        "source_agent": "ingest",
        "payload": { "type": "event", "data": { "text": "x" } }
    })
}

#[test]
fn event_constructor_generates_session_id() {
    let env = Envelope::event("ingest", data(json!({"text": "flood"})), None, None)
        .expect("valid envelope");

    assert_eq!(env.schema(), EnvelopeSchema::EventV1);
    assert_eq!(env.source_agent(), "ingest");
    assert!(!env.session_id().is_empty());
    assert_eq!(env.payload().kind(), PayloadKind::Event);
    assert_eq!(env.payload().data()["text"], "flood");
}

#[test]
fn stage_constructors_use_their_schema_and_payload_type() {
    let cases = [
        (
            Envelope::verified_event("verifier", JsonMap::new(), "s-1", None),
            EnvelopeSchema::VerifiedEventV1,
            PayloadKind::Event,
        ),
        (
            Envelope::incident("summarizer", JsonMap::new(), "s-1", None),
            EnvelopeSchema::IncidentBriefV1,
            PayloadKind::Incident,
        ),
        (
            Envelope::triage("triage", JsonMap::new(), "s-1", None),
            EnvelopeSchema::TriagedIncidentV1,
            PayloadKind::Triage,
        ),
        (
            Envelope::dispatch("dispatcher", JsonMap::new(), "s-1", None),
            EnvelopeSchema::DispatchV1,
            PayloadKind::Dispatch,
        ),
    ];

    for (env, schema, kind) in cases {
        let env = env.expect("valid envelope");
        assert_eq!(env.schema(), schema);
        assert_eq!(env.payload().kind(), kind);
        assert_eq!(env.session_id(), "s-1");
    }
}

#[test]
fn error_envelope_carries_message_and_details() {
    let details = data(json!({"stage": "verify"}));
    let env = Envelope::error("pipeline", "boom", Some(details), Some("s-9".into()), None)
        .expect("valid envelope");

    assert_eq!(env.schema(), EnvelopeSchema::McpEnvelopeV1);
    assert_eq!(env.payload().kind(), PayloadKind::Error);
    assert_eq!(env.payload().data()["error_message"], "boom");
    assert_eq!(env.payload().data()["error_details"]["stage"], "verify");
}

#[test]
fn empty_source_agent_is_rejected() {
    let msg = validation_message(Envelope::event("  ", JsonMap::new(), None, None));
    assert!(msg.contains("source_agent"), "{msg}");
}

#[test]
fn empty_session_id_is_rejected() {
    let msg = validation_message(Envelope::verified_event("verifier", JsonMap::new(), "", None));
    assert!(msg.contains("session_id"), "{msg}");
}

#[test]
fn serialized_envelope_parses_back_to_equal_value() {
    let meta = data(json!({"trace": "abc"}));
    let env = Envelope::incident("summarizer", data(json!({"title": "t"})), "s-2", Some(meta))
        .expect("valid envelope");

    let text = env.to_json().expect("serializes");
    let parsed = Envelope::parse(&text).expect("parses");

    assert_eq!(parsed, env);
    assert_eq!(parsed.metadata()["trace"], "abc");
}

#[test]
fn serialized_payload_is_tagged_by_type() {
    let env = Envelope::triage("triage", JsonMap::new(), "s-3", None).expect("valid envelope");
    let value = env.to_value().expect("serializes");

    assert_eq!(value["schema"], "triaged_incident_v1");
    assert_eq!(value["payload"]["type"], "triage");
    assert!(value["payload"]["data"].is_object());
}

#[test]
fn parse_accepts_wire_envelope() {
    let env = Envelope::from_value(wire_envelope()).expect("parses");
    assert_eq!(env.session_id(), "s-1");
    assert_eq!(env.timestamp().to_rfc3339(), "2024-05-01T12:00:00+00:00");
    assert!(env.metadata().is_empty());
}

#[test]
fn parse_accepts_offsetless_timestamp() {
    let mut value = wire_envelope();
    value["timestamp"] = json!("2024-05-01T12:00:00.123456");
    let env = Envelope::from_value(value).expect("parses");
    assert_eq!(env.timestamp().timestamp_subsec_micros(), 123_456);
}

#[test]
fn parse_accepts_acknowledgment_alias() {
    let mut value = wire_envelope();
    value["payload"]["type"] = json!("acknowledgment");
    let env = Envelope::from_value(value).expect("parses");
    assert!(matches!(env.payload(), Payload::Ack(_)));
}

#[test]
fn parse_rejects_invalid_json() {
    let msg = validation_message(Envelope::parse("{not json"));
    assert!(msg.starts_with("invalid json"), "{msg}");
}

#[test]
fn parse_rejects_non_object() {
    let msg = validation_message(Envelope::from_value(json!([1, 2])));
    assert_eq!(msg, "envelope must be a JSON object");
}

#[test]
fn parse_lists_every_missing_field() {
    let msg = validation_message(Envelope::from_value(json!({"schema": "event_v1"})));
    assert_eq!(
        msg,
        "missing required fields: session_id, timestamp, source_agent, payload"
    );
}

#[test]
fn parse_rejects_unknown_schema() {
    let mut value = wire_envelope();
    value["schema"] = json!("event_v9");
    let msg = validation_message(Envelope::from_value(value));
    assert!(msg.contains("invalid schema"), "{msg}");
}

#[test]
fn parse_rejects_payload_without_type() {
    let mut value = wire_envelope();
    value["payload"] = json!({"data": {}});
    let msg = validation_message(Envelope::from_value(value));
    assert_eq!(msg, "payload missing 'type' field");
}

#[test]
fn parse_rejects_unknown_payload_type() {
    let mut value = wire_envelope();
    value["payload"]["type"] = json!("notice");
    let msg = validation_message(Envelope::from_value(value));
    assert!(msg.starts_with("invalid payload type"), "{msg}");
}

#[test]
fn parse_rejects_payload_without_data() {
    let mut value = wire_envelope();
    value["payload"] = json!({"type": "event"});
    let msg = validation_message(Envelope::from_value(value));
    assert_eq!(msg, "payload missing 'data' field");
}

#[test]
fn parse_rejects_non_object_data() {
    let mut value = wire_envelope();
    value["payload"]["data"] = json!("text");
    let msg = validation_message(Envelope::from_value(value));
    assert_eq!(msg, "payload 'data' must be an object");
}

#[test]
fn parse_rejects_empty_session_id() {
    let mut value = wire_envelope();
    value["session_id"] = json!("");
    let msg = validation_message(Envelope::from_value(value));
    assert!(msg.contains("session_id"), "{msg}");
}

#[test]
fn parse_rejects_bad_timestamp() {
    let mut value = wire_envelope();
    value["timestamp"] = json!("last tuesday");
    let msg = validation_message(Envelope::from_value(value));
    assert!(msg.contains("invalid timestamp"), "{msg}");
}

#[test]
fn schema_names_round_trip_through_from_str() {
    for name in [
        "mcp_envelope_v1",
        "event_v1",
        "verified_event_v1",
        "incident_brief_v1",
        "triaged_incident_v1",
        "dispatch_v1",
    ] {
        let schema: EnvelopeSchema = name.parse().expect("known schema");
        assert_eq!(schema.to_string(), name);
    }
}
