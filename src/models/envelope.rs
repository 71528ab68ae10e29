//! Message envelope exchanged with stage agents.
//!
//! Every message sent to or received from a stage agent is wrapped in an
//! [`Envelope`] that correlates it with a session. Envelopes are immutable
//! once built: the only ways to obtain one are the validated constructors
//! below or [`Envelope::parse`], and both either fully succeed or return
//! [`AppError::Validation`] without producing a value.

use std::fmt::{Display, Formatter};
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::{AppError, Result};

/// JSON object type used for payload data and metadata.
pub type JsonMap = Map<String, Value>;

const REQUIRED_FIELDS: [&str; 5] = ["schema", "session_id", "timestamp", "source_agent", "payload"];

/// Known envelope schemas.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum EnvelopeSchema {
    /// Generic envelope, used for errors and acknowledgements.
    #[serde(rename = "mcp_envelope_v1")]
    McpEnvelopeV1,
    /// Raw or normalized event.
    #[serde(rename = "event_v1")]
    EventV1,
    /// Event after claim verification.
    #[serde(rename = "verified_event_v1")]
    VerifiedEventV1,
    /// Summarized incident brief.
    #[serde(rename = "incident_brief_v1")]
    IncidentBriefV1,
    /// Incident with severity and priority.
    #[serde(rename = "triaged_incident_v1")]
    TriagedIncidentV1,
    /// Dispatched actions.
    #[serde(rename = "dispatch_v1")]
    DispatchV1,
}

impl EnvelopeSchema {
    /// Wire name of the schema.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::McpEnvelopeV1 => "mcp_envelope_v1",
            Self::EventV1 => "event_v1",
            Self::VerifiedEventV1 => "verified_event_v1",
            Self::IncidentBriefV1 => "incident_brief_v1",
            Self::TriagedIncidentV1 => "triaged_incident_v1",
            Self::DispatchV1 => "dispatch_v1",
        }
    }
}

impl FromStr for EnvelopeSchema {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "mcp_envelope_v1" => Ok(Self::McpEnvelopeV1),
            "event_v1" => Ok(Self::EventV1),
            "verified_event_v1" => Ok(Self::VerifiedEventV1),
            "incident_brief_v1" => Ok(Self::IncidentBriefV1),
            "triaged_incident_v1" => Ok(Self::TriagedIncidentV1),
            "dispatch_v1" => Ok(Self::DispatchV1),
            other => Err(AppError::Validation(format!("invalid schema: {other}"))),
        }
    }
}

impl Display for EnvelopeSchema {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Discriminant of a [`Payload`], without its body.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PayloadKind {
    /// Event data.
    Event,
    /// Incident brief.
    Incident,
    /// Triage result.
    Triage,
    /// Dispatch result.
    Dispatch,
    /// Error report.
    Error,
    /// Acknowledgement.
    Ack,
}

impl PayloadKind {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "event" => Some(Self::Event),
            "incident" => Some(Self::Incident),
            "triage" => Some(Self::Triage),
            "dispatch" => Some(Self::Dispatch),
            "error" => Some(Self::Error),
            "ack" | "acknowledgment" => Some(Self::Ack),
            _ => None,
        }
    }
}

/// Data and metadata carried by every payload variant.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PayloadBody {
    /// Stage-specific data.
    pub data: JsonMap,
    /// Payload-level metadata.
    #[serde(default)]
    pub metadata: JsonMap,
}

/// Envelope payload tagged by its `type` field.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    /// Event data (raw, normalized or verified).
    Event(PayloadBody),
    /// Incident brief.
    Incident(PayloadBody),
    /// Triage result.
    Triage(PayloadBody),
    /// Dispatch result.
    Dispatch(PayloadBody),
    /// Error report.
    Error(PayloadBody),
    /// Acknowledgement.
    #[serde(rename = "ack", alias = "acknowledgment")]
    Ack(PayloadBody),
}

impl Payload {
    /// Discriminant of this payload.
    #[must_use]
    pub fn kind(&self) -> PayloadKind {
        match self {
            Self::Event(_) => PayloadKind::Event,
            Self::Incident(_) => PayloadKind::Incident,
            Self::Triage(_) => PayloadKind::Triage,
            Self::Dispatch(_) => PayloadKind::Dispatch,
            Self::Error(_) => PayloadKind::Error,
            Self::Ack(_) => PayloadKind::Ack,
        }
    }

    /// Shared body of the payload.
    #[must_use]
    pub fn body(&self) -> &PayloadBody {
        match self {
            Self::Event(body)
            | Self::Incident(body)
            | Self::Triage(body)
            | Self::Dispatch(body)
            | Self::Error(body)
            | Self::Ack(body) => body,
        }
    }

    /// Stage-specific data map.
    #[must_use]
    pub fn data(&self) -> &JsonMap {
        &self.body().data
    }
}

/// Immutable, validated message envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(try_from = "RawEnvelope")]
pub struct Envelope {
    schema: EnvelopeSchema,
    session_id: String,
    timestamp: DateTime<Utc>,
    source_agent: String,
    payload: Payload,
    metadata: JsonMap,
}

/// Wire shape accepted before validation.
#[derive(Deserialize)]
struct RawEnvelope {
    schema: EnvelopeSchema,
    session_id: String,
    timestamp: String,
    source_agent: String,
    payload: Payload,
    #[serde(default)]
    metadata: JsonMap,
}

impl TryFrom<RawEnvelope> for Envelope {
    type Error = AppError;

    fn try_from(raw: RawEnvelope) -> Result<Self> {
        let timestamp = parse_timestamp(&raw.timestamp)?;
        Self::build(
            raw.schema,
            raw.session_id,
            timestamp,
            raw.source_agent,
            raw.payload,
            raw.metadata,
        )
    }
}

/// Accept RFC 3339 timestamps, and offset-less ISO-8601 ones as UTC.
fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|err| AppError::Validation(format!("invalid timestamp '{raw}': {err}")))
}

impl Envelope {
    fn build(
        schema: EnvelopeSchema,
        session_id: String,
        timestamp: DateTime<Utc>,
        source_agent: String,
        payload: Payload,
        metadata: JsonMap,
    ) -> Result<Self> {
        if session_id.trim().is_empty() {
            return Err(AppError::Validation("missing session_id".into()));
        }
        if source_agent.trim().is_empty() {
            return Err(AppError::Validation("missing source_agent".into()));
        }
        Ok(Self {
            schema,
            session_id,
            timestamp,
            source_agent,
            payload,
            metadata,
        })
    }

    /// Create an envelope stamped with the current UTC time.
    ///
    /// A fresh session id is generated when `session_id` is `None`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` if `source_agent` or an explicit
    /// `session_id` is empty.
    pub fn create(
        schema: EnvelopeSchema,
        source_agent: impl Into<String>,
        payload: Payload,
        session_id: Option<String>,
        metadata: Option<JsonMap>,
    ) -> Result<Self> {
        Self::build(
            schema,
            session_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
            Utc::now(),
            source_agent.into(),
            payload,
            metadata.unwrap_or_default(),
        )
    }

    fn body(data: JsonMap, metadata: Option<&JsonMap>) -> PayloadBody {
        PayloadBody {
            data,
            metadata: metadata.cloned().unwrap_or_default(),
        }
    }

    /// Event envelope (`event_v1`).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` if identifiers are empty.
    pub fn event(
        source_agent: impl Into<String>,
        data: JsonMap,
        session_id: Option<String>,
        metadata: Option<JsonMap>,
    ) -> Result<Self> {
        let payload = Payload::Event(Self::body(data, metadata.as_ref()));
        Self::create(EnvelopeSchema::EventV1, source_agent, payload, session_id, metadata)
    }

    /// Verified event envelope (`verified_event_v1`).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` if identifiers are empty.
    pub fn verified_event(
        source_agent: impl Into<String>,
        data: JsonMap,
        session_id: &str,
        metadata: Option<JsonMap>,
    ) -> Result<Self> {
        let payload = Payload::Event(Self::body(data, metadata.as_ref()));
        Self::create(
            EnvelopeSchema::VerifiedEventV1,
            source_agent,
            payload,
            Some(session_id.to_owned()),
            metadata,
        )
    }

    /// Incident brief envelope (`incident_brief_v1`).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` if identifiers are empty.
    pub fn incident(
        source_agent: impl Into<String>,
        data: JsonMap,
        session_id: &str,
        metadata: Option<JsonMap>,
    ) -> Result<Self> {
        let payload = Payload::Incident(Self::body(data, metadata.as_ref()));
        Self::create(
            EnvelopeSchema::IncidentBriefV1,
            source_agent,
            payload,
            Some(session_id.to_owned()),
            metadata,
        )
    }

    /// Triaged incident envelope (`triaged_incident_v1`).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` if identifiers are empty.
    pub fn triage(
        source_agent: impl Into<String>,
        data: JsonMap,
        session_id: &str,
        metadata: Option<JsonMap>,
    ) -> Result<Self> {
        let payload = Payload::Triage(Self::body(data, metadata.as_ref()));
        Self::create(
            EnvelopeSchema::TriagedIncidentV1,
            source_agent,
            payload,
            Some(session_id.to_owned()),
            metadata,
        )
    }

    /// Dispatch envelope (`dispatch_v1`).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` if identifiers are empty.
    pub fn dispatch(
        source_agent: impl Into<String>,
        data: JsonMap,
        session_id: &str,
        metadata: Option<JsonMap>,
    ) -> Result<Self> {
        let payload = Payload::Dispatch(Self::body(data, metadata.as_ref()));
        Self::create(
            EnvelopeSchema::DispatchV1,
            source_agent,
            payload,
            Some(session_id.to_owned()),
            metadata,
        )
    }

    /// Error report envelope (`mcp_envelope_v1`).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` if identifiers are empty.
    pub fn error(
        source_agent: impl Into<String>,
        error_message: &str,
        error_details: Option<JsonMap>,
        session_id: Option<String>,
        metadata: Option<JsonMap>,
    ) -> Result<Self> {
        let mut data = JsonMap::new();
        data.insert("error_message".into(), Value::String(error_message.to_owned()));
        data.insert(
            "error_details".into(),
            Value::Object(error_details.unwrap_or_default()),
        );
        let payload = Payload::Error(Self::body(data, metadata.as_ref()));
        Self::create(EnvelopeSchema::McpEnvelopeV1, source_agent, payload, session_id, metadata)
    }

    /// Parse and validate an envelope from its JSON text.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` naming the first problem found:
    /// invalid JSON, missing fields, unknown schema, malformed payload,
    /// or empty identifiers.
    pub fn parse(raw: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(raw)?;
        Self::from_value(value)
    }

    /// Validate and convert an already-decoded JSON value.
    ///
    /// # Errors
    ///
    /// Same conditions as [`Envelope::parse`].
    pub fn from_value(value: Value) -> Result<Self> {
        let Value::Object(ref fields) = value else {
            return Err(AppError::Validation("envelope must be a JSON object".into()));
        };

        let missing: Vec<&str> = REQUIRED_FIELDS
            .iter()
            .copied()
            .filter(|name| !fields.contains_key(*name))
            .collect();
        if !missing.is_empty() {
            return Err(AppError::Validation(format!(
                "missing required fields: {}",
                missing.join(", ")
            )));
        }

        match fields.get("schema") {
            Some(Value::String(schema)) => {
                EnvelopeSchema::from_str(schema)?;
            }
            _ => return Err(AppError::Validation("schema must be a string".into())),
        }

        let Some(Value::Object(payload)) = fields.get("payload") else {
            return Err(AppError::Validation("payload must be an object".into()));
        };
        match payload.get("type") {
            None => return Err(AppError::Validation("payload missing 'type' field".into())),
            Some(Value::String(kind)) if PayloadKind::parse(kind).is_some() => {}
            Some(other) => {
                return Err(AppError::Validation(format!(
                    "invalid payload type: {other}"
                )))
            }
        }
        match payload.get("data") {
            None => return Err(AppError::Validation("payload missing 'data' field".into())),
            Some(Value::Object(_)) => {}
            Some(_) => {
                return Err(AppError::Validation(
                    "payload 'data' must be an object".into(),
                ))
            }
        }

        serde_json::from_value(value).map_err(|err| AppError::Validation(err.to_string()))
    }

    /// Serialize to a JSON value.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` if serialization fails.
    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Serialize to JSON text.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Validation` if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Schema of the envelope.
    #[must_use]
    pub fn schema(&self) -> EnvelopeSchema {
        self.schema
    }

    /// Correlation key.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Creation time.
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Agent that built the envelope.
    #[must_use]
    pub fn source_agent(&self) -> &str {
        &self.source_agent
    }

    /// Tagged payload.
    #[must_use]
    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    /// Envelope-level metadata.
    #[must_use]
    pub fn metadata(&self) -> &JsonMap {
        &self.metadata
    }
}
