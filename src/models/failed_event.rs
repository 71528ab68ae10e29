//! Dead-letter queue row model.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::envelope::JsonMap;

/// Recovery state of a dead-lettered message.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FailedEventStatus {
    /// Waiting for its first recovery attempt.
    Pending,
    /// Recovery attempted; eligible again once `retry_after` passes.
    Retrying,
    /// Recovery budget exhausted; never processed again.
    Failed,
    /// Resent successfully. Recovered rows are deleted, so this is only
    /// observed transiently.
    Recovered,
}

impl FailedEventStatus {
    /// Column value of the status.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Retrying => "retrying",
            Self::Failed => "failed",
            Self::Recovered => "recovered",
        }
    }
}

/// Message whose delivery to a stage agent was abandoned.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FailedEvent {
    /// Unique row identifier.
    pub event_id: String,
    /// Serialized envelope that could not be delivered.
    pub original_payload: Value,
    /// Agent id of the intended recipient.
    pub target_agent: String,
    /// Full URL the envelope was posted to.
    pub target_url: String,
    /// Most recent failure description.
    pub failure_reason: String,
    /// Observed failures; never decreases.
    pub failure_count: u32,
    /// First failure time.
    pub first_failure: DateTime<Utc>,
    /// Most recent failure time.
    pub last_failure: DateTime<Utc>,
    /// Earliest time the recovery loop may retry the row.
    pub retry_after: Option<DateTime<Utc>>,
    /// Recovery state.
    pub status: FailedEventStatus,
    /// Extra context, such as `reason = "circuit_open"`.
    pub metadata: JsonMap,
}

impl FailedEvent {
    /// Build a pending row for a freshly abandoned delivery.
    #[must_use]
    pub fn new(
        original_payload: Value,
        target_agent: impl Into<String>,
        target_url: impl Into<String>,
        failure_reason: impl Into<String>,
        failure_count: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            event_id: Uuid::new_v4().to_string(),
            original_payload,
            target_agent: target_agent.into(),
            target_url: target_url.into(),
            failure_reason: failure_reason.into(),
            failure_count,
            first_failure: now,
            last_failure: now,
            retry_after: None,
            status: FailedEventStatus::Pending,
            metadata: JsonMap::new(),
        }
    }

    /// Whether the recovery loop may resend this row at `now`.
    #[must_use]
    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            FailedEventStatus::Pending => true,
            FailedEventStatus::Retrying => self.retry_after.is_none_or(|at| at <= now),
            FailedEventStatus::Failed | FailedEventStatus::Recovered => false,
        }
    }

    /// Attach a metadata entry.
    #[must_use]
    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        self.metadata.insert(key.to_owned(), value);
        self
    }
}
