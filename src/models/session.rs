//! Session model and lifecycle helpers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::envelope::JsonMap;

/// Lifecycle status for a pipeline session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// Pipeline run in progress.
    Active,
    /// All five stages succeeded.
    Completed,
    /// A stage failed after exhausting its retries.
    Failed,
    /// Moved into the archive store.
    Archived,
    /// Brought back from the archive into the active set.
    Restored,
}

impl SessionStatus {
    /// Wire and tag name of the status.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Archived => "archived",
            Self::Restored => "restored",
        }
    }
}

/// Entry in the append-only session event log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionEvent {
    /// When the event was recorded.
    pub timestamp: DateTime<Utc>,
    /// Short label, usually the stage name.
    pub label: String,
    /// Event body.
    pub data: Value,
}

impl SessionEvent {
    /// Build an event stamped with the current time.
    #[must_use]
    pub fn new(label: impl Into<String>, data: Value) -> Self {
        Self {
            timestamp: Utc::now(),
            label: label.into(),
            data,
        }
    }
}

/// Unit of work tracking one event through the pipeline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Session {
    /// Session identifier, shared with every envelope of the run.
    pub session_id: String,
    /// Current lifecycle status.
    pub status: SessionStatus,
    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
    /// Last recorded activity; never moves backwards.
    pub last_activity: DateTime<Utc>,
    /// Append-only event log.
    pub events: Vec<SessionEvent>,
    /// Incident id, set only on successful completion.
    pub incident_id: Option<String>,
    /// Free-form metadata (source agent, severity, error).
    pub metadata: JsonMap,
    /// Number of times the session was restored from the archive.
    #[serde(default)]
    pub restore_count: u32,
    /// Time of the most recent restore.
    #[serde(default)]
    pub restored_at: Option<DateTime<Utc>>,
}

impl Session {
    /// Construct a new active session with a generated identifier.
    #[must_use]
    pub fn new(metadata: JsonMap) -> Self {
        let now = Utc::now();
        Self {
            session_id: Uuid::new_v4().to_string(),
            status: SessionStatus::Active,
            created_at: now,
            last_activity: now,
            events: Vec::new(),
            incident_id: None,
            metadata,
            restore_count: 0,
            restored_at: None,
        }
    }

    /// Bump `last_activity` to `now`, keeping it monotonic.
    pub fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.last_activity {
            self.last_activity = now;
        }
    }

    /// Append an event and bump activity.
    pub fn record(&mut self, event: SessionEvent) {
        self.touch(event.timestamp);
        self.events.push(event);
    }

    /// Whether the session has been idle for strictly longer than `timeout`.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>, timeout: chrono::Duration) -> bool {
        now - self.last_activity > timeout
    }

    /// Search tags derived from status and metadata.
    #[must_use]
    pub fn derive_tags(&self) -> Vec<String> {
        let mut tags = vec![format!("status:{}", self.status.as_str())];
        if let Some(Value::String(source)) = self.metadata.get("source_agent") {
            tags.push(format!("source:{source}"));
        }
        if let Some(Value::String(severity)) = self.metadata.get("severity") {
            tags.push(format!("severity:{}", severity.to_lowercase()));
        }
        if self.incident_id.is_some() {
            tags.push("incident:yes".into());
        }
        tags
    }
}

/// Snapshot of a session held in the archive store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArchivedSession {
    /// Session state at archive time, with status `archived`.
    pub session: Session,
    /// When the snapshot was written.
    pub archived_at: DateTime<Utc>,
    /// Why the session was archived (`timeout`, `manual`, ...).
    pub archive_reason: String,
    /// Time of the most recent restore, if any.
    pub restored_at: Option<DateTime<Utc>>,
    /// Number of completed restores.
    pub restore_count: u32,
    /// Search tags.
    pub tags: Vec<String>,
}

impl ArchivedSession {
    /// Snapshot a session that is leaving the active set.
    ///
    /// Tags capture the status the session had before archival.
    #[must_use]
    pub fn from_session(mut session: Session, reason: &str, now: DateTime<Utc>) -> Self {
        let tags = session.derive_tags();
        let restore_count = session.restore_count;
        let restored_at = session.restored_at;
        session.status = SessionStatus::Archived;
        Self {
            session,
            archived_at: now,
            archive_reason: reason.to_owned(),
            restored_at,
            restore_count,
            tags,
        }
    }

    /// Session id of the snapshot.
    #[must_use]
    pub fn session_id(&self) -> &str {
        &self.session.session_id
    }

    /// Turn the snapshot back into an active-set session.
    #[must_use]
    pub fn into_restored(self, now: DateTime<Utc>) -> Session {
        let mut session = self.session;
        session.status = SessionStatus::Restored;
        session.restore_count = self.restore_count.saturating_add(1);
        session.restored_at = Some(now);
        session.touch(now);
        session
    }
}
