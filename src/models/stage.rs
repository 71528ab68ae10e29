//! The five ordered pipeline stages.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

/// One step of the incident pipeline, in execution order.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    /// Normalize the raw event.
    Ingest,
    /// Verify claims in the normalized event.
    Verify,
    /// Produce an incident brief.
    Summarize,
    /// Classify severity and priority.
    Triage,
    /// Generate and dispatch actions.
    Dispatch,
}

impl Stage {
    /// All stages in strict execution order.
    pub const ALL: [Stage; 5] = [
        Stage::Ingest,
        Stage::Verify,
        Stage::Summarize,
        Stage::Triage,
        Stage::Dispatch,
    ];

    /// Registry key of the agent that serves this stage.
    #[must_use]
    pub fn agent_id(self) -> &'static str {
        match self {
            Self::Ingest => "ingest",
            Self::Verify => "verifier",
            Self::Summarize => "summarizer",
            Self::Triage => "triage",
            Self::Dispatch => "dispatcher",
        }
    }

    /// Operation name sent in the stage request data.
    #[must_use]
    pub fn operation(self) -> &'static str {
        match self {
            Self::Ingest => "normalize_event",
            Self::Verify => "verify_event",
            Self::Summarize => "generate_summary",
            Self::Triage => "classify_severity",
            Self::Dispatch => "generate_actions",
        }
    }

    /// Key under which the previous stage output is sent.
    #[must_use]
    pub fn input_key(self) -> &'static str {
        match self {
            Self::Ingest => "event_data",
            Self::Verify | Self::Summarize => "event",
            Self::Triage => "brief",
            Self::Dispatch => "incident",
        }
    }

    /// Stage name as used in logs and session events.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ingest => "ingest",
            Self::Verify => "verify",
            Self::Summarize => "summarize",
            Self::Triage => "triage",
            Self::Dispatch => "dispatch",
        }
    }
}

impl Display for Stage {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
