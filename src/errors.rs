//! Error types shared across the application.

use std::fmt::{Display, Formatter};

/// Shared application result type.
pub type Result<T> = std::result::Result<T, AppError>;

/// Application error enumeration covering all domain failure modes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    /// Configuration parsing or validation failure.
    Config(String),
    /// Persistence failure when interacting with `SQLite`.
    Db(String),
    /// Malformed envelope or unknown schema; never retried.
    Validation(String),
    /// Timeout or connection failure talking to a stage agent.
    Transport(String),
    /// Stage agent answered with an explicit failure.
    AgentLogic(String),
    /// Call rejected by an open circuit breaker without a network attempt.
    CircuitOpen(String),
    /// Session id is not present in the active set.
    SessionNotFound(String),
    /// Session id is not present in the archive store.
    ArchiveNotFound(String),
    /// Dead-letter row exceeded its recovery budget.
    RecoveryExhausted(String),
    /// File-system or I/O operation failure.
    Io(String),
}

impl AppError {
    /// Short machine-readable category name, used in HTTP error bodies.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Config(_) => "config",
            Self::Db(_) => "db",
            Self::Validation(_) => "validation",
            Self::Transport(_) => "transport",
            Self::AgentLogic(_) => "agent_logic",
            Self::CircuitOpen(_) => "circuit_open",
            Self::SessionNotFound(_) => "session_not_found",
            Self::ArchiveNotFound(_) => "archive_not_found",
            Self::RecoveryExhausted(_) => "recovery_exhausted",
            Self::Io(_) => "io",
        }
    }
}

impl Display for AppError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "config: {msg}"),
            Self::Db(msg) => write!(f, "db: {msg}"),
            Self::Validation(msg) => write!(f, "validation: {msg}"),
            Self::Transport(msg) => write!(f, "transport: {msg}"),
            Self::AgentLogic(msg) => write!(f, "agent logic: {msg}"),
            Self::CircuitOpen(msg) => write!(f, "circuit open: {msg}"),
            Self::SessionNotFound(msg) => write!(f, "session not found: {msg}"),
            Self::ArchiveNotFound(msg) => write!(f, "archive not found: {msg}"),
            Self::RecoveryExhausted(msg) => write!(f, "recovery exhausted: {msg}"),
            Self::Io(msg) => write!(f, "io: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<toml::de::Error> for AppError {
    fn from(err: toml::de::Error) -> Self {
        Self::Config(format!("invalid config: {err}"))
    }
}

impl From<sqlx::Error> for AppError {
    fn from(err: sqlx::Error) -> Self {
        Self::Db(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        Self::Validation(format!("invalid json: {err}"))
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}
