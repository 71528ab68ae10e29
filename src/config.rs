//! Global configuration parsing and validation.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::models::stage::Stage;
use crate::{AppError, Result};

/// Retry executor settings for stage dispatch.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", default)]
pub struct RetryConfig {
    /// Retries after the first attempt; total attempts is `max_retries + 1`.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub initial_delay_ms: u64,
    /// Exponential growth factor applied per attempt.
    pub backoff_multiplier: f64,
    /// Upper bound for the pre-jitter delay.
    pub max_delay_ms: u64,
    /// Lower bound applied after jitter.
    pub min_delay_ms: u64,
    /// Symmetric jitter fraction of the computed delay.
    pub jitter: f64,
    /// Per-attempt request timeout.
    pub timeout_seconds: u64,
    /// Whether exhausted calls are written to the dead-letter queue.
    pub enable_dead_letter_queue: bool,
    /// Whether explicit agent failures are retried like transport failures.
    pub retry_agent_logic_errors: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 1000,
            backoff_multiplier: 2.0,
            max_delay_ms: 30_000,
            min_delay_ms: 100,
            jitter: 0.1,
            timeout_seconds: 30,
            enable_dead_letter_queue: true,
            retry_agent_logic_errors: true,
        }
    }
}

impl RetryConfig {
    /// Per-attempt request timeout as a [`Duration`].
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

/// Circuit breaker thresholds applied to every stage target.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct CircuitBreakerConfig {
    /// Consecutive observed failures before the breaker opens.
    pub failure_threshold: u32,
    /// Time an open breaker rejects calls before allowing a probe.
    pub recovery_timeout_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_ms: 60_000,
        }
    }
}

impl CircuitBreakerConfig {
    /// Recovery timeout as a [`Duration`].
    #[must_use]
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }
}

/// Dead-letter recovery processor settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct RecoveryConfig {
    /// Interval between recovery ticks.
    pub interval_seconds: u64,
    /// Maximum rows pulled per tick.
    pub batch_size: u32,
    /// Failure count at which a row becomes terminally failed.
    pub max_recovery_attempts: u32,
    /// Base of the exponential `retry_after` schedule.
    pub backoff_base_seconds: u64,
    /// Timeout for the single-shot resend.
    pub timeout_seconds: u64,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 300,
            batch_size: 10,
            max_recovery_attempts: 5,
            backoff_base_seconds: 300,
            timeout_seconds: 30,
        }
    }
}

/// Session lifecycle and archive maintenance settings.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case", default)]
pub struct SessionConfig {
    /// Inactivity after which an active session is archived.
    pub timeout_seconds: u64,
    /// Interval between timeout scanner ticks.
    pub scan_interval_seconds: u64,
    /// Interval between archive cleanup runs.
    pub cleanup_interval_seconds: u64,
    /// Archived sessions older than this are deleted by cleanup.
    pub max_archive_age_days: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 3600,
            scan_interval_seconds: 300,
            cleanup_interval_seconds: 86_400,
            max_archive_age_days: 30,
        }
    }
}

impl SessionConfig {
    /// Inactivity timeout as a `chrono` duration for timestamp arithmetic.
    #[must_use]
    pub fn timeout(&self) -> chrono::Duration {
        i64::try_from(self.timeout_seconds)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX)
    }
}

/// Similarity-search lookup settings used between summarize and triage.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", default)]
pub struct MemoryConfig {
    /// Number of related incidents requested.
    pub top_k: usize,
    /// Minimum similarity score for a match.
    pub min_similarity: f64,
    /// Lookup timeout; exceeding it yields an empty context.
    pub timeout_ms: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            top_k: 3,
            min_similarity: 0.2,
            timeout_ms: 2000,
        }
    }
}

fn default_http_port() -> u16 {
    8080
}

fn default_db_path() -> PathBuf {
    PathBuf::from("data/fleet.db")
}

fn default_source_agent() -> String {
    "integration_pipeline".into()
}

fn default_agents() -> HashMap<String, String> {
    Stage::ALL
        .iter()
        .zip(8001u16..)
        .map(|(stage, port)| (stage.agent_id().to_owned(), format!("http://localhost:{port}")))
        .collect()
}

/// Global configuration parsed from `config.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case")]
pub struct GlobalConfig {
    /// HTTP port for the API surface.
    #[serde(default = "default_http_port")]
    pub http_port: u16,
    /// `SQLite` file holding the archive and the dead-letter queue.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// `source_agent` stamped on envelopes built by the orchestrator.
    #[serde(default = "default_source_agent")]
    pub source_agent: String,
    /// Stage agent id to base URL.
    #[serde(default = "default_agents")]
    pub agents: HashMap<String, String>,
    /// Retry executor settings.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Circuit breaker settings.
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,
    /// Dead-letter recovery settings.
    #[serde(default)]
    pub recovery: RecoveryConfig,
    /// Session lifecycle settings.
    #[serde(default)]
    pub sessions: SessionConfig,
    /// Similarity lookup settings.
    #[serde(default)]
    pub memory: MemoryConfig,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            http_port: default_http_port(),
            db_path: default_db_path(),
            source_agent: default_source_agent(),
            agents: default_agents(),
            retry: RetryConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            recovery: RecoveryConfig::default(),
            sessions: SessionConfig::default(),
            memory: MemoryConfig::default(),
        }
    }
}

impl GlobalConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Base URL configured for a stage, if any.
    #[must_use]
    pub fn agent_url(&self, stage: Stage) -> Option<&str> {
        self.agents.get(stage.agent_id()).map(String::as_str)
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` describing the first violated constraint.
    pub fn validate(&self) -> Result<()> {
        if self.circuit_breaker.failure_threshold == 0 {
            return Err(AppError::Config(
                "circuit_breaker.failure_threshold must be greater than zero".into(),
            ));
        }
        if self.recovery.max_recovery_attempts == 0 {
            return Err(AppError::Config(
                "recovery.max_recovery_attempts must be greater than zero".into(),
            ));
        }
        if self.recovery.interval_seconds == 0
            || self.sessions.scan_interval_seconds == 0
            || self.sessions.cleanup_interval_seconds == 0
        {
            return Err(AppError::Config(
                "background intervals must be greater than zero".into(),
            ));
        }
        if self.retry.timeout_seconds == 0 || self.recovery.timeout_seconds == 0 {
            return Err(AppError::Config(
                "dispatch timeouts must be greater than zero".into(),
            ));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(AppError::Config(
                "retry.backoff_multiplier must be at least 1.0".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.retry.jitter) {
            return Err(AppError::Config(
                "retry.jitter must be within [0, 1]".into(),
            ));
        }
        if self.retry.min_delay_ms > self.retry.max_delay_ms {
            return Err(AppError::Config(
                "retry.min_delay_ms must not exceed retry.max_delay_ms".into(),
            ));
        }
        Ok(())
    }
}
