//! Stage agent transport abstraction.
//!
//! [`StageTransport`] performs exactly one delivery attempt of a serialized
//! envelope. Retrying, circuit breaking and dead-lettering are layered on
//! top by the other resilience modules, so test doubles only need to script
//! single-attempt outcomes.

use std::fmt::{Display, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use crate::{AppError, Result};

/// Path appended to a stage agent base URL for task delivery.
pub const TASKS_PATH: &str = "/tasks";

/// Failure of a single delivery attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchError {
    /// The attempt exceeded its timeout.
    Timeout(Duration),
    /// The connection could not be established or was dropped.
    Connection(String),
    /// The agent answered with a non-success HTTP status.
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, possibly truncated.
        body: String,
    },
    /// The agent answered but reported a failure in its body.
    AgentLogic(String),
    /// The response body was not a JSON object.
    InvalidResponse(String),
}

impl DispatchError {
    /// Whether the failure is a transport-level condition that may clear on
    /// its own (timeouts, connection errors, 5xx, 408 and 429).
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Connection(_) => true,
            Self::Status { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            Self::AgentLogic(_) | Self::InvalidResponse(_) => false,
        }
    }

    /// Lift into the application taxonomy with a context prefix.
    #[must_use]
    pub fn into_app_error(self, context: &str) -> AppError {
        if self.is_transient() {
            AppError::Transport(format!("{context}: {self}"))
        } else {
            AppError::AgentLogic(format!("{context}: {self}"))
        }
    }
}

impl Display for DispatchError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout(after) => write!(f, "timed out after {}ms", after.as_millis()),
            Self::Connection(msg) => write!(f, "connection failed: {msg}"),
            Self::Status { status, body } => write!(f, "http {status}: {body}"),
            Self::AgentLogic(msg) => write!(f, "agent reported failure: {msg}"),
            Self::InvalidResponse(msg) => write!(f, "invalid response: {msg}"),
        }
    }
}

impl std::error::Error for DispatchError {}

/// Future returned by [`StageTransport::send`].
pub type DispatchFuture<'a> =
    Pin<Box<dyn Future<Output = std::result::Result<Value, DispatchError>> + Send + 'a>>;

/// Single-attempt delivery of an envelope to a stage agent.
pub trait StageTransport: Send + Sync {
    /// POST `envelope` to `target_url` and return the decoded response body.
    ///
    /// # Errors
    ///
    /// Returns a [`DispatchError`] describing why the attempt failed.
    fn send<'a>(
        &'a self,
        target_url: &'a str,
        envelope: &'a Value,
        timeout: Duration,
    ) -> DispatchFuture<'a>;
}

/// Build the task endpoint for an agent base URL.
#[must_use]
pub fn task_url(base_url: &str) -> String {
    format!("{}{TASKS_PATH}", base_url.trim_end_matches('/'))
}

/// Check a decoded response body for an explicit failure report.
///
/// # Errors
///
/// Returns `DispatchError::InvalidResponse` for non-object bodies and
/// `DispatchError::AgentLogic` for `{"status": "error"}` or
/// `{"success": false}` bodies.
pub fn classify_body(body: Value) -> std::result::Result<Value, DispatchError> {
    let Value::Object(fields) = &body else {
        return Err(DispatchError::InvalidResponse(format!(
            "expected JSON object, got {body}"
        )));
    };

    let failed = matches!(fields.get("status"), Some(Value::String(s)) if s == "error")
        || matches!(fields.get("success"), Some(Value::Bool(false)));
    if failed {
        let message = ["error", "message", "error_message"]
            .iter()
            .find_map(|key| fields.get(*key).and_then(Value::as_str))
            .unwrap_or("no error message")
            .to_owned();
        return Err(DispatchError::AgentLogic(message));
    }
    Ok(body)
}

const MAX_ERROR_BODY: usize = 512;

/// [`StageTransport`] over HTTP using `reqwest`.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// Build a transport with a shared connection pool.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Transport` if the HTTP client cannot be built.
    pub fn new(user_agent: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .build()
            .map_err(|err| AppError::Transport(format!("failed to build http client: {err}")))?;
        Ok(Self { client })
    }

    async fn post(
        &self,
        target_url: &str,
        envelope: &Value,
        timeout: Duration,
    ) -> std::result::Result<Value, DispatchError> {
        let response = self
            .client
            .post(target_url)
            .timeout(timeout)
            .json(envelope)
            .send()
            .await
            .map_err(|err| map_reqwest_error(&err, timeout))?;

        let status = response.status();
        if !status.is_success() {
            let mut body = response.text().await.unwrap_or_default();
            if body.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }
            return Err(DispatchError::Status {
                status: status.as_u16(),
                body,
            });
        }

        let body: Value = response.json().await.map_err(|err| {
            if err.is_timeout() {
                DispatchError::Timeout(timeout)
            } else {
                DispatchError::InvalidResponse(err.to_string())
            }
        })?;
        debug!(target_url, "stage agent responded");
        classify_body(body)
    }
}

fn map_reqwest_error(err: &reqwest::Error, timeout: Duration) -> DispatchError {
    if err.is_timeout() {
        DispatchError::Timeout(timeout)
    } else {
        DispatchError::Connection(err.to_string())
    }
}

impl StageTransport for HttpTransport {
    fn send<'a>(
        &'a self,
        target_url: &'a str,
        envelope: &'a Value,
        timeout: Duration,
    ) -> DispatchFuture<'a> {
        Box::pin(self.post(target_url, envelope, timeout))
    }
}
