//! Retry with exponential backoff for stage calls.
//!
//! [`RetryExecutor::execute`] performs up to `max_retries + 1` attempts
//! through a [`StageTransport`], sleeping between attempts with
//! [`RetryPolicy::delay`]. When every attempt fails the final failure is
//! written to the dead-letter queue (if one is attached) before the
//! failure response is returned.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use tracing::{error, info, warn};

use crate::config::RetryConfig;
use crate::models::failed_event::FailedEvent;
use crate::persistence::dlq_repo::DeadLetterQueue;
use crate::AppError;

use super::transport::{DispatchError, StageTransport};

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn ms_to_duration(ms: f64) -> Duration {
    Duration::from_micros((ms.max(0.0) * 1000.0).round() as u64)
}

/// Backoff schedule and retry classification.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    initial_delay_ms: f64,
    backoff_multiplier: f64,
    max_delay_ms: f64,
    min_delay_ms: f64,
    jitter: f64,
    retry_agent_logic_errors: bool,
}

impl RetryPolicy {
    /// Build a policy from configuration.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            initial_delay_ms: config.initial_delay_ms as f64,
            backoff_multiplier: config.backoff_multiplier,
            max_delay_ms: config.max_delay_ms as f64,
            min_delay_ms: config.min_delay_ms as f64,
            jitter: config.jitter,
            retry_agent_logic_errors: config.retry_agent_logic_errors,
        }
    }

    fn base_delay_ms(&self, attempt: u32) -> f64 {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        (self.initial_delay_ms * self.backoff_multiplier.powi(exponent)).min(self.max_delay_ms)
    }

    /// Delay before jitter: `initial * multiplier^attempt`, capped at the
    /// maximum. Non-decreasing in `attempt`.
    #[must_use]
    pub fn base_delay(&self, attempt: u32) -> Duration {
        ms_to_duration(self.base_delay_ms(attempt))
    }

    /// Delay to sleep after the failed attempt number `attempt` (0-based).
    ///
    /// The base delay is perturbed by `u * jitter * base` with `u` uniform in
    /// `[-0.5, 0.5)`, then floored at the minimum delay.
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay_ms(attempt);
        let spread: f64 = rand::thread_rng().gen_range(-0.5..0.5);
        let jittered = (base + spread * self.jitter * base).max(self.min_delay_ms);
        ms_to_duration(jittered)
    }

    /// Whether `err` warrants another attempt.
    #[must_use]
    pub fn should_retry(&self, err: &DispatchError) -> bool {
        err.is_transient() || self.retry_agent_logic_errors
    }
}

/// One stage call to perform with retries.
#[derive(Debug, Clone)]
pub struct StageRequest {
    /// Agent id of the recipient, recorded in dead-letter rows.
    pub target_agent: String,
    /// Full task URL.
    pub target_url: String,
    /// Serialized envelope.
    pub envelope: Value,
    /// Per-attempt timeout.
    pub timeout: Duration,
    /// Retries after the first attempt.
    pub max_retries: u32,
}

/// Outcome of [`RetryExecutor::execute`].
#[derive(Debug, Clone, PartialEq)]
pub struct StageResponse {
    /// Response body on success.
    pub data: Option<Value>,
    /// Last failure when every attempt failed.
    pub error: Option<DispatchError>,
    /// Attempts performed.
    pub attempts: u32,
    /// Dead-letter row written for this failure, if any.
    pub dead_letter_id: Option<String>,
}

impl StageResponse {
    /// Whether the call eventually succeeded.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.data.is_some()
    }

    /// Convert into a result carrying the aggregated failure message.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Transport` for transient final failures and
    /// `AppError::AgentLogic` otherwise.
    pub fn into_result(self) -> crate::Result<Value> {
        match (self.data, self.error) {
            (Some(data), _) => Ok(data),
            (None, Some(err)) => {
                Err(err.into_app_error(&format!("all {} attempts failed", self.attempts)))
            }
            (None, None) => Err(AppError::Transport(format!(
                "all {} attempts failed",
                self.attempts
            ))),
        }
    }
}

/// Snapshot of retry counters.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct RetryStats {
    /// Retries performed (attempts beyond the first).
    pub total_retries: u64,
    /// Calls that succeeded after at least one retry.
    pub successful_retries: u64,
    /// Calls that failed after all attempts.
    pub failed_requests: u64,
    /// Rows written to the dead-letter queue.
    pub dlq_enqueued: u64,
}

/// Executes stage calls with retries and dead-letter fallback.
pub struct RetryExecutor {
    policy: RetryPolicy,
    transport: Arc<dyn StageTransport>,
    dlq: Option<DeadLetterQueue>,
    total_retries: AtomicU64,
    successful_retries: AtomicU64,
    failed_requests: AtomicU64,
    dlq_enqueued: AtomicU64,
}

impl RetryExecutor {
    /// Create an executor. Pass `None` for `dlq` to disable dead-lettering.
    #[must_use]
    pub fn new(
        policy: RetryPolicy,
        transport: Arc<dyn StageTransport>,
        dlq: Option<DeadLetterQueue>,
    ) -> Self {
        Self {
            policy,
            transport,
            dlq,
            total_retries: AtomicU64::new(0),
            successful_retries: AtomicU64::new(0),
            failed_requests: AtomicU64::new(0),
            dlq_enqueued: AtomicU64::new(0),
        }
    }

    /// Backoff policy in use.
    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Dead-letter queue attached to this executor.
    #[must_use]
    pub fn dead_letter_queue(&self) -> Option<&DeadLetterQueue> {
        self.dlq.as_ref()
    }

    /// Perform the call with retries.
    ///
    /// Never returns an error: failures are reported in the response.
    pub async fn execute(&self, request: &StageRequest) -> StageResponse {
        let max_attempts = request.max_retries.saturating_add(1);
        let mut attempts = 0u32;
        let mut last_error = None;

        while attempts < max_attempts {
            if attempts > 0 {
                let delay = self.policy.delay(attempts - 1);
                tokio::time::sleep(delay).await;
                self.total_retries.fetch_add(1, Ordering::Relaxed);
            }
            attempts += 1;

            match self
                .transport
                .send(&request.target_url, &request.envelope, request.timeout)
                .await
            {
                Ok(data) => {
                    if attempts > 1 {
                        self.successful_retries.fetch_add(1, Ordering::Relaxed);
                        info!(agent = %request.target_agent, attempts, "stage call succeeded after retry");
                    }
                    return StageResponse {
                        data: Some(data),
                        error: None,
                        attempts,
                        dead_letter_id: None,
                    };
                }
                Err(err) => {
                    warn!(
                        agent = %request.target_agent,
                        attempt = attempts,
                        max_attempts,
                        %err,
                        "stage call attempt failed"
                    );
                    let retry = self.policy.should_retry(&err);
                    last_error = Some(err);
                    if !retry {
                        break;
                    }
                }
            }
        }

        self.failed_requests.fetch_add(1, Ordering::Relaxed);
        let reason = last_error
            .as_ref()
            .map_or_else(|| "unknown failure".to_owned(), ToString::to_string);
        let dead_letter_id = self.enqueue(request, &reason, attempts).await;

        StageResponse {
            data: None,
            error: last_error,
            attempts,
            dead_letter_id,
        }
    }

    async fn enqueue(&self, request: &StageRequest, reason: &str, attempts: u32) -> Option<String> {
        let dlq = self.dlq.as_ref()?;
        let event = FailedEvent::new(
            request.envelope.clone(),
            request.target_agent.clone(),
            request.target_url.clone(),
            format!("all {attempts} attempts failed: {reason}"),
            attempts,
        );
        match dlq.add(&event).await {
            Ok(()) => {
                self.dlq_enqueued.fetch_add(1, Ordering::Relaxed);
                info!(event_id = %event.event_id, agent = %request.target_agent, "stage call dead-lettered");
                Some(event.event_id)
            }
            Err(err) => {
                error!(?err, agent = %request.target_agent, "failed to write dead-letter row");
                None
            }
        }
    }

    /// Snapshot of the counters.
    #[must_use]
    pub fn stats(&self) -> RetryStats {
        RetryStats {
            total_retries: self.total_retries.load(Ordering::Relaxed),
            successful_retries: self.successful_retries.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
            dlq_enqueued: self.dlq_enqueued.load(Ordering::Relaxed),
        }
    }
}
