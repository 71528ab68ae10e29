//! Per-target circuit breakers.
//!
//! One breaker is created lazily per target id. A breaker observes one
//! outcome per guarded call; the pipeline wraps the whole retrying stage
//! call, so a burst of retries inside one call counts once.
//!
//! State machine:
//!
//! * `CLOSED` -> `OPEN` when consecutive failures reach the threshold.
//! * `OPEN` rejects calls until the recovery timeout has elapsed since the
//!   last failure; the next call then moves to `HALF_OPEN` and runs as the
//!   single probe.
//! * `HALF_OPEN` -> `CLOSED` on probe success, `HALF_OPEN` -> `OPEN` on
//!   probe failure. Other calls are rejected while the probe is in flight.
//!
//! Rejections are counted as blocked requests, never as failures.

use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::CircuitBreakerConfig;
use crate::{AppError, Result};

/// Breaker state.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Calls flow normally.
    Closed,
    /// Calls are rejected without being attempted.
    Open,
    /// A single probe call is allowed through.
    HalfOpen,
}

impl Display for CircuitState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

#[derive(Debug)]
struct Breaker {
    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    probe_in_flight: bool,
}

impl Breaker {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure: None,
            last_failure_at: None,
            probe_in_flight: false,
        }
    }
}

/// Point-in-time view of one breaker.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BreakerStatus {
    /// Target id.
    pub target: String,
    /// Current state.
    pub state: CircuitState,
    /// Consecutive failures observed.
    pub failure_count: u32,
    /// Time of the most recent failure.
    pub last_failure: Option<DateTime<Utc>>,
    /// Failures needed to open.
    pub failure_threshold: u32,
    /// Open duration before a probe is allowed.
    pub recovery_timeout_ms: u64,
}

/// Aggregate breaker counters.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct BreakerStats {
    /// Breakers created.
    pub created: u64,
    /// Transitions into `OPEN` (trips).
    pub opened: u64,
    /// `HALF_OPEN` -> `CLOSED` recoveries.
    pub recovered: u64,
    /// Calls rejected without being attempted.
    pub blocked: u64,
    /// Failed calls observed.
    pub failures: u64,
}

/// Registry of per-target breakers.
pub struct CircuitBreakerManager {
    failure_threshold: u32,
    recovery_timeout: Duration,
    breakers: Mutex<HashMap<String, Breaker>>,
    created: AtomicU64,
    opened: AtomicU64,
    recovered: AtomicU64,
    blocked: AtomicU64,
    failures: AtomicU64,
}

/// Admission to run a guarded call.
///
/// Dropping a probe permit without reporting an outcome (for example when
/// the calling future is cancelled) releases the probe slot so the breaker
/// does not stay wedged in `HALF_OPEN`.
struct Permit<'a> {
    manager: &'a CircuitBreakerManager,
    target: &'a str,
    probe: bool,
    settled: bool,
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.probe && !self.settled {
            let mut breakers = self.manager.lock();
            if let Some(breaker) = breakers.get_mut(self.target) {
                breaker.probe_in_flight = false;
            }
        }
    }
}

impl CircuitBreakerManager {
    /// Create a manager applying `config` to every target.
    #[must_use]
    pub fn new(config: &CircuitBreakerConfig) -> Self {
        Self {
            failure_threshold: config.failure_threshold,
            recovery_timeout: config.recovery_timeout(),
            breakers: Mutex::new(HashMap::new()),
            created: AtomicU64::new(0),
            opened: AtomicU64::new(0),
            recovered: AtomicU64::new(0),
            blocked: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Breaker>> {
        self.breakers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `operation` under the breaker for `target`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::CircuitOpen` without invoking `operation` when the
    /// breaker rejects the call; otherwise returns the operation's result.
    pub async fn call<T, F, Fut>(&self, target: &str, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut permit = self.acquire(target)?;
        let outcome = operation().await;
        permit.settled = true;
        match &outcome {
            Ok(_) => self.on_success(target),
            Err(_) => self.on_failure(target),
        }
        outcome
    }

    fn acquire<'a>(&'a self, target: &'a str) -> Result<Permit<'a>> {
        let mut breakers = self.lock();
        let breaker = breakers.entry(target.to_owned()).or_insert_with(|| {
            self.created.fetch_add(1, Ordering::Relaxed);
            Breaker::new()
        });

        let probe = match breaker.state {
            CircuitState::Closed => false,
            CircuitState::Open => {
                let elapsed = breaker
                    .last_failure
                    .map_or(Duration::MAX, |at| at.elapsed());
                if elapsed < self.recovery_timeout {
                    self.blocked.fetch_add(1, Ordering::Relaxed);
                    return Err(AppError::CircuitOpen(format!(
                        "{target} rejected, retry in {}ms",
                        (self.recovery_timeout - elapsed).as_millis()
                    )));
                }
                breaker.state = CircuitState::HalfOpen;
                breaker.probe_in_flight = true;
                info!(target_id = target, "circuit half-open, probing");
                true
            }
            CircuitState::HalfOpen => {
                if breaker.probe_in_flight {
                    self.blocked.fetch_add(1, Ordering::Relaxed);
                    return Err(AppError::CircuitOpen(format!(
                        "{target} probe already in flight"
                    )));
                }
                breaker.probe_in_flight = true;
                true
            }
        };

        Ok(Permit {
            manager: self,
            target,
            probe,
            settled: false,
        })
    }

    fn on_success(&self, target: &str) {
        let mut breakers = self.lock();
        let Some(breaker) = breakers.get_mut(target) else {
            return;
        };
        if breaker.state == CircuitState::HalfOpen {
            breaker.state = CircuitState::Closed;
            self.recovered.fetch_add(1, Ordering::Relaxed);
            info!(target_id = target, "circuit closed after successful probe");
        }
        breaker.failure_count = 0;
        breaker.probe_in_flight = false;
    }

    fn on_failure(&self, target: &str) {
        self.failures.fetch_add(1, Ordering::Relaxed);
        let mut breakers = self.lock();
        let Some(breaker) = breakers.get_mut(target) else {
            return;
        };
        breaker.failure_count = breaker.failure_count.saturating_add(1);
        breaker.last_failure = Some(Instant::now());
        breaker.last_failure_at = Some(Utc::now());
        breaker.probe_in_flight = false;

        let trip = match breaker.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => breaker.failure_count >= self.failure_threshold,
            CircuitState::Open => false,
        };
        if trip {
            breaker.state = CircuitState::Open;
            self.opened.fetch_add(1, Ordering::Relaxed);
            warn!(
                target_id = target,
                failure_count = breaker.failure_count,
                "circuit opened"
            );
        }
    }

    /// Current state of `target`, `CLOSED` if never used.
    #[must_use]
    pub fn state(&self, target: &str) -> CircuitState {
        self.lock()
            .get(target)
            .map_or(CircuitState::Closed, |breaker| breaker.state)
    }

    /// Snapshot of one breaker.
    #[must_use]
    pub fn status(&self, target: &str) -> Option<BreakerStatus> {
        self.lock()
            .get(target)
            .map(|breaker| self.snapshot(target, breaker))
    }

    /// Snapshots of every breaker, ordered by target id.
    #[must_use]
    pub fn all_status(&self) -> Vec<BreakerStatus> {
        let breakers = self.lock();
        let mut all: Vec<BreakerStatus> = breakers
            .iter()
            .map(|(target, breaker)| self.snapshot(target, breaker))
            .collect();
        all.sort_by(|a, b| a.target.cmp(&b.target));
        all
    }

    fn snapshot(&self, target: &str, breaker: &Breaker) -> BreakerStatus {
        BreakerStatus {
            target: target.to_owned(),
            state: breaker.state,
            failure_count: breaker.failure_count,
            last_failure: breaker.last_failure_at,
            failure_threshold: self.failure_threshold,
            recovery_timeout_ms: u64::try_from(self.recovery_timeout.as_millis())
                .unwrap_or(u64::MAX),
        }
    }

    /// Aggregate counters.
    #[must_use]
    pub fn stats(&self) -> BreakerStats {
        BreakerStats {
            created: self.created.load(Ordering::Relaxed),
            opened: self.opened.load(Ordering::Relaxed),
            recovered: self.recovered.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
        }
    }
}
