//! Background recovery of dead-lettered messages.
//!
//! Each tick pulls a batch of ready rows from the [`DeadLetterQueue`] and
//! resends each one exactly once through the raw [`StageTransport`],
//! bypassing the retry executor. Rows that reach the recovery budget are
//! marked `failed` and never picked up again.
//!
//! A row is resent by at most one caller at a time: the periodic tick and
//! manual recovery both claim the `event_id` first and re-read the row
//! under the claim, skipping it if another caller already settled it.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::config::RecoveryConfig;
use crate::models::failed_event::{FailedEvent, FailedEventStatus};
use crate::persistence::dlq_repo::{DeadLetterQueue, DlqStats};
use crate::{AppError, Result};

use super::transport::StageTransport;

/// Result of handling one dead-letter row.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryOutcome {
    /// Resend succeeded; the row was removed.
    Recovered,
    /// Resend failed; the row waits for its `retry_after`.
    Retrying,
    /// Budget exhausted; the row is terminally failed.
    Exhausted,
    /// Another recovery of the row is in progress; nothing was sent.
    InFlight,
}

/// Totals for one recovery tick.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct RecoveryTick {
    /// Rows resent or marked exhausted.
    pub processed: u32,
    /// Rows resent successfully.
    pub recovered: u32,
    /// Rows whose resend failed.
    pub retrying: u32,
    /// Rows marked terminally failed.
    pub exhausted: u32,
    /// Rows left alone because another caller held or had settled them.
    pub skipped: u32,
}

/// Cumulative recovery counters.
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Ticks run.
    pub ticks: u64,
    /// Resends attempted.
    pub attempts: u64,
    /// Rows recovered.
    pub recovered: u64,
    /// Rows marked terminally failed.
    pub exhausted: u64,
    /// Resends that failed.
    pub failed_attempts: u64,
}

/// Recovery counters together with queue contents and settings.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryReport {
    /// Cumulative counters.
    pub stats: RecoveryStats,
    /// Queue contents by status.
    pub queue: DlqStats,
    /// Rows per tick.
    pub batch_size: u32,
    /// Failure count at which rows become terminal.
    pub max_recovery_attempts: u32,
    /// Seconds between ticks.
    pub interval_seconds: u64,
}

/// Periodic resender of dead-lettered messages.
pub struct RecoveryProcessor {
    dlq: DeadLetterQueue,
    transport: Arc<dyn StageTransport>,
    config: RecoveryConfig,
    ticks: AtomicU64,
    attempts: AtomicU64,
    recovered: AtomicU64,
    exhausted: AtomicU64,
    failed_attempts: AtomicU64,
    in_flight: Mutex<HashSet<String>>,
}

/// Exclusive right to resend one row, released on drop.
struct Claim<'a> {
    in_flight: &'a Mutex<HashSet<String>>,
    event_id: String,
}

impl Drop for Claim<'_> {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.event_id);
    }
}

impl RecoveryProcessor {
    /// Create a processor.
    #[must_use]
    pub fn new(
        dlq: DeadLetterQueue,
        transport: Arc<dyn StageTransport>,
        config: RecoveryConfig,
    ) -> Self {
        Self {
            dlq,
            transport,
            config,
            ticks: AtomicU64::new(0),
            attempts: AtomicU64::new(0),
            recovered: AtomicU64::new(0),
            exhausted: AtomicU64::new(0),
            failed_attempts: AtomicU64::new(0),
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    fn claim(&self, event_id: &str) -> Option<Claim<'_>> {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if !in_flight.insert(event_id.to_owned()) {
            return None;
        }
        Some(Claim {
            in_flight: &self.in_flight,
            event_id: event_id.to_owned(),
        })
    }

    /// `retry_after` for a row that has failed `failure_count` times:
    /// `now + base * 2^(failure_count - 1)`.
    #[must_use]
    pub fn retry_after(&self, failure_count: u32, now: DateTime<Utc>) -> DateTime<Utc> {
        let exponent = failure_count.saturating_sub(1).min(20);
        let secs = self.config.backoff_base_seconds.saturating_mul(1u64 << exponent);
        let backoff = i64::try_from(secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .unwrap_or(chrono::Duration::MAX);
        now.checked_add_signed(backoff)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Run one recovery pass over ready rows.
    ///
    /// A failure on one row is logged and does not stop the batch.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if ready rows cannot be listed.
    pub async fn process_once(&self) -> Result<RecoveryTick> {
        self.ticks.fetch_add(1, Ordering::Relaxed);
        let rows = self
            .dlq
            .get_pending(self.config.batch_size, Utc::now())
            .await?;

        let mut tick = RecoveryTick::default();
        for listed in rows {
            let event_id = listed.event_id;
            let Some(_claim) = self.claim(&event_id) else {
                debug!(%event_id, "dead-letter row already in flight");
                tick.skipped += 1;
                continue;
            };
            let row = match self.dlq.get(&event_id).await {
                Ok(Some(row)) if row.is_ready(Utc::now()) => row,
                Ok(_) => {
                    tick.skipped += 1;
                    continue;
                }
                Err(err) => {
                    error!(?err, %event_id, "failed to re-read dead-letter row");
                    continue;
                }
            };

            tick.processed += 1;
            match self.attempt(row).await {
                Ok(RecoveryOutcome::Recovered) => tick.recovered += 1,
                Ok(RecoveryOutcome::Retrying) => tick.retrying += 1,
                Ok(RecoveryOutcome::Exhausted) => tick.exhausted += 1,
                Ok(RecoveryOutcome::InFlight) => tick.skipped += 1,
                Err(err) => error!(?err, %event_id, "recovery of dead-letter row failed"),
            }
        }
        if tick.processed > 0 {
            info!(
                processed = tick.processed,
                recovered = tick.recovered,
                exhausted = tick.exhausted,
                "recovery tick completed"
            );
        }
        Ok(tick)
    }

    /// Recover a single row on demand, ignoring its `retry_after`.
    ///
    /// Returns [`RecoveryOutcome::InFlight`] without sending if the row is
    /// being resent by another caller.
    ///
    /// # Errors
    ///
    /// Returns `AppError::RecoveryExhausted` if the row is (or becomes)
    /// terminally failed, `AppError::Db` if it does not exist or the
    /// queue cannot be updated.
    pub async fn recover_one(&self, event_id: &str) -> Result<RecoveryOutcome> {
        let Some(_claim) = self.claim(event_id) else {
            return Ok(RecoveryOutcome::InFlight);
        };
        let row = self
            .dlq
            .get(event_id)
            .await?
            .ok_or_else(|| AppError::Db(format!("failed event not found: {event_id}")))?;
        if row.status == FailedEventStatus::Failed {
            return Err(AppError::RecoveryExhausted(format!(
                "{event_id} failed {} times",
                row.failure_count
            )));
        }
        match self.attempt(row).await? {
            RecoveryOutcome::Exhausted => Err(AppError::RecoveryExhausted(format!(
                "{event_id} reached {} failures",
                self.config.max_recovery_attempts
            ))),
            outcome => Ok(outcome),
        }
    }

    async fn attempt(&self, row: FailedEvent) -> Result<RecoveryOutcome> {
        let now = Utc::now();
        if row.failure_count >= self.config.max_recovery_attempts {
            self.dlq
                .update_status(&row.event_id, FailedEventStatus::Failed, None)
                .await?;
            self.exhausted.fetch_add(1, Ordering::Relaxed);
            warn!(
                event_id = %row.event_id,
                failure_count = row.failure_count,
                "dead-letter row exhausted"
            );
            return Ok(RecoveryOutcome::Exhausted);
        }

        let retry_after = self.retry_after(row.failure_count, now);
        self.dlq
            .update_status(&row.event_id, FailedEventStatus::Retrying, Some(retry_after))
            .await?;
        self.attempts.fetch_add(1, Ordering::Relaxed);

        let timeout = Duration::from_secs(self.config.timeout_seconds);
        match self
            .transport
            .send(&row.target_url, &row.original_payload, timeout)
            .await
        {
            Ok(_) => {
                self.dlq.remove(&row.event_id).await?;
                self.recovered.fetch_add(1, Ordering::Relaxed);
                info!(event_id = %row.event_id, agent = %row.target_agent, "dead-letter row recovered");
                Ok(RecoveryOutcome::Recovered)
            }
            Err(err) => {
                self.dlq
                    .record_failure(&row.event_id, &err.to_string(), Utc::now())
                    .await?;
                self.failed_attempts.fetch_add(1, Ordering::Relaxed);
                warn!(event_id = %row.event_id, %err, %retry_after, "dead-letter resend failed");
                Ok(RecoveryOutcome::Retrying)
            }
        }
    }

    /// Cumulative counters.
    #[must_use]
    pub fn stats(&self) -> RecoveryStats {
        RecoveryStats {
            ticks: self.ticks.load(Ordering::Relaxed),
            attempts: self.attempts.load(Ordering::Relaxed),
            recovered: self.recovered.load(Ordering::Relaxed),
            exhausted: self.exhausted.load(Ordering::Relaxed),
            failed_attempts: self.failed_attempts.load(Ordering::Relaxed),
        }
    }

    /// Counters plus queue statistics and settings.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if queue statistics cannot be read.
    pub async fn report(&self) -> Result<RecoveryReport> {
        Ok(RecoveryReport {
            stats: self.stats(),
            queue: self.dlq.stats().await?,
            batch_size: self.config.batch_size,
            max_recovery_attempts: self.config.max_recovery_attempts,
            interval_seconds: self.config.interval_seconds,
        })
    }

    /// Spawn the periodic recovery loop.
    #[must_use]
    pub fn spawn(self: Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let period = Duration::from_secs(self.config.interval_seconds);
        tokio::spawn(
            async move {
                let mut interval = tokio::time::interval(period);
                loop {
                    tokio::select! {
                        () = cancel.cancelled() => {
                            info!("recovery processor shutting down");
                            break;
                        }
                        _ = interval.tick() => {
                            if let Err(err) = self.process_once().await {
                                error!(?err, "recovery tick failed");
                            }
                        }
                    }
                }
            }
            .instrument(info_span!("recovery_processor")),
        )
    }
}
