//! Dead-letter queue backed by `SQLite`.
//!
//! Rows are keyed by `event_id`. Every mutation is a single SQL statement,
//! so concurrent writers to the same row (the retry executor enqueueing and
//! the recovery processor updating) are serialized by the database.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::failed_event::{FailedEvent, FailedEventStatus};
use crate::{AppError, Result};

use super::db::Database;
use super::{ts_from_text, ts_to_text};

const COLUMNS: &str = "event_id, original_payload, target_agent, target_url, failure_reason, \
     failure_count, first_failure, last_failure, retry_after, status, metadata";

/// Durable store for messages whose delivery was abandoned.
#[derive(Clone)]
pub struct DeadLetterQueue {
    db: Arc<Database>,
}

/// Aggregate figures over the queue.
#[derive(Debug, Clone, Default, Serialize, PartialEq, Eq)]
pub struct DlqStats {
    /// Rows awaiting their first recovery attempt.
    pub pending: u64,
    /// Rows waiting for their `retry_after`.
    pub retrying: u64,
    /// Terminally failed rows.
    pub failed: u64,
    /// Rows flagged recovered but not yet removed.
    pub recovered: u64,
    /// All rows.
    pub total: u64,
    /// Earliest `first_failure` in the queue.
    pub oldest_failure: Option<DateTime<Utc>>,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct FailedEventRow {
    event_id: String,
    original_payload: String,
    target_agent: String,
    target_url: String,
    failure_reason: String,
    failure_count: i64,
    first_failure: String,
    last_failure: String,
    retry_after: Option<String>,
    status: String,
    metadata: String,
}

impl FailedEventRow {
    fn into_failed_event(self) -> Result<FailedEvent> {
        let original_payload = serde_json::from_str(&self.original_payload)
            .map_err(|e| AppError::Db(format!("invalid original_payload: {e}")))?;
        let metadata = serde_json::from_str(&self.metadata)
            .map_err(|e| AppError::Db(format!("invalid metadata: {e}")))?;
        let retry_after = self
            .retry_after
            .as_deref()
            .map(|raw| ts_from_text("retry_after", raw))
            .transpose()?;

        Ok(FailedEvent {
            event_id: self.event_id,
            original_payload,
            target_agent: self.target_agent,
            target_url: self.target_url,
            failure_reason: self.failure_reason,
            failure_count: u32::try_from(self.failure_count).unwrap_or(u32::MAX),
            first_failure: ts_from_text("first_failure", &self.first_failure)?,
            last_failure: ts_from_text("last_failure", &self.last_failure)?,
            retry_after,
            status: parse_status(&self.status)?,
            metadata,
        })
    }
}

fn parse_status(s: &str) -> Result<FailedEventStatus> {
    match s {
        "pending" => Ok(FailedEventStatus::Pending),
        "retrying" => Ok(FailedEventStatus::Retrying),
        "failed" => Ok(FailedEventStatus::Failed),
        "recovered" => Ok(FailedEventStatus::Recovered),
        other => Err(AppError::Db(format!("invalid failed_event status: {other}"))),
    }
}

impl DeadLetterQueue {
    /// Create a new queue handle.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert or replace a row.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the write fails.
    pub async fn add(&self, event: &FailedEvent) -> Result<()> {
        let payload = serde_json::to_string(&event.original_payload)
            .map_err(|e| AppError::Db(format!("failed to encode payload: {e}")))?;
        let metadata = serde_json::to_string(&event.metadata)
            .map_err(|e| AppError::Db(format!("failed to encode metadata: {e}")))?;

        sqlx::query(&format!(
            "INSERT OR REPLACE INTO failed_event ({COLUMNS})
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"
        ))
        .bind(&event.event_id)
        .bind(&payload)
        .bind(&event.target_agent)
        .bind(&event.target_url)
        .bind(&event.failure_reason)
        .bind(i64::from(event.failure_count))
        .bind(ts_to_text(event.first_failure))
        .bind(ts_to_text(event.last_failure))
        .bind(event.retry_after.map(ts_to_text))
        .bind(event.status.as_str())
        .bind(&metadata)
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    /// Fetch a row by id.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails or the row is corrupt.
    pub async fn get(&self, event_id: &str) -> Result<Option<FailedEvent>> {
        let row: Option<FailedEventRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM failed_event WHERE event_id = ?1"
        ))
        .bind(event_id)
        .fetch_optional(self.db.as_ref())
        .await?;

        row.map(FailedEventRow::into_failed_event).transpose()
    }

    /// Rows ready for recovery at `now`, least recently failed first.
    ///
    /// A row is ready when it is `pending`, or `retrying` with a
    /// `retry_after` at or before `now`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn get_pending(&self, limit: u32, now: DateTime<Utc>) -> Result<Vec<FailedEvent>> {
        let rows: Vec<FailedEventRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM failed_event
             WHERE status = 'pending'
                OR (status = 'retrying' AND (retry_after IS NULL OR retry_after <= ?1))
             ORDER BY last_failure ASC
             LIMIT ?2"
        ))
        .bind(ts_to_text(now))
        .bind(i64::from(limit))
        .fetch_all(self.db.as_ref())
        .await?;

        rows.into_iter()
            .map(FailedEventRow::into_failed_event)
            .collect()
    }

    /// Set a row's status and, when given, its `retry_after`.
    ///
    /// Returns `false` if no row matched.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn update_status(
        &self,
        event_id: &str,
        status: FailedEventStatus,
        retry_after: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE failed_event
             SET status = ?2, retry_after = COALESCE(?3, retry_after)
             WHERE event_id = ?1",
        )
        .bind(event_id)
        .bind(status.as_str())
        .bind(retry_after.map(ts_to_text))
        .execute(self.db.as_ref())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Count one more failure against a row.
    ///
    /// Returns `false` if no row matched.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the update fails.
    pub async fn record_failure(
        &self,
        event_id: &str,
        reason: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE failed_event
             SET failure_count = failure_count + 1, last_failure = ?2, failure_reason = ?3
             WHERE event_id = ?1",
        )
        .bind(event_id)
        .bind(ts_to_text(at))
        .bind(reason)
        .execute(self.db.as_ref())
        .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Delete a row.
    ///
    /// Returns `false` if no row matched.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn remove(&self, event_id: &str) -> Result<bool> {
        let result = sqlx::query("DELETE FROM failed_event WHERE event_id = ?1")
            .bind(event_id)
            .execute(self.db.as_ref())
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Counts by status and the oldest failure.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn stats(&self) -> Result<DlqStats> {
        let counts: Vec<(String, i64)> =
            sqlx::query_as("SELECT status, COUNT(*) FROM failed_event GROUP BY status")
                .fetch_all(self.db.as_ref())
                .await?;
        let by_status: HashMap<String, u64> = counts
            .into_iter()
            .map(|(status, n)| (status, u64::try_from(n).unwrap_or(0)))
            .collect();
        let count = |status: FailedEventStatus| by_status.get(status.as_str()).copied().unwrap_or(0);

        let (oldest,): (Option<String>,) =
            sqlx::query_as("SELECT MIN(first_failure) FROM failed_event")
                .fetch_one(self.db.as_ref())
                .await?;

        Ok(DlqStats {
            pending: count(FailedEventStatus::Pending),
            retrying: count(FailedEventStatus::Retrying),
            failed: count(FailedEventStatus::Failed),
            recovered: count(FailedEventStatus::Recovered),
            total: by_status.values().sum(),
            oldest_failure: oldest
                .as_deref()
                .map(|raw| ts_from_text("first_failure", raw))
                .transpose()?,
        })
    }
}
