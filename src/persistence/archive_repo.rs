//! Archived session store for `SQLite` persistence.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::models::session::{ArchivedSession, Session};
use crate::{AppError, Result};

use super::db::Database;
use super::{like_pattern, ts_from_text, ts_to_text};

const SEARCH_LIMIT: i64 = 50;

const COLUMNS: &str =
    "session_id, session_data, archived_at, archive_reason, restored_at, restore_count, tags";

/// Repository for archived session snapshots.
#[derive(Clone)]
pub struct ArchiveRepo {
    db: Arc<Database>,
}

/// Aggregate figures over the archive store.
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
pub struct ArchiveStats {
    /// Rows currently archived.
    pub total_archived: u64,
    /// Archived rows whose session was restored at least once before.
    pub restored_sessions: u64,
    /// `restored_sessions / total_archived`, or 0 when empty.
    pub restore_rate: f64,
    /// Oldest `archived_at`.
    pub oldest_archive: Option<DateTime<Utc>>,
    /// Newest `archived_at`.
    pub newest_archive: Option<DateTime<Utc>>,
    /// Mean `restore_count` across archived rows.
    pub average_restore_count: f64,
}

/// Internal row struct for `SQLite` deserialization.
#[derive(sqlx::FromRow)]
struct ArchiveRow {
    session_id: String,
    session_data: String,
    archived_at: String,
    archive_reason: String,
    restored_at: Option<String>,
    restore_count: i64,
    tags: String,
}

impl ArchiveRow {
    fn into_archived(self) -> Result<ArchivedSession> {
        let session: Session = serde_json::from_str(&self.session_data)
            .map_err(|e| AppError::Db(format!("invalid session_data for {}: {e}", self.session_id)))?;
        let tags: Vec<String> = serde_json::from_str(&self.tags)
            .map_err(|e| AppError::Db(format!("invalid tags: {e}")))?;
        let restored_at = self
            .restored_at
            .as_deref()
            .map(|raw| ts_from_text("restored_at", raw))
            .transpose()?;

        Ok(ArchivedSession {
            session,
            archived_at: ts_from_text("archived_at", &self.archived_at)?,
            archive_reason: self.archive_reason,
            restored_at,
            restore_count: u32::try_from(self.restore_count).unwrap_or(0),
            tags,
        })
    }
}

impl ArchiveRepo {
    /// Create a new repository instance.
    #[must_use]
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Insert an archive snapshot.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the insert fails, including when a row
    /// for the same session already exists.
    pub async fn insert(&self, archived: &ArchivedSession) -> Result<()> {
        let session_data = serde_json::to_string(&archived.session)
            .map_err(|e| AppError::Db(format!("failed to encode session: {e}")))?;
        let tags = serde_json::to_string(&archived.tags)
            .map_err(|e| AppError::Db(format!("failed to encode tags: {e}")))?;

        sqlx::query(
            "INSERT INTO archived_session
                (session_id, session_data, archived_at, archive_reason, restored_at, restore_count, tags)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(archived.session_id())
        .bind(&session_data)
        .bind(ts_to_text(archived.archived_at))
        .bind(&archived.archive_reason)
        .bind(archived.restored_at.map(ts_to_text))
        .bind(i64::from(archived.restore_count))
        .bind(&tags)
        .execute(self.db.as_ref())
        .await?;
        Ok(())
    }

    /// Fetch a snapshot without removing it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails or the row is corrupt.
    pub async fn get(&self, session_id: &str) -> Result<Option<ArchivedSession>> {
        let row: Option<ArchiveRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM archived_session WHERE session_id = ?1"
        ))
        .bind(session_id)
        .fetch_optional(self.db.as_ref())
        .await?;

        row.map(ArchiveRow::into_archived).transpose()
    }

    /// Delete a snapshot and return it.
    ///
    /// The delete is committed only once the row decodes, so a corrupt
    /// snapshot stays in the store.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the statement fails or the row is corrupt.
    pub async fn take(&self, session_id: &str) -> Result<Option<ArchivedSession>> {
        let mut tx = self.db.begin().await?;
        let row: Option<ArchiveRow> = sqlx::query_as(&format!(
            "DELETE FROM archived_session WHERE session_id = ?1 RETURNING {COLUMNS}"
        ))
        .bind(session_id)
        .fetch_optional(&mut *tx)
        .await?;

        let archived = row.map(ArchiveRow::into_archived).transpose()?;
        tx.commit().await?;
        Ok(archived)
    }

    /// Whether a snapshot exists for `session_id`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn exists(&self, session_id: &str) -> Result<bool> {
        let found: Option<(i64,)> =
            sqlx::query_as("SELECT 1 FROM archived_session WHERE session_id = ?1")
                .bind(session_id)
                .fetch_optional(self.db.as_ref())
                .await?;
        Ok(found.is_some())
    }

    /// List snapshots, newest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn list(&self, limit: u32, offset: u32) -> Result<Vec<ArchivedSession>> {
        let rows: Vec<ArchiveRow> = sqlx::query_as(&format!(
            "SELECT {COLUMNS} FROM archived_session
             ORDER BY archived_at DESC
             LIMIT ?1 OFFSET ?2"
        ))
        .bind(i64::from(limit))
        .bind(i64::from(offset))
        .fetch_all(self.db.as_ref())
        .await?;

        rows.into_iter().map(ArchiveRow::into_archived).collect()
    }

    /// Search snapshots by free text over the session body and by exact tags.
    ///
    /// Every tag in `tags` must be present. Results are newest first and
    /// capped at 50.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn search(&self, query: &str, tags: &[String]) -> Result<Vec<ArchivedSession>> {
        let mut sql = format!("SELECT {COLUMNS} FROM archived_session WHERE 1 = 1");
        let mut params = Vec::with_capacity(tags.len() + 1);

        if !query.trim().is_empty() {
            sql.push_str(" AND session_data LIKE ? ESCAPE '\\'");
            params.push(like_pattern(query.trim()));
        }
        for tag in tags {
            sql.push_str(" AND tags LIKE ? ESCAPE '\\'");
            params.push(like_pattern(&format!("\"{tag}\"")));
        }
        sql.push_str(" ORDER BY archived_at DESC LIMIT ?");

        let mut statement = sqlx::query_as::<_, ArchiveRow>(&sql);
        for param in &params {
            statement = statement.bind(param);
        }
        let rows = statement
            .bind(SEARCH_LIMIT)
            .fetch_all(self.db.as_ref())
            .await?;

        rows.into_iter().map(ArchiveRow::into_archived).collect()
    }

    /// Delete snapshots archived before `cutoff`.
    ///
    /// Returns the number of rows deleted.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = sqlx::query("DELETE FROM archived_session WHERE archived_at < ?1")
            .bind(ts_to_text(cutoff))
            .execute(self.db.as_ref())
            .await?;
        Ok(result.rows_affected())
    }

    /// Aggregate archive statistics.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the query fails.
    pub async fn stats(&self) -> Result<ArchiveStats> {
        let (total, restored, oldest, newest, average): (
            i64,
            Option<i64>,
            Option<String>,
            Option<String>,
            Option<f64>,
        ) = sqlx::query_as(
            "SELECT COUNT(*),
                    SUM(CASE WHEN restore_count > 0 THEN 1 ELSE 0 END),
                    MIN(archived_at),
                    MAX(archived_at),
                    AVG(restore_count)
             FROM archived_session",
        )
        .fetch_one(self.db.as_ref())
        .await?;

        let total_archived = u64::try_from(total).unwrap_or(0);
        let restored_sessions = u64::try_from(restored.unwrap_or(0)).unwrap_or(0);
        #[allow(clippy::cast_precision_loss)]
        let restore_rate = if total_archived == 0 {
            0.0
        } else {
            restored_sessions as f64 / total_archived as f64
        };

        Ok(ArchiveStats {
            total_archived,
            restored_sessions,
            restore_rate,
            oldest_archive: oldest
                .as_deref()
                .map(|raw| ts_from_text("archived_at", raw))
                .transpose()?,
            newest_archive: newest
                .as_deref()
                .map(|raw| ts_from_text("archived_at", raw))
                .transpose()?,
            average_restore_count: average.unwrap_or(0.0),
        })
    }
}
