//! Session lifecycle management: create, record, archive, restore.
//!
//! Live sessions are held in an in-memory active set; archived sessions
//! live in the [`ArchiveRepo`]. A session id is in exactly one of the two
//! at any observation point. Archive and restore perform the move while
//! holding the active-set lock for the whole operation, including the
//! database write, and every observer that checks both sides takes the
//! same lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{info, info_span, warn, Instrument};

use crate::config::SessionConfig;
use crate::models::envelope::JsonMap;
use crate::models::session::{ArchivedSession, Session, SessionEvent, SessionStatus};
use crate::persistence::archive_repo::{ArchiveRepo, ArchiveStats};
use crate::{AppError, Result};

/// Archive reason recorded by the timeout scanner.
pub const TIMEOUT_REASON: &str = "timeout";

/// Where a session id currently lives.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SessionLocation {
    /// In the active set.
    Active,
    /// In the archive store.
    Archived,
}

/// Session manager counters.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct SessionStats {
    /// Sessions in the active set.
    pub active: u64,
    /// Archive operations performed by this manager.
    pub archived: u64,
    /// Restore operations performed by this manager.
    pub restored: u64,
    /// Archive operations triggered by inactivity.
    pub expired: u64,
    /// Cleanup passes run.
    pub cleanup_runs: u64,
    /// Archive rows deleted by cleanup.
    pub cleaned_up: u64,
    /// Archive store aggregates.
    pub archive: ArchiveStats,
}

/// Owner of the active set and the archive store.
pub struct SessionManager {
    active: Mutex<HashMap<String, Session>>,
    archive: ArchiveRepo,
    config: SessionConfig,
    archived: AtomicU64,
    restored: AtomicU64,
    expired: AtomicU64,
    cleanup_runs: AtomicU64,
    cleaned_up: AtomicU64,
}

impl SessionManager {
    /// Create a manager with an empty active set.
    #[must_use]
    pub fn new(archive: ArchiveRepo, config: SessionConfig) -> Self {
        Self {
            active: Mutex::new(HashMap::new()),
            archive,
            config,
            archived: AtomicU64::new(0),
            restored: AtomicU64::new(0),
            expired: AtomicU64::new(0),
            cleanup_runs: AtomicU64::new(0),
            cleaned_up: AtomicU64::new(0),
        }
    }

    /// Session lifecycle settings.
    #[must_use]
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Create an active session and return its id.
    pub async fn create_session(&self, metadata: JsonMap) -> String {
        let session = Session::new(metadata);
        let session_id = session.session_id.clone();
        self.active.lock().await.insert(session_id.clone(), session);
        info!(%session_id, "session created");
        session_id
    }

    async fn with_active<T>(
        &self,
        session_id: &str,
        update: impl FnOnce(&mut Session) -> T,
    ) -> Result<T> {
        let mut active = self.active.lock().await;
        let session = active
            .get_mut(session_id)
            .ok_or_else(|| AppError::SessionNotFound(session_id.to_owned()))?;
        Ok(update(session))
    }

    /// Append an event to an active session and bump its activity.
    ///
    /// # Errors
    ///
    /// Returns `AppError::SessionNotFound` if the id is not active.
    pub async fn record_event(&self, session_id: &str, event: SessionEvent) -> Result<()> {
        self.with_active(session_id, |session| session.record(event))
            .await
    }

    /// Set a metadata entry on an active session.
    ///
    /// # Errors
    ///
    /// Returns `AppError::SessionNotFound` if the id is not active.
    pub async fn set_metadata(&self, session_id: &str, key: &str, value: Value) -> Result<()> {
        self.with_active(session_id, |session| {
            session.metadata.insert(key.to_owned(), value);
            session.touch(Utc::now());
        })
        .await
    }

    /// Mark an active session completed with its incident id.
    ///
    /// # Errors
    ///
    /// Returns `AppError::SessionNotFound` if the id is not active.
    pub async fn mark_completed(&self, session_id: &str, incident_id: &str) -> Result<()> {
        self.with_active(session_id, |session| {
            session.status = SessionStatus::Completed;
            session.incident_id = Some(incident_id.to_owned());
            session.touch(Utc::now());
        })
        .await
    }

    /// Mark an active session failed, recording the error in its metadata.
    ///
    /// # Errors
    ///
    /// Returns `AppError::SessionNotFound` if the id is not active.
    pub async fn mark_failed(&self, session_id: &str, error: &str) -> Result<()> {
        self.with_active(session_id, |session| {
            session.status = SessionStatus::Failed;
            session
                .metadata
                .insert("error".into(), Value::String(error.to_owned()));
            session.touch(Utc::now());
        })
        .await
    }

    /// Clone of an active session.
    pub async fn get_session(&self, session_id: &str) -> Option<Session> {
        self.active.lock().await.get(session_id).cloned()
    }

    /// Number of active sessions.
    pub async fn active_count(&self) -> usize {
        self.active.lock().await.len()
    }

    /// Where `session_id` lives, checked atomically against concurrent moves.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the archive store cannot be queried.
    pub async fn locate(&self, session_id: &str) -> Result<Option<SessionLocation>> {
        let active = self.active.lock().await;
        if active.contains_key(session_id) {
            return Ok(Some(SessionLocation::Active));
        }
        let archived = self.archive.exists(session_id).await?;
        drop(active);
        Ok(archived.then_some(SessionLocation::Archived))
    }

    /// Move an active session into the archive store.
    ///
    /// # Errors
    ///
    /// Returns `AppError::SessionNotFound` if the id is not active, or
    /// `AppError::Db` if the snapshot cannot be written (the session then
    /// stays active).
    pub async fn archive_session(&self, session_id: &str, reason: &str) -> Result<ArchivedSession> {
        self.archive_where(session_id, reason, |_| true)
            .await?
            .ok_or_else(|| AppError::SessionNotFound(session_id.to_owned()))
    }

    async fn archive_where(
        &self,
        session_id: &str,
        reason: &str,
        eligible: impl FnOnce(&Session) -> bool,
    ) -> Result<Option<ArchivedSession>> {
        let span = info_span!("archive_session", session_id, reason);
        async {
            let mut active = self.active.lock().await;
            let Some(session) = active.get(session_id) else {
                return Err(AppError::SessionNotFound(session_id.to_owned()));
            };
            if !eligible(session) {
                return Ok(None);
            }
            let Some(session) = active.remove(session_id) else {
                return Err(AppError::SessionNotFound(session_id.to_owned()));
            };

            let previous_status = session.status;
            let snapshot = ArchivedSession::from_session(session, reason, Utc::now());
            if let Err(err) = self.archive.insert(&snapshot).await {
                let mut session = snapshot.session;
                session.status = previous_status;
                active.insert(session_id.to_owned(), session);
                return Err(err);
            }
            drop(active);

            self.archived.fetch_add(1, Ordering::Relaxed);
            info!(tags = ?snapshot.tags, "session archived");
            Ok(Some(snapshot))
        }
        .instrument(span)
        .await
    }

    /// Archive every active session idle for strictly longer than the
    /// configured timeout at `now`.
    ///
    /// Returns the archived ids. A failure on one session is logged and the
    /// scan continues.
    pub async fn archive_expired(&self, now: DateTime<Utc>) -> Vec<String> {
        let timeout = self.config.timeout();
        let candidates: Vec<String> = self
            .active
            .lock()
            .await
            .values()
            .filter(|session| session.is_expired(now, timeout))
            .map(|session| session.session_id.clone())
            .collect();

        let mut archived = Vec::with_capacity(candidates.len());
        for session_id in candidates {
            match self
                .archive_where(&session_id, TIMEOUT_REASON, |session| {
                    session.is_expired(now, timeout)
                })
                .await
            {
                Ok(Some(_)) => {
                    self.expired.fetch_add(1, Ordering::Relaxed);
                    archived.push(session_id);
                }
                Ok(None) | Err(AppError::SessionNotFound(_)) => {}
                Err(err) => warn!(?err, %session_id, "failed to archive expired session"),
            }
        }
        archived
    }

    /// Move an archived session back into the active set.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ArchiveNotFound` if the id is not archived, or
    /// `AppError::Db` if the archive store fails.
    pub async fn restore_session(&self, session_id: &str) -> Result<Session> {
        let span = info_span!("restore_session", session_id);
        async {
            let mut active = self.active.lock().await;
            let archived = self
                .archive
                .take(session_id)
                .await?
                .ok_or_else(|| AppError::ArchiveNotFound(session_id.to_owned()))?;

            let session = archived.into_restored(Utc::now());
            active.insert(session_id.to_owned(), session.clone());
            drop(active);

            self.restored.fetch_add(1, Ordering::Relaxed);
            info!(restore_count = session.restore_count, "session restored");
            Ok(session)
        }
        .instrument(span)
        .await
    }

    /// Archive snapshot of a session without restoring it.
    ///
    /// # Errors
    ///
    /// Returns `AppError::ArchiveNotFound` if the id is not archived.
    pub async fn archived_info(&self, session_id: &str) -> Result<ArchivedSession> {
        self.archive
            .get(session_id)
            .await?
            .ok_or_else(|| AppError::ArchiveNotFound(session_id.to_owned()))
    }

    /// Archived sessions, newest first.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the archive store fails.
    pub async fn list_archived(&self, limit: u32, offset: u32) -> Result<Vec<ArchivedSession>> {
        self.archive.list(limit, offset).await
    }

    /// Search archived sessions by text and tags.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the archive store fails.
    pub async fn search(&self, query: &str, tags: &[String]) -> Result<Vec<ArchivedSession>> {
        self.archive.search(query, tags).await
    }

    /// Delete archived sessions older than `max_age`.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if the delete fails.
    pub async fn cleanup_old(&self, max_age: chrono::Duration) -> Result<u64> {
        let cutoff = Utc::now()
            .checked_sub_signed(max_age)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let deleted = self.archive.delete_older_than(cutoff).await?;
        self.cleanup_runs.fetch_add(1, Ordering::Relaxed);
        self.cleaned_up.fetch_add(deleted, Ordering::Relaxed);
        Ok(deleted)
    }

    /// Counters and archive aggregates.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Db` if archive statistics cannot be read.
    pub async fn stats(&self) -> Result<SessionStats> {
        let active = u64::try_from(self.active_count().await).unwrap_or(u64::MAX);
        Ok(SessionStats {
            active,
            archived: self.archived.load(Ordering::Relaxed),
            restored: self.restored.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            cleanup_runs: self.cleanup_runs.load(Ordering::Relaxed),
            cleaned_up: self.cleaned_up.load(Ordering::Relaxed),
            archive: self.archive.stats().await?,
        })
    }
}

