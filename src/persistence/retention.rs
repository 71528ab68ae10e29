//! Retention service for archived sessions.
//!
//! Runs as a background task deleting archive snapshots older than
//! `max_archive_age_days`.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::orchestrator::session_manager::SessionManager;

/// Spawn the archive cleanup background task.
///
/// The first tick fires immediately, then once per `interval`.
#[must_use]
pub fn spawn_retention_task(
    sessions: Arc<SessionManager>,
    interval: Duration,
    max_archive_age_days: u32,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        let max_age = chrono::Duration::days(i64::from(max_archive_age_days));
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    info!("retention task shutting down");
                    break;
                }
                _ = ticker.tick() => {
                    match sessions.cleanup_old(max_age).await {
                        Ok(deleted) => info!(deleted, max_archive_age_days, "archive cleanup completed"),
                        Err(err) => error!(?err, "archive cleanup failed"),
                    }
                }
            }
        }
    })
}
