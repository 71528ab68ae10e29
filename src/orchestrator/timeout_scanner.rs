//! Inactivity scanner for active sessions.
//!
//! On every tick, sessions idle for strictly longer than the session
//! timeout are archived with reason `timeout`. The scanner never cancels
//! in-flight pipeline work; a run whose session was archived underneath it
//! just stops recording events.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, Instrument};

use super::session_manager::SessionManager;

/// Spawn the timeout scanner background task.
#[must_use]
pub fn spawn_timeout_scanner(
    sessions: Arc<SessionManager>,
    scan_interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(
        async move {
            let mut interval = tokio::time::interval(scan_interval);
            loop {
                tokio::select! {
                    () = cancel.cancelled() => {
                        info!("timeout scanner shutting down");
                        break;
                    }
                    _ = interval.tick() => {
                        let archived = sessions.archive_expired(Utc::now()).await;
                        if archived.is_empty() {
                            debug!("no expired sessions");
                        } else {
                            info!(count = archived.len(), "archived expired sessions");
                        }
                    }
                }
            }
        }
        .instrument(info_span!("timeout_scanner")),
    )
}
