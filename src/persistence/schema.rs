//! `SQLite` schema bootstrap logic.
//!
//! All table definitions use `CREATE TABLE IF NOT EXISTS` and are safe to
//! re-run on every startup.

use sqlx::SqlitePool;

use crate::Result;

/// Apply the archive and dead-letter table definitions.
///
/// # Errors
///
/// Returns `AppError::Db` if any DDL statement fails.
pub async fn bootstrap_schema(pool: &SqlitePool) -> Result<()> {
    let ddl = r"
CREATE TABLE IF NOT EXISTS archived_session (
    session_id      TEXT PRIMARY KEY NOT NULL,
    session_data    TEXT NOT NULL,
    archived_at     TEXT NOT NULL,
    archive_reason  TEXT NOT NULL,
    restored_at     TEXT,
    restore_count   INTEGER NOT NULL DEFAULT 0,
    tags            TEXT NOT NULL DEFAULT '[]'
);

CREATE TABLE IF NOT EXISTS failed_event (
    event_id         TEXT PRIMARY KEY NOT NULL,
    original_payload TEXT NOT NULL,
    target_agent     TEXT NOT NULL,
    target_url       TEXT NOT NULL,
    failure_reason   TEXT NOT NULL,
    failure_count    INTEGER NOT NULL DEFAULT 0,
    first_failure    TEXT NOT NULL,
    last_failure     TEXT NOT NULL,
    retry_after      TEXT,
    status           TEXT NOT NULL CHECK(status IN ('pending','retrying','failed','recovered')),
    metadata         TEXT NOT NULL DEFAULT '{}'
);

CREATE INDEX IF NOT EXISTS idx_archived_at ON archived_session(archived_at);
CREATE INDEX IF NOT EXISTS idx_archived_restore_count ON archived_session(restore_count);
CREATE INDEX IF NOT EXISTS idx_failed_event_status ON failed_event(status);
CREATE INDEX IF NOT EXISTS idx_failed_event_retry_after ON failed_event(retry_after);
";

    sqlx::raw_sql(ddl).execute(pool).await?;
    Ok(())
}
