use chrono::{DateTime, Datelike, SecondsFormat, Utc};
use rusqlite::Connection;

use crate::error::{Result, SchedulerError};

/// Initialise the scheduler schema in `conn`.
///
/// Creates the `users` and `jobs` tables (idempotent) plus the indexes the
/// due-job query and the per-owner listing rely on.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id            TEXT NOT NULL PRIMARY KEY,
            email         TEXT NOT NULL,
            name          TEXT NOT NULL,
            google_id     TEXT NOT NULL UNIQUE,
            access_token  TEXT NOT NULL,
            refresh_token TEXT,
            token_expiry  TEXT NOT NULL,
            created_at    TEXT NOT NULL,
            updated_at    TEXT NOT NULL
        ) STRICT;

        CREATE TABLE IF NOT EXISTS jobs (
            id           TEXT    NOT NULL PRIMARY KEY,
            user_id      TEXT    NOT NULL REFERENCES users(id),
            recipient    TEXT    NOT NULL,
            subject      TEXT    NOT NULL,
            body         TEXT    NOT NULL,
            attachments  TEXT    NOT NULL DEFAULT '[]',   -- JSON array of paths
            every_n_days INTEGER NOT NULL CHECK (every_n_days > 0),
            last_sent    TEXT,                           -- RFC 3339 or NULL
            next_send    TEXT,                           -- RFC 3339 or NULL
            status       TEXT    NOT NULL DEFAULT 'active',
            created_at   TEXT    NOT NULL,
            updated_at   TEXT    NOT NULL
        ) STRICT;

        -- Polling: WHERE status = 'active' AND (next_send IS NULL OR next_send <= ?)
        CREATE INDEX IF NOT EXISTS idx_jobs_next_send ON jobs (next_send);
        CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs (status);
        CREATE INDEX IF NOT EXISTS idx_jobs_user ON jobs (user_id);
        ",
    )?;
    Ok(())
}

/// Render a timestamp for storage.
///
/// Fixed width (microseconds, `Z` suffix) so that string comparison in SQL
/// orders the same way as the instants themselves. Only four-digit years
/// keep that width and parse back, so anything outside 0000..=9999 is refused.
pub fn to_db_ts(ts: DateTime<Utc>) -> Result<String> {
    if !is_storable(ts) {
        return Err(SchedulerError::TimestampOutOfRange(ts));
    }
    Ok(ts.to_rfc3339_opts(SecondsFormat::Micros, true))
}

/// Whether `ts` survives a round trip through [`to_db_ts`].
pub fn is_storable(ts: DateTime<Utc>) -> bool {
    (0..=9999).contains(&ts.year())
}

/// Parse a stored timestamp back into UTC.
pub fn from_db_ts(raw: &str) -> std::result::Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|dt| dt.with_timezone(&Utc))
}
