use chrono::{DateTime, Duration, Utc};

use crate::error::{Result, SchedulerError};

/// Upper bound on the cadence (100 years). Keeps timestamp arithmetic in range.
pub const MAX_CADENCE_DAYS: i64 = 36_500;

/// Validate a requested cadence and narrow it to the stored type.
pub fn validate_cadence(every_n_days: i64) -> Result<u32> {
    if every_n_days <= 0 || every_n_days > MAX_CADENCE_DAYS {
        return Err(SchedulerError::InvalidCadence(every_n_days));
    }
    Ok(every_n_days as u32)
}

/// Compute the next send instant for a job.
///
/// Anchored on the last real send when there is one, otherwise on `now`.
/// A job that was never sent therefore fires one full cadence after it is
/// (re)scheduled, and a resumed job never replays missed occurrences.
pub fn next_occurrence(
    last_sent: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    every_n_days: u32,
) -> DateTime<Utc> {
    let anchor = last_sent.unwrap_or(now);
    anchor
        .checked_add_signed(Duration::days(i64::from(every_n_days)))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
