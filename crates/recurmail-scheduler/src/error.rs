use chrono::{DateTime, Utc};
use recurmail_core::types::JobStatus;
use thiserror::Error;

/// Errors that can occur within the scheduling and dispatch subsystem.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Underlying SQLite / rusqlite error.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Cadence must be a positive number of days.
    #[error("Invalid cadence: every_n_days must be > 0, got {0}")]
    InvalidCadence(i64),

    /// Job-level input rejected before reaching the store.
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    /// No visible job with the given ID exists for this owner.
    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    #[error("User not found: {id}")]
    UserNotFound { id: String },

    /// The job is already being dispatched by another caller.
    #[error("Job is busy: {id}")]
    JobBusy { id: String },

    /// The lifecycle does not define this transition (e.g. anything out of Deleted).
    #[error("Cannot move job from {from} to {to}")]
    InvalidTransition { from: JobStatus, to: JobStatus },

    /// The stored credential is expired and could not be refreshed.
    #[error("Credential expired: {0}")]
    CredentialExpired(String),

    /// The message transport failed; the job stays due and is retried next tick.
    #[error("Transport error: {0}")]
    Transport(String),

    /// An attachment could not be read. Non-fatal: the message goes out without it.
    #[error("Attachment unreadable ({path}): {reason}")]
    AttachmentUnreadable { path: String, reason: String },

    /// The instant cannot be stored in the fixed-width timestamp format.
    #[error("Timestamp out of range: {0}")]
    TimestampOutOfRange(DateTime<Utc>),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl SchedulerError {
    /// Short error code string returned to HTTP clients.
    pub fn code(&self) -> &'static str {
        match self {
            SchedulerError::Database(_) => "DATABASE_ERROR",
            SchedulerError::InvalidCadence(_) => "INVALID_CADENCE",
            SchedulerError::InvalidJob(_) => "INVALID_JOB",
            SchedulerError::JobNotFound { .. } => "JOB_NOT_FOUND",
            SchedulerError::UserNotFound { .. } => "USER_NOT_FOUND",
            SchedulerError::JobBusy { .. } => "JOB_BUSY",
            SchedulerError::InvalidTransition { .. } => "INVALID_TRANSITION",
            SchedulerError::CredentialExpired(_) => "CREDENTIAL_EXPIRED",
            SchedulerError::Transport(_) => "TRANSPORT_ERROR",
            SchedulerError::AttachmentUnreadable { .. } => "ATTACHMENT_UNREADABLE",
            SchedulerError::TimestampOutOfRange(_) => "TIMESTAMP_OUT_OF_RANGE",
            SchedulerError::Serialization(_) => "SERIALIZATION_ERROR",
            SchedulerError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, SchedulerError>;
