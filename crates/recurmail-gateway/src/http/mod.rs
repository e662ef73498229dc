pub mod health;
pub mod jobs;
pub mod users;

use axum::{http::StatusCode, Json};
use recurmail_scheduler::SchedulerError;
use serde_json::{json, Value};
use tracing::error;

/// Error half of every handler result.
pub type ApiError = (StatusCode, Json<Value>);

pub fn api_error(status: StatusCode, message: impl Into<String>, code: &str) -> ApiError {
    (status, Json(json!({"error": message.into(), "code": code})))
}

/// Map a scheduler error onto an HTTP status.
pub fn scheduler_error(e: SchedulerError) -> ApiError {
    let status = match &e {
        SchedulerError::JobNotFound { .. } | SchedulerError::UserNotFound { .. } => {
            StatusCode::NOT_FOUND
        }
        SchedulerError::InvalidCadence(_)
        | SchedulerError::InvalidJob(_)
        | SchedulerError::TimestampOutOfRange(_)
        | SchedulerError::AttachmentUnreadable { .. } => StatusCode::BAD_REQUEST,
        SchedulerError::InvalidTransition { .. } | SchedulerError::JobBusy { .. } => {
            StatusCode::CONFLICT
        }
        SchedulerError::Database(rusqlite::Error::SqliteFailure(err, _))
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            StatusCode::CONFLICT
        }
        SchedulerError::CredentialExpired(_) | SchedulerError::Transport(_) => {
            StatusCode::BAD_GATEWAY
        }
        SchedulerError::Database(_)
        | SchedulerError::Serialization(_)
        | SchedulerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status == StatusCode::INTERNAL_SERVER_ERROR {
        error!(error = %e, "request failed");
    }
    api_error(status, e.to_string(), e.code())
}
