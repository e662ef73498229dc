//! Job endpoints under /users/{user_id}/jobs.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use recurmail_core::{
    config::UploadsConfig,
    types::{Job, JobId, UserId},
};
use recurmail_scheduler::{dispatch::outcome_into_result, JobPatch, NewJob};
use serde_json::{json, Value};
use std::{
    path::{Component, Path as FsPath},
    sync::Arc,
};
use tracing::info;

use super::{api_error, scheduler_error, ApiError};
use crate::app::AppState;

type JobPath = Path<(String, String)>;

fn ids((user_id, job_id): (String, String)) -> (UserId, JobId) {
    (UserId::from(user_id), JobId::from(job_id))
}

/// GET /users/{user_id}/jobs
pub async fn list_jobs(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<Job>>, ApiError> {
    let jobs = state
        .jobs
        .list(&UserId::from(user_id))
        .await
        .map_err(scheduler_error)?;
    Ok(Json(jobs))
}

/// POST /users/{user_id}/jobs
pub async fn create_job(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
    Json(req): Json<NewJob>,
) -> Result<(StatusCode, Json<Job>), ApiError> {
    check_attachments(&state.config.uploads, &req.attachments).await?;
    let job = state
        .jobs
        .create(&UserId::from(user_id), req)
        .await
        .map_err(scheduler_error)?;
    Ok((StatusCode::CREATED, Json(job)))
}

/// GET /users/{user_id}/jobs/{job_id}
pub async fn get_job(State(state): State<Arc<AppState>>, Path(p): JobPath) -> Result<Json<Job>, ApiError> {
    let (owner, id) = ids(p);
    state.jobs.get(&owner, &id).await.map(Json).map_err(scheduler_error)
}

/// PUT /users/{user_id}/jobs/{job_id}
pub async fn update_job(
    State(state): State<Arc<AppState>>,
    Path(p): JobPath,
    Json(patch): Json<JobPatch>,
) -> Result<Json<Job>, ApiError> {
    if let Some(attachments) = &patch.attachments {
        check_attachments(&state.config.uploads, attachments).await?;
    }
    let (owner, id) = ids(p);
    state
        .jobs
        .update(&owner, &id, patch)
        .await
        .map(Json)
        .map_err(scheduler_error)
}

/// DELETE /users/{user_id}/jobs/{job_id}
pub async fn delete_job(State(state): State<Arc<AppState>>, Path(p): JobPath) -> Result<Json<Value>, ApiError> {
    let (owner, id) = ids(p);
    state.jobs.delete(&owner, &id).await.map_err(scheduler_error)?;
    Ok(Json(json!({"deleted": true, "id": id})))
}

/// POST /users/{user_id}/jobs/{job_id}/pause
pub async fn pause_job(State(state): State<Arc<AppState>>, Path(p): JobPath) -> Result<Json<Job>, ApiError> {
    let (owner, id) = ids(p);
    state.jobs.pause(&owner, &id).await.map(Json).map_err(scheduler_error)
}

/// POST /users/{user_id}/jobs/{job_id}/resume
pub async fn resume_job(State(state): State<Arc<AppState>>, Path(p): JobPath) -> Result<Json<Job>, ApiError> {
    let (owner, id) = ids(p);
    state.jobs.resume(&owner, &id).await.map(Json).map_err(scheduler_error)
}

/// POST /users/{user_id}/jobs/{job_id}/send-now
///
/// The outcome is returned either way; a failed send carries the error
/// status of its cause (502 for transport and credential failures).
pub async fn send_now(
    State(state): State<Arc<AppState>>,
    Path(p): JobPath,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let (owner, id) = ids(p);
    let outcome = state
        .scheduler
        .send_now(&owner, &id)
        .await
        .map_err(scheduler_error)?;
    let body = json!({ "outcome": outcome });
    match outcome_into_result(outcome) {
        Ok(_) => Ok((StatusCode::OK, Json(body))),
        Err(e) => {
            info!(job_id = %id, error = %e, "manual send failed");
            let (status, Json(mut err)) = scheduler_error(e);
            err["outcome"] = body["outcome"].clone();
            Ok((status, Json(err)))
        }
    }
}

async fn check_attachments(uploads: &UploadsConfig, paths: &[String]) -> Result<(), ApiError> {
    validate_attachments(uploads, paths)
        .await
        .map_err(|msg| api_error(StatusCode::BAD_REQUEST, msg, "INVALID_ATTACHMENT"))
}

/// Attachments must be relative-free paths under the uploads directory and,
/// when the file already exists, no larger than the configured limit.
/// A missing file is accepted; the send skips it.
pub async fn validate_attachments(uploads: &UploadsConfig, paths: &[String]) -> Result<(), String> {
    let root = FsPath::new(&uploads.dir);
    for raw in paths {
        let path = FsPath::new(raw);
        if path.components().any(|c| matches!(c, Component::ParentDir)) {
            return Err(format!("attachment path may not contain '..': {raw}"));
        }
        if !path.starts_with(root) {
            return Err(format!("attachment must live under {}: {raw}", uploads.dir));
        }
        if let Ok(meta) = tokio::fs::metadata(path).await {
            if meta.len() > uploads.max_file_size {
                return Err(format!(
                    "attachment exceeds {} bytes: {raw}",
                    uploads.max_file_size
                ));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uploads(dir: &str, max: u64) -> UploadsConfig {
        UploadsConfig {
            dir: dir.to_string(),
            max_file_size: max,
        }
    }

    #[tokio::test]
    async fn paths_outside_uploads_are_rejected() {
        let cfg = uploads("uploads", 1024);
        assert!(validate_attachments(&cfg, &["uploads/a.pdf".into()]).await.is_ok());
        assert!(validate_attachments(&cfg, &["/etc/passwd".into()]).await.is_err());
        assert!(validate_attachments(&cfg, &["uploads/../secret".into()]).await.is_err());
        assert!(validate_attachments(&cfg, &["uploads-evil/a.pdf".into()]).await.is_err());
    }

    #[tokio::test]
    async fn oversized_files_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let big = dir.path().join("big.bin");
        std::fs::write(&big, vec![0u8; 64]).unwrap();
        let cfg = uploads(&dir.path().to_string_lossy(), 32);

        let err = validate_attachments(&cfg, &[big.to_string_lossy().into_owned()])
            .await
            .unwrap_err();
        assert!(err.contains("exceeds 32 bytes"));

        let small = dir.path().join("small.bin");
        std::fs::write(&small, vec![0u8; 16]).unwrap();
        assert!(validate_attachments(&cfg, &[small.to_string_lossy().into_owned()])
            .await
            .is_ok());
    }
}
