//! User provisioning and connection checks.
//!
//! The OAuth authorization-code exchange happens elsewhere; `POST /users`
//! only records an account together with the credential pair it produced.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Duration, Utc};
use recurmail_core::types::{Credential, User, UserId};
use recurmail_scheduler::{db::is_storable, SchedulerError};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::{info, warn};

use super::{api_error, scheduler_error, ApiError};
use crate::app::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateUserRequest {
    pub email: String,
    #[serde(default)]
    pub name: String,
    pub google_id: String,
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Absolute expiry; wins over `expires_in`.
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub expires_in: Option<i64>,
}

impl CreateUserRequest {
    fn into_user(self, now: DateTime<Utc>) -> Result<User, String> {
        let expires_at = match (self.expires_at, self.expires_in) {
            (Some(at), _) => at,
            (None, Some(secs)) => Duration::try_seconds(secs)
                .and_then(|d| now.checked_add_signed(d))
                .ok_or_else(|| format!("expires_in out of range: {secs}"))?,
            // Unknown expiry: treat as already expired so the first use refreshes.
            (None, None) => now,
        };
        if !is_storable(expires_at) {
            return Err(format!("token expiry must fall in years 0000-9999, got {expires_at}"));
        }
        Ok(User {
            id: UserId::new(),
            email: self.email,
            name: self.name,
            google_id: self.google_id,
            credential: Credential {
                access_token: self.access_token,
                refresh_token: self.refresh_token,
                expires_at,
            },
            created_at: now,
            updated_at: now,
        })
    }
}

/// POST /users
pub async fn create_user(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CreateUserRequest>,
) -> Result<(StatusCode, Json<User>), ApiError> {
    if req.email.trim().is_empty() || req.google_id.trim().is_empty() {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            "email and google_id are required",
            "INVALID_USER",
        ));
    }
    let user = req
        .into_user(Utc::now())
        .map_err(|e| api_error(StatusCode::BAD_REQUEST, e, "INVALID_USER"))?;
    state
        .store
        .insert_user(&user)
        .await
        .map_err(scheduler_error)?;
    info!(user_id = %user.id, email = %user.email, "user registered");
    Ok((StatusCode::CREATED, Json(user)))
}

/// GET /users/{user_id}
pub async fn get_user(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<Json<User>, ApiError> {
    load_user(&state, user_id).await.map(Json)
}

/// POST /users/{user_id}/connection-test
///
/// 200 with `valid: false` when the account can no longer send.
pub async fn connection_test(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let user = load_user(&state, user_id).await?;
    match state.scheduler.dispatcher().check_connection(&user).await {
        Ok(profile) => Ok(Json(json!({
            "valid": true,
            "email": profile.email,
            "name": profile.name,
        }))),
        Err(e @ SchedulerError::UserNotFound { .. }) => Err(scheduler_error(e)),
        Err(e) => {
            warn!(user_id = %user.id, error = %e, "connection test failed");
            Ok(Json(json!({"valid": false, "error": e.to_string()})))
        }
    }
}

async fn load_user(state: &AppState, user_id: String) -> Result<User, ApiError> {
    let id = UserId::from(user_id);
    state
        .store
        .get_user(&id)
        .await
        .map_err(scheduler_error)?
        .ok_or_else(|| scheduler_error(SchedulerError::UserNotFound { id: id.to_string() }))
}
