use axum::{
    routing::{get, post},
    Router,
};
use recurmail_core::config::RecurmailConfig;
use recurmail_scheduler::{JobManager, JobStore, Scheduler};
use std::sync::Arc;

use crate::http::{health, jobs, users};

/// Central shared state — passed as Arc<AppState> to all Axum handlers.
pub struct AppState {
    pub config: RecurmailConfig,
    pub store: Arc<dyn JobStore>,
    pub jobs: JobManager,
    /// Owns the background loop; also serves manual sends and connection tests.
    pub scheduler: Scheduler,
}

impl AppState {
    pub fn new(config: RecurmailConfig, store: Arc<dyn JobStore>, scheduler: Scheduler) -> Self {
        Self {
            config,
            jobs: JobManager::new(store.clone()),
            store,
            scheduler,
        }
    }
}

/// Assemble the full Axum router.
pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health::health_handler))
        .route("/users", post(users::create_user))
        .route("/users/{user_id}", get(users::get_user))
        .route(
            "/users/{user_id}/connection-test",
            post(users::connection_test),
        )
        .route(
            "/users/{user_id}/jobs",
            get(jobs::list_jobs).post(jobs::create_job),
        )
        .route(
            "/users/{user_id}/jobs/{job_id}",
            get(jobs::get_job).put(jobs::update_job).delete(jobs::delete_job),
        )
        .route("/users/{user_id}/jobs/{job_id}/pause", post(jobs::pause_job))
        .route("/users/{user_id}/jobs/{job_id}/resume", post(jobs::resume_job))
        .route("/users/{user_id}/jobs/{job_id}/send-now", post(jobs::send_now))
        .with_state(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
}
