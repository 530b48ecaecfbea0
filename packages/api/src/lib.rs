// ABOUTME: HTTP API layer for Dappbox providing the sandbox REST and streaming endpoints
// ABOUTME: Routes requests onto the shared sandbox services

use axum::{
    routing::{get, post},
    Json, Router,
};
use dappbox_sandbox::SandboxServices;
use serde_json::{json, Value};
use std::sync::Arc;

pub mod command_handlers;
pub mod error;
pub mod extract;
pub mod files_handlers;
pub mod git_handlers;
pub mod sandbox_handlers;
pub mod sse;
pub mod stream_handlers;

pub use error::{ApiError, ApiResult};

/// Creates the sandbox API router
pub fn create_sandbox_router(services: Arc<SandboxServices>) -> Router {
    Router::new()
        .route("/sandbox/create", post(sandbox_handlers::create_sandbox))
        .route("/sandbox/upload", post(sandbox_handlers::upload_files))
        .route("/sandbox/{id}", get(sandbox_handlers::get_sandbox))
        // Commands
        .route("/sandbox/{id}/command", post(command_handlers::run_command))
        .route(
            "/sandbox/{id}/command/stream",
            get(command_handlers::stream_command),
        )
        // Files
        .route("/sandbox/{id}/files", get(files_handlers::list_files))
        .route(
            "/sandbox/{id}/files/changes",
            post(files_handlers::file_changes),
        )
        .route("/sandbox/{id}/download", post(files_handlers::download_files))
        // Status and logs
        .route("/sandbox/{id}/events", get(stream_handlers::sandbox_events))
        .route("/sandbox/{id}/logs", get(stream_handlers::stream_logs))
        .route("/sandbox/{id}/recent-logs", get(sandbox_handlers::recent_logs))
        // Dev server and lifecycle
        .route("/sandbox/{id}/start", post(sandbox_handlers::start_dev_server))
        .route("/sandbox/{id}/stop", post(sandbox_handlers::stop_dev_server))
        .route(
            "/sandbox/{id}/restart",
            post(sandbox_handlers::restart_dev_server),
        )
        .route(
            "/sandbox/{id}/terminate",
            post(sandbox_handlers::terminate_sandbox),
        )
        .route(
            "/sandbox/{id}/bootstrap",
            post(sandbox_handlers::bootstrap_project),
        )
        // Checkpoints
        .route("/sandbox/{id}/git", post(git_handlers::git_operation))
        .with_state(services)
}

pub async fn health_check() -> Json<Value> {
    Json(json!({ "status": "healthy" }))
}
