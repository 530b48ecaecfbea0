// ABOUTME: HTTP request handlers for sandbox lifecycle, uploads and the dev server
// ABOUTME: Create, look up, upload into, bootstrap and terminate per-project sandboxes

use axum::{
    extract::State,
    Json,
};
use dappbox_sandbox::{
    validate_project_id, AutoStart, BootstrapOptions, SandboxHandle, SandboxServices, SyncedFile,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use crate::error::{ApiError, ApiResult};
use crate::extract::{ApiJson, ApiPath, ApiQuery};

const DEFAULT_RECENT_LOG_LINES: usize = 50;

/// Required string field: present and not blank
pub(crate) fn require(value: Option<String>, field: &str) -> ApiResult<String> {
    match value {
        Some(value) if !value.trim().is_empty() => Ok(value),
        _ => Err(ApiError::validation(format!("{} is required", field))),
    }
}

#[derive(Debug, Serialize)]
pub struct SandboxResponse {
    pub url: String,
    pub sandbox_id: String,
    pub project_id: String,
}

impl From<SandboxHandle> for SandboxResponse {
    fn from(handle: SandboxHandle) -> Self {
        Self {
            url: handle.url,
            sandbox_id: handle.instance_id,
            project_id: handle.project_id,
        }
    }
}

/// Downloaded files keyed by client path
pub(crate) fn files_body(files: Vec<SyncedFile>) -> Value {
    let count = files.len();
    let files: BTreeMap<String, String> = files
        .into_iter()
        .map(|file| (file.path, file.content))
        .collect();
    json!({ "files": files, "count": count })
}

#[derive(Debug, Deserialize)]
pub struct CreateSandboxRequest {
    pub project_id: Option<String>,
}

/// Create a sandbox, or return the project's live one
pub async fn create_sandbox(
    State(services): State<Arc<SandboxServices>>,
    ApiJson(request): ApiJson<CreateSandboxRequest>,
) -> ApiResult<Json<SandboxResponse>> {
    let project_id = require(request.project_id, "project_id")?;
    info!("Creating sandbox for project: {}", project_id);

    let handle = services.registry.create(&project_id).await?;
    Ok(Json(handle.into()))
}

/// Look up a live sandbox without provisioning one
pub async fn get_sandbox(
    State(services): State<Arc<SandboxServices>>,
    ApiPath(project_id): ApiPath<String>,
) -> ApiResult<Json<SandboxResponse>> {
    match services.registry.acquire(&project_id).await? {
        Some(handle) => Ok(Json(handle.into())),
        None => Err(ApiError::NotFound(format!(
            "No active sandbox for project {}",
            project_id
        ))),
    }
}

#[derive(Debug, Deserialize)]
pub struct UploadFilesRequest {
    pub project_id: Option<String>,
    #[serde(default)]
    pub files: BTreeMap<String, String>,
    #[serde(default)]
    pub auto_start: bool,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub status: &'static str,
    pub project_id: String,
    pub files_uploaded: usize,
    pub auto_start: AutoStart,
}

pub async fn upload_files(
    State(services): State<Arc<SandboxServices>>,
    ApiJson(request): ApiJson<UploadFilesRequest>,
) -> ApiResult<Json<UploadResponse>> {
    let project_id = require(request.project_id, "project_id")?;
    info!(
        "Uploading {} file(s) for project: {}",
        request.files.len(),
        project_id
    );

    let report = services
        .sync
        .upload(&project_id, &request.files, request.auto_start)
        .await?;

    Ok(Json(UploadResponse {
        status: "success",
        project_id,
        files_uploaded: report.files_uploaded,
        auto_start: report.auto_start,
    }))
}

pub async fn start_dev_server(
    State(services): State<Arc<SandboxServices>>,
    ApiPath(project_id): ApiPath<String>,
) -> ApiResult<Json<Value>> {
    info!("Starting dev server for project: {}", project_id);
    let status = services.dev_server.start(&project_id).await?;

    Ok(Json(json!({
        "status": if status.already_running { "already_running" } else { "success" },
        "url": status.url,
        "project_id": project_id,
    })))
}

pub async fn stop_dev_server(
    State(services): State<Arc<SandboxServices>>,
    ApiPath(project_id): ApiPath<String>,
) -> ApiResult<Json<Value>> {
    info!("Stopping dev server for project: {}", project_id);
    let stopped = services.dev_server.stop(&project_id).await?;

    Ok(Json(json!({
        "status": if stopped { "stopped" } else { "not_running" },
        "project_id": project_id,
    })))
}

pub async fn restart_dev_server(
    State(services): State<Arc<SandboxServices>>,
    ApiPath(project_id): ApiPath<String>,
) -> ApiResult<Json<Value>> {
    info!("Restarting dev server for project: {}", project_id);
    let status = services.dev_server.restart(&project_id).await?;

    Ok(Json(json!({
        "status": "success",
        "url": status.url,
        "project_id": project_id,
    })))
}

pub async fn terminate_sandbox(
    State(services): State<Arc<SandboxServices>>,
    ApiPath(project_id): ApiPath<String>,
) -> ApiResult<Json<Value>> {
    info!("Terminating sandbox for project: {}", project_id);
    let terminated = services.terminate(&project_id).await?;

    Ok(Json(json!({
        "status": if terminated { "terminated" } else { "not_found" },
        "project_id": project_id,
    })))
}

#[derive(Debug, Deserialize)]
pub struct RecentLogsQuery {
    pub lines: Option<usize>,
}

pub async fn recent_logs(
    State(services): State<Arc<SandboxServices>>,
    ApiPath(project_id): ApiPath<String>,
    ApiQuery(query): ApiQuery<RecentLogsQuery>,
) -> ApiResult<Json<Value>> {
    let lines = query.lines.unwrap_or(DEFAULT_RECENT_LOG_LINES);
    let logs = services.dev_server.recent_logs(&project_id, lines).await?;
    Ok(Json(json!({ "logs": logs, "project_id": project_id })))
}

/// Scaffold a Next.js app in the sandbox and return its files
pub async fn bootstrap_project(
    State(services): State<Arc<SandboxServices>>,
    ApiPath(project_id): ApiPath<String>,
    ApiJson(options): ApiJson<BootstrapOptions>,
) -> ApiResult<Json<Value>> {
    validate_project_id(&project_id)?;
    options.validate()?;

    let files = services
        .bootstrap
        .bootstrap_nextjs(&project_id, &options)
        .await?;
    Ok(Json(files_body(files)))
}
