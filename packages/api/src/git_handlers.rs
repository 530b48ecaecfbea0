// ABOUTME: HTTP handler for git checkpoint operations in a project's sandbox
// ABOUTME: One endpoint dispatching on the request's operation field

use axum::{
    extract::State,
    Json,
};
use dappbox_sandbox::{validate_project_id, SandboxServices};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

use crate::error::ApiResult;
use crate::extract::{ApiJson, ApiPath};
use crate::sandbox_handlers::require;

#[derive(Debug, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum GitRequest {
    Init,
    Commit { message: Option<String> },
    Head,
    ChangedFiles { since: Option<String> },
    Log { since: Option<String> },
    Restore { hash: Option<String> },
}

pub async fn git_operation(
    State(services): State<Arc<SandboxServices>>,
    ApiPath(project_id): ApiPath<String>,
    ApiJson(request): ApiJson<GitRequest>,
) -> ApiResult<Json<Value>> {
    validate_project_id(&project_id)?;
    info!("Git {:?} for project: {}", request, project_id);
    let git = &services.git;

    let body = match request {
        GitRequest::Init => {
            let status = git.ensure_repo(&project_id).await?;
            json!({ "success": true, "status": status })
        }
        GitRequest::Commit { message } => {
            let message = require(message, "message")?;
            let hash = git.commit(&project_id, &message).await?;
            json!({ "success": true, "hash": hash })
        }
        GitRequest::Head => {
            let hash = git.head(&project_id).await?;
            json!({ "success": true, "hash": hash })
        }
        GitRequest::ChangedFiles { since } => {
            let files = git.changed_files(&project_id, since.as_deref()).await?;
            json!({ "success": true, "files": files })
        }
        GitRequest::Log { since } => {
            let commits = git.commit_log(&project_id, since.as_deref()).await?;
            json!({ "success": true, "commits": commits })
        }
        GitRequest::Restore { hash } => {
            let hash = require(hash, "hash")?;
            git.restore(&project_id, &hash).await?;
            json!({ "success": true, "hash": hash })
        }
    };

    Ok(Json(body))
}
