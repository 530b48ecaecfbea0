// ABOUTME: HTTP handlers for running shell commands inside a project's sandbox
// ABOUTME: Collect-and-return execution plus a Server-Sent Events stream of live output

use axum::{
    extract::State,
    response::{sse::Event, Sse},
    Json,
};
use dappbox_sandbox::{validate_project_id, SandboxServices};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use tracing::info;

use crate::error::ApiResult;
use crate::extract::{ApiJson, ApiPath, ApiQuery};
use crate::sandbox_handlers::require;
use crate::sse::{command_event, create_sse_response};

#[derive(Debug, Deserialize)]
pub struct RunCommandRequest {
    pub command: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct RunCommandResponse {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
    pub command: String,
}

/// Run a command to completion; a non-zero exit code is still a 200
pub async fn run_command(
    State(services): State<Arc<SandboxServices>>,
    ApiPath(project_id): ApiPath<String>,
    ApiJson(request): ApiJson<RunCommandRequest>,
) -> ApiResult<Json<RunCommandResponse>> {
    let command = require(request.command, "command")?;
    validate_project_id(&project_id)?;
    info!("Running command for project {}: {}", project_id, command);

    let output = services.commands.run(&project_id, &command).await?;
    Ok(Json(RunCommandResponse {
        stdout: output.stdout,
        stderr: output.stderr,
        exit_code: output.exit_code,
        command,
    }))
}

#[derive(Debug, Deserialize)]
pub struct StreamCommandQuery {
    pub command: Option<String>,
}

/// Stream `start`, `log`* and a final `done` or `error` event
pub async fn stream_command(
    State(services): State<Arc<SandboxServices>>,
    ApiPath(project_id): ApiPath<String>,
    ApiQuery(query): ApiQuery<StreamCommandQuery>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let command = require(query.command, "command")?;
    validate_project_id(&project_id)?;
    info!("Streaming command for project {}: {}", project_id, command);

    let events = services.commands.stream(&project_id, &command).await?;
    Ok(create_sse_response(
        events.map(|event| Ok(command_event(&event))),
    ))
}
