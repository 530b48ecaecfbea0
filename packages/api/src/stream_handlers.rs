// ABOUTME: Long-lived Server-Sent Events endpoints for sandbox status and dev server logs
// ABOUTME: Streams end their polling and capture work as soon as the client disconnects

use axum::{
    extract::State,
    response::{sse::Event, Sse},
};
use dappbox_sandbox::{validate_project_id, SandboxServices};
use futures::{Stream, StreamExt};
use std::convert::Infallible;
use std::sync::Arc;
use tracing::debug;

use crate::error::ApiResult;
use crate::extract::ApiPath;
use crate::sse::{create_data_event, create_sse_event, create_sse_response};

/// Sandbox readiness transitions plus periodic pings
pub async fn sandbox_events(
    State(services): State<Arc<SandboxServices>>,
    ApiPath(project_id): ApiPath<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    validate_project_id(&project_id)?;
    debug!("Status stream opened for project: {}", project_id);

    let events = services.events.subscribe(&project_id);
    Ok(create_sse_response(
        events.map(|event| Ok(create_data_event(&event))),
    ))
}

/// Buffered dev server output followed by live lines
pub async fn stream_logs(
    State(services): State<Arc<SandboxServices>>,
    ApiPath(project_id): ApiPath<String>,
) -> ApiResult<Sse<impl Stream<Item = Result<Event, Infallible>>>> {
    let logs = services.dev_server.subscribe_logs(&project_id).await?;
    Ok(create_sse_response(
        logs.map(|log| Ok(create_sse_event("log", &log))),
    ))
}
