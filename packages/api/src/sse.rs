// ABOUTME: Server-Sent Events helpers shared by the streaming sandbox endpoints
// ABOUTME: Standard keep-alive plus JSON event construction for command, status and log streams

use axum::response::sse::{Event, KeepAlive, Sse};
use dappbox_sandbox::CommandEvent;
use futures::stream::Stream;
use serde::Serialize;
use serde_json::json;
use std::convert::Infallible;

/// SSE response with the standard keep-alive settings
pub fn create_sse_response<S>(stream: S) -> Sse<impl Stream<Item = Result<Event, Infallible>>>
where
    S: Stream<Item = Result<Event, Infallible>> + Send + 'static,
{
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(std::time::Duration::from_secs(15))
            .text("keep-alive"),
    )
}

/// Named SSE event with a JSON payload
pub fn create_sse_event<T: Serialize>(event_type: &str, data: &T) -> Event {
    match serde_json::to_string(data) {
        Ok(json) => Event::default().event(event_type).data(json),
        Err(e) => create_error_event(&format!("Failed to encode event: {}", e)),
    }
}

/// Unnamed SSE event whose payload carries its own `type` field
pub fn create_data_event<T: Serialize>(data: &T) -> Event {
    match serde_json::to_string(data) {
        Ok(json) => Event::default().data(json),
        Err(e) => create_error_event(&format!("Failed to encode event: {}", e)),
    }
}

pub fn create_error_event(error_message: &str) -> Event {
    Event::default()
        .event("error")
        .data(json!({ "message": error_message }).to_string())
}

/// Wire form of a streamed command event: the kind is the SSE event name
pub fn command_event(event: &CommandEvent) -> Event {
    match event {
        CommandEvent::Start { command } => {
            create_sse_event("start", &json!({ "command": command }))
        }
        CommandEvent::Log { stream, chunk } => {
            create_sse_event("log", &json!({ "type": stream.as_str(), "chunk": chunk }))
        }
        CommandEvent::Done { exit_code } => {
            create_sse_event("done", &json!({ "exitCode": exit_code }))
        }
        CommandEvent::Error { message } => create_error_event(message),
    }
}
