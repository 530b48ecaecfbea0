// ABOUTME: Sandbox readiness notifications derived from periodic status polling
// ABOUTME: Edge-triggered ready/removed events with heartbeats, stopped when the subscriber drops

use crate::registry::SandboxRegistry;
use async_trait::async_trait;
use futures::Stream;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::MissedTickBehavior;
use tracing::debug;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum StatusError {
    #[error("Status check failed: {0}")]
    Unavailable(String),
}

/// Where the bridge learns a project's current sandbox address
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SandboxStatusSource: Send + Sync {
    async fn current_url(&self, project_id: &str) -> Result<Option<String>, StatusError>;
}

/// Reads the registry without renewing anything
pub struct RegistryStatusSource {
    registry: Arc<SandboxRegistry>,
}

impl RegistryStatusSource {
    pub fn new(registry: Arc<SandboxRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl SandboxStatusSource for RegistryStatusSource {
    async fn current_url(&self, project_id: &str) -> Result<Option<String>, StatusError> {
        Ok(self.registry.peek(project_id).map(|handle| handle.url))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum StatusEvent {
    #[serde(rename = "sandbox_ready")]
    Ready { url: String },
    #[serde(rename = "sandbox_removed")]
    Removed,
    #[serde(rename = "sandbox_ping")]
    Ping {
        #[serde(skip_serializing_if = "Option::is_none")]
        url: Option<String>,
    },
    #[serde(rename = "sandbox_error")]
    Error { message: String },
}

/// Event for one poll given the previously seen address
pub fn next_event(previous: Option<&str>, current: Option<&str>) -> StatusEvent {
    match (previous, current) {
        (previous, Some(url)) if previous != Some(url) => StatusEvent::Ready {
            url: url.to_string(),
        },
        (Some(_), None) => StatusEvent::Removed,
        (_, current) => StatusEvent::Ping {
            url: current.map(str::to_string),
        },
    }
}

pub struct EventBridge {
    source: Arc<dyn SandboxStatusSource>,
    interval: Duration,
}

impl EventBridge {
    pub fn new(source: Arc<dyn SandboxStatusSource>, interval: Duration) -> Self {
        Self { source, interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Poll the project's status on a fixed interval. The first poll runs
    /// immediately; dropping the stream stops the timer.
    pub fn subscribe(&self, project_id: &str) -> impl Stream<Item = StatusEvent> + Send + 'static {
        let source = self.source.clone();
        let interval = self.interval;
        let project_id = project_id.to_string();

        async_stream::stream! {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut previous: Option<String> = None;

            loop {
                ticker.tick().await;
                match source.current_url(&project_id).await {
                    Ok(current) => {
                        let event = next_event(previous.as_deref(), current.as_deref());
                        if !matches!(event, StatusEvent::Ping { .. }) {
                            debug!(project_id = %project_id, "Sandbox status changed: {:?}", event);
                        }
                        previous = current;
                        yield event;
                    }
                    Err(e) => {
                        yield StatusEvent::Error { message: e.to_string() };
                    }
                }
            }
        }
    }
}
