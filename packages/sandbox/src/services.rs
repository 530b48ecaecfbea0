// ABOUTME: Wires one sandbox registry into every sandbox component
// ABOUTME: Owned by the server process and shared with request handlers

use crate::bootstrap::ProjectBootstrapper;
use crate::command::CommandChannel;
use crate::dev_server::DevServerSupervisor;
use crate::events::{EventBridge, RegistryStatusSource};
use crate::git::GitCheckpointController;
use crate::providers::Provider;
use crate::registry::{self, SandboxRegistry};
use crate::settings::SandboxSettings;
use crate::sync::FileSyncEngine;
use std::sync::Arc;
use tracing::info;

pub struct SandboxServices {
    pub registry: Arc<SandboxRegistry>,
    pub commands: CommandChannel,
    pub dev_server: Arc<DevServerSupervisor>,
    pub sync: Arc<FileSyncEngine>,
    pub events: EventBridge,
    pub git: GitCheckpointController,
    pub bootstrap: ProjectBootstrapper,
}

impl SandboxServices {
    pub fn new(provider: Arc<dyn Provider>, settings: SandboxSettings) -> Self {
        let poll_interval = settings.event_poll_interval;
        let registry = Arc::new(SandboxRegistry::new(provider, Arc::new(settings)));
        let commands = CommandChannel::new(registry.clone());
        let dev_server = Arc::new(DevServerSupervisor::new(commands.clone()));
        let sync = Arc::new(FileSyncEngine::new(commands.clone(), dev_server.clone()));
        let events = EventBridge::new(
            Arc::new(RegistryStatusSource::new(registry.clone())),
            poll_interval,
        );
        let git = GitCheckpointController::new(commands.clone());
        let bootstrap = ProjectBootstrapper::new(commands.clone(), sync.clone());

        info!(
            "Sandbox services ready (provider: {})",
            registry.provider().name()
        );

        Self {
            registry,
            commands,
            dev_server,
            sync,
            events,
            git,
            bootstrap,
        }
    }

    /// Terminate the project's sandbox and drop its logs
    pub async fn terminate(&self, project_id: &str) -> registry::Result<bool> {
        let terminated = self.registry.terminate(project_id).await?;
        self.dev_server.forget(project_id).await;
        Ok(terminated)
    }

    /// Terminate every sandbox; called once on server shutdown
    pub async fn shutdown(&self) {
        for project_id in self.registry.project_ids() {
            self.dev_server.forget(&project_id).await;
        }
        self.registry.shutdown().await;
    }
}
