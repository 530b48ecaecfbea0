// ABOUTME: Per-project sandbox registry handling provisioning, renewal and eviction
// ABOUTME: Serializes creation per project so concurrent callers share one instance

use crate::providers::{InstanceSpec, Provider, ProviderError};
use crate::settings::SandboxSettings;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("Invalid project ID '{project_id}': {reason}")]
    InvalidProjectId { project_id: String, reason: String },

    #[error("Sandbox unavailable for project {project_id}: {source}")]
    Unavailable {
        project_id: String,
        #[source]
        source: ProviderError,
    },
}

pub type Result<T> = std::result::Result<T, RegistryError>;

/// A live, addressable sandbox owned by one project
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SandboxHandle {
    pub project_id: String,
    pub instance_id: String,
    pub url: String,
    pub created_at: DateTime<Utc>,
    pub last_renewed_at: DateTime<Utc>,
    pub ttl_secs: u64,
}

/// The dev-server process tracked for a project
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessHandle {
    pub project_id: String,
    pub command_line: String,
    pub started_at: DateTime<Utc>,
    pub exit_code: Option<i64>,
}

struct TrackedProcess {
    handle: ProcessHandle,
    capture: Option<AbortHandle>,
}

impl TrackedProcess {
    fn stop_capture(&self) {
        if let Some(capture) = &self.capture {
            capture.abort();
        }
    }
}

/// Validate project ID to prevent path traversal and keep instance names sane
pub fn validate_project_id(project_id: &str) -> Result<()> {
    let invalid = |reason: &str| RegistryError::InvalidProjectId {
        project_id: project_id.to_string(),
        reason: reason.to_string(),
    };

    if project_id.is_empty() {
        return Err(invalid("Project ID cannot be empty"));
    }

    if project_id.len() > 64 {
        return Err(invalid("Project ID cannot be longer than 64 characters"));
    }

    if project_id.contains("..") || project_id.contains('/') || project_id.contains('\\') {
        return Err(invalid(
            "Project ID cannot contain path traversal sequences (.. / \\)",
        ));
    }

    if !project_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(invalid(
            "Project ID can only contain alphanumeric characters, hyphens, and underscores",
        ));
    }

    Ok(())
}

/// Owns the project to sandbox mapping for the lifetime of the service
pub struct SandboxRegistry {
    provider: Arc<dyn Provider>,
    settings: Arc<SandboxSettings>,
    handles: DashMap<String, SandboxHandle>,
    /// Single-flight guards for provisioning, one per project
    gates: DashMap<String, Arc<Mutex<()>>>,
    processes: DashMap<String, TrackedProcess>,
}

impl SandboxRegistry {
    pub fn new(provider: Arc<dyn Provider>, settings: Arc<SandboxSettings>) -> Self {
        Self {
            provider,
            settings,
            handles: DashMap::new(),
            gates: DashMap::new(),
            processes: DashMap::new(),
        }
    }

    pub fn provider(&self) -> &Arc<dyn Provider> {
        &self.provider
    }

    pub fn settings(&self) -> &Arc<SandboxSettings> {
        &self.settings
    }

    fn gate(&self, project_id: &str) -> Arc<Mutex<()>> {
        self.gates
            .entry(project_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Drop the project's gate unless another caller is holding or awaiting it.
    /// `gate` is the caller's own clone; the map holds the other reference.
    fn release_gate(&self, project_id: &str, gate: &Arc<Mutex<()>>) {
        self.gates.remove_if(project_id, |_, stored| {
            Arc::ptr_eq(stored, gate) && Arc::strong_count(stored) <= 2
        });
    }

    fn unavailable(project_id: &str, source: ProviderError) -> RegistryError {
        RegistryError::Unavailable {
            project_id: project_id.to_string(),
            source,
        }
    }

    /// Return the live handle for a project after renewing its keep-alive.
    /// A handle whose renewal fails is evicted and `None` is returned.
    pub async fn acquire(&self, project_id: &str) -> Result<Option<SandboxHandle>> {
        validate_project_id(project_id)?;

        let Some(current) = self.handles.get(project_id).map(|h| h.clone()) else {
            return Ok(None);
        };

        match self
            .provider
            .renew(&current.instance_id, self.settings.keep_alive_secs)
            .await
        {
            Ok(()) => {
                let renewed_at = Utc::now();
                let mut renewed = current.clone();
                renewed.last_renewed_at = renewed_at;
                if let Some(mut stored) = self.handles.get_mut(project_id) {
                    if stored.instance_id == current.instance_id {
                        stored.last_renewed_at = renewed_at;
                    }
                }
                Ok(Some(renewed))
            }
            Err(e) => {
                warn!(
                    project_id = %project_id,
                    instance_id = %current.instance_id,
                    "Sandbox renewal failed, evicting handle: {}", e
                );
                self.evict(project_id, &current.instance_id).await;
                Ok(None)
            }
        }
    }

    async fn evict(&self, project_id: &str, instance_id: &str) {
        let removed = self
            .handles
            .remove_if(project_id, |_, handle| handle.instance_id == instance_id);
        if removed.is_none() {
            return;
        }

        if let Some((_, process)) = self.processes.remove(project_id) {
            process.stop_capture();
        }

        if let Err(e) = self.provider.terminate(instance_id).await {
            debug!("Release of evicted instance {} failed: {}", instance_id, e);
        }
    }

    /// Provision a sandbox for the project. Concurrent calls for the same
    /// project converge on one instance; later callers adopt the stored handle.
    pub async fn create(&self, project_id: &str) -> Result<SandboxHandle> {
        self.create_inner(project_id).await.map(|(handle, _)| handle)
    }

    async fn create_inner(&self, project_id: &str) -> Result<(SandboxHandle, bool)> {
        validate_project_id(project_id)?;

        let gate = self.gate(project_id);
        let _guard = gate.lock().await;

        if let Some(existing) = self.handles.get(project_id).map(|h| h.clone()) {
            debug!(project_id = %project_id, "Adopting sandbox created concurrently");
            return Ok((existing, false));
        }

        match self.provision(project_id).await {
            Ok(handle) => {
                self.handles.insert(project_id.to_string(), handle.clone());
                Ok((handle, true))
            }
            Err(e) => {
                self.release_gate(project_id, &gate);
                Err(e)
            }
        }
    }

    async fn provision(&self, project_id: &str) -> Result<SandboxHandle> {
        let suffix = Uuid::new_v4().simple().to_string();
        let spec = InstanceSpec {
            name: format!(
                "{}-{}-{}",
                self.settings.instance_prefix,
                project_id.to_lowercase(),
                &suffix[..8]
            ),
            image: self.settings.image.clone(),
            resources: self.settings.resources.clone(),
            keep_alive_secs: self.settings.keep_alive_secs,
            ports: vec![self.settings.dev_port],
            labels: HashMap::from([("dappbox.project".to_string(), project_id.to_string())]),
        };

        info!(project_id = %project_id, "Provisioning sandbox {}", spec.name);

        let instance_id = self
            .provider
            .create_instance(&spec)
            .await
            .map_err(|e| Self::unavailable(project_id, e))?;

        let url = match self
            .provider
            .expose_port(&instance_id, self.settings.dev_port)
            .await
        {
            Ok(url) => url,
            Err(e) => {
                warn!(
                    project_id = %project_id,
                    "Could not address instance {}, releasing it: {}", instance_id, e
                );
                if let Err(cleanup) = self.provider.terminate(&instance_id).await {
                    warn!("Failed to release instance {}: {}", instance_id, cleanup);
                }
                return Err(Self::unavailable(project_id, e));
            }
        };

        let now = Utc::now();
        info!(project_id = %project_id, "Sandbox ready at {}", url);

        Ok(SandboxHandle {
            project_id: project_id.to_string(),
            instance_id,
            url,
            created_at: now,
            last_renewed_at: now,
            ttl_secs: self.settings.keep_alive_secs,
        })
    }

    /// Acquire the live sandbox or provision one. The flag reports whether
    /// this call provisioned it.
    pub async fn resolve(&self, project_id: &str) -> Result<(SandboxHandle, bool)> {
        if let Some(handle) = self.acquire(project_id).await? {
            return Ok((handle, false));
        }
        self.create_inner(project_id).await
    }

    /// Read-only lookup with no provider call
    pub fn peek(&self, project_id: &str) -> Option<SandboxHandle> {
        self.handles.get(project_id).map(|h| h.clone())
    }

    pub fn project_ids(&self) -> Vec<String> {
        self.handles.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Release the project's sandbox and forget its dev-server process.
    /// Returns whether a sandbox was registered.
    pub async fn terminate(&self, project_id: &str) -> Result<bool> {
        validate_project_id(project_id)?;

        let gate = self.gate(project_id);
        let _guard = gate.lock().await;

        if let Some((_, process)) = self.processes.remove(project_id) {
            process.stop_capture();
        }

        let Some((_, handle)) = self.handles.remove(project_id) else {
            debug!(project_id = %project_id, "Terminate requested for project without sandbox");
            self.release_gate(project_id, &gate);
            return Ok(false);
        };

        info!(project_id = %project_id, "Terminating sandbox {}", handle.instance_id);
        if let Err(e) = self.provider.terminate(&handle.instance_id).await {
            warn!(
                project_id = %project_id,
                "Provider failed to release instance {}: {}", handle.instance_id, e
            );
        }
        self.release_gate(project_id, &gate);
        Ok(true)
    }

    /// Terminate every sandbox; called when the service stops
    pub async fn shutdown(&self) {
        let projects = self.project_ids();
        if projects.is_empty() {
            return;
        }

        info!("Shutting down {} sandbox(es)", projects.len());
        for project_id in projects {
            if let Err(e) = self.terminate(&project_id).await {
                warn!("Failed to terminate sandbox for {}: {}", project_id, e);
            }
        }
    }

    /// Claim the dev-server slot for a project. Returns `None` while a
    /// process is running; a process that already exited gives up its slot.
    pub fn track_process(&self, project_id: &str, command_line: &str) -> Option<ProcessHandle> {
        use dashmap::mapref::entry::Entry;

        let handle = ProcessHandle {
            project_id: project_id.to_string(),
            command_line: command_line.to_string(),
            started_at: Utc::now(),
            exit_code: None,
        };
        let tracked = TrackedProcess {
            handle: handle.clone(),
            capture: None,
        };

        match self.processes.entry(project_id.to_string()) {
            Entry::Occupied(slot) if slot.get().handle.exit_code.is_none() => None,
            Entry::Occupied(mut slot) => {
                debug!(project_id = %project_id, "Replacing exited dev server");
                slot.get().stop_capture();
                slot.insert(tracked);
                Some(handle)
            }
            Entry::Vacant(slot) => {
                slot.insert(tracked);
                Some(handle)
            }
        }
    }

    /// Attach the task capturing the tracked process's output
    pub fn attach_capture(&self, project_id: &str, capture: AbortHandle) {
        match self.processes.get_mut(project_id) {
            Some(mut tracked) => tracked.capture = Some(capture),
            None => capture.abort(),
        }
    }

    pub fn process(&self, project_id: &str) -> Option<ProcessHandle> {
        self.processes
            .get(project_id)
            .map(|tracked| tracked.handle.clone())
    }

    /// Whether a process is tracked, running or exited
    pub fn has_process(&self, project_id: &str) -> bool {
        self.processes.contains_key(project_id)
    }

    /// Whether a tracked process has not reported an exit code yet
    pub fn is_process_running(&self, project_id: &str) -> bool {
        self.processes
            .get(project_id)
            .is_some_and(|tracked| tracked.handle.exit_code.is_none())
    }

    /// Record the exit code of the tracked process
    pub fn finish_process(&self, project_id: &str, exit_code: i64) {
        if let Some(mut tracked) = self.processes.get_mut(project_id) {
            tracked.handle.exit_code = Some(exit_code);
        }
    }

    /// Forget the tracked process and stop capturing its output
    pub fn untrack_process(&self, project_id: &str) -> Option<ProcessHandle> {
        self.processes.remove(project_id).map(|(_, tracked)| {
            tracked.stop_capture();
            tracked.handle
        })
    }
}
