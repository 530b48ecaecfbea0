// ABOUTME: Control plane for per-project ephemeral development sandboxes
// ABOUTME: Provider abstraction, registry, command/file/event channels, dev server and git checkpoints

pub mod bootstrap;
pub mod command;
pub mod dev_server;
pub mod events;
pub mod git;
pub mod manifest;
pub mod providers;
pub mod registry;
pub mod services;
pub mod settings;
pub mod sync;

pub use bootstrap::{BootstrapError, BootstrapOptions, ProjectBootstrapper};
pub use command::{CommandChannel, CommandError, CommandEvent, CommandOutput};
pub use dev_server::{DevServerError, DevServerLog, DevServerStatus, DevServerSupervisor, LogType};
pub use events::{EventBridge, RegistryStatusSource, SandboxStatusSource, StatusError, StatusEvent};
pub use git::{Checkpoint, GitCheckpointController, GitError, RepoStatus};
pub use manifest::{diff_manifests, Manifest, ManifestDiff, ManifestEntry};
pub use providers::{
    DockerProvider, MemoryProvider, Provider as SandboxProvider, ProviderError, StreamType,
};
pub use registry::{validate_project_id, RegistryError, SandboxHandle, SandboxRegistry};
pub use services::SandboxServices;
pub use settings::{SandboxSettings, SettingsError};
pub use sync::{AutoStart, FileSyncEngine, SyncError, SyncPage, SyncedFile, UploadReport};
