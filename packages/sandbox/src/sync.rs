// ABOUTME: Bidirectional file sync between client project state and the sandbox code root
// ABOUTME: Handles path mapping, staged uploads, tree downloads, cursor pagination and manifests

use crate::command::{CommandChannel, CommandError};
use crate::dev_server::DevServerSupervisor;
use crate::manifest::{diff_manifests, Manifest, ManifestDiff, ManifestEntry};
use crate::providers::{Provider, ProviderError};
use crate::registry::{RegistryError, SandboxHandle};
use crate::settings::SandboxSettings;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Invalid path '{path}': {reason}")]
    InvalidPath { path: String, reason: String },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("Staging error: {0}")]
    Staging(#[from] std::io::Error),

    #[error("No active sandbox for project {0}")]
    NoSandbox(String),
}

pub type Result<T> = std::result::Result<T, SyncError>;

/// Outcome of the best-effort dev server start after an upload
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AutoStart {
    Skipped,
    Started { url: String },
    Failed { message: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadReport {
    pub files_uploaded: usize,
    pub auto_start: AutoStart,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncedFile {
    pub path: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncEntry {
    pub path: String,
    pub encoding: &'static str,
    pub size_bytes: u64,
    pub content: String,
}

/// One window of a sorted listing
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncPage {
    pub entries: Vec<SyncEntry>,
    pub cursor: Option<String>,
    pub has_more: bool,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncChanges {
    #[serde(flatten)]
    pub diff: ManifestDiff,
    pub manifest: Manifest,
}

/// Maps between client paths (`/dapp/...` or relative) and sandbox paths
#[derive(Debug, Clone)]
pub struct PathMapper {
    code_root: String,
    client_prefix: String,
}

impl PathMapper {
    pub fn new(settings: &SandboxSettings) -> Self {
        Self {
            code_root: settings.code_root.trim_end_matches('/').to_string(),
            client_prefix: settings.client_prefix.trim_end_matches('/').to_string(),
        }
    }

    fn invalid(path: &str, reason: &str) -> SyncError {
        SyncError::InvalidPath {
            path: path.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Place a client path under the code root. The client prefix is
    /// swapped for the root; any other path is treated as root-relative.
    pub fn to_sandbox(&self, client_path: &str) -> Result<String> {
        let trimmed = client_path.trim();
        if trimmed.is_empty() {
            return Err(Self::invalid(client_path, "path cannot be empty"));
        }
        if trimmed.contains('\0') {
            return Err(Self::invalid(client_path, "path cannot contain NUL bytes"));
        }
        if trimmed.split(['/', '\\']).any(|segment| segment == "..") {
            return Err(Self::invalid(client_path, "path cannot contain '..' segments"));
        }

        let relative = if trimmed == self.client_prefix {
            ""
        } else if let Some(rest) = trimmed
            .strip_prefix(&self.client_prefix)
            .filter(|rest| rest.starts_with('/'))
        {
            rest
        } else {
            trimmed
        };

        let relative = relative.trim_matches('/');
        if relative.is_empty() {
            Ok(self.code_root.clone())
        } else {
            Ok(format!("{}/{}", self.code_root, relative))
        }
    }

    /// Inverse of [`PathMapper::to_sandbox`] for paths under the code root
    pub fn to_client(&self, sandbox_path: &str) -> String {
        match sandbox_path
            .strip_prefix(&self.code_root)
            .filter(|rest| rest.starts_with('/'))
        {
            Some(rest) => format!("{}{}", self.client_prefix, rest),
            None => sandbox_path.to_string(),
        }
    }
}

fn parent_dir(path: &str) -> Option<&str> {
    path.rsplit_once('/')
        .map(|(parent, _)| parent)
        .filter(|parent| !parent.is_empty())
}

pub struct FileSyncEngine {
    commands: CommandChannel,
    dev_server: Arc<DevServerSupervisor>,
    mapper: PathMapper,
}

impl FileSyncEngine {
    pub fn new(commands: CommandChannel, dev_server: Arc<DevServerSupervisor>) -> Self {
        let mapper = PathMapper::new(commands.registry().settings());
        Self {
            commands,
            dev_server,
            mapper,
        }
    }

    pub fn mapper(&self) -> &PathMapper {
        &self.mapper
    }

    fn provider(&self) -> &Arc<dyn Provider> {
        self.commands.registry().provider()
    }

    fn settings(&self) -> &SandboxSettings {
        self.commands.registry().settings()
    }

    /// Write files into the sandbox, then optionally start the dev server.
    /// Every path is validated before the sandbox is touched.
    pub async fn upload(
        &self,
        project_id: &str,
        files: &BTreeMap<String, String>,
        auto_start: bool,
    ) -> Result<UploadReport> {
        let targets = files
            .iter()
            .map(|(path, content)| Ok((self.mapper.to_sandbox(path)?, content)))
            .collect::<Result<Vec<_>>>()?;

        let (handle, _) = self.commands.registry().resolve(project_id).await?;
        let mut ensured: HashSet<String> = HashSet::new();

        for (remote_path, content) in &targets {
            if let Some(parent) = parent_dir(remote_path) {
                if !ensured.contains(parent) {
                    self.commands.ensure_dir(&handle, parent).await?;
                    ensured.insert(parent.to_string());
                }
            }

            let staging = tempfile::NamedTempFile::new()?;
            tokio::fs::write(staging.path(), content.as_bytes()).await?;
            self.provider()
                .upload_file(&handle.instance_id, staging.path(), remote_path)
                .await?;
            debug!("Uploaded {} ({} bytes)", remote_path, content.len());
        }

        info!(
            project_id = %project_id,
            "Uploaded {} file(s) to sandbox", targets.len()
        );

        let running = self.commands.registry().is_process_running(project_id);
        let auto_start = if auto_start && !running {
            match self.dev_server.start(project_id).await {
                Ok(status) => AutoStart::Started { url: status.url },
                Err(e) => {
                    warn!(project_id = %project_id, "Auto-start after upload failed: {}", e);
                    AutoStart::Failed {
                        message: e.to_string(),
                    }
                }
            }
        } else {
            AutoStart::Skipped
        };

        Ok(UploadReport {
            files_uploaded: targets.len(),
            auto_start,
        })
    }

    fn root_path(&self, root: Option<&str>) -> Result<String> {
        match root {
            Some(path) if !path.trim().is_empty() => self.mapper.to_sandbox(path),
            _ => Ok(self.settings().code_root.clone()),
        }
    }

    /// Regular files under `root`, skipping excluded directories, sorted
    async fn list_files(&self, handle: &SandboxHandle, root: &str) -> Result<Vec<String>> {
        let mut argv = vec![
            "find".to_string(),
            root.to_string(),
            "-type".to_string(),
            "f".to_string(),
        ];
        for dir in &self.settings().excluded_dirs {
            argv.push("-not".to_string());
            argv.push("-path".to_string());
            argv.push(format!("*/{}/*", dir));
        }

        let result = self.commands.exec_argv(handle, argv).await?;
        if !result.success() {
            warn!(
                "find under {} exited with {}: {}",
                root,
                result.exit_code,
                result.stderr_lossy().trim()
            );
        }

        let mut paths: Vec<String> = result
            .stdout_lossy()
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();
        paths.sort();
        paths.dedup();
        Ok(paths)
    }

    async fn read_file(&self, handle: &SandboxHandle, remote_path: &str) -> Result<Vec<u8>> {
        let staging = tempfile::NamedTempFile::new()?;
        self.provider()
            .download_file(&handle.instance_id, remote_path, staging.path())
            .await?;
        Ok(tokio::fs::read(staging.path()).await?)
    }

    /// Sorted client paths of every file under `root`. Never provisions.
    async fn client_listing(
        &self,
        project_id: &str,
        root: Option<&str>,
    ) -> Result<(SandboxHandle, Vec<(String, String)>)> {
        let root = self.root_path(root)?;
        let handle = self
            .commands
            .registry()
            .acquire(project_id)
            .await?
            .ok_or_else(|| SyncError::NoSandbox(project_id.to_string()))?;

        let mut listing: Vec<(String, String)> = self
            .list_files(&handle, &root)
            .await?
            .into_iter()
            .map(|remote| (self.mapper.to_client(&remote), remote))
            .collect();
        listing.sort();
        Ok((handle, listing))
    }

    /// Download every text file under `root`. Files that cannot be read or
    /// are not UTF-8 are logged and skipped.
    pub async fn download(&self, project_id: &str, root: Option<&str>) -> Result<Vec<SyncedFile>> {
        let (handle, listing) = self.client_listing(project_id, root).await?;

        let mut files = Vec::with_capacity(listing.len());
        for (client_path, remote_path) in listing {
            match self.read_file(&handle, &remote_path).await {
                Ok(bytes) => match String::from_utf8(bytes) {
                    Ok(content) => files.push(SyncedFile {
                        path: client_path,
                        content,
                    }),
                    Err(_) => debug!("Skipping binary file {}", remote_path),
                },
                Err(e) => warn!("Skipping {}: {}", remote_path, e),
            }
        }

        info!(project_id = %project_id, "Downloaded {} file(s)", files.len());
        Ok(files)
    }

    /// Download one page of the sorted listing, starting after `cursor`.
    /// Only the files of the page are transferred.
    pub async fn download_paged(
        &self,
        project_id: &str,
        root: Option<&str>,
        cursor: Option<&str>,
        limit: Option<usize>,
    ) -> Result<SyncPage> {
        let limit = self.settings().page_limit(limit);
        let (handle, listing) = self.client_listing(project_id, root).await?;

        let start = match cursor {
            Some(cursor) => listing.partition_point(|(path, _)| path.as_str() <= cursor),
            None => 0,
        };
        let end = (start + limit).min(listing.len());
        let window = &listing[start..end];

        let mut entries = Vec::with_capacity(window.len());
        for (client_path, remote_path) in window {
            match self.read_file(&handle, remote_path).await {
                Ok(bytes) => entries.push(SyncEntry {
                    path: client_path.clone(),
                    encoding: "base64",
                    size_bytes: bytes.len() as u64,
                    content: BASE64.encode(&bytes),
                }),
                Err(e) => warn!("Skipping {}: {}", remote_path, e),
            }
        }

        Ok(SyncPage {
            entries,
            cursor: window.last().map(|(path, _)| path.clone()),
            has_more: end < listing.len(),
            total: listing.len(),
        })
    }

    /// Fingerprint every file under `root`
    pub async fn manifest(&self, project_id: &str, root: Option<&str>) -> Result<Manifest> {
        let (handle, listing) = self.client_listing(project_id, root).await?;

        let mut manifest = Manifest::new();
        for (client_path, remote_path) in listing {
            match self.read_file(&handle, &remote_path).await {
                Ok(bytes) => manifest.insert(ManifestEntry::from_content(client_path, &bytes)),
                Err(e) => warn!("Skipping {}: {}", remote_path, e),
            }
        }
        Ok(manifest)
    }

    /// Diff the current tree against a snapshot the caller already holds
    pub async fn changes(
        &self,
        project_id: &str,
        root: Option<&str>,
        previous: &Manifest,
    ) -> Result<SyncChanges> {
        let manifest = self.manifest(project_id, root).await?;
        let diff = diff_manifests(&manifest, previous);
        Ok(SyncChanges { diff, manifest })
    }
}
