// ABOUTME: Provider trait and implementations for remote sandbox backends
// ABOUTME: Defines the instance, exec and file-transfer primitives the registry builds on

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

pub mod docker;
pub mod memory;

pub use docker::DockerProvider;
pub use memory::{MemoryProvider, ScriptedCommand};

#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("Container error: {0}")]
    ContainerError(String),

    #[error("Image error: {0}")]
    ImageError(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Provider not available: {0}")]
    NotAvailable(String),

    #[error("Instance not found: {0}")]
    NotFound(String),

    #[error("Instance expired: {0}")]
    Expired(String),

    #[error("File error: {0}")]
    FileError(String),

    #[error("Stream error: {0}")]
    StreamError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

pub type Result<T> = std::result::Result<T, ProviderError>;

/// Base image plus the commands that prepare it for a project
#[derive(Debug, Clone, PartialEq)]
pub struct ImageSpec {
    pub base: String,
    pub commands: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResourceSpec {
    pub cpu: f32,
    pub memory_mb: u64,
}

/// Everything a provider needs to provision one sandbox instance
#[derive(Debug, Clone)]
pub struct InstanceSpec {
    pub name: String,
    pub image: ImageSpec,
    pub resources: ResourceSpec,
    pub keep_alive_secs: u64,
    pub ports: Vec<u16>,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub is_dir: bool,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamType {
    Stdout,
    Stderr,
}

impl StreamType {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamType::Stdout => "stdout",
            StreamType::Stderr => "stderr",
        }
    }
}

/// Fully collected output of a finished process
#[derive(Debug, Clone, PartialEq)]
pub struct ExecResult {
    pub exit_code: i64,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ExecResult {
    pub fn stdout_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_lossy(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// One output pipe of a running process. Each read yields the next chunk
/// in FIFO order; `None` means the pipe closed.
pub struct OutputReader {
    receiver: mpsc::UnboundedReceiver<Result<Vec<u8>>>,
}

impl OutputReader {
    pub async fn read(&mut self) -> Option<Result<Vec<u8>>> {
        self.receiver.recv().await
    }

    pub async fn read_to_end(mut self) -> Result<Vec<u8>> {
        let mut data = Vec::new();
        while let Some(chunk) = self.read().await {
            data.extend_from_slice(&chunk?);
        }
        Ok(data)
    }
}

/// Resolves once the process exits
pub struct ExitWaiter {
    receiver: oneshot::Receiver<Result<i64>>,
}

impl ExitWaiter {
    pub async fn wait(self) -> Result<i64> {
        match self.receiver.await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::StreamError(
                "Process ended without reporting an exit code".to_string(),
            )),
        }
    }
}

/// A process started inside a sandbox
pub struct ExecProcess {
    pub stdout: OutputReader,
    pub stderr: OutputReader,
    pub exit: ExitWaiter,
}

impl ExecProcess {
    /// Create a process handle together with the sink its backend writes into
    pub fn channel() -> (ExecSink, ExecProcess) {
        let (stdout_tx, stdout_rx) = mpsc::unbounded_channel();
        let (stderr_tx, stderr_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();

        let sink = ExecSink {
            stdout: stdout_tx,
            stderr: stderr_tx,
            exit: exit_tx,
        };
        let process = ExecProcess {
            stdout: OutputReader {
                receiver: stdout_rx,
            },
            stderr: OutputReader {
                receiver: stderr_rx,
            },
            exit: ExitWaiter { receiver: exit_rx },
        };

        (sink, process)
    }

    /// Wait for exit and collect both pipes in full
    pub async fn collect(self) -> Result<ExecResult> {
        let (stdout, stderr, exit_code) = tokio::try_join!(
            self.stdout.read_to_end(),
            self.stderr.read_to_end(),
            self.exit.wait()
        )?;

        Ok(ExecResult {
            exit_code,
            stdout,
            stderr,
        })
    }
}

/// Backend side of an [`ExecProcess`]
pub struct ExecSink {
    stdout: mpsc::UnboundedSender<Result<Vec<u8>>>,
    stderr: mpsc::UnboundedSender<Result<Vec<u8>>>,
    exit: oneshot::Sender<Result<i64>>,
}

impl ExecSink {
    /// Push a chunk; returns false once the reader side is gone
    pub fn send(&self, stream: StreamType, data: Vec<u8>) -> bool {
        let sender = match stream {
            StreamType::Stdout => &self.stdout,
            StreamType::Stderr => &self.stderr,
        };
        sender.send(Ok(data)).is_ok()
    }

    /// Whether any reader of the process is still alive
    pub fn is_attached(&self) -> bool {
        !self.stdout.is_closed() || !self.stderr.is_closed() || !self.exit.is_closed()
    }

    /// Report a read failure on one pipe and abandon the process
    pub fn fail(self, stream: StreamType, error: ProviderError) {
        let sender = match stream {
            StreamType::Stdout => &self.stdout,
            StreamType::Stderr => &self.stderr,
        };
        let _ = sender.send(Err(error));
    }

    /// Close both pipes and publish the exit code
    pub fn finish(self, exit_code: i64) {
        let ExecSink {
            stdout,
            stderr,
            exit,
        } = self;
        drop(stdout);
        drop(stderr);
        let _ = exit.send(Ok(exit_code));
    }
}

/// Provider trait for remote sandbox backends
#[async_trait]
pub trait Provider: Send + Sync {
    /// Short backend name used in logs and API responses
    fn name(&self) -> &str;

    /// Check if the provider is reachable and configured correctly
    async fn is_available(&self) -> Result<bool>;

    /// Provision a new instance, returning its opaque reference
    async fn create_instance(&self, spec: &InstanceSpec) -> Result<String>;

    /// Publish a port of the instance and return its public URL
    async fn expose_port(&self, instance_id: &str, port: u16) -> Result<String>;

    /// Refresh the keep-alive window of an instance
    async fn renew(&self, instance_id: &str, keep_alive_secs: u64) -> Result<()>;

    /// Start a process from an argument vector
    async fn exec(&self, instance_id: &str, argv: Vec<String>) -> Result<ExecProcess>;

    async fn stat_file(&self, instance_id: &str, path: &str) -> Result<FileStat>;

    async fn upload_file(&self, instance_id: &str, local_path: &Path, remote_path: &str)
        -> Result<()>;

    async fn download_file(
        &self,
        instance_id: &str,
        remote_path: &str,
        local_path: &Path,
    ) -> Result<()>;

    /// Release the instance. Releasing an unknown instance is not an error.
    async fn terminate(&self, instance_id: &str) -> Result<()>;
}
