// ABOUTME: Shell command execution inside project sandboxes
// ABOUTME: Supports collect-and-return runs and live event streams of process output

use crate::providers::{ExecProcess, ExecResult, OutputReader, Provider, ProviderError, StreamType};
use crate::registry::{RegistryError, SandboxHandle, SandboxRegistry};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, info, warn};

/// Buffered events per stream before the driver waits on the client
const STREAM_BUFFER: usize = 64;

#[derive(Error, Debug)]
pub enum CommandError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Command cannot be empty")]
    EmptyCommand,

    #[error("Failed to prepare {path}: {message}")]
    Prepare { path: String, message: String },

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),
}

pub type Result<T> = std::result::Result<T, CommandError>;

/// Output of a finished command. A non-zero exit code is data, not an error.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i64,
}

impl From<ExecResult> for CommandOutput {
    fn from(result: ExecResult) -> Self {
        Self {
            stdout: result.stdout_lossy(),
            stderr: result.stderr_lossy(),
            exit_code: result.exit_code,
        }
    }
}

/// Events of a streamed command. `Start` comes first; `Done` or `Error` last.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CommandEvent {
    Start { command: String },
    Log { stream: StreamType, chunk: String },
    Done { exit_code: i64 },
    Error { message: String },
}

/// Quote a value for POSIX sh
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[derive(Clone)]
pub struct CommandChannel {
    registry: Arc<SandboxRegistry>,
}

impl CommandChannel {
    pub fn new(registry: Arc<SandboxRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<SandboxRegistry> {
        &self.registry
    }

    fn provider(&self) -> &Arc<dyn Provider> {
        self.registry.provider()
    }

    fn validate(command: &str) -> Result<()> {
        if command.trim().is_empty() {
            return Err(CommandError::EmptyCommand);
        }
        Ok(())
    }

    /// `sh -c "cd <root> && <command>"`
    pub fn shell_argv(&self, command: &str) -> Vec<String> {
        vec![
            "sh".to_string(),
            "-c".to_string(),
            format!(
                "cd {} && {}",
                shell_quote(&self.registry.settings().code_root),
                command
            ),
        ]
    }

    /// Run a command in the project's code root and collect its output
    pub async fn run(&self, project_id: &str, command: &str) -> Result<CommandOutput> {
        Self::validate(command)?;
        let (handle, _) = self.registry.resolve(project_id).await?;
        self.run_in(&handle, command).await
    }

    /// Like [`CommandChannel::run`] against an already resolved sandbox
    pub async fn run_in(&self, handle: &SandboxHandle, command: &str) -> Result<CommandOutput> {
        Self::validate(command)?;
        self.ensure_code_root(handle).await?;

        debug!(project_id = %handle.project_id, "Running command: {}", command);
        let result = self
            .provider()
            .exec(&handle.instance_id, self.shell_argv(command))
            .await?
            .collect()
            .await?;

        Ok(result.into())
    }

    /// Execute an argument vector without a shell
    pub async fn exec_argv(&self, handle: &SandboxHandle, argv: Vec<String>) -> Result<ExecResult> {
        Ok(self
            .provider()
            .exec(&handle.instance_id, argv)
            .await?
            .collect()
            .await?)
    }

    pub async fn ensure_code_root(&self, handle: &SandboxHandle) -> Result<()> {
        let root = self.registry.settings().code_root.clone();
        self.ensure_dir(handle, &root).await
    }

    /// Stat the directory and create it on a miss
    pub async fn ensure_dir(&self, handle: &SandboxHandle, dir: &str) -> Result<()> {
        match self.provider().stat_file(&handle.instance_id, dir).await {
            Ok(stat) if stat.is_dir => return Ok(()),
            Ok(_) => {
                return Err(CommandError::Prepare {
                    path: dir.to_string(),
                    message: "path exists and is not a directory".to_string(),
                })
            }
            Err(e) => debug!("Directory {} missing ({}), creating it", dir, e),
        }

        let argv = vec!["mkdir".to_string(), "-p".to_string(), dir.to_string()];
        let result = self.exec_argv(handle, argv).await?;
        if !result.success() {
            return Err(CommandError::Prepare {
                path: dir.to_string(),
                message: result.stderr_lossy().trim().to_string(),
            });
        }
        Ok(())
    }

    /// Start a command and stream its events.
    ///
    /// Resolving the sandbox happens before the stream is returned, so a
    /// missing sandbox is an ordinary error. Anything failing afterwards is
    /// delivered as a final [`CommandEvent::Error`]. Dropping the stream stops
    /// the draining tasks; the remote process keeps running.
    pub async fn stream(
        &self,
        project_id: &str,
        command: &str,
    ) -> Result<ReceiverStream<CommandEvent>> {
        Self::validate(command)?;
        let (handle, created) = self.registry.resolve(project_id).await?;

        let (tx, rx) = mpsc::channel(STREAM_BUFFER);
        let channel = self.clone();
        let command = command.to_string();

        tokio::spawn(async move {
            tokio::select! {
                _ = tx.closed() => {
                    debug!(project_id = %handle.project_id, "Command stream dropped by client");
                }
                _ = channel.drive(&handle, &command, created, &tx) => {}
            }
        });

        Ok(ReceiverStream::new(rx))
    }

    async fn drive(
        &self,
        handle: &SandboxHandle,
        command: &str,
        created: bool,
        tx: &mpsc::Sender<CommandEvent>,
    ) {
        let start = CommandEvent::Start {
            command: command.to_string(),
        };
        if tx.send(start).await.is_err() {
            return;
        }

        let outcome = self.pump(handle, command, created, tx).await;
        let last = match outcome {
            Ok(exit_code) => {
                info!(
                    project_id = %handle.project_id,
                    "Streamed command finished with exit code {}", exit_code
                );
                CommandEvent::Done { exit_code }
            }
            Err(e) => {
                warn!(project_id = %handle.project_id, "Streamed command failed: {}", e);
                CommandEvent::Error {
                    message: e.to_string(),
                }
            }
        };
        let _ = tx.send(last).await;
    }

    async fn pump(
        &self,
        handle: &SandboxHandle,
        command: &str,
        created: bool,
        tx: &mpsc::Sender<CommandEvent>,
    ) -> Result<i64> {
        let settle = self.registry.settings().settle_delay;
        if created && !settle.is_zero() {
            debug!("Waiting {:?} for new sandbox to settle", settle);
            tokio::time::sleep(settle).await;
        }

        self.ensure_code_root(handle).await?;

        let ExecProcess {
            stdout,
            stderr,
            exit,
        } = self
            .provider()
            .exec(&handle.instance_id, self.shell_argv(command))
            .await?;

        let (_, _, exit_code) = tokio::try_join!(
            forward(stdout, StreamType::Stdout, tx),
            forward(stderr, StreamType::Stderr, tx),
            async { exit.wait().await.map_err(CommandError::from) },
        )?;

        Ok(exit_code)
    }
}

async fn forward(
    mut reader: OutputReader,
    stream: StreamType,
    tx: &mpsc::Sender<CommandEvent>,
) -> Result<()> {
    while let Some(chunk) = reader.read().await {
        let chunk = chunk?;
        let event = CommandEvent::Log {
            stream,
            chunk: String::from_utf8_lossy(&chunk).into_owned(),
        };
        if tx.send(event).await.is_err() {
            break;
        }
    }
    Ok(())
}
