// ABOUTME: Dev server lifecycle inside project sandboxes with log capture
// ABOUTME: Keeps a bounded per-project log buffer and fans new lines out to live subscribers

use crate::command::{shell_quote, CommandChannel, CommandError};
use crate::providers::{ExecProcess, OutputReader, ProviderError};
use crate::registry::{validate_project_id, ProcessHandle, RegistryError, SandboxHandle};
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

const LIVE_CHANNEL_CAPACITY: usize = 256;

pub const NO_PROCESS_MESSAGE: &str = "No active process found. Start the dev server first.";
pub const NO_LOGS_MESSAGE: &str = "No logs available yet.";

#[derive(Error, Debug)]
pub enum DevServerError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("Provider error: {0}")]
    Provider(#[from] ProviderError),

    #[error("No active sandbox for project {0}")]
    NoSandbox(String),
}

pub type Result<T> = std::result::Result<T, DevServerError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogType {
    Stdout,
    Stderr,
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DevServerLog {
    pub timestamp: DateTime<Utc>,
    pub log_type: LogType,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DevServerStatus {
    pub url: String,
    pub process: ProcessHandle,
    pub already_running: bool,
}

/// Per-project log buffers plus live broadcast channels
#[derive(Clone)]
struct LogBook {
    logs: Arc<RwLock<HashMap<String, VecDeque<DevServerLog>>>>,
    live: Arc<RwLock<HashMap<String, broadcast::Sender<DevServerLog>>>>,
    capacity: usize,
}

impl LogBook {
    fn new(capacity: usize) -> Self {
        Self {
            logs: Arc::new(RwLock::new(HashMap::new())),
            live: Arc::new(RwLock::new(HashMap::new())),
            capacity,
        }
    }

    async fn add_log(&self, project_id: &str, log_type: LogType, message: String) {
        let log_entry = DevServerLog {
            timestamp: Utc::now(),
            log_type,
            message,
        };

        // Publish under the buffer lock; subscribe() snapshots under it too
        let mut logs = self.logs.write().await;
        let project_logs = logs
            .entry(project_id.to_string())
            .or_insert_with(VecDeque::new);

        project_logs.push_back(log_entry.clone());
        while project_logs.len() > self.capacity {
            project_logs.pop_front();
        }

        if let Some(sender) = self.live.read().await.get(project_id) {
            let _ = sender.send(log_entry);
        }
    }

    async fn recent(&self, project_id: &str, lines: usize) -> Vec<DevServerLog> {
        let logs = self.logs.read().await;
        logs.get(project_id)
            .map(|entries| {
                let skip = entries.len().saturating_sub(lines);
                entries.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }

    async fn open_live(&self, project_id: &str) {
        let mut live = self.live.write().await;
        live.entry(project_id.to_string())
            .or_insert_with(|| broadcast::channel(LIVE_CHANNEL_CAPACITY).0);
    }

    async fn close_live(&self, project_id: &str) {
        self.live.write().await.remove(project_id);
    }

    async fn subscribe(
        &self,
        project_id: &str,
    ) -> (Vec<DevServerLog>, Option<broadcast::Receiver<DevServerLog>>) {
        let logs = self.logs.read().await;
        let backlog = logs
            .get(project_id)
            .map(|entries| entries.iter().cloned().collect())
            .unwrap_or_default();
        let receiver = self
            .live
            .read()
            .await
            .get(project_id)
            .map(|sender| sender.subscribe());
        (backlog, receiver)
    }

    async fn forget(&self, project_id: &str) {
        self.logs.write().await.remove(project_id);
        self.close_live(project_id).await;
    }
}

async fn capture_lines(
    mut reader: OutputReader,
    log_type: LogType,
    logbook: &LogBook,
    project_id: &str,
) {
    let mut pending = String::new();
    while let Some(chunk) = reader.read().await {
        match chunk {
            Ok(bytes) => {
                pending.push_str(&String::from_utf8_lossy(&bytes));
                while let Some(newline) = pending.find('\n') {
                    let line: String = pending.drain(..=newline).collect();
                    let line = line.trim_end_matches(['\n', '\r']);
                    if !line.is_empty() {
                        logbook.add_log(project_id, log_type, line.to_string()).await;
                    }
                }
            }
            Err(e) => {
                logbook
                    .add_log(project_id, LogType::System, format!("Output stream failed: {}", e))
                    .await;
                break;
            }
        }
    }

    if !pending.trim().is_empty() {
        logbook
            .add_log(project_id, log_type, pending.trim_end().to_string())
            .await;
    }
}

/// Starts, stops and tails the single dev server of each project
pub struct DevServerSupervisor {
    commands: CommandChannel,
    logbook: LogBook,
}

impl DevServerSupervisor {
    pub fn new(commands: CommandChannel) -> Self {
        let capacity = commands.registry().settings().log_buffer_lines;
        Self {
            commands,
            logbook: LogBook::new(capacity),
        }
    }

    /// Start the dev server in the project's live sandbox unless one is
    /// already running. Dependencies are installed first when the project
    /// has a package.json.
    pub async fn start(&self, project_id: &str) -> Result<DevServerStatus> {
        let registry = self.commands.registry();
        let handle = registry
            .acquire(project_id)
            .await?
            .ok_or_else(|| DevServerError::NoSandbox(project_id.to_string()))?;
        let dev_command = registry.settings().dev_command.clone();

        let Some(process) = registry.track_process(project_id, &dev_command) else {
            debug!(project_id = %project_id, "Dev server already tracked");
            let process = registry.process(project_id).ok_or_else(|| {
                ProviderError::InternalError("Dev server vanished while starting".to_string())
            })?;
            return Ok(DevServerStatus {
                url: handle.url,
                process,
                already_running: true,
            });
        };

        self.logbook.open_live(project_id).await;
        self.logbook
            .add_log(
                project_id,
                LogType::System,
                format!("Starting dev server: {}", dev_command),
            )
            .await;

        let exec = match self.launch(&handle, &dev_command).await {
            Ok(exec) => exec,
            Err(e) => {
                registry.untrack_process(project_id);
                self.logbook
                    .add_log(
                        project_id,
                        LogType::System,
                        format!("Dev server failed to start: {}", e),
                    )
                    .await;
                self.logbook.close_live(project_id).await;
                return Err(e);
            }
        };

        let logbook = self.logbook.clone();
        let task_registry = registry.clone();
        let task_project = project_id.to_string();
        let capture = tokio::spawn(async move {
            let ExecProcess {
                stdout,
                stderr,
                exit,
            } = exec;
            tokio::join!(
                capture_lines(stdout, LogType::Stdout, &logbook, &task_project),
                capture_lines(stderr, LogType::Stderr, &logbook, &task_project),
            );

            let exit_code = match exit.wait().await {
                Ok(code) => {
                    logbook
                        .add_log(
                            &task_project,
                            LogType::System,
                            format!("Dev server exited with code {}", code),
                        )
                        .await;
                    Some(code)
                }
                Err(e) => {
                    logbook
                        .add_log(
                            &task_project,
                            LogType::System,
                            format!("Lost track of dev server: {}", e),
                        )
                        .await;
                    None
                }
            };

            // Recording the exit code frees the slot, so close the live channel first
            logbook.close_live(&task_project).await;
            if let Some(code) = exit_code {
                task_registry.finish_process(&task_project, code);
            }
        });
        registry.attach_capture(project_id, capture.abort_handle());

        info!(project_id = %project_id, "Dev server started at {}", handle.url);
        Ok(DevServerStatus {
            url: handle.url,
            process,
            already_running: false,
        })
    }

    async fn launch(&self, handle: &SandboxHandle, dev_command: &str) -> Result<ExecProcess> {
        let registry = self.commands.registry();
        let settings = registry.settings();
        self.commands.ensure_code_root(handle).await?;

        let package_json = format!("{}/package.json", settings.code_root);
        if registry
            .provider()
            .stat_file(&handle.instance_id, &package_json)
            .await
            .is_ok()
        {
            self.logbook
                .add_log(
                    &handle.project_id,
                    LogType::System,
                    format!("Installing dependencies: {}", settings.install_command),
                )
                .await;

            let install = self
                .commands
                .run_in(handle, &settings.install_command)
                .await?;
            if install.exit_code != 0 {
                warn!(
                    project_id = %handle.project_id,
                    "Dependency install exited with {}", install.exit_code
                );
                self.logbook
                    .add_log(
                        &handle.project_id,
                        LogType::Stderr,
                        install.stderr.trim_end().to_string(),
                    )
                    .await;
            }
        }

        Ok(registry
            .provider()
            .exec(&handle.instance_id, self.commands.shell_argv(dev_command))
            .await?)
    }

    /// Stop tracking the dev server and make a best-effort attempt to kill it
    pub async fn stop(&self, project_id: &str) -> Result<bool> {
        validate_project_id(project_id)?;
        let registry = self.commands.registry();

        let Some(process) = registry.untrack_process(project_id) else {
            return Ok(false);
        };

        if let Some(handle) = registry.peek(project_id) {
            let kill = format!("pkill -f {} || true", shell_quote(&process.command_line));
            match self.commands.run_in(&handle, &kill).await {
                Ok(output) if output.exit_code != 0 => {
                    debug!("Kill of dev server exited with {}", output.exit_code)
                }
                Ok(_) => {}
                Err(e) => warn!(project_id = %project_id, "Could not kill dev server: {}", e),
            }
        }

        self.logbook
            .add_log(project_id, LogType::System, "Dev server stopped".to_string())
            .await;
        self.logbook.close_live(project_id).await;
        info!(project_id = %project_id, "Dev server stopped");
        Ok(true)
    }

    pub async fn restart(&self, project_id: &str) -> Result<DevServerStatus> {
        self.stop(project_id).await?;
        self.start(project_id).await
    }

    /// Last `lines` buffered log lines joined by newlines
    pub async fn recent_logs(&self, project_id: &str, lines: usize) -> Result<String> {
        validate_project_id(project_id)?;
        if !self.commands.registry().has_process(project_id) {
            return Ok(NO_PROCESS_MESSAGE.to_string());
        }

        let logs = self.logbook.recent(project_id, lines).await;
        if logs.is_empty() {
            return Ok(NO_LOGS_MESSAGE.to_string());
        }

        Ok(logs
            .into_iter()
            .map(|log| log.message)
            .collect::<Vec<_>>()
            .join("\n"))
    }

    /// Buffered lines followed by live ones until the capture stops
    pub async fn subscribe_logs(
        &self,
        project_id: &str,
    ) -> Result<impl Stream<Item = DevServerLog> + Send + 'static> {
        validate_project_id(project_id)?;
        let tracked = self.commands.registry().has_process(project_id);
        let (backlog, receiver) = if tracked {
            self.logbook.subscribe(project_id).await
        } else {
            (Vec::new(), None)
        };

        Ok(async_stream::stream! {
            if !tracked {
                yield DevServerLog {
                    timestamp: Utc::now(),
                    log_type: LogType::System,
                    message: "No active process found".to_string(),
                };
                return;
            }

            for log in backlog {
                yield log;
            }

            if let Some(mut receiver) = receiver {
                loop {
                    match receiver.recv().await {
                        Ok(log) => yield log,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            yield DevServerLog {
                                timestamp: Utc::now(),
                                log_type: LogType::System,
                                message: format!("{} log line(s) skipped", skipped),
                            };
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        })
    }

    /// Drop all log state of a project; used when its sandbox goes away
    pub async fn forget(&self, project_id: &str) {
        self.commands.registry().untrack_process(project_id);
        self.logbook.forget(project_id).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::{MemoryProvider, ScriptedCommand};
    use crate::registry::SandboxRegistry;
    use crate::settings::SandboxSettings;
    use futures::StreamExt;
    use std::time::Duration;

    fn setup_with(
        dev_server: ScriptedCommand,
    ) -> (Arc<MemoryProvider>, Arc<SandboxRegistry>, DevServerSupervisor) {
        let provider = Arc::new(MemoryProvider::new());
        provider.script("npx next dev", dev_server);
        provider.script("pnpm install", ScriptedCommand::new().stdout("done\n"));
        let registry = Arc::new(SandboxRegistry::new(
            provider.clone(),
            Arc::new(SandboxSettings::for_tests()),
        ));
        let supervisor = DevServerSupervisor::new(CommandChannel::new(registry.clone()));
        (provider, registry, supervisor)
    }

    /// Dev server that prints a few lines and exits straight away
    fn setup() -> (Arc<MemoryProvider>, Arc<SandboxRegistry>, DevServerSupervisor) {
        setup_with(
            ScriptedCommand::new()
                .stdout("ready - started server\nlistening on 3000\n")
                .stderr("warn: telemetry\n"),
        )
    }

    async fn wait_for_exit(registry: &SandboxRegistry, project_id: &str) {
        for _ in 0..100 {
            if registry
                .process(project_id)
                .and_then(|p| p.exit_code)
                .is_some()
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("dev server capture did not finish");
    }

    fn launches(provider: &MemoryProvider) -> usize {
        provider
            .exec_log()
            .iter()
            .filter(|cmd| cmd.ends_with("&& npx next dev --port 3000"))
            .count()
    }

    #[tokio::test]
    async fn test_start_captures_output() {
        let (_provider, registry, supervisor) = setup();
        registry.create("demo").await.unwrap();

        let status = supervisor.start("demo").await.unwrap();
        assert!(!status.already_running);
        wait_for_exit(&registry, "demo").await;

        let logs = supervisor.recent_logs("demo", 100).await.unwrap();
        assert!(logs.contains("ready - started server"));
        assert!(logs.contains("listening on 3000"));
        assert!(logs.contains("warn: telemetry"));
        assert!(logs.contains("Dev server exited with code 0"));
    }

    #[tokio::test]
    async fn test_start_requires_live_sandbox() {
        let (provider, registry, supervisor) = setup();

        let err = supervisor.start("ghost").await.unwrap_err();
        assert!(matches!(err, DevServerError::NoSandbox(_)));
        assert_eq!(provider.create_count(), 0);
        assert!(!registry.has_process("ghost"));
    }

    #[tokio::test]
    async fn test_start_is_idempotent_while_running() {
        let (provider, registry, supervisor) =
            setup_with(ScriptedCommand::new().stdout("ready\n").keep_running());
        registry.create("demo").await.unwrap();

        supervisor.start("demo").await.unwrap();
        let second = supervisor.start("demo").await.unwrap();
        assert!(second.already_running);
        assert_eq!(launches(&provider), 1);
    }

    #[tokio::test]
    async fn test_exited_dev_server_can_start_again() {
        let (provider, registry, supervisor) =
            setup_with(ScriptedCommand::new().stdout("ready\n").keep_running());
        registry.create("demo").await.unwrap();

        supervisor.start("demo").await.unwrap();
        provider.exit_running(1);
        wait_for_exit(&registry, "demo").await;
        assert_eq!(registry.process("demo").unwrap().exit_code, Some(1));

        let again = supervisor.start("demo").await.unwrap();
        assert!(!again.already_running);
        assert_eq!(again.process.exit_code, None);
        assert_eq!(launches(&provider), 2);
        assert!(registry.is_process_running("demo"));
    }

    #[tokio::test]
    async fn test_install_runs_only_with_package_json() {
        let (provider, registry, supervisor) = setup();

        registry.create("plain").await.unwrap();
        supervisor.start("plain").await.unwrap();
        assert!(!provider.exec_log().iter().any(|c| c.contains("pnpm install")));

        let handle = registry.create("node").await.unwrap();
        provider.put_file(&handle.instance_id, "/app/package.json", "{}");
        supervisor.start("node").await.unwrap();
        assert!(provider.exec_log().iter().any(|c| c.contains("pnpm install")));
    }

    #[tokio::test]
    async fn test_recent_logs_without_process() {
        let (_provider, _registry, supervisor) = setup();
        assert_eq!(
            supervisor.recent_logs("demo", 50).await.unwrap(),
            NO_PROCESS_MESSAGE
        );
    }

    #[tokio::test]
    async fn test_recent_logs_limits_lines() {
        let (_provider, registry, supervisor) = setup();
        registry.create("demo").await.unwrap();
        supervisor.start("demo").await.unwrap();
        wait_for_exit(&registry, "demo").await;

        let logs = supervisor.recent_logs("demo", 1).await.unwrap();
        assert_eq!(logs, "Dev server exited with code 0");
    }

    #[tokio::test]
    async fn test_stop_and_restart() {
        let (provider, registry, supervisor) =
            setup_with(ScriptedCommand::new().keep_running());
        registry.create("demo").await.unwrap();

        supervisor.start("demo").await.unwrap();
        assert!(supervisor.stop("demo").await.unwrap());
        assert!(!registry.has_process("demo"));
        assert!(!supervisor.stop("demo").await.unwrap());

        let restarted = supervisor.restart("demo").await.unwrap();
        assert!(!restarted.already_running);
        assert_eq!(launches(&provider), 2);
    }

    #[tokio::test]
    async fn test_subscribe_without_process_yields_notice() {
        let (_provider, _registry, supervisor) = setup();
        let logs: Vec<DevServerLog> = supervisor
            .subscribe_logs("demo")
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].message, "No active process found");
    }

    #[tokio::test]
    async fn test_subscribe_replays_backlog_and_ends() {
        let (_provider, registry, supervisor) = setup();
        registry.create("demo").await.unwrap();
        supervisor.start("demo").await.unwrap();
        wait_for_exit(&registry, "demo").await;

        let logs: Vec<DevServerLog> = tokio::time::timeout(
            Duration::from_secs(1),
            supervisor.subscribe_logs("demo").await.unwrap().collect(),
        )
        .await
        .unwrap();
        assert!(logs
            .iter()
            .any(|log| log.message == "listening on 3000" && log.log_type == LogType::Stdout));
    }

    #[tokio::test]
    async fn test_log_buffer_is_bounded() {
        let logbook = LogBook::new(3);
        for i in 0..5 {
            logbook
                .add_log("demo", LogType::Stdout, format!("line {}", i))
                .await;
        }
        let logs = logbook.recent("demo", 10).await;
        let messages: Vec<&str> = logs.iter().map(|l| l.message.as_str()).collect();
        assert_eq!(messages, vec!["line 2", "line 3", "line 4"]);
    }
}
