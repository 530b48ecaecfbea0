// ABOUTME: Scaffolds a fresh Next.js project inside a sandbox with create-next-app
// ABOUTME: Moves the generated app into the code root and returns the resulting file tree

use crate::command::{shell_quote, CommandChannel, CommandError};
use crate::sync::{FileSyncEngine, SyncError, SyncedFile};
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::info;

const SCRATCH_DIR: &str = "/tmp";

#[derive(Error, Debug)]
pub enum BootstrapError {
    #[error("Invalid app name '{0}': use lowercase letters, digits, '-' or '_'")]
    InvalidAppName(String),

    #[error(transparent)]
    Command(#[from] CommandError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    #[error("{step} failed: {message}")]
    Failed { step: &'static str, message: String },
}

pub type Result<T> = std::result::Result<T, BootstrapError>;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct BootstrapOptions {
    pub app_name: String,
    pub typescript: bool,
    pub tailwind: bool,
    pub app_router: bool,
}

impl Default for BootstrapOptions {
    fn default() -> Self {
        Self {
            app_name: "my-app".to_string(),
            typescript: true,
            tailwind: true,
            app_router: true,
        }
    }
}

impl BootstrapOptions {
    pub fn validate(&self) -> Result<()> {
        let valid = !self.app_name.is_empty()
            && self
                .app_name
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
        if valid {
            Ok(())
        } else {
            Err(BootstrapError::InvalidAppName(self.app_name.clone()))
        }
    }

    /// Non-interactive create-next-app invocation run from the scratch dir
    pub fn create_command(&self) -> String {
        let flag = |enabled: bool, on: &str, off: &str| if enabled { on } else { off }.to_string();
        [
            format!("cd {}", SCRATCH_DIR),
            format!(
                "npx create-next-app@latest {} --no-git --eslint --no-turbopack {} {} {} --no-src-dir --import-alias '@/*'",
                self.app_name,
                flag(self.typescript, "--typescript", "--js"),
                flag(self.tailwind, "--tailwind", "--no-tailwind"),
                flag(self.app_router, "--app", "--no-app"),
            ),
        ]
        .join(" && ")
    }

    /// Replace the code root's contents with the generated app, dotfiles included
    pub fn move_command(&self, code_root: &str) -> String {
        let source = format!("{}/{}", SCRATCH_DIR, self.app_name);
        let root = shell_quote(code_root);
        format!(
            "mkdir -p {root} && rm -rf {root}/* && mv {source}/* {root}/ && (mv {source}/.* {root}/ 2>/dev/null || true)",
            root = root,
            source = source,
        )
    }
}

pub struct ProjectBootstrapper {
    commands: CommandChannel,
    sync: Arc<FileSyncEngine>,
}

impl ProjectBootstrapper {
    pub fn new(commands: CommandChannel, sync: Arc<FileSyncEngine>) -> Self {
        Self { commands, sync }
    }

    async fn step(&self, project_id: &str, step: &'static str, command: &str) -> Result<()> {
        let output = self.commands.run(project_id, command).await?;
        if output.exit_code != 0 {
            let message = match output.stderr.trim() {
                "" => format!("exit code {}", output.exit_code),
                stderr => stderr.to_string(),
            };
            return Err(BootstrapError::Failed { step, message });
        }
        Ok(())
    }

    /// Generate a Next.js app and return the sandbox's new file tree
    pub async fn bootstrap_nextjs(
        &self,
        project_id: &str,
        options: &BootstrapOptions,
    ) -> Result<Vec<SyncedFile>> {
        options.validate()?;
        info!(project_id = %project_id, "Bootstrapping Next.js app {}", options.app_name);

        self.step(project_id, "create-next-app", &options.create_command())
            .await?;

        let code_root = self.commands.registry().settings().code_root.clone();
        self.step(project_id, "move", &options.move_command(&code_root))
            .await?;

        let files = self.sync.download(project_id, None).await?;
        info!(
            project_id = %project_id,
            "Bootstrapped project with {} file(s)", files.len()
        );
        Ok(files)
    }
}
