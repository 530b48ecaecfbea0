// ABOUTME: Linear git checkpoints of a sandbox's code root
// ABOUTME: Runs git through the command channel so the repository lives inside the sandbox

use crate::command::{shell_quote, CommandChannel, CommandError, CommandOutput};
use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

const FIELD_SEPARATOR: char = '\u{1f}';
const COMMITTER_EMAIL: &str = "sandbox@dappbox.local";
const COMMITTER_NAME: &str = "Dappbox";

#[derive(Error, Debug)]
pub enum GitError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("Invalid commit hash '{0}'")]
    InvalidHash(String),

    #[error("Commit message cannot be empty")]
    EmptyMessage,

    #[error("git {operation} failed: {message}")]
    Failed {
        operation: &'static str,
        message: String,
    },
}

pub type Result<T> = std::result::Result<T, GitError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RepoStatus {
    Existing,
    Initialized,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Checkpoint {
    pub hash: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Abbreviated or full hex object names only
pub fn validate_hash(hash: &str) -> Result<()> {
    let valid = (4..=40).contains(&hash.len()) && hash.chars().all(|c| c.is_ascii_hexdigit());
    if valid {
        Ok(())
    } else {
        Err(GitError::InvalidHash(hash.to_string()))
    }
}

fn non_empty_lines(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_log_line(line: &str) -> Option<Checkpoint> {
    let mut fields = line.splitn(3, FIELD_SEPARATOR);
    let hash = fields.next()?.trim();
    let message = fields.next()?;
    let seconds: i64 = fields.next()?.trim().parse().ok()?;
    let timestamp = Utc.timestamp_opt(seconds, 0).single()?;

    Some(Checkpoint {
        hash: hash.to_string(),
        message: message.to_string(),
        timestamp,
    })
}

pub struct GitCheckpointController {
    commands: CommandChannel,
}

impl GitCheckpointController {
    pub fn new(commands: CommandChannel) -> Self {
        Self { commands }
    }

    async fn run_checked(
        &self,
        project_id: &str,
        operation: &'static str,
        command: &str,
    ) -> Result<CommandOutput> {
        let output = self.commands.run(project_id, command).await?;
        if output.exit_code != 0 {
            let message = match output.stderr.trim() {
                "" => format!("exit code {}", output.exit_code),
                stderr => stderr.to_string(),
            };
            return Err(GitError::Failed { operation, message });
        }
        Ok(output)
    }

    /// Initialize a repository in the code root unless one exists
    pub async fn ensure_repo(&self, project_id: &str) -> Result<RepoStatus> {
        let repo_check = self.commands.run(project_id, "test -d .git").await?;
        if repo_check.exit_code == 0 {
            return Ok(RepoStatus::Existing);
        }

        let init = format!(
            "git init -q && git config user.email {} && git config user.name {}",
            shell_quote(COMMITTER_EMAIL),
            shell_quote(COMMITTER_NAME)
        );
        self.run_checked(project_id, "init", &init).await?;
        info!(project_id = %project_id, "Initialized checkpoint repository");
        Ok(RepoStatus::Initialized)
    }

    /// Stage everything and record a checkpoint. Returns the new HEAD.
    pub async fn commit(&self, project_id: &str, message: &str) -> Result<String> {
        if message.trim().is_empty() {
            return Err(GitError::EmptyMessage);
        }
        self.ensure_repo(project_id).await?;

        let command = format!(
            "git add -A && git commit --allow-empty -q -m {}",
            shell_quote(message)
        );
        self.run_checked(project_id, "commit", &command).await?;

        let hash = self
            .head(project_id)
            .await?
            .ok_or_else(|| GitError::Failed {
                operation: "commit",
                message: "no HEAD after commit".to_string(),
            })?;
        info!(project_id = %project_id, "Created checkpoint {}", hash);
        Ok(hash)
    }

    /// Current checkpoint, or `None` before the first commit
    pub async fn head(&self, project_id: &str) -> Result<Option<String>> {
        let output = self
            .commands
            .run(project_id, "git rev-parse --verify -q HEAD")
            .await?;
        if output.exit_code != 0 {
            return Ok(None);
        }
        let hash = output.stdout.trim();
        Ok((!hash.is_empty()).then(|| hash.to_string()))
    }

    /// Paths changed since `since`, or every tracked path
    pub async fn changed_files(&self, project_id: &str, since: Option<&str>) -> Result<Vec<String>> {
        let command = match since {
            Some(hash) => {
                validate_hash(hash)?;
                format!("git diff --name-only {} HEAD", hash)
            }
            None => "git ls-files".to_string(),
        };
        let output = self.run_checked(project_id, "diff", &command).await?;
        Ok(non_empty_lines(&output.stdout))
    }

    /// Checkpoint history, newest first
    pub async fn commit_log(&self, project_id: &str, since: Option<&str>) -> Result<Vec<Checkpoint>> {
        if let Some(hash) = since {
            validate_hash(hash)?;
        }
        if self.head(project_id).await?.is_none() {
            return Ok(Vec::new());
        }

        let mut command = "git log --format=%H%x1f%s%x1f%ct".to_string();
        if let Some(hash) = since {
            command.push_str(&format!(" {}..HEAD", hash));
        }
        let output = self.run_checked(project_id, "log", &command).await?;

        Ok(non_empty_lines(&output.stdout)
            .iter()
            .filter_map(|line| {
                let checkpoint = parse_log_line(line);
                if checkpoint.is_none() {
                    warn!(project_id = %project_id, "Skipping unparsable log line: {}", line);
                }
                checkpoint
            })
            .collect())
    }

    /// Reset the working tree to a checkpoint and drop untracked files
    pub async fn restore(&self, project_id: &str, hash: &str) -> Result<()> {
        validate_hash(hash)?;
        let command = format!("git reset --hard -q {} && git clean -fdq", hash);
        self.run_checked(project_id, "restore", &command).await?;
        info!(project_id = %project_id, "Restored checkpoint {}", hash);
        Ok(())
    }
}
