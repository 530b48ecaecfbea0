// ABOUTME: Sandbox settings covering image, resources, layout and sync limits
// ABOUTME: Loaded from DAPPBOX_* environment variables with production defaults

use crate::providers::{ImageSpec, ResourceSpec};
use dappbox_config::constants::*;
use std::env;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum SettingsError {
    #[error("Invalid value for {name}: {value}")]
    Invalid { name: &'static str, value: String },

    #[error("{0} must be an absolute path")]
    RelativePath(&'static str),
}

type Result<T> = std::result::Result<T, SettingsError>;

/// Largest page any listing returns, whatever the environment asks for
pub const PAGE_LIMIT_CEILING: usize = 200;

/// Settings shared by every sandbox component
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxSettings {
    /// Directory inside the sandbox holding the project's code
    pub code_root: String,
    /// Path prefix clients use for project files
    pub client_prefix: String,
    pub dev_port: u16,
    pub image: ImageSpec,
    pub resources: ResourceSpec,
    pub keep_alive_secs: u64,
    /// Pause after provisioning before the first command runs
    pub settle_delay: Duration,
    /// Directory names never listed or downloaded
    pub excluded_dirs: Vec<String>,
    pub instance_prefix: String,
    pub dev_command: String,
    pub install_command: String,
    pub log_buffer_lines: usize,
    pub page_limit_default: usize,
    pub page_limit_max: usize,
    pub gzip_threshold_bytes: usize,
    pub event_poll_interval: Duration,
}

impl Default for SandboxSettings {
    fn default() -> Self {
        Self {
            code_root: "/app".to_string(),
            client_prefix: "/dapp".to_string(),
            dev_port: 3000,
            image: ImageSpec {
                base: "node:20".to_string(),
                commands: vec![
                    "apt-get update && apt-get install -y git curl".to_string(),
                    "npm install -g pnpm".to_string(),
                ],
            },
            resources: ResourceSpec {
                cpu: 1.0,
                memory_mb: 1024,
            },
            keep_alive_secs: 300,
            settle_delay: Duration::from_secs(3),
            excluded_dirs: vec![
                "node_modules".to_string(),
                ".next".to_string(),
                ".git".to_string(),
            ],
            instance_prefix: "dappbox".to_string(),
            dev_command: "npx next dev --port 3000".to_string(),
            install_command: "pnpm install".to_string(),
            log_buffer_lines: 1000,
            page_limit_default: 100,
            page_limit_max: PAGE_LIMIT_CEILING,
            gzip_threshold_bytes: 64 * 1024,
            event_poll_interval: Duration::from_secs(5),
        }
    }
}

fn parse_var<T: FromStr>(name: &'static str, default: T) -> Result<T> {
    match env::var(name) {
        Ok(value) if !value.trim().is_empty() => {
            value
                .trim()
                .parse::<T>()
                .map_err(|_| SettingsError::Invalid {
                    name,
                    value: value.clone(),
                })
        }
        _ => Ok(default),
    }
}

fn string_var(name: &'static str, default: String) -> String {
    env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or(default)
}

fn list_var(name: &'static str, separator: char, default: Vec<String>) -> Vec<String> {
    match env::var(name) {
        Ok(value) => value
            .split(separator)
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect(),
        Err(_) => default,
    }
}

fn absolute_path(name: &'static str, value: String) -> Result<String> {
    if !value.starts_with('/') {
        return Err(SettingsError::RelativePath(name));
    }
    let trimmed = value.trim_end_matches('/');
    Ok(if trimmed.is_empty() {
        "/".to_string()
    } else {
        trimmed.to_string()
    })
}

impl SandboxSettings {
    /// Read settings from the environment, falling back to defaults
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let code_root = absolute_path(
            DAPPBOX_CODE_ROOT,
            string_var(DAPPBOX_CODE_ROOT, defaults.code_root),
        )?;
        let client_prefix = absolute_path(
            DAPPBOX_CLIENT_PREFIX,
            string_var(DAPPBOX_CLIENT_PREFIX, defaults.client_prefix),
        )?;

        let dev_port = parse_var(DAPPBOX_DEV_PORT, defaults.dev_port)?;
        if dev_port == 0 {
            return Err(SettingsError::Invalid {
                name: DAPPBOX_DEV_PORT,
                value: "0".to_string(),
            });
        }

        let page_limit_max = parse_var(DAPPBOX_PAGE_LIMIT_MAX, defaults.page_limit_max)?
            .clamp(1, PAGE_LIMIT_CEILING);
        let page_limit_default =
            parse_var(DAPPBOX_PAGE_LIMIT_DEFAULT, defaults.page_limit_default)?
                .clamp(1, page_limit_max);

        Ok(Self {
            code_root,
            client_prefix,
            dev_port,
            image: ImageSpec {
                base: string_var(DAPPBOX_IMAGE, defaults.image.base),
                commands: list_var(DAPPBOX_SETUP_COMMANDS, ';', defaults.image.commands),
            },
            resources: ResourceSpec {
                cpu: parse_var(DAPPBOX_CPU, defaults.resources.cpu)?,
                memory_mb: parse_var(DAPPBOX_MEMORY_MB, defaults.resources.memory_mb)?,
            },
            keep_alive_secs: parse_var(DAPPBOX_KEEP_ALIVE_SECS, defaults.keep_alive_secs)?,
            settle_delay: Duration::from_millis(parse_var(
                DAPPBOX_SETTLE_DELAY_MS,
                defaults.settle_delay.as_millis() as u64,
            )?),
            excluded_dirs: list_var(DAPPBOX_EXCLUDED_DIRS, ',', defaults.excluded_dirs),
            instance_prefix: defaults.instance_prefix,
            dev_command: string_var(
                DAPPBOX_DEV_COMMAND,
                format!("npx next dev --port {}", dev_port),
            ),
            install_command: string_var(DAPPBOX_INSTALL_COMMAND, defaults.install_command),
            log_buffer_lines: parse_var(DAPPBOX_LOG_BUFFER_LINES, defaults.log_buffer_lines)?
                .max(1),
            page_limit_default,
            page_limit_max,
            gzip_threshold_bytes: parse_var(
                DAPPBOX_GZIP_THRESHOLD_BYTES,
                defaults.gzip_threshold_bytes,
            )?,
            event_poll_interval: Duration::from_secs(
                parse_var(
                    DAPPBOX_EVENT_POLL_SECS,
                    defaults.event_poll_interval.as_secs(),
                )?
                .max(1),
            ),
        })
    }

    /// Settings suited to tests: no settle delay, tiny image spec
    pub fn for_tests() -> Self {
        Self {
            image: ImageSpec {
                base: "node:20".to_string(),
                commands: Vec::new(),
            },
            settle_delay: Duration::ZERO,
            ..Self::default()
        }
    }

    /// Clamp a requested page size into the allowed range
    pub fn page_limit(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.page_limit_default)
            .clamp(1, self.page_limit_max)
    }
}
