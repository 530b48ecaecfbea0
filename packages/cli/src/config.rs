// ABOUTME: Server configuration read from the environment
// ABOUTME: Bind address, CORS origin, provider selection and log format

use dappbox_config::{
    CORS_ORIGIN, DAPPBOX_CORS_ORIGIN, DAPPBOX_HOST, DAPPBOX_LOG_FORMAT, DAPPBOX_PORT,
    DAPPBOX_PROVIDER, DAPPBOX_PUBLIC_HOST, DAPPBOX_REAPER_INTERVAL_SECS, PORT,
};
use std::env;
use std::num::ParseIntError;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid port number: {0}")]
    InvalidPort(#[from] ParseIntError),
    #[error("Port {0} is out of valid range (1-65535)")]
    PortOutOfRange(u16),
    #[error("Invalid provider: {0} (expected docker or memory)")]
    InvalidProvider(String),
    #[error("Invalid log format: {0} (expected compact or json)")]
    InvalidLogFormat(String),
    #[error("Invalid reaper interval: {0}")]
    InvalidReaperInterval(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    Docker,
    Memory,
}

impl FromStr for ProviderKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "docker" => Ok(ProviderKind::Docker),
            "memory" => Ok(ProviderKind::Memory),
            _ => Err(ConfigError::InvalidProvider(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

impl FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "compact" | "text" => Ok(LogFormat::Compact),
            "json" => Ok(LogFormat::Json),
            _ => Err(ConfigError::InvalidLogFormat(s.to_string())),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub cors_origin: String,
    pub provider: ProviderKind,
    /// Host name put into URLs of ports published by Docker
    pub public_host: String,
    /// `None` disables the background reaper
    pub reaper_interval: Option<Duration>,
    pub log_format: LogFormat,
}

fn var_or(names: &[&str], default: &str) -> String {
    names
        .iter()
        .find_map(|name| env::var(name).ok().filter(|v| !v.trim().is_empty()))
        .unwrap_or_else(|| default.to_string())
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let port = var_or(&[DAPPBOX_PORT, PORT], "8000").trim().parse::<u16>()?;

        // Validate port is in valid range
        if port == 0 {
            return Err(ConfigError::PortOutOfRange(port));
        }

        let reaper_secs = var_or(&[DAPPBOX_REAPER_INTERVAL_SECS], "30");
        let reaper_secs = reaper_secs
            .trim()
            .parse::<u64>()
            .map_err(|_| ConfigError::InvalidReaperInterval(reaper_secs.clone()))?;

        Ok(Config {
            host: var_or(&[DAPPBOX_HOST], "127.0.0.1"),
            port,
            cors_origin: var_or(&[DAPPBOX_CORS_ORIGIN, CORS_ORIGIN], "http://localhost:3000"),
            provider: var_or(&[DAPPBOX_PROVIDER], "docker").parse()?,
            public_host: var_or(&[DAPPBOX_PUBLIC_HOST], "localhost"),
            reaper_interval: (reaper_secs > 0).then(|| Duration::from_secs(reaper_secs)),
            log_format: var_or(&[DAPPBOX_LOG_FORMAT], "compact").parse()?,
        })
    }
}
