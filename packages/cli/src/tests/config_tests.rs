// ABOUTME: Tests for reading server configuration from the environment
// ABOUTME: Env-mutating tests run serially

use crate::config::{Config, ConfigError, LogFormat, ProviderKind};
use pretty_assertions::assert_eq;
use rstest::rstest;
use serial_test::serial;
use std::env;
use std::time::Duration;

const VARS: &[&str] = &[
    "DAPPBOX_HOST",
    "DAPPBOX_PORT",
    "PORT",
    "DAPPBOX_CORS_ORIGIN",
    "CORS_ORIGIN",
    "DAPPBOX_PROVIDER",
    "DAPPBOX_PUBLIC_HOST",
    "DAPPBOX_REAPER_INTERVAL_SECS",
    "DAPPBOX_LOG_FORMAT",
];

fn clear_env() {
    for var in VARS {
        env::remove_var(var);
    }
}

#[test]
#[serial]
fn test_defaults() {
    clear_env();

    let config = Config::from_env().unwrap();
    assert_eq!(config.host, "127.0.0.1");
    assert_eq!(config.port, 8000);
    assert_eq!(config.cors_origin, "http://localhost:3000");
    assert_eq!(config.provider, ProviderKind::Docker);
    assert_eq!(config.public_host, "localhost");
    assert_eq!(config.reaper_interval, Some(Duration::from_secs(30)));
    assert_eq!(config.log_format, LogFormat::Compact);
}

#[test]
#[serial]
fn test_overrides_from_env() {
    clear_env();
    env::set_var("DAPPBOX_HOST", "0.0.0.0");
    env::set_var("DAPPBOX_PORT", "9100");
    env::set_var("DAPPBOX_CORS_ORIGIN", "*");
    env::set_var("DAPPBOX_PROVIDER", "memory");
    env::set_var("DAPPBOX_REAPER_INTERVAL_SECS", "0");
    env::set_var("DAPPBOX_LOG_FORMAT", "json");

    let config = Config::from_env().unwrap();
    assert_eq!(config.host, "0.0.0.0");
    assert_eq!(config.port, 9100);
    assert_eq!(config.cors_origin, "*");
    assert_eq!(config.provider, ProviderKind::Memory);
    assert_eq!(config.reaper_interval, None);
    assert_eq!(config.log_format, LogFormat::Json);

    clear_env();
}

#[test]
#[serial]
fn test_legacy_port_and_cors_fallbacks() {
    clear_env();
    env::set_var("PORT", "7000");
    env::set_var("CORS_ORIGIN", "http://example.com");

    let config = Config::from_env().unwrap();
    assert_eq!(config.port, 7000);
    assert_eq!(config.cors_origin, "http://example.com");

    env::set_var("DAPPBOX_PORT", "7001");
    let config = Config::from_env().unwrap();
    assert_eq!(config.port, 7001);

    clear_env();
}

#[test]
#[serial]
fn test_invalid_port() {
    clear_env();
    env::set_var("DAPPBOX_PORT", "not-a-port");
    assert!(matches!(Config::from_env(), Err(ConfigError::InvalidPort(_))));

    env::set_var("DAPPBOX_PORT", "0");
    assert!(matches!(
        Config::from_env(),
        Err(ConfigError::PortOutOfRange(0))
    ));

    clear_env();
}

#[test]
#[serial]
fn test_invalid_provider_and_format() {
    clear_env();
    env::set_var("DAPPBOX_PROVIDER", "kubernetes");
    assert!(matches!(
        Config::from_env(),
        Err(ConfigError::InvalidProvider(_))
    ));

    clear_env();
    env::set_var("DAPPBOX_LOG_FORMAT", "xml");
    assert!(matches!(
        Config::from_env(),
        Err(ConfigError::InvalidLogFormat(_))
    ));

    clear_env();
    env::set_var("DAPPBOX_REAPER_INTERVAL_SECS", "soon");
    assert!(matches!(
        Config::from_env(),
        Err(ConfigError::InvalidReaperInterval(_))
    ));

    clear_env();
}

#[rstest]
#[case("docker", ProviderKind::Docker)]
#[case("Memory", ProviderKind::Memory)]
#[case(" DOCKER ", ProviderKind::Docker)]
fn test_provider_kind_parsing(#[case] input: &str, #[case] expected: ProviderKind) {
    assert_eq!(input.parse::<ProviderKind>().unwrap(), expected);
}

#[rstest]
#[case("compact", LogFormat::Compact)]
#[case("text", LogFormat::Compact)]
#[case("JSON", LogFormat::Json)]
fn test_log_format_parsing(#[case] input: &str, #[case] expected: LogFormat) {
    assert_eq!(input.parse::<LogFormat>().unwrap(), expected);
}
