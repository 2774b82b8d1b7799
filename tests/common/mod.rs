//! Common test utilities and fixtures

#![allow(dead_code)]

use std::path::PathBuf;

use assert_cmd::Command;

/// Environment variables that would override the configuration under test
pub const OVERRIDE_VARS: [&str; 11] = [
    "REMOTE_GPIO_CONFIG",
    "REMOTE_GPIO_URL",
    "REMOTE_GPIO_SCHEME",
    "REMOTE_GPIO_CLIENT_NAME",
    "CF_ACCESS_CLIENT_ID",
    "CF_ACCESS_CLIENT_SECRET",
    "REMOTE_GPIO_HEARTBEAT_SECS",
    "REMOTE_GPIO_CONNECT_TIMEOUT_SECS",
    "REMOTE_GPIO_LOG_LEVEL",
    "REMOTE_GPIO_LOG_FILE",
    "REMOTE_GPIO_LOG_JSON",
];

/// The binary under test with a clean override environment
pub fn remote_cmd() -> Command {
    let mut cmd = Command::cargo_bin("remote-gpio").unwrap();
    for var in OVERRIDE_VARS {
        cmd.env_remove(var);
    }
    cmd
}

/// Get the path to the test fixtures directory
pub fn fixtures_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("fixtures")
}

/// Get a path to a specific fixture file
pub fn fixture_path(name: &str) -> PathBuf {
    fixtures_dir().join(name)
}

/// Get the valid config fixture path
pub fn valid_config_fixture() -> PathBuf {
    fixture_path("valid_config.toml")
}

/// Get the invalid config fixture path
pub fn invalid_config_fixture() -> PathBuf {
    fixture_path("invalid_config.toml")
}
