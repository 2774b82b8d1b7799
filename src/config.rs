//! Configuration system for the remote GPIO client
//!
//! Supports multiple configuration sources with the following precedence (highest to lowest):
//! 1. CLI arguments
//! 2. Environment variables (REMOTE_GPIO_* and CF_ACCESS_* names)
//! 3. Configuration file (TOML)
//! 4. Default values

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use url::Url;

use crate::connection::{ConnectRequest, RequestSource};
use crate::error::{Error, Result};

/// Placeholder shown instead of the access secret
const REDACTED: &str = "********";

const VALID_LOG_LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// Main client configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Remote endpoint settings
    pub remote: RemoteSettings,

    /// Access-control credentials sent with every connect
    pub access: AccessSettings,

    /// Heartbeat, timeout and reconnect tuning
    pub connection: ConnectionSettings,

    /// Logging configuration
    pub logging: LoggingSettings,
}

/// Remote endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteSettings {
    /// Host name (optionally with port), without scheme
    pub host: String,

    /// ws or wss
    pub scheme: String,

    /// WebSocket path on the host
    pub path: String,

    /// Client name sent as the `name` query parameter
    pub client_name: String,
}

/// Access-control credentials
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AccessSettings {
    pub client_id: String,
    pub client_secret: String,
}

/// Connection tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionSettings {
    /// Seconds between heartbeat pings while in the foreground
    pub heartbeat_interval_secs: u64,

    /// Ceiling for the reconnect backoff in seconds
    pub max_reconnect_delay_secs: u64,

    /// Seconds to wait for a session to open
    pub connect_timeout_secs: u64,
}

/// Logging settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Log level: trace, debug, info, warn, error
    pub level: String,

    /// Log file path (empty = no file logging)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,

    /// Maximum log file size in MB before rotation
    pub max_file_size_mb: u64,

    /// Number of rotated log files to keep
    pub max_files: u32,

    /// Enable JSON formatted logging
    pub json_format: bool,
}

// Default implementations

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            host: String::new(),
            scheme: "wss".to_string(),
            path: "/ws".to_string(),
            client_name: "cli".to_string(),
        }
    }
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            max_reconnect_delay_secs: 30,
            connect_timeout_secs: 15,
        }
    }
}

impl ConnectionSettings {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
            max_file_size_mb: 100,
            max_files: 5,
            json_format: false,
        }
    }
}

impl RemoteConfig {
    /// Load configuration from file with environment variable overrides
    pub fn load(config_path: Option<&str>) -> Result<Self> {
        let mut config = match Self::find_config_file(config_path)? {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };

        config.apply_env_overrides();
        config.expand_paths();
        config.validate()?;

        Ok(config)
    }

    /// Parse a single file without overrides or validation
    pub fn from_file(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "Loading configuration file");
        let content = fs::read_to_string(path).map_err(|source| Error::IoRead {
            path: path.to_path_buf(),
            source,
        })?;
        let config = toml::from_str(&content).map_err(Error::config_parse)?;
        info!(path = %path.display(), "Configuration loaded from file");
        Ok(config)
    }

    /// Find the configuration file to use
    pub fn find_config_file(explicit_path: Option<&str>) -> Result<Option<PathBuf>> {
        // An explicit path must exist
        if let Some(path) = explicit_path {
            let path = PathBuf::from(expand_path(path));
            if path.exists() {
                return Ok(Some(path));
            }
            return Err(Error::config_not_found(path));
        }

        let search_paths = [
            // Current directory
            PathBuf::from("remote-gpio.toml"),
            PathBuf::from("config.toml"),
            // User config directory
            dirs::config_dir()
                .map(|p| p.join("remote-gpio").join("config.toml"))
                .unwrap_or_default(),
            // Home directory
            dirs::home_dir()
                .map(|p| p.join(".remote-gpio").join("config.toml"))
                .unwrap_or_default(),
            // System config (Linux)
            PathBuf::from("/etc/remote-gpio/config.toml"),
        ];

        for path in &search_paths {
            if !path.as_os_str().is_empty() && path.exists() {
                debug!(path = %path.display(), "Found configuration file");
                return Ok(Some(path.clone()));
            }
        }

        debug!("No configuration file found, using defaults");
        Ok(None)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) {
        self.apply_overrides(|name| std::env::var(name).ok());
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) {
        // Remote endpoint
        if let Some(val) = var("REMOTE_GPIO_URL") {
            self.remote.host = val;
        }
        if let Some(val) = var("REMOTE_GPIO_SCHEME") {
            self.remote.scheme = val;
        }
        if let Some(val) = var("REMOTE_GPIO_CLIENT_NAME") {
            self.remote.client_name = val;
        }

        // Access credentials
        if let Some(val) = var("CF_ACCESS_CLIENT_ID") {
            self.access.client_id = val;
        }
        if let Some(val) = var("CF_ACCESS_CLIENT_SECRET") {
            self.access.client_secret = val;
        }

        // Connection tuning
        if let Some(n) = var("REMOTE_GPIO_HEARTBEAT_SECS").and_then(|v| v.parse().ok()) {
            self.connection.heartbeat_interval_secs = n;
        }
        if let Some(n) = var("REMOTE_GPIO_CONNECT_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
            self.connection.connect_timeout_secs = n;
        }

        // Logging settings
        if let Some(val) = var("REMOTE_GPIO_LOG_LEVEL") {
            self.logging.level = val;
        }
        if let Some(val) = var("REMOTE_GPIO_LOG_FILE") {
            self.logging.file = Some(val);
        }
        if let Some(val) = var("REMOTE_GPIO_LOG_JSON") {
            self.logging.json_format = val.to_lowercase() == "true" || val == "1";
        }
    }

    /// Expand ~ and other path variables
    fn expand_paths(&mut self) {
        if let Some(ref file) = self.logging.file {
            self.logging.file = Some(expand_path(file));
        }
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let host = self.remote.host.trim();
        if host.is_empty() {
            return Err(Error::config_field_invalid(
                "remote.host",
                "remote host is not set (set REMOTE_GPIO_URL or remote.host)",
            ));
        }
        if host.contains("://") {
            return Err(Error::config_field_invalid(
                "remote.host",
                format!("'{}' must be a bare host name without a scheme", host),
            ));
        }
        if self.remote.scheme != "ws" && self.remote.scheme != "wss" {
            return Err(Error::config_field_invalid(
                "remote.scheme",
                format!("scheme must be ws or wss, got '{}'", self.remote.scheme),
            ));
        }
        if !self.remote.path.starts_with('/') {
            return Err(Error::config_field_invalid(
                "remote.path",
                format!("path must start with '/', got '{}'", self.remote.path),
            ));
        }
        if self.remote.client_name.trim().is_empty() {
            return Err(Error::config_field_invalid("remote.client_name", "client name cannot be empty"));
        }
        self.endpoint_url()?;

        if self.access.client_id.trim().is_empty() {
            return Err(Error::config_field_invalid("access.client_id", "access client id is not set"));
        }
        if self.access.client_secret.trim().is_empty() {
            return Err(Error::config_field_invalid(
                "access.client_secret",
                "access client secret is not set",
            ));
        }

        if self.connection.heartbeat_interval_secs == 0 {
            return Err(Error::config_field_invalid(
                "connection.heartbeat_interval_secs",
                "must be greater than zero",
            ));
        }
        if self.connection.connect_timeout_secs == 0 {
            return Err(Error::config_field_invalid(
                "connection.connect_timeout_secs",
                "must be greater than zero",
            ));
        }
        if self.connection.max_reconnect_delay_secs == 0 {
            return Err(Error::config_field_invalid(
                "connection.max_reconnect_delay_secs",
                "must be greater than zero",
            ));
        }

        if !VALID_LOG_LEVELS.contains(&self.logging.level.to_lowercase().as_str()) {
            return Err(Error::config_field_invalid(
                "logging.level",
                format!(
                    "invalid log level '{}'. Must be one of: {}",
                    self.logging.level,
                    VALID_LOG_LEVELS.join(", ")
                ),
            ));
        }

        Ok(())
    }

    /// Full endpoint: `{scheme}://{host}{path}?name={client_name}`
    pub fn endpoint_url(&self) -> Result<Url> {
        let raw = format!("{}://{}{}", self.remote.scheme, self.remote.host.trim(), self.remote.path);
        let mut url = Url::parse(&raw).map_err(|e| {
            Error::config_field_invalid("remote.host", format!("'{}' is not a valid endpoint: {}", raw, e))
        })?;
        url.query_pairs_mut().append_pair("name", &self.remote.client_name);
        Ok(url)
    }

    /// Connect request for the current settings
    pub fn connect_request(&self) -> Result<ConnectRequest> {
        Ok(ConnectRequest::new(
            self.endpoint_url()?,
            self.access.client_id.clone(),
            self.access.client_secret.clone(),
        ))
    }

    /// Copy with the access secret masked, for display
    pub fn redacted(&self) -> Self {
        let mut config = self.clone();
        if !config.access.client_secret.is_empty() {
            config.access.client_secret = REDACTED.to_string();
        }
        config
    }

    /// Pretty TOML rendering
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// Builds each connect request from a fresh configuration load
///
/// Credentials rotated in the file or environment apply to the next
/// reconnect without restarting the process.
#[derive(Debug, Clone, Default)]
pub struct ReloadingRequestSource {
    config_path: Option<String>,
}

impl ReloadingRequestSource {
    pub fn new(config_path: Option<String>) -> Self {
        Self { config_path }
    }
}

#[async_trait]
impl RequestSource for ReloadingRequestSource {
    /// Reads the file on the blocking pool
    async fn connect_request(&self) -> Result<ConnectRequest> {
        let path = self.config_path.clone();
        tokio::task::spawn_blocking(move || RemoteConfig::load(path.as_deref())?.connect_request())
            .await
            .map_err(|e| Error::Internal(format!("configuration reload task failed: {}", e)))?
    }
}

/// Expand ~ and environment variables in paths
fn expand_path(path: &str) -> String {
    shellexpand::full(path)
        .unwrap_or(std::borrow::Cow::Borrowed(path))
        .into_owned()
}

/// Default location for `config init`
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("remote-gpio")
        .join("config.toml")
}

/// Initialize a new configuration file, returning where it was written
pub fn init_config(path: Option<&str>, force: bool) -> Result<PathBuf> {
    let config_path = path
        .map(|p| PathBuf::from(expand_path(p)))
        .unwrap_or_else(default_config_path);

    if config_path.exists() && !force {
        return Err(Error::Config(format!(
            "Configuration file already exists: {}. Use --force to overwrite.",
            config_path.display()
        )));
    }

    if let Some(parent) = config_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(|source| Error::IoWrite {
            path: parent.to_path_buf(),
            source,
        })?;
    }

    fs::write(&config_path, generate_default_config()).map_err(|source| Error::IoWrite {
        path: config_path.clone(),
        source,
    })?;

    info!(path = %config_path.display(), "Configuration file created");
    Ok(config_path)
}

/// Generate default configuration content with comments
fn generate_default_config() -> &'static str {
    r#"# Remote GPIO client configuration

[remote]
# Host of the GPIO bridge, without scheme (REMOTE_GPIO_URL)
host = ""

# ws or wss (REMOTE_GPIO_SCHEME)
scheme = "wss"

# WebSocket path
path = "/ws"

# Sent as the ?name= query parameter (REMOTE_GPIO_CLIENT_NAME)
client_name = "cli"

[access]
# Access-control service token (CF_ACCESS_CLIENT_ID / CF_ACCESS_CLIENT_SECRET)
# Re-read on every reconnect, so rotating them here takes effect without a restart
client_id = ""
client_secret = ""

[connection]
# Seconds between heartbeat pings while in the foreground
heartbeat_interval_secs = 30

# Ceiling for the reconnect backoff (1s, 2s, 4s, ... up to this)
max_reconnect_delay_secs = 30

# Seconds to wait for a connection to open
connect_timeout_secs = 15

[logging]
# Log level: trace, debug, info, warn, error
level = "info"

# Log file path (comment out to disable file logging)
# file = "~/.remote-gpio/logs/remote-gpio.log"

# Maximum log file size in MB before rotation
max_file_size_mb = 100

# Number of rotated log files to keep
max_files = 5

# Enable JSON formatted logging
json_format = false
"#
}
