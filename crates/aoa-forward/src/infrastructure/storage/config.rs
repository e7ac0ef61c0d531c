//! TOML-based configuration for the forwarding host.
//!
//! Reads `AppConfig` from the platform-appropriate config file unless a path
//! is given on the command line:
//! - Windows:  `%APPDATA%\AoaForward\config.toml`
//! - Linux:    `~/.config/aoa-forward/config.toml`
//! - macOS:    `~/Library/Application Support/AoaForward/config.toml`
//!
//! Every field has a default, so a missing file (or a file that only sets one
//! value) is valid.  Example:
//!
//! ```toml
//! [device]
//! vendor_id = 0x04E8
//! product_id = 0x6860
//!
//! [forward]
//! default_port = 8080
//!
//! [transport]
//! strategy = "threaded"
//! ```
//!
//! TOML integers accept `0x` prefixes, so USB ids can be written in hex.

use std::path::{Path, PathBuf};
use std::time::Duration;

use aoa_core::{AccessoryStrings, DeviceFilter};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The platform config directory could not be determined.
    #[error("could not determine platform config directory")]
    NoPlatformConfigDir,

    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    /// The config could not be serialized to TOML.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub accessory: AccessoryStrings,
    #[serde(default)]
    pub forward: ForwardConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// `tracing` log level: `"error"`, `"warn"`, `"info"`, `"debug"`, `"trace"`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Optional device filter; both ids must be set for it to apply.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DeviceConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vendor_id: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_id: Option<u16>,
}

impl DeviceConfig {
    pub fn filter(&self) -> DeviceFilter {
        DeviceFilter::from_ids(self.vendor_id, self.product_id)
    }
}

/// Where CONNECT_SOCKET requests are dialled.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ForwardConfig {
    /// Host the local sockets connect to.
    #[serde(default = "default_host")]
    pub host: String,
    /// Forwarding port used until the device announces its own.
    #[serde(default = "default_port")]
    pub default_port: u16,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

/// How inbound bulk transfers are received.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum InboundStrategy {
    /// A queue of outstanding asynchronous bulk-IN transfers.
    #[default]
    Queued,
    /// One dedicated worker issuing one blocking read at a time.
    Threaded,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TransportConfig {
    #[serde(default)]
    pub strategy: InboundStrategy,
    /// Size of each bulk-IN request.
    #[serde(default = "default_transfer_size")]
    pub transfer_size: usize,
    /// Outstanding bulk-IN requests for the queued strategy.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    /// Upper bound on one socket-readiness wait.
    #[serde(default = "default_poll_timeout_ms")]
    pub poll_timeout_ms: u64,
}

/// Retry, delay, and teardown timing for the session supervisor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SupervisorConfig {
    #[serde(default = "default_find_attempts")]
    pub find_attempts: u32,
    #[serde(default = "default_one_second_ms")]
    pub find_backoff_ms: u64,
    /// Wait after START before looking for the re-enumerated device.
    #[serde(default = "default_one_second_ms")]
    pub reenumeration_delay_ms: u64,
    /// Wait after claiming the interface before resolving endpoints.
    #[serde(default = "default_one_second_ms")]
    pub settle_delay_ms: u64,
    /// Wait after CLOSE_ACCESSORY before tearing down.
    #[serde(default = "default_one_second_ms")]
    pub grace_period_ms: u64,
    #[serde(default = "default_control_timeout_ms")]
    pub control_timeout_ms: u64,
    /// Fixed wait between attempts when hotplug is unavailable.
    #[serde(default = "default_retry_interval_secs")]
    pub retry_interval_secs: u64,
    #[serde(default = "default_true")]
    pub use_hotplug: bool,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_log_level() -> String {
    "info".to_string()
}
fn default_host() -> String {
    "localhost".to_string()
}
fn default_port() -> u16 {
    8000
}
fn default_connect_timeout_ms() -> u64 {
    3000
}
fn default_transfer_size() -> usize {
    0x4000
}
fn default_queue_depth() -> usize {
    64
}
fn default_read_timeout_ms() -> u64 {
    1000
}
fn default_write_timeout_ms() -> u64 {
    1000
}
fn default_poll_timeout_ms() -> u64 {
    250
}
fn default_find_attempts() -> u32 {
    5
}
fn default_one_second_ms() -> u64 {
    1000
}
fn default_control_timeout_ms() -> u64 {
    1000
}
fn default_retry_interval_secs() -> u64 {
    5
}
fn default_true() -> bool {
    true
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            default_port: default_port(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl ForwardConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            strategy: InboundStrategy::default(),
            transfer_size: default_transfer_size(),
            queue_depth: default_queue_depth(),
            read_timeout_ms: default_read_timeout_ms(),
            write_timeout_ms: default_write_timeout_ms(),
            poll_timeout_ms: default_poll_timeout_ms(),
        }
    }
}

impl TransportConfig {
    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            find_attempts: default_find_attempts(),
            find_backoff_ms: default_one_second_ms(),
            reenumeration_delay_ms: default_one_second_ms(),
            settle_delay_ms: default_one_second_ms(),
            grace_period_ms: default_one_second_ms(),
            control_timeout_ms: default_control_timeout_ms(),
            retry_interval_secs: default_retry_interval_secs(),
            use_hotplug: default_true(),
        }
    }
}

impl SupervisorConfig {
    pub fn find_backoff(&self) -> Duration {
        Duration::from_millis(self.find_backoff_ms)
    }
    pub fn reenumeration_delay(&self) -> Duration {
        Duration::from_millis(self.reenumeration_delay_ms)
    }
    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }
    pub fn control_timeout(&self) -> Duration {
        Duration::from_millis(self.control_timeout_ms)
    }
    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }
}

// ── Config loading ────────────────────────────────────────────────────────────

/// Resolves the full path to the default config file.
///
/// # Errors
///
/// Returns [`ConfigError::NoPlatformConfigDir`] if the base directory cannot be
/// determined.
pub fn config_file_path() -> Result<PathBuf, ConfigError> {
    platform_config_dir()
        .map(|dir| dir.join("config.toml"))
        .ok_or(ConfigError::NoPlatformConfigDir)
}

/// Loads `AppConfig` from the default location, or from `path` when given.
///
/// A missing file yields `AppConfig::default()`.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] for file-system errors other than "not found",
/// and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config(path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let path = match path {
        Some(p) => p.to_path_buf(),
        None => config_file_path()?,
    };

    match std::fs::read_to_string(&path) {
        Ok(content) => Ok(toml::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(AppConfig::default()),
        Err(e) => Err(ConfigError::Io { path, source: e }),
    }
}

/// Renders the effective configuration as TOML.
///
/// # Errors
///
/// Returns [`ConfigError::Serialize`] if serialization fails.
pub fn render_config(config: &AppConfig) -> Result<String, ConfigError> {
    Ok(toml::to_string_pretty(config)?)
}

fn platform_config_dir() -> Option<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        std::env::var_os("APPDATA").map(|p| PathBuf::from(p).join("AoaForward"))
    }

    #[cfg(target_os = "linux")]
    {
        let base = std::env::var_os("XDG_CONFIG_HOME")
            .map(PathBuf::from)
            .or_else(|| std::env::var_os("HOME").map(|h| PathBuf::from(h).join(".config")))?;
        Some(base.join("aoa-forward"))
    }

    #[cfg(target_os = "macos")]
    {
        std::env::var_os("HOME").map(|h| {
            PathBuf::from(h)
                .join("Library")
                .join("Application Support")
                .join("AoaForward")
        })
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        None
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
