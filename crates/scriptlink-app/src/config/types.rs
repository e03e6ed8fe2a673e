//! Configuration types for scriptlink
//!
//! Defines `Settings` (the `config.toml` file) and its sections.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use scriptlink_daemon::SessionConfig;

/// Application settings (`config.toml`)
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerSettings,

    #[serde(default)]
    pub session: SessionSettings,

    #[serde(default)]
    pub adb: AdbSettings,

    #[serde(default)]
    pub transfer: TransferSettings,

    #[serde(default)]
    pub commands: CommandSettings,

    #[serde(default)]
    pub logging: LoggingSettings,
}

impl Settings {
    /// Session tuning derived from `[session]`
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            handshake_timeout: Duration::from_millis(self.session.handshake_timeout_ms),
            keepalive_interval: Duration::from_millis(self.session.keepalive_interval_ms),
            min_versioned_client: self.session.min_versioned_client,
            debug: self.session.debug,
            ..SessionConfig::default()
        }
    }
}

/// Listening socket (`[server]`)
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ServerSettings {
    #[serde(default = "default_bind")]
    pub bind: IpAddr,

    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

impl ServerSettings {
    pub fn addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind, self.port)
    }
}

fn default_bind() -> IpAddr {
    IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

fn default_port() -> u16 {
    9317
}

/// Device session tuning (`[session]`)
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct SessionSettings {
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    #[serde(default = "default_keepalive_interval_ms")]
    pub keepalive_interval_ms: u64,

    /// First client `app_version_code` that gets the versioned hello ack
    #[serde(default = "default_min_versioned_client")]
    pub min_versioned_client: u64,

    #[serde(default)]
    pub debug: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            handshake_timeout_ms: default_handshake_timeout_ms(),
            keepalive_interval_ms: default_keepalive_interval_ms(),
            min_versioned_client: default_min_versioned_client(),
            debug: false,
        }
    }
}

fn default_handshake_timeout_ms() -> u64 {
    10_000
}

fn default_keepalive_interval_ms() -> u64 {
    10_000
}

fn default_min_versioned_client() -> u64 {
    629
}

/// ADB integration (`[adb]`)
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct AdbSettings {
    /// Start device tracking together with the server
    #[serde(default = "default_true")]
    pub auto_track: bool,

    /// Explicit `adb` binary; otherwise PATH and the Android SDK are searched
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Port the on-device agent listens on
    #[serde(default = "default_port")]
    pub device_port: u16,

    /// Host side of new forwards; the server port when unset
    #[serde(default)]
    pub local_port: Option<u16>,
}

impl Default for AdbSettings {
    fn default() -> Self {
        Self {
            auto_track: true,
            path: None,
            device_port: default_port(),
            local_port: None,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Project transfer (`[transfer]`)
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TransferSettings {
    /// On-device directory projects are unpacked into
    #[serde(default = "default_staging_dir")]
    pub staging_dir: String,

    /// Name of the temporary archive written inside the project folder
    #[serde(default = "default_temp_archive_name")]
    pub temp_archive_name: String,

    #[serde(default)]
    pub zip_path: Option<PathBuf>,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            staging_dir: default_staging_dir(),
            temp_archive_name: default_temp_archive_name(),
            zip_path: None,
        }
    }
}

fn default_staging_dir() -> String {
    "/sdcard/脚本/project".to_string()
}

fn default_temp_archive_name() -> String {
    ".temp_project.zip".to_string()
}

/// Script commands (`[commands]`)
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CommandSettings {
    /// Pause between `stopAll` and `run` for a rerun
    #[serde(default = "default_rerun_delay_ms")]
    pub rerun_delay_ms: u64,
}

impl Default for CommandSettings {
    fn default() -> Self {
        Self {
            rerun_delay_ms: default_rerun_delay_ms(),
        }
    }
}

impl CommandSettings {
    pub fn rerun_delay(&self) -> Duration {
        Duration::from_millis(self.rerun_delay_ms)
    }
}

fn default_rerun_delay_ms() -> u64 {
    1_000
}

/// Per-device log sinks (`[logging]`)
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct LoggingSettings {
    #[serde(default = "default_device_log_lines")]
    pub device_log_lines: usize,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            device_log_lines: default_device_log_lines(),
        }
    }
}

fn default_device_log_lines() -> usize {
    500
}
