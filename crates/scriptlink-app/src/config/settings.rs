//! Settings file loading and initialization

use std::path::{Path, PathBuf};

use scriptlink_core::prelude::*;

use super::types::Settings;

const CONFIG_DIR: &str = "scriptlink";
const CONFIG_FILENAME: &str = "config.toml";

/// `<config_dir>/scriptlink/config.toml`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join(CONFIG_DIR).join(CONFIG_FILENAME))
}

/// Load settings from `config_path`
///
/// A missing or unreadable file yields the defaults.
pub fn load_settings(config_path: &Path) -> Settings {
    if !config_path.exists() {
        debug!("No config file at {:?}, using defaults", config_path);
        return Settings::default();
    }

    match std::fs::read_to_string(config_path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(settings) => {
                debug!("Loaded settings from {:?}", config_path);
                settings
            }
            Err(e) => {
                warn!("Failed to parse {:?}: {}", config_path, e);
                Settings::default()
            }
        },
        Err(e) => {
            warn!("Failed to read {:?}: {}", config_path, e);
            Settings::default()
        }
    }
}

/// Write a commented default config to `config_path` unless one exists
///
/// Returns `true` if a file was written.
pub fn init_config_file(config_path: &Path) -> Result<bool> {
    if config_path.exists() {
        return Ok(false);
    }

    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| Error::config(format!("Failed to create {}: {}", parent.display(), e)))?;
    }

    let default_content = r#"# scriptlink configuration

[server]
bind = "0.0.0.0"
port = 9317

[session]
handshake_timeout_ms = 10000   # Close connections that never say hello
keepalive_interval_ms = 10000
min_versioned_client = 629     # Clients at or above this get the versioned hello ack
debug = false

[adb]
auto_track = true              # Track ADB devices when the server starts
# path = "/opt/android-sdk/platform-tools/adb"
device_port = 9317
# local_port = 9318            # Host side of new forwards (default: server port)

[transfer]
staging_dir = "/sdcard/脚本/project"
temp_archive_name = ".temp_project.zip"
# zip_path = "/usr/bin/zip"

[commands]
rerun_delay_ms = 1000

[logging]
device_log_lines = 500
"#;

    std::fs::write(config_path, default_content)
        .map_err(|e| Error::config(format!("Failed to write config.toml: {}", e)))?;
    info!("Created default config at {}", config_path.display());
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_load_settings_missing_file() {
        let temp = tempdir().unwrap();
        let settings = load_settings(&temp.path().join("config.toml"));
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_load_settings_custom() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
[server]
port = 9400

[adb]
auto_track = false

[commands]
rerun_delay_ms = 250
"#,
        )
        .unwrap();

        let settings = load_settings(&path);

        assert_eq!(settings.server.port, 9400);
        assert!(!settings.adb.auto_track);
        assert_eq!(settings.commands.rerun_delay_ms, 250);
        assert_eq!(settings.session.handshake_timeout_ms, 10_000);
    }

    #[test]
    fn test_load_settings_invalid_toml() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("config.toml");
        std::fs::write(&path, "not valid toml {{{{").unwrap();

        assert_eq!(load_settings(&path), Settings::default());
    }

    #[test]
    fn test_init_config_file() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("scriptlink").join("config.toml");

        assert!(init_config_file(&path).unwrap());
        assert!(!init_config_file(&path).unwrap());

        let content = std::fs::read_to_string(&path).unwrap();
        let parsed: Settings = toml::from_str(&content).expect("Default config should be valid TOML");
        assert_eq!(parsed, Settings::default());
    }
}
