//! Headless mode - NDJSON event output
//!
//! scriptlink has no UI of its own. Everything the bridge observes is written
//! to stdout as newline-delimited JSON, one object per line, each carrying an
//! `"event"` tag and a millisecond `"timestamp"`. Commands are read from stdin
//! (see [`runner`]).
//!
//! # Example Output
//!
//! ```json
//! {"event":"ready","addr":"0.0.0.0:9317","addresses":["192.168.1.20"],"timestamp":1704700001000}
//! {"event":"device_attached","device":"R58M","label":"Device Pixel(adb: R58M)","kind":"adb_tunnel","timestamp":1704700002000}
//! {"event":"device_log","device":"R58M","line":"12:00:01 script started","timestamp":1704700003000}
//! ```

pub mod runner;

use std::io::{self, Write};
use std::net::{IpAddr, SocketAddr};

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use tracing::error;

use scriptlink_app::{BroadcastReport, ServerEvent};

/// Events produced by the headless front end itself
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HeadlessEvent {
    /// Server is up
    Ready {
        addr: SocketAddr,
        addresses: Vec<IpAddr>,
        timestamp: i64,
    },

    /// Outcome of a fan-out command from stdin
    CommandResult {
        command: String,
        delivered: usize,
        failed: Vec<String>,
        timestamp: i64,
    },

    /// Reply to `devices`
    Devices {
        devices: Vec<DeviceEntry>,
        timestamp: i64,
    },

    /// Reply to `adb-devices`
    AdbDevices {
        devices: Vec<String>,
        timestamp: i64,
    },

    Error {
        message: String,
        fatal: bool,
        timestamp: i64,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct DeviceEntry {
    pub id: String,
    pub label: String,
}

impl HeadlessEvent {
    /// Emit this event to stdout as JSON
    pub fn emit(&self) {
        match serde_json::to_string(self) {
            Ok(json) => write_line(&json),
            Err(e) => error!("Failed to serialize headless event: {}", e),
        }
    }

    fn now() -> i64 {
        Utc::now().timestamp_millis()
    }

    pub fn ready(addr: SocketAddr, addresses: Vec<IpAddr>) -> Self {
        Self::Ready {
            addr,
            addresses,
            timestamp: Self::now(),
        }
    }

    pub fn command_result(command: &str, report: BroadcastReport) -> Self {
        Self::CommandResult {
            command: command.to_string(),
            delivered: report.delivered,
            failed: report.failed,
            timestamp: Self::now(),
        }
    }

    pub fn devices(devices: Vec<DeviceEntry>) -> Self {
        Self::Devices {
            devices,
            timestamp: Self::now(),
        }
    }

    pub fn adb_devices(devices: Vec<String>) -> Self {
        Self::AdbDevices {
            devices,
            timestamp: Self::now(),
        }
    }

    pub fn error(message: impl Into<String>, fatal: bool) -> Self {
        Self::Error {
            message: message.into(),
            fatal,
            timestamp: Self::now(),
        }
    }
}

/// [`ServerEvent`] as one NDJSON object with a timestamp added
pub fn server_event_json(event: &ServerEvent) -> Option<Value> {
    let mut value = match serde_json::to_value(event) {
        Ok(value) => value,
        Err(e) => {
            error!("Failed to serialize server event: {}", e);
            return None;
        }
    };
    if let Value::Object(map) = &mut value {
        map.insert("timestamp".into(), Value::from(HeadlessEvent::now()));
    }
    Some(value)
}

pub fn emit_server_event(event: &ServerEvent) {
    if let Some(value) = server_event_json(event) {
        write_line(&value.to_string());
    }
}

fn write_line(json: &str) {
    let mut stdout = io::stdout().lock();
    if let Err(e) = writeln!(stdout, "{}", json) {
        error!("Failed to write headless event to stdout: {}", e);
        return;
    }
    if let Err(e) = stdout.flush() {
        error!("Failed to flush headless stdout: {}", e);
    }
}
