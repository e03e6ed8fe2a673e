//! Events published by [`AppContext`](crate::AppContext) for observers
//!
//! Front ends subscribe through `AppContext::subscribe()`. The headless
//! binary serializes every event as one JSON line.

use std::net::SocketAddr;

use serde::Serialize;
use serde_json::Value;

use scriptlink_core::TransportKind;

use crate::transfer::TransferProgress;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    // ─────────────────────────────────────────────────────────
    // Server lifecycle
    // ─────────────────────────────────────────────────────────
    Listening { addr: SocketAddr },

    /// `listen` while already listening
    AlreadyListening { addr: SocketAddr },

    ServerStopped,

    // ─────────────────────────────────────────────────────────
    // ADB tracking
    // ─────────────────────────────────────────────────────────
    TrackingStarted,

    TrackingAlreadyRunning,

    /// Tracking ended, either on request or because the subscription went away
    TrackingStopped,

    TrackingFailed { error: String },

    // ─────────────────────────────────────────────────────────
    // Devices
    // ─────────────────────────────────────────────────────────
    DeviceAttached {
        device: String,
        label: String,
        kind: TransportKind,
    },

    DeviceDetached { device: String },

    /// Any inbound envelope that is not handled by the session itself
    DeviceMessage {
        device: String,
        kind: String,
        data: Value,
    },

    DeviceLog { device: String, line: String },

    ConnectFailed { device: String, error: String },

    // ─────────────────────────────────────────────────────────
    // Commands and transfers
    // ─────────────────────────────────────────────────────────
    /// `GET /exec` was hit
    Exec { cmd: String, path: String },

    TransferProgress(TransferProgress),

    TransferFinished {
        device: String,
        elapsed_ms: u64,
        error: Option<String>,
    },
}
