//! Device and session domain types

use std::fmt;

use serde::{Deserialize, Serialize};

/// How a session reached its device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    /// Connection accepted by the listening socket
    Direct,
    /// Outbound connection through an ADB port forward
    AdbTunnel,
}

impl TransportKind {
    /// Short label used in device labels and logs
    pub fn label(&self) -> &'static str {
        match self {
            TransportKind::Direct => "tcp",
            TransportKind::AdbTunnel => "adb",
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Identity of the device at the other end of a session
///
/// `id` is the remote `address:port` for [`TransportKind::Direct`] and the ADB
/// serial for [`TransportKind::AdbTunnel`]. `display_name` is only known once
/// the device has said hello.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub id: String,
    pub kind: TransportKind,
    pub display_name: Option<String>,
}

impl DeviceIdentity {
    pub fn new(id: impl Into<String>, kind: TransportKind) -> Self {
        Self {
            id: id.into(),
            kind,
            display_name: None,
        }
    }

    /// Identity for a directly accepted connection
    pub fn direct(addr: std::net::SocketAddr) -> Self {
        Self::new(addr.to_string(), TransportKind::Direct)
    }

    /// Identity for an ADB-tunneled connection
    pub fn adb(serial: impl Into<String>) -> Self {
        Self::new(serial, TransportKind::AdbTunnel)
    }

    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Name suitable for user-facing messages: display name, else the id
    pub fn short_name(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.id)
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.display_name {
            Some(name) => write!(f, "Device {}({}: {})", name, self.kind, self.id),
            None => write!(f, "Device ({}: {})", self.kind, self.id),
        }
    }
}

/// Lifecycle of a device session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Transport not yet established
    Connecting,
    /// Transport up, waiting for the device's hello
    Handshaking,
    /// Hello received; visible to the registry
    Attached,
    /// Transport torn down
    Closed,
}

impl SessionState {
    pub fn is_attached(&self) -> bool {
        matches!(self, SessionState::Attached)
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, SessionState::Closed)
    }
}

/// Lifecycle of the ADB device tracker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackerState {
    #[default]
    Idle,
    Tracking,
    Error,
}

/// A TCP port forward from the host to a device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForwardMapping {
    pub local_port: u16,
    pub remote_port: u16,
    pub device_id: String,
}

impl ForwardMapping {
    pub fn new(device_id: impl Into<String>, local_port: u16, remote_port: u16) -> Self {
        Self {
            local_port,
            remote_port,
            device_id: device_id.into(),
        }
    }
}
