//! Android Debug Bridge orchestration
//!
//! The toolkit itself is reached through [`AdbBridge`]. [`AdbCli`] drives the
//! `adb` binary; tests use `test_utils::FakeAdb`. Everything above this module
//! only ever sees an [`AdbHandle`] for a single device.

pub mod cli;
pub mod forward;
pub mod tracker;

use std::path::Path;
use std::sync::Arc;

use tokio::sync::mpsc;

use scriptlink_core::prelude::*;
use scriptlink_core::ForwardMapping;

pub use cli::AdbCli;
pub use forward::ForwardAllocator;
pub use tracker::{AdbTracker, TrackerEvent};

/// A device as reported by `adb devices`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdbDevice {
    pub serial: String,
    /// `device`, `offline`, `unauthorized`, ...
    pub state: String,
}

impl AdbDevice {
    pub fn new(serial: impl Into<String>, state: impl Into<String>) -> Self {
        Self {
            serial: serial.into(),
            state: state.into(),
        }
    }

    /// Whether the device is online and authorized
    pub fn is_ready(&self) -> bool {
        self.state == "device"
    }
}

/// Change notification from a device tracking subscription
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackerChange {
    Added(String),
    Removed(String),
}

/// Primitives the ADB toolkit must provide
#[trait_variant::make(AdbBridge: Send)]
pub trait LocalAdbBridge {
    /// Enumerate currently connected devices
    async fn list_devices(&self) -> Result<Vec<AdbDevice>>;

    /// Subscribe to add/remove notifications
    ///
    /// The receiver ends when the underlying subscription ends.
    async fn track_devices(&self) -> Result<mpsc::Receiver<TrackerChange>>;

    async fn shell(&self, serial: &str, command: &str) -> Result<String>;

    async fn push(&self, serial: &str, local: &Path, remote: &str) -> Result<()>;

    async fn forward(&self, serial: &str, local_port: u16, remote_port: u16) -> Result<()>;

    /// TCP forwards currently registered for `serial`
    async fn list_forwards(&self, serial: &str) -> Result<Vec<ForwardMapping>>;

    /// Resolve once the device is ready for debug-bridge commands
    async fn wait_for_device(&self, serial: &str) -> Result<()>;
}

/// Opaque per-device capability
///
/// Exposes exactly the primitives a transfer or tunnel needs, bound to one
/// serial.
pub struct AdbHandle<B> {
    serial: String,
    bridge: Arc<B>,
}

impl<B> Clone for AdbHandle<B> {
    fn clone(&self) -> Self {
        Self {
            serial: self.serial.clone(),
            bridge: Arc::clone(&self.bridge),
        }
    }
}

impl<B> std::fmt::Debug for AdbHandle<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdbHandle")
            .field("serial", &self.serial)
            .finish()
    }
}

impl<B: AdbBridge + Sync> AdbHandle<B> {
    pub fn new(serial: impl Into<String>, bridge: Arc<B>) -> Self {
        Self {
            serial: serial.into(),
            bridge,
        }
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub async fn shell(&self, command: &str) -> Result<String> {
        self.bridge.shell(&self.serial, command).await
    }

    pub async fn push(&self, local: &Path, remote: &str) -> Result<()> {
        self.bridge.push(&self.serial, local, remote).await
    }

    pub async fn forward(&self, local_port: u16, remote_port: u16) -> Result<()> {
        self.bridge.forward(&self.serial, local_port, remote_port).await
    }

    pub async fn list_forwards(&self) -> Result<Vec<ForwardMapping>> {
        self.bridge.list_forwards(&self.serial).await
    }

    pub async fn wait_for_device(&self) -> Result<()> {
        self.bridge.wait_for_device(&self.serial).await
    }

    /// `"<brand> <model>"` from the device's system properties
    pub async fn product_label(&self) -> Result<String> {
        let brand = self.shell("getprop ro.product.brand").await?;
        let model = self.shell("getprop ro.product.model").await?;
        Ok(format!("{} {}", brand.trim(), model.trim()))
    }
}
