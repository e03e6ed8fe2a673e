//! Test utilities for daemon types
//!
//! Provides [`FakeAdb`], a scriptable in-memory [`AdbBridge`], and helpers for
//! running device sessions over in-memory sockets.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use futures_util::StreamExt;
use serde_json::Value;
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, Notify};
use tokio_tungstenite::tungstenite::protocol::{Message as WsMessage, Role};
use tokio_tungstenite::WebSocketStream;

use scriptlink_core::prelude::*;
use scriptlink_core::ForwardMapping;

use crate::adb::{AdbBridge, AdbDevice, TrackerChange};

/// One recorded bridge call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdbCall {
    ListDevices,
    Track,
    Shell { serial: String, command: String },
    Push { serial: String, local: PathBuf, remote: String },
    Forward { serial: String, local: u16, remote: u16 },
    ListForwards { serial: String },
    WaitForDevice { serial: String },
}

#[derive(Default)]
struct FakeState {
    devices: Vec<AdbDevice>,
    forwards: Vec<ForwardMapping>,
    calls: Vec<AdbCall>,
    pushed: Vec<Vec<u8>>,
    track_tx: Option<mpsc::Sender<TrackerChange>>,
    track_failure: Option<String>,
    forward_failure: Option<String>,
    push_failure: Option<String>,
    shell_failure: Option<String>,
    block_push: bool,
    held_waits: HashSet<String>,
    shell_outputs: HashMap<String, String>,
}

/// In-memory ADB bridge that records every call
#[derive(Default)]
pub struct FakeAdb {
    state: Mutex<FakeState>,
    wait_released: Notify,
}

impl FakeAdb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fake with devices as `(serial, state)` pairs
    pub fn with_devices(devices: &[(&str, &str)]) -> Self {
        let fake = Self::new();
        fake.lock().devices = devices
            .iter()
            .map(|(serial, state)| AdbDevice::new(*serial, *state))
            .collect();
        fake
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FakeState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn calls(&self) -> Vec<AdbCall> {
        self.lock().calls.clone()
    }

    /// Contents of every pushed file, read at push time
    pub fn pushed(&self) -> Vec<Vec<u8>> {
        self.lock().pushed.clone()
    }

    pub fn shell_commands(&self, serial: &str) -> Vec<String> {
        self.lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                AdbCall::Shell { serial: s, command } if s == serial => Some(command.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn track_count(&self) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| matches!(c, AdbCall::Track))
            .count()
    }

    pub fn add_forward(&self, mapping: ForwardMapping) {
        self.lock().forwards.push(mapping);
    }

    pub fn set_shell_output(&self, command: &str, output: &str) {
        self.lock()
            .shell_outputs
            .insert(command.to_string(), output.to_string());
    }

    pub fn fail_track(&self, message: Option<&str>) {
        self.lock().track_failure = message.map(str::to_string);
    }

    pub fn fail_forward(&self, message: &str) {
        self.lock().forward_failure = Some(message.to_string());
    }

    pub fn fail_push(&self, message: &str) {
        self.lock().push_failure = Some(message.to_string());
    }

    pub fn fail_shell(&self, message: &str) {
        self.lock().shell_failure = Some(message.to_string());
    }

    /// Make every push hang until the caller gives up on it
    pub fn block_push(&self) {
        self.lock().block_push = true;
    }

    /// Keep `wait_for_device(serial)` pending until [`release_wait`](Self::release_wait)
    pub fn hold_wait(&self, serial: &str) {
        self.lock().held_waits.insert(serial.to_string());
    }

    pub fn release_wait(&self, serial: &str) {
        self.lock().held_waits.remove(serial);
        self.wait_released.notify_waiters();
    }

    /// Deliver a change to the active tracking subscription
    pub async fn emit(&self, change: TrackerChange) {
        let tx = self.lock().track_tx.clone();
        if let Some(tx) = tx {
            let _ = tx.send(change).await;
        }
    }

    /// End the active tracking subscription, as if the daemon went away
    pub fn end_tracking(&self) {
        self.lock().track_tx = None;
    }
}

impl AdbBridge for FakeAdb {
    async fn list_devices(&self) -> Result<Vec<AdbDevice>> {
        let mut state = self.lock();
        state.calls.push(AdbCall::ListDevices);
        Ok(state.devices.clone())
    }

    async fn track_devices(&self) -> Result<mpsc::Receiver<TrackerChange>> {
        let mut state = self.lock();
        state.calls.push(AdbCall::Track);
        if let Some(message) = state.track_failure.clone() {
            return Err(Error::adb(message));
        }
        let (tx, rx) = mpsc::channel(32);
        state.track_tx = Some(tx);
        Ok(rx)
    }

    async fn shell(&self, serial: &str, command: &str) -> Result<String> {
        let mut state = self.lock();
        state.calls.push(AdbCall::Shell {
            serial: serial.to_string(),
            command: command.to_string(),
        });
        if let Some(message) = state.shell_failure.clone() {
            return Err(Error::adb(message));
        }
        Ok(state.shell_outputs.get(command).cloned().unwrap_or_default())
    }

    async fn push(&self, serial: &str, local: &Path, remote: &str) -> Result<()> {
        let blocked = {
            let mut state = self.lock();
            state.calls.push(AdbCall::Push {
                serial: serial.to_string(),
                local: local.to_path_buf(),
                remote: remote.to_string(),
            });
            if let Some(message) = state.push_failure.clone() {
                return Err(Error::adb(message));
            }
            state.pushed.push(std::fs::read(local)?);
            state.block_push
        };
        if blocked {
            std::future::pending::<()>().await;
        }
        Ok(())
    }

    async fn forward(&self, serial: &str, local_port: u16, remote_port: u16) -> Result<()> {
        let mut state = self.lock();
        state.calls.push(AdbCall::Forward {
            serial: serial.to_string(),
            local: local_port,
            remote: remote_port,
        });
        if let Some(message) = state.forward_failure.clone() {
            return Err(Error::adb(message));
        }
        state
            .forwards
            .push(ForwardMapping::new(serial, local_port, remote_port));
        Ok(())
    }

    async fn list_forwards(&self, serial: &str) -> Result<Vec<ForwardMapping>> {
        let mut state = self.lock();
        state.calls.push(AdbCall::ListForwards {
            serial: serial.to_string(),
        });
        Ok(state
            .forwards
            .iter()
            .filter(|f| f.device_id == serial)
            .cloned()
            .collect())
    }

    async fn wait_for_device(&self, serial: &str) -> Result<()> {
        self.lock().calls.push(AdbCall::WaitForDevice {
            serial: serial.to_string(),
        });
        loop {
            let released = self.wait_released.notified();
            if !self.lock().held_waits.contains(serial) {
                return Ok(());
            }
            released.await;
        }
    }
}

/// Server/client websocket halves joined by an in-memory pipe
pub async fn ws_pair() -> (WebSocketStream<DuplexStream>, WebSocketStream<DuplexStream>) {
    let (server_io, client_io) = tokio::io::duplex(256 * 1024);
    let server = WebSocketStream::from_raw_socket(server_io, Role::Server, None).await;
    let client = WebSocketStream::from_raw_socket(client_io, Role::Client, None).await;
    (server, client)
}

/// Next text frame from the device side, parsed as JSON
///
/// Transport pings and pongs are skipped. Returns `None` once the connection
/// closes.
pub async fn next_json(client: &mut WebSocketStream<DuplexStream>) -> Option<Value> {
    while let Some(frame) = client.next().await {
        match frame.ok()? {
            WsMessage::Text(text) => return serde_json::from_str(text.as_str()).ok(),
            WsMessage::Close(_) => return None,
            _ => continue,
        }
    }
    None
}

/// Next binary frame from the device side
pub async fn next_binary(client: &mut WebSocketStream<DuplexStream>) -> Option<Vec<u8>> {
    while let Some(frame) = client.next().await {
        match frame.ok()? {
            WsMessage::Binary(bytes) => return Some(bytes.to_vec()),
            WsMessage::Close(_) => return None,
            _ => continue,
        }
    }
    None
}

/// Hello text frame as a device would send it
pub fn hello_frame(device_name: &str, app_version_code: u64) -> WsMessage {
    let text = serde_json::json!({
        "type": "hello",
        "data": {"device_name": device_name, "app_version_code": app_version_code},
    })
    .to_string();
    WsMessage::Text(text.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fake_records_forwards() {
        let fake = FakeAdb::new();
        fake.forward("R58M", 9317, 9317).await.unwrap();
        let forwards = fake.list_forwards("R58M").await.unwrap();
        assert_eq!(forwards, vec![ForwardMapping::new("R58M", 9317, 9317)]);
        assert!(fake.list_forwards("other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_fake_shell_output() {
        let fake = FakeAdb::new();
        fake.set_shell_output("getprop ro.product.brand", "google\n");
        assert_eq!(fake.shell("R58M", "getprop ro.product.brand").await.unwrap(), "google\n");
        assert_eq!(fake.shell_commands("R58M"), vec!["getprop ro.product.brand"]);
    }
}
