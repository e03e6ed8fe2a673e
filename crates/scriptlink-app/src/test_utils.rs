//! Test helpers for the application layer

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::SinkExt;
use tokio::io::DuplexStream;
use tokio::sync::mpsc;
use tokio_tungstenite::WebSocketStream;

use scriptlink_core::prelude::*;
use scriptlink_core::{DeviceIdentity, ProjectDiff, ProjectPacker, ProjectWatch};
use scriptlink_daemon::test_utils::{hello_frame, next_json, ws_pair};
use scriptlink_daemon::{spawn_session, SessionConfig, SessionEvent, SessionHandle};

pub type Client = WebSocketStream<DuplexStream>;

/// An attached session together with the device side of its socket
pub struct TestDevice {
    pub handle: SessionHandle,
    pub client: Client,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
}

pub fn quiet_config() -> Arc<SessionConfig> {
    Arc::new(SessionConfig {
        keepalive_interval: Duration::from_secs(600),
        host_version: "9.9.9".to_string(),
        ..SessionConfig::default()
    })
}

/// Run a session and complete its handshake as device `name`
pub async fn attached_session(identity: DeviceIdentity, name: &str) -> TestDevice {
    let (server, mut client) = ws_pair().await;
    let (tx, mut events) = mpsc::unbounded_channel();
    spawn_session(server, identity, quiet_config(), tx);

    client.send(hello_frame(name, 700)).await.unwrap();
    next_json(&mut client).await.expect("hello ack");

    match events.recv().await {
        Some(SessionEvent::Attached(handle)) => TestDevice {
            handle,
            client,
            events,
        },
        other => panic!("expected Attached, got {other:?}"),
    }
}

/// A session that attached and was then closed locally
pub async fn closed_session(identity: DeviceIdentity) -> (SessionHandle, Client) {
    let device = attached_session(identity, "gone").await;
    device.handle.close().await.unwrap();
    (device.handle, device.client)
}

/// Packer whose watches always return the same bytes
#[derive(Clone, Default)]
pub struct StaticPacker {
    bytes: Arc<Mutex<Vec<u8>>>,
    failure: Arc<Mutex<Option<String>>>,
    watches: Arc<AtomicUsize>,
    diffs: Arc<AtomicUsize>,
}

impl StaticPacker {
    pub fn new(bytes: &[u8]) -> Self {
        let packer = Self::default();
        *packer.bytes.lock().unwrap() = bytes.to_vec();
        packer
    }

    pub fn fail(&self, message: &str) {
        *self.failure.lock().unwrap() = Some(message.to_string());
    }

    /// Number of watches created so far
    pub fn watches(&self) -> usize {
        self.watches.load(Ordering::SeqCst)
    }

    pub fn diffs(&self) -> usize {
        self.diffs.load(Ordering::SeqCst)
    }
}

impl ProjectPacker for StaticPacker {
    type Watch = StaticWatch;

    fn watch(&self, folder: &Path) -> StaticWatch {
        self.watches.fetch_add(1, Ordering::SeqCst);
        StaticWatch {
            folder: folder.to_path_buf(),
            packer: self.clone(),
        }
    }
}

pub struct StaticWatch {
    folder: PathBuf,
    packer: StaticPacker,
}

impl ProjectWatch for StaticWatch {
    fn folder(&self) -> &Path {
        &self.folder
    }

    async fn diff(&mut self) -> Result<ProjectDiff> {
        self.packer.diffs.fetch_add(1, Ordering::SeqCst);
        let failure = self.packer.failure.lock().unwrap().clone();
        if let Some(message) = failure {
            return Err(Error::Io(std::io::Error::other(message)));
        }
        let bytes = self.packer.bytes.lock().unwrap().clone();
        Ok(ProjectDiff::from_bytes(bytes))
    }
}
