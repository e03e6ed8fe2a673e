//! Outbound connection to a device through an ADB port forward

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;

use scriptlink_core::prelude::*;
use scriptlink_core::DeviceIdentity;

use crate::session::{spawn_session, SessionConfig, SessionEvent};

/// Socket URL of the device agent reachable on a forwarded local port
pub fn tunnel_url(local_port: u16) -> String {
    format!("ws://127.0.0.1:{local_port}/")
}

/// Connect to the device agent behind `local_port` and run an AdbTunnel
/// session keyed by `serial`
///
/// Returns the session instance once the transport is up; the handshake
/// proceeds in the background.
pub async fn connect_tunnel(
    serial: &str,
    local_port: u16,
    config: Arc<SessionConfig>,
    event_tx: mpsc::UnboundedSender<SessionEvent>,
) -> Result<u64> {
    let url = tunnel_url(local_port);
    debug!("Connecting to {} via {}", serial, url);

    let (ws_stream, _response) = connect_async(url.as_str())
        .await
        .map_err(|e| Error::protocol(format!("failed to connect to {serial} at {url}: {e}")))?;

    Ok(spawn_session(
        ws_stream,
        DeviceIdentity::adb(serial),
        config,
        event_tx,
    ))
}
