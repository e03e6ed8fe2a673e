//! Per-connection device session
//!
//! Each session runs as one background task that exclusively owns its
//! transport. Callers talk to it through a clonable [`SessionHandle`] and hear
//! from it through [`SessionEvent`]s.
//!
//! ```text
//! Connecting ──▶ Handshaking ──hello──▶ Attached ──▶ Closed
//!                    │                                  ▲
//!                    └────────── handshake timeout ─────┘
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Local};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;

use scriptlink_core::prelude::*;
use scriptlink_core::{DeviceIdentity, SessionState, TransportKind};

use crate::protocol::{parse_inbound, Envelope, InboundMessage};

/// Default handshake window
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Default interval between transport pings
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);

/// First client version that receives the versioned hello ack
pub const MIN_VERSIONED_CLIENT: u64 = 629;

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

/// Session tuning shared by every connection
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub handshake_timeout: Duration,
    pub keepalive_interval: Duration,
    pub min_versioned_client: u64,
    /// Version string announced to versioned clients
    pub host_version: String,
    pub debug: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: HANDSHAKE_TIMEOUT,
            keepalive_interval: KEEPALIVE_INTERVAL,
            min_versioned_client: MIN_VERSIONED_CLIENT,
            host_version: env!("CARGO_PKG_VERSION").to_string(),
            debug: false,
        }
    }
}

/// Events published by session tasks
///
/// `instance` distinguishes successive sessions that share an id (for
/// example a device that reconnected through the same tunnel).
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// Hello received; fired at most once per session
    Attached(SessionHandle),
    Message {
        id: String,
        instance: u64,
        message: InboundMessage,
    },
    Log {
        id: String,
        instance: u64,
        line: String,
    },
    /// Transport gone, either remote hangup or a local `close()`
    Disconnected { id: String, instance: u64 },
    /// No hello within the handshake window; the session never attached
    HandshakeTimedOut { id: String, instance: u64 },
}

enum SessionCommand {
    Send {
        message: WsMessage,
        ack: oneshot::Sender<Result<()>>,
    },
    Close {
        ack: oneshot::Sender<Result<()>>,
    },
}

struct SessionShared {
    instance: u64,
    identity: RwLock<DeviceIdentity>,
    state: RwLock<SessionState>,
    attached_at: RwLock<Option<DateTime<Local>>>,
}

impl SessionShared {
    fn set_state(&self, state: SessionState) {
        *self.state.write().unwrap_or_else(|e| e.into_inner()) = state;
    }

    fn state(&self) -> SessionState {
        *self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn label(&self) -> String {
        self.identity
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .to_string()
    }
}

/// Clonable handle to a running session
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<SessionShared>,
    cmd_tx: mpsc::Sender<SessionCommand>,
}

impl fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionHandle")
            .field("identity", &self.identity())
            .field("instance", &self.shared.instance)
            .field("state", &self.state())
            .finish()
    }
}

impl SessionHandle {
    pub fn id(&self) -> String {
        self.identity().id
    }

    pub fn identity(&self) -> DeviceIdentity {
        self.shared
            .identity
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn kind(&self) -> TransportKind {
        self.identity().kind
    }

    pub fn instance(&self) -> u64 {
        self.shared.instance
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn attached_at(&self) -> Option<DateTime<Local>> {
        *self
            .shared
            .attached_at
            .read()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// `Device <name>(<kind>: <id>)`
    pub fn label(&self) -> String {
        self.shared.label()
    }

    pub fn is_closed(&self) -> bool {
        self.cmd_tx.is_closed()
    }

    /// Send an envelope of `kind` with a fresh message id
    pub async fn send(&self, kind: &str, data: Value) -> Result<()> {
        self.send_envelope(Envelope::new(kind, data)).await
    }

    /// Send a `command` envelope
    pub async fn send_command(&self, command: &str, data: Map<String, Value>) -> Result<()> {
        self.send_envelope(Envelope::command(command, data)).await
    }

    /// Send a raw binary frame
    pub async fn send_bytes(&self, bytes: Vec<u8>) -> Result<()> {
        self.send_frame(WsMessage::Binary(bytes.into())).await
    }

    /// Send a `bytes_command` envelope referring to a binary frame by hash
    pub async fn send_bytes_command(
        &self,
        command: &str,
        content_hash: &str,
        extra: Map<String, Value>,
    ) -> Result<()> {
        self.send_envelope(Envelope::bytes_command(command, content_hash, extra))
            .await
    }

    pub async fn send_envelope(&self, envelope: Envelope) -> Result<()> {
        let text = envelope.to_text()?;
        self.send_frame(WsMessage::Text(text.into())).await
    }

    async fn send_frame(&self, message: WsMessage) -> Result<()> {
        let (ack, ack_rx) = oneshot::channel();
        self.cmd_tx
            .send(SessionCommand::Send { message, ack })
            .await
            .map_err(|_| Error::session_closed(self.label()))?;
        ack_rx
            .await
            .map_err(|_| Error::session_closed(self.label()))?
    }

    /// Say goodbye and close the transport
    ///
    /// Closing an already closed session is a no-op.
    pub async fn close(&self) -> Result<()> {
        let (ack, ack_rx) = oneshot::channel();
        if self.cmd_tx.send(SessionCommand::Close { ack }).await.is_err() {
            return Ok(());
        }
        ack_rx.await.unwrap_or(Ok(()))
    }
}

/// Start a session task over an established transport
///
/// The session begins in [`SessionState::Handshaking`]. Returns the session's
/// instance number.
pub fn spawn_session<T, E>(
    transport: T,
    identity: DeviceIdentity,
    config: Arc<SessionConfig>,
    event_tx: mpsc::UnboundedSender<SessionEvent>,
) -> u64
where
    T: Stream<Item = std::result::Result<WsMessage, E>>
        + Sink<WsMessage, Error = E>
        + Send
        + Unpin
        + 'static,
    E: fmt::Display + Send + 'static,
{
    let instance = NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed);
    let (cmd_tx, cmd_rx) = mpsc::channel(32);
    let shared = Arc::new(SessionShared {
        instance,
        identity: RwLock::new(identity),
        state: RwLock::new(SessionState::Connecting),
        attached_at: RwLock::new(None),
    });

    debug!("Session {} opened for {}", instance, shared.label());

    let handle = SessionHandle { shared, cmd_tx };
    tokio::spawn(run_session(transport, handle, cmd_rx, config, event_tx));
    instance
}

/// How the I/O loop ended
enum Exit {
    /// Remote hangup or write failure
    Hangup,
    /// Local `close()`; close envelope already sent
    Closed,
    /// Handshake window expired
    TimedOut,
}

async fn run_session<T, E>(
    transport: T,
    handle: SessionHandle,
    mut cmd_rx: mpsc::Receiver<SessionCommand>,
    config: Arc<SessionConfig>,
    event_tx: mpsc::UnboundedSender<SessionEvent>,
) where
    T: Stream<Item = std::result::Result<WsMessage, E>> + Sink<WsMessage, Error = E> + Unpin,
    E: fmt::Display,
{
    let (mut sink, mut stream) = transport.split();
    let shared = Arc::clone(&handle.shared);
    let id = handle.id();
    let instance = shared.instance;

    shared.set_state(SessionState::Handshaking);

    let handshake = tokio::time::sleep(config.handshake_timeout);
    tokio::pin!(handshake);

    let mut keepalive = tokio::time::interval_at(
        tokio::time::Instant::now() + config.keepalive_interval,
        config.keepalive_interval,
    );

    let exit = loop {
        tokio::select! {
            // ── Handshake window ─────────────────────────────────────────
            _ = &mut handshake, if shared.state() == SessionState::Handshaking => {
                break Exit::TimedOut;
            }

            // ── Incoming frame ───────────────────────────────────────────
            frame = stream.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        if !handle_text(text.as_str(), &handle, &mut sink, &config, &event_tx).await {
                            break Exit::Hangup;
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        debug!("{}: transport closed by peer", shared.label());
                        break Exit::Hangup;
                    }
                    Some(Ok(_)) => {
                        // Binary/Ping/Pong: nothing to route
                    }
                    Some(Err(e)) => {
                        warn!("{}: transport read error: {}", shared.label(), e);
                        break Exit::Hangup;
                    }
                }
            }

            // ── Outgoing command from a handle ───────────────────────────
            Some(cmd) = cmd_rx.recv() => {
                match cmd {
                    SessionCommand::Send { message, ack } => {
                        let result = sink
                            .send(message)
                            .await
                            .map_err(|e| Error::session_closed(format!("{}: {}", shared.label(), e)));
                        let failed = result.is_err();
                        let _ = ack.send(result);
                        if failed {
                            break Exit::Hangup;
                        }
                    }
                    SessionCommand::Close { ack } => {
                        if let Ok(text) = Envelope::close().to_text() {
                            let _ = sink.send(WsMessage::Text(text.into())).await;
                        }
                        let _ = sink.close().await;
                        shared.set_state(SessionState::Closed);
                        let _ = ack.send(Ok(()));
                        break Exit::Closed;
                    }
                }
            }

            // ── Transport keepalive ──────────────────────────────────────
            _ = keepalive.tick() => {
                if let Err(e) = sink.send(WsMessage::Ping(Default::default())).await {
                    debug!("{}: keepalive failed: {}", shared.label(), e);
                    break Exit::Hangup;
                }
            }
        }
    };

    shared.set_state(SessionState::Closed);
    cmd_rx.close();

    match exit {
        Exit::TimedOut => {
            info!(
                "{}: no hello within {:?}, closing",
                shared.label(),
                config.handshake_timeout
            );
            let _ = sink.send(WsMessage::Close(None)).await;
            let _ = sink.close().await;
            let _ = event_tx.send(SessionEvent::HandshakeTimedOut { id, instance });
        }
        Exit::Closed => {
            info!("{}: closed", shared.label());
            let _ = event_tx.send(SessionEvent::Disconnected { id, instance });
        }
        Exit::Hangup => {
            info!("{}: disconnected", shared.label());
            let _ = event_tx.send(SessionEvent::Disconnected { id, instance });
        }
    }
}

/// Route one inbound text frame
///
/// Returns `false` if a reply could not be written.
async fn handle_text<S, E>(
    text: &str,
    handle: &SessionHandle,
    sink: &mut S,
    config: &SessionConfig,
    event_tx: &mpsc::UnboundedSender<SessionEvent>,
) -> bool
where
    S: Sink<WsMessage, Error = E> + Unpin,
    E: fmt::Display,
{
    let shared = &handle.shared;
    let message = match parse_inbound(text) {
        Ok(message) => message,
        Err(e) => {
            warn!(
                "{}: dropping malformed message: {} ({})",
                shared.label(),
                e,
                text.chars().take(120).collect::<String>()
            );
            return true;
        }
    };

    match message {
        InboundMessage::Hello(hello) => {
            if shared.state() != SessionState::Handshaking {
                debug!("{}: ignoring repeated hello", shared.label());
                return true;
            }

            {
                let mut identity = shared.identity.write().unwrap_or_else(|e| e.into_inner());
                identity.display_name = Some(hello.device_name.clone());
            }
            *shared.attached_at.write().unwrap_or_else(|e| e.into_inner()) = Some(Local::now());
            shared.set_state(SessionState::Attached);

            let ack = Envelope::hello_ack(
                hello.app_version_code,
                config.min_versioned_client,
                &config.host_version,
                config.debug,
            );
            if !write_envelope(sink, &ack, &shared.label()).await {
                return false;
            }

            info!(
                "{} attached (app version {})",
                shared.label(),
                hello.app_version_code
            );
            let _ = event_tx.send(SessionEvent::Attached(handle.clone()));
        }
        InboundMessage::Ping(data) => {
            if !write_envelope(sink, &Envelope::pong(data), &shared.label()).await {
                return false;
            }
        }
        InboundMessage::Log(log) => {
            let _ = event_tx.send(SessionEvent::Log {
                id: handle.id(),
                instance: shared.instance,
                line: log.log,
            });
        }
        message => {
            let _ = event_tx.send(SessionEvent::Message {
                id: handle.id(),
                instance: shared.instance,
                message,
            });
        }
    }

    true
}

async fn write_envelope<S, E>(sink: &mut S, envelope: &Envelope, label: &str) -> bool
where
    S: Sink<WsMessage, Error = E> + Unpin,
    E: fmt::Display,
{
    let text = match envelope.to_text() {
        Ok(text) => text,
        Err(e) => {
            error!("{}: failed to encode {} envelope: {}", label, envelope.kind, e);
            return true;
        }
    };
    match sink.send(WsMessage::Text(text.into())).await {
        Ok(()) => true,
        Err(e) => {
            debug!("{}: write failed: {}", label, e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{hello_frame, next_json, ws_pair};
    use serde_json::json;

    fn test_config() -> Arc<SessionConfig> {
        Arc::new(SessionConfig {
            keepalive_interval: Duration::from_secs(600),
            host_version: "9.9.9".to_string(),
            ..SessionConfig::default()
        })
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> SessionEvent {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for session event")
            .expect("session event channel closed")
    }

    fn text(value: Value) -> WsMessage {
        WsMessage::Text(value.to_string().into())
    }

    #[tokio::test]
    async fn test_versioned_hello_attaches() {
        let (server, mut client) = ws_pair().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        spawn_session(server, DeviceIdentity::new("10.0.0.2:5000", TransportKind::Direct), test_config(), tx);

        client.send(hello_frame("Pixel", 700)).await.unwrap();

        let reply = next_json(&mut client).await.unwrap();
        assert_eq!(reply["type"], "hello");
        assert_eq!(reply["data"], "ok");
        assert_eq!(reply["version"], "9.9.9");

        match next_event(&mut rx).await {
            SessionEvent::Attached(handle) => {
                assert_eq!(handle.state(), SessionState::Attached);
                assert_eq!(handle.identity().display_name.as_deref(), Some("Pixel"));
                assert!(handle.attached_at().is_some());
                assert_eq!(handle.label(), "Device Pixel(tcp: 10.0.0.2:5000)");
            }
            other => panic!("expected Attached, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_legacy_hello_gets_greeting() {
        let (server, mut client) = ws_pair().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        spawn_session(server, DeviceIdentity::adb("emulator-5554"), test_config(), tx);

        client.send(hello_frame("Old", 100)).await.unwrap();

        let reply = next_json(&mut client).await.unwrap();
        assert_eq!(reply["data"], crate::protocol::LEGACY_GREETING);
        assert!(reply.get("version").is_none());
        assert!(matches!(next_event(&mut rx).await, SessionEvent::Attached(_)));
    }

    #[tokio::test]
    async fn test_repeated_hello_attaches_once() {
        let (server, mut client) = ws_pair().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        spawn_session(server, DeviceIdentity::adb("R58M"), test_config(), tx);

        client.send(hello_frame("Pixel", 700)).await.unwrap();
        client.send(hello_frame("Pixel", 700)).await.unwrap();
        client.send(text(json!({"type": "ping", "data": 1}))).await.unwrap();

        next_json(&mut client).await.unwrap();
        // the second hello produced no reply: next frame is the pong
        assert_eq!(next_json(&mut client).await.unwrap()["type"], "pong");

        assert!(matches!(next_event(&mut rx).await, SessionEvent::Attached(_)));
        drop(client);
        assert!(matches!(next_event(&mut rx).await, SessionEvent::Disconnected { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_handshake_timeout_closes_without_attaching() {
        let (server, mut client) = ws_pair().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        spawn_session(server, DeviceIdentity::adb("R58M"), test_config(), tx);

        tokio::time::sleep(HANDSHAKE_TIMEOUT + Duration::from_millis(10)).await;

        // a hello after the window can no longer attach
        let _ = client.send(hello_frame("Late", 700)).await;
        assert!(next_json(&mut client).await.is_none());

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], SessionEvent::HandshakeTimedOut { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_hello_inside_window_attaches() {
        let (server, mut client) = ws_pair().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        spawn_session(server, DeviceIdentity::adb("R58M"), test_config(), tx);

        tokio::time::sleep(HANDSHAKE_TIMEOUT - Duration::from_secs(1)).await;
        client.send(hello_frame("Pixel", 700)).await.unwrap();
        assert_eq!(next_json(&mut client).await.unwrap()["data"], "ok");
        assert!(matches!(rx.recv().await, Some(SessionEvent::Attached(_))));

        // the expired window no longer applies once attached
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_ping_is_echoed() {
        let (server, mut client) = ws_pair().await;
        let (tx, _rx) = mpsc::unbounded_channel();
        spawn_session(server, DeviceIdentity::adb("R58M"), test_config(), tx);

        client.send(hello_frame("Pixel", 700)).await.unwrap();
        next_json(&mut client).await.unwrap();

        client
            .send(text(json!({"type": "ping", "data": 1700000000123u64})))
            .await
            .unwrap();
        let pong = next_json(&mut client).await.unwrap();
        assert_eq!(pong, json!({"type": "pong", "data": 1700000000123u64}));
    }

    #[tokio::test]
    async fn test_malformed_message_keeps_session_alive() {
        let (server, mut client) = ws_pair().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        spawn_session(server, DeviceIdentity::adb("R58M"), test_config(), tx);

        client.send(hello_frame("Pixel", 700)).await.unwrap();
        next_json(&mut client).await.unwrap();
        assert!(matches!(next_event(&mut rx).await, SessionEvent::Attached(_)));

        client.send(WsMessage::Text("{oops".into())).await.unwrap();
        client.send(text(json!({"type": "ping", "data": 2}))).await.unwrap();

        assert_eq!(next_json(&mut client).await.unwrap()["type"], "pong");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_log_and_other_messages_are_routed() {
        let (server, mut client) = ws_pair().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        spawn_session(server, DeviceIdentity::adb("R58M"), test_config(), tx);

        client.send(hello_frame("Pixel", 700)).await.unwrap();
        next_json(&mut client).await.unwrap();
        assert!(matches!(next_event(&mut rx).await, SessionEvent::Attached(_)));

        client
            .send(text(json!({"type": "log", "data": {"log": "12:00 script started"}})))
            .await
            .unwrap();
        client
            .send(text(json!({"type": "debug_status", "data": {"running": true}})))
            .await
            .unwrap();

        match next_event(&mut rx).await {
            SessionEvent::Log { id, line, .. } => {
                assert_eq!(id, "R58M");
                assert_eq!(line, "12:00 script started");
            }
            other => panic!("expected Log, got {other:?}"),
        }
        match next_event(&mut rx).await {
            SessionEvent::Message { message, .. } => assert_eq!(message.kind(), "debug_status"),
            other => panic!("expected Message, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_outbound_primitives() {
        let (server, mut client) = ws_pair().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        spawn_session(server, DeviceIdentity::adb("R58M"), test_config(), tx);

        client.send(hello_frame("Pixel", 700)).await.unwrap();
        next_json(&mut client).await.unwrap();
        let SessionEvent::Attached(handle) = next_event(&mut rx).await else {
            panic!("expected Attached");
        };

        let mut data = Map::new();
        data.insert("id".into(), json!("main.js"));
        handle.send_command("run", data).await.unwrap();
        let command = next_json(&mut client).await.unwrap();
        assert_eq!(command["type"], "command");
        assert_eq!(command["data"]["command"], "run");

        handle.send_bytes(vec![1, 2, 3]).await.unwrap();
        let bytes = crate::test_utils::next_binary(&mut client).await.unwrap();
        assert_eq!(bytes, vec![1, 2, 3]);

        handle
            .send_bytes_command("save_project", "00ff", Map::new())
            .await
            .unwrap();
        let envelope = next_json(&mut client).await.unwrap();
        assert_eq!(envelope["md5"], "00ff");
    }

    #[tokio::test]
    async fn test_close_sends_goodbye_and_disconnects() {
        let (server, mut client) = ws_pair().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        spawn_session(server, DeviceIdentity::adb("R58M"), test_config(), tx);

        client.send(hello_frame("Pixel", 700)).await.unwrap();
        next_json(&mut client).await.unwrap();
        let SessionEvent::Attached(handle) = next_event(&mut rx).await else {
            panic!("expected Attached");
        };

        handle.close().await.unwrap();

        assert_eq!(next_json(&mut client).await.unwrap()["type"], "close");
        assert!(matches!(next_event(&mut rx).await, SessionEvent::Disconnected { .. }));
        assert_eq!(handle.state(), SessionState::Closed);

        // closing again is a no-op, sending is an error
        handle.close().await.unwrap();
        let err = handle.send("log", json!("x")).await.unwrap_err();
        assert!(matches!(err, Error::SessionClosed { .. }));
    }

    #[tokio::test]
    async fn test_remote_hangup_emits_disconnect() {
        let (server, mut client) = ws_pair().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        let instance = spawn_session(server, DeviceIdentity::adb("R58M"), test_config(), tx);

        client.send(hello_frame("Pixel", 700)).await.unwrap();
        next_json(&mut client).await.unwrap();
        assert!(matches!(next_event(&mut rx).await, SessionEvent::Attached(_)));

        client.close(None).await.unwrap();

        match next_event(&mut rx).await {
            SessionEvent::Disconnected { id, instance: got } => {
                assert_eq!(id, "R58M");
                assert_eq!(got, instance);
            }
            other => panic!("expected Disconnected, got {other:?}"),
        }
    }
}
