//! Application context
//!
//! [`AppContext`] owns every long-lived piece of the bridge: the listener, the
//! ADB tracker and forward allocator, the session registry, and the per-session
//! project watches. It is constructed once at startup and shared by `Arc`.
//!
//! All background sources (session tasks, the tracker, `/exec` hits) report on
//! channels that [`AppContext::run`] drains in a single loop, so registry
//! attach/detach are serialized in arrival order.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use futures_util::future::join_all;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use scriptlink_core::prelude::*;
use scriptlink_core::{BoundWatch, ProjectPacker, ProjectWatch, TrackerState, TransportKind};
use scriptlink_daemon::{
    connect_tunnel, AdbBridge, AdbHandle, AdbTracker, ExecRequest, ForwardAllocator,
    InboundMessage, Listener, SessionConfig, SessionEvent, SessionHandle, TrackerEvent,
};

use crate::commands;
use crate::config::Settings;
use crate::event::ServerEvent;
use crate::registry::{BroadcastReport, SessionRegistry};
use crate::transfer::{project_extra, TransferJob};

const EVENT_CAPACITY: usize = 256;

type SharedWatch<W> = Arc<tokio::sync::Mutex<BoundWatch<W>>>;

/// Receivers drained by [`AppContext::run`]
pub struct EventSources {
    session_rx: mpsc::UnboundedReceiver<SessionEvent>,
    tracker_rx: mpsc::UnboundedReceiver<TrackerEvent>,
    exec_rx: mpsc::UnboundedReceiver<ExecRequest>,
}

pub struct AppContext<B, P: ProjectPacker> {
    settings: Settings,
    session_config: Arc<SessionConfig>,
    registry: Arc<SessionRegistry>,

    adb: Option<Arc<B>>,
    tracker: Option<AdbTracker<B>>,
    forwards: Option<ForwardAllocator<B>>,

    packer: P,
    /// Project watch per session instance
    watches: Mutex<HashMap<u64, SharedWatch<P::Watch>>>,

    recent_device: RwLock<Option<String>>,
    events: broadcast::Sender<ServerEvent>,

    listener: tokio::sync::Mutex<Option<Listener>>,
    /// Direct sessions may only attach while this is set
    accepting: AtomicBool,
    session_tx: mpsc::UnboundedSender<SessionEvent>,
    exec_tx: mpsc::UnboundedSender<ExecRequest>,
    shutdown: CancellationToken,
}

impl<B, P> AppContext<B, P>
where
    B: AdbBridge + Send + Sync + 'static,
    P: ProjectPacker,
{
    /// Build the context
    ///
    /// Without `adb`, tracking and tunneled connections are unavailable and
    /// only directly connecting devices are served.
    pub fn new(settings: Settings, adb: Option<Arc<B>>, packer: P) -> (Arc<Self>, EventSources) {
        let (session_tx, session_rx) = mpsc::unbounded_channel();
        let (tracker_tx, tracker_rx) = mpsc::unbounded_channel();
        let (exec_tx, exec_rx) = mpsc::unbounded_channel();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        let tracker = adb
            .as_ref()
            .map(|bridge| AdbTracker::new(Arc::clone(bridge), tracker_tx));
        let forwards = adb
            .as_ref()
            .map(|bridge| ForwardAllocator::new(Arc::clone(bridge)));

        let context = Arc::new(Self {
            session_config: Arc::new(settings.session_config()),
            registry: Arc::new(SessionRegistry::new(settings.logging.device_log_lines)),
            settings,
            adb,
            tracker,
            forwards,
            packer,
            watches: Mutex::new(HashMap::new()),
            recent_device: RwLock::new(None),
            events,
            listener: tokio::sync::Mutex::new(None),
            accepting: AtomicBool::new(false),
            session_tx,
            exec_tx,
            shutdown: CancellationToken::new(),
        });

        let sources = EventSources {
            session_rx,
            tracker_rx,
            exec_rx,
        };
        (context, sources)
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ServerEvent> {
        self.events.subscribe()
    }

    pub(crate) fn emit(&self, event: ServerEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    pub fn recent_device(&self) -> Option<String> {
        self.recent_device
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn set_recent_device(&self, id: impl Into<String>) {
        *self
            .recent_device
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(id.into());
    }

    pub fn tracker_state(&self) -> TrackerState {
        self.tracker
            .as_ref()
            .map(AdbTracker::state)
            .unwrap_or_default()
    }

    /// Ask [`run`](Self::run) to return
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    // ─────────────────────────────────────────────────────────
    // Event loop
    // ─────────────────────────────────────────────────────────

    /// Drain the background event sources until [`shutdown`](Self::shutdown)
    pub async fn run(self: Arc<Self>, mut sources: EventSources) {
        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => {
                    debug!("Context loop shutting down");
                    break;
                }
                Some(event) = sources.session_rx.recv() => {
                    self.on_session_event(event);
                }
                Some(event) = sources.tracker_rx.recv() => {
                    self.on_tracker_event(event);
                }
                Some(request) = sources.exec_rx.recv() => {
                    self.on_exec(request);
                }
            }
        }
    }

    fn on_session_event(self: &Arc<Self>, event: SessionEvent) {
        match event {
            SessionEvent::Attached(session)
                if session.kind() == TransportKind::Direct
                    && !self.accepting.load(Ordering::SeqCst) =>
            {
                debug!("Server stopped, closing late {}", session.label());
                tokio::spawn(async move {
                    let _ = session.close().await;
                });
            }
            SessionEvent::Attached(session) => match self.registry.attach(session.clone()) {
                Ok(replaced) => {
                    if let Some(old) = replaced {
                        info!("{} replaced an older session", session.label());
                        self.forget_watch(old.instance());
                        tokio::spawn(async move {
                            let _ = old.close().await;
                        });
                    }
                    self.emit(ServerEvent::DeviceAttached {
                        device: session.id(),
                        label: session.label(),
                        kind: session.kind(),
                    });
                }
                Err(e) => debug!("Not attaching: {}", e),
            },
            SessionEvent::Message {
                id,
                instance: _,
                message,
            } => {
                let (kind, data) = match message {
                    InboundMessage::Other { kind, data, .. } => (kind, data),
                    other => (other.kind().to_string(), Value::Null),
                };
                self.emit(ServerEvent::DeviceMessage {
                    device: id,
                    kind,
                    data,
                });
            }
            SessionEvent::Log { id, instance, line } => {
                if self.registry.route_log(&id, instance, &line) {
                    self.emit(ServerEvent::DeviceLog { device: id, line });
                }
            }
            SessionEvent::Disconnected { id, instance } => {
                self.forget_watch(instance);
                if self.registry.detach(&id, instance).is_some() {
                    self.emit(ServerEvent::DeviceDetached { device: id });
                }
            }
            SessionEvent::HandshakeTimedOut { id, instance } => {
                debug!("Session {} for {} never said hello", instance, id);
            }
        }
    }

    fn on_tracker_event(self: &Arc<Self>, event: TrackerEvent) {
        match event {
            TrackerEvent::Present(serial) | TrackerEvent::DeviceAdded(serial) => {
                let context = Arc::clone(self);
                tokio::spawn(async move {
                    let _ = context.connect_device(&serial).await;
                });
            }
            TrackerEvent::DeviceRemoved(serial) => {
                if let Some(forwards) = &self.forwards {
                    forwards.forget(&serial);
                }
                if let Some(session) = self.registry.get(&serial) {
                    if session.kind() == TransportKind::AdbTunnel {
                        tokio::spawn(async move {
                            let _ = session.close().await;
                        });
                    }
                }
            }
            TrackerEvent::TrackingStarted => self.emit(ServerEvent::TrackingStarted),
            TrackerEvent::AlreadyRunning => self.emit(ServerEvent::TrackingAlreadyRunning),
            TrackerEvent::TrackingStopped => self.emit(ServerEvent::TrackingStopped),
            TrackerEvent::TrackingFailed(error) => {
                self.emit(ServerEvent::TrackingFailed { error })
            }
        }
    }

    fn on_exec(self: &Arc<Self>, request: ExecRequest) {
        self.emit(ServerEvent::Exec {
            cmd: request.cmd.clone(),
            path: request.path.clone(),
        });
        let context = Arc::clone(self);
        tokio::spawn(async move {
            if let Err(e) = commands::handle_exec(&context, &request).await {
                warn!("/exec {} {} failed: {}", request.cmd, request.path, e);
            }
        });
    }

    // ─────────────────────────────────────────────────────────
    // Server lifecycle
    // ─────────────────────────────────────────────────────────

    /// Start accepting device connections
    ///
    /// Listening twice reports [`ServerEvent::AlreadyListening`] and keeps the
    /// existing socket.
    pub async fn listen(&self) -> Result<SocketAddr> {
        let mut listener = self.listener.lock().await;
        if let Some(existing) = listener.as_ref() {
            let addr = existing.local_addr();
            self.emit(ServerEvent::AlreadyListening { addr });
            return Ok(addr);
        }

        let bound = Listener::bind(
            self.settings.server.addr(),
            Arc::clone(&self.session_config),
            self.session_tx.clone(),
            self.exec_tx.clone(),
        )
        .await?;
        let addr = bound.local_addr();
        *listener = Some(bound);
        self.accepting.store(true, Ordering::SeqCst);
        self.emit(ServerEvent::Listening { addr });
        Ok(addr)
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.lock().await.as_ref().map(Listener::local_addr)
    }

    /// Stop accepting and close every session
    ///
    /// Direct connections still in their handshake are closed as soon as
    /// they say hello.
    pub async fn stop_server(&self) {
        self.accepting.store(false, Ordering::SeqCst);
        if let Some(listener) = self.listener.lock().await.take() {
            listener.shutdown().await;
        }

        let sessions = self.registry.drain();
        join_all(sessions.iter().map(|s| s.close())).await;
        self.watches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();

        info!("Server stopped, {} session(s) closed", sessions.len());
        self.emit(ServerEvent::ServerStopped);
    }

    /// Start ADB device tracking
    ///
    /// The outcome is also published as a tracking event.
    pub async fn start_tracking(&self) -> Result<()> {
        match &self.tracker {
            Some(tracker) => tracker.start().await,
            None => Err(Error::config("ADB integration is disabled")),
        }
    }

    pub fn stop_tracking(&self) {
        if let Some(tracker) = &self.tracker {
            tracker.stop();
        }
    }

    /// Listen, then start tracking
    ///
    /// A tracking failure is reported as an event and does not fail the call.
    pub async fn start_all(&self) -> Result<SocketAddr> {
        let addr = self.listen().await?;
        if self.tracker.is_some() {
            if let Err(e) = self.start_tracking().await {
                warn!("{}", e);
            }
        }
        Ok(addr)
    }

    pub async fn stop_all(&self) {
        self.stop_server().await;
        self.stop_tracking();
    }

    /// Non-loopback IPv4 address devices can reach this host on
    ///
    /// Determined from the route an outbound UDP socket would take; nothing
    /// is sent.
    pub fn server_addresses() -> Vec<IpAddr> {
        let mut addrs = Vec::new();
        if let Ok(socket) = UdpSocket::bind("0.0.0.0:0") {
            if socket.connect("8.8.8.8:80").is_ok() {
                if let Ok(local) = socket.local_addr() {
                    let ip = local.ip();
                    if ip.is_ipv4() && !ip.is_loopback() && !ip.is_unspecified() {
                        addrs.push(ip);
                    }
                }
            }
        }
        addrs
    }

    // ─────────────────────────────────────────────────────────
    // ADB devices
    // ─────────────────────────────────────────────────────────

    fn adb_bridge(&self) -> Result<&Arc<B>> {
        self.adb
            .as_ref()
            .ok_or_else(|| Error::config("ADB integration is disabled"))
    }

    /// Forward the device agent's port and open a tunneled session to it
    ///
    /// Returns the new session's instance. Failures are also published as
    /// [`ServerEvent::ConnectFailed`].
    pub async fn connect_device(&self, serial: &str) -> Result<u64> {
        let result = self.open_tunnel(serial).await;
        if let Err(e) = &result {
            warn!("Failed to connect {}: {}", serial, e);
            self.emit(ServerEvent::ConnectFailed {
                device: serial.to_string(),
                error: e.to_string(),
            });
        }
        result
    }

    async fn open_tunnel(&self, serial: &str) -> Result<u64> {
        let forwards = self
            .forwards
            .as_ref()
            .ok_or_else(|| Error::config("ADB integration is disabled"))?;

        let local_port = self
            .settings
            .adb
            .local_port
            .unwrap_or(self.settings.server.port);
        let mapping = forwards
            .ensure_forward(serial, local_port, self.settings.adb.device_port)
            .await?;

        connect_tunnel(
            serial,
            mapping.local_port,
            Arc::clone(&self.session_config),
            self.session_tx.clone(),
        )
        .await
    }

    /// Gracefully close the attached session `id`
    pub async fn disconnect_device(&self, id: &str) -> Result<()> {
        self.registry.lookup(id)?.close().await
    }

    /// `"<brand> <model>: <serial>"` for every device ADB knows about
    pub async fn adb_device_labels(&self) -> Result<Vec<String>> {
        let bridge = self.adb_bridge()?;
        let devices = bridge.list_devices().await?;

        let mut labels = Vec::with_capacity(devices.len());
        for device in devices {
            let handle = AdbHandle::new(device.serial.clone(), Arc::clone(bridge));
            let label = match handle.product_label().await {
                Ok(product) => format!("{}: {}", product, device.serial),
                Err(e) => {
                    debug!("No product label for {}: {}", device.serial, e);
                    device.serial.clone()
                }
            };
            labels.push(label);
        }
        Ok(labels)
    }

    // ─────────────────────────────────────────────────────────
    // Projects
    // ─────────────────────────────────────────────────────────

    fn watch_for(&self, instance: u64) -> SharedWatch<P::Watch> {
        let mut watches = self.watches.lock().unwrap_or_else(|e| e.into_inner());
        Arc::clone(watches.entry(instance).or_default())
    }

    fn forget_watch(&self, instance: u64) {
        self.watches
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&instance);
    }

    /// Pack `folder` for every attached session and send it as `command`
    ///
    /// Each session uses its own watch, rebound when the folder changes.
    pub async fn send_project_command(&self, folder: &Path, command: &str) -> BroadcastReport {
        let started = Instant::now();
        let sessions = self.registry.sessions();
        let results = join_all(
            sessions
                .iter()
                .map(|session| self.send_project_to(session, folder, command, started)),
        )
        .await;

        let mut report = BroadcastReport::default();
        for (session, result) in sessions.iter().zip(results) {
            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!("Sending {} to {} failed: {}", folder.display(), session.label(), e);
                    report.failed.push(session.id());
                }
            }
        }
        report
    }

    async fn send_project_to(
        &self,
        session: &SessionHandle,
        folder: &Path,
        command: &str,
        started: Instant,
    ) -> Result<()> {
        let watch = self.watch_for(session.instance());
        let mut watch = watch.lock().await;
        let diff = watch.bind(&self.packer, folder).diff().await?;

        session.send_bytes(diff.buffer).await?;
        let mut extra = project_extra(folder);
        extra.insert("name".into(), Value::String(folder.display().to_string()));
        session
            .send_bytes_command(command, &diff.content_hash, extra)
            .await?;

        self.registry.append_log(
            &session.id(),
            format!("Project sent in {:.3} s", started.elapsed().as_secs_f64()),
        );
        Ok(())
    }

    /// Transfer `folder` to device `id`
    ///
    /// Tunneled devices receive it through `adb push`. Progress is published
    /// as [`ServerEvent::TransferProgress`], the outcome as
    /// [`ServerEvent::TransferFinished`].
    pub async fn save_project(
        &self,
        id: &str,
        folder: &Path,
        cancel: CancellationToken,
    ) -> Result<()> {
        let session = self.registry.lookup(id)?;
        let adb = match (session.kind(), &self.adb) {
            (TransportKind::AdbTunnel, Some(bridge)) => {
                Some(AdbHandle::new(session.id(), Arc::clone(bridge)))
            }
            _ => None,
        };

        let (progress_tx, mut progress_rx) = mpsc::unbounded_channel();
        let events = self.events.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(progress) = progress_rx.recv().await {
                let _ = events.send(ServerEvent::TransferProgress(progress));
            }
        });

        let started = Instant::now();
        let job = TransferJob::new(session.clone(), folder, &self.settings.transfer)
            .with_adb(adb)
            .with_cancel(cancel)
            .with_progress(progress_tx);

        let watch = self.watch_for(session.instance());
        let result = {
            let mut watch = watch.lock().await;
            job.run(watch.bind(&self.packer, folder)).await
        };
        let _ = forwarder.await;

        let elapsed = started.elapsed();
        if result.is_ok() {
            self.registry.append_log(
                id,
                format!("Project sent in {:.3} s", elapsed.as_secs_f64()),
            );
        }
        self.emit(ServerEvent::TransferFinished {
            device: id.to_string(),
            elapsed_ms: elapsed.as_millis() as u64,
            error: result.as_ref().err().map(ToString::to_string),
        });
        result
    }

    /// Attached sessions with the recently used device first
    pub fn devices_for_picker(&self) -> Vec<SessionHandle> {
        let mut sessions = self.registry.sessions();
        if let Some(recent) = self.recent_device() {
            if let Some(pos) = sessions.iter().position(|s| s.id() == recent) {
                let session = sessions.remove(pos);
                sessions.insert(0, session);
            }
        }
        sessions
    }
}
