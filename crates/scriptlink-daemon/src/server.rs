//! Listening socket: `GET /exec` and the device socket upgrade on one port

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame as AxCloseFrame, Message as AxMessage, WebSocket};
use axum::extract::{ConnectInfo, Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{future, SinkExt, StreamExt};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::frame::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::Message as WsMessage;

use scriptlink_core::prelude::*;
use scriptlink_core::DeviceIdentity;

use crate::session::{spawn_session, SessionConfig, SessionEvent};

/// Command received on `GET /exec`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    pub cmd: String,
    pub path: String,
}

#[derive(Debug, Deserialize)]
struct ExecQuery {
    #[serde(default)]
    cmd: String,
    #[serde(default)]
    path: String,
}

#[derive(Clone)]
struct ServerState {
    config: Arc<SessionConfig>,
    session_tx: mpsc::UnboundedSender<SessionEvent>,
    exec_tx: mpsc::UnboundedSender<ExecRequest>,
}

/// A bound, accepting listener
pub struct Listener {
    local_addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl Listener {
    /// Bind `addr` and start accepting
    ///
    /// Every socket upgrade becomes a Direct session reporting on
    /// `session_tx`; every `/exec` hit is forwarded on `exec_tx`.
    pub async fn bind(
        addr: SocketAddr,
        config: Arc<SessionConfig>,
        session_tx: mpsc::UnboundedSender<SessionEvent>,
        exec_tx: mpsc::UnboundedSender<ExecRequest>,
    ) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::server(format!("failed to bind {addr}: {e}")))?;
        let local_addr = listener.local_addr()?;

        let state = ServerState {
            config,
            session_tx,
            exec_tx,
        };
        let app = Router::new()
            .route("/", get(upgrade))
            .route("/exec", get(exec))
            .fallback(|| async { StatusCode::NOT_FOUND })
            .with_state(state);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let served = axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await;
            if let Err(e) = served {
                error!("Listener failed: {}", e);
            }
            debug!("Listener task exiting");
        });

        info!("Listening on {}", local_addr);
        Ok(Self {
            local_addr,
            shutdown_tx: Some(shutdown_tx),
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and wait for the accept loop to finish
    ///
    /// Already upgraded sessions are not affected.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.task).await;
        info!("Stopped listening on {}", self.local_addr);
    }
}

async fn upgrade(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<ServerState>,
) -> impl IntoResponse {
    debug!("Socket upgrade from {}", peer);
    ws.on_upgrade(move |socket| async move {
        spawn_session(
            adapt(socket),
            DeviceIdentity::direct(peer),
            state.config,
            state.session_tx,
        );
    })
}

async fn exec(
    Query(query): Query<ExecQuery>,
    State(state): State<ServerState>,
) -> impl IntoResponse {
    info!("exec: cmd={} path={}", query.cmd, query.path);
    let body = format!("this command is:{}-->{}", query.cmd, query.path);
    let _ = state.exec_tx.send(ExecRequest {
        cmd: query.cmd,
        path: query.path,
    });
    (StatusCode::OK, body)
}

/// View an upgraded socket as a stream/sink of tungstenite messages
fn adapt(
    socket: WebSocket,
) -> impl futures_util::Stream<Item = std::result::Result<WsMessage, axum::Error>>
       + futures_util::Sink<WsMessage, Error = axum::Error>
       + Send
       + Unpin
       + 'static {
    socket
        .with(|msg: WsMessage| future::ready(Ok::<_, axum::Error>(to_axum(msg))))
        .map(|frame| frame.map(from_axum))
}

fn from_axum(msg: AxMessage) -> WsMessage {
    match msg {
        AxMessage::Text(text) => WsMessage::Text(text.as_str().to_owned().into()),
        AxMessage::Binary(bytes) => WsMessage::Binary(bytes),
        AxMessage::Ping(bytes) => WsMessage::Ping(bytes),
        AxMessage::Pong(bytes) => WsMessage::Pong(bytes),
        AxMessage::Close(_) => WsMessage::Close(None),
    }
}

fn to_axum(msg: WsMessage) -> AxMessage {
    match msg {
        WsMessage::Text(text) => AxMessage::Text(text.as_str().to_owned().into()),
        WsMessage::Binary(bytes) => AxMessage::Binary(bytes),
        WsMessage::Ping(bytes) => AxMessage::Ping(bytes),
        WsMessage::Pong(bytes) => AxMessage::Pong(bytes),
        WsMessage::Close(frame) => AxMessage::Close(frame.map(|CloseFrame { code, reason }| {
            AxCloseFrame {
                code: code.into(),
                reason: reason.as_str().to_owned().into(),
            }
        })),
        // raw frames are never written by sessions
        WsMessage::Frame(_) => AxMessage::Pong(Default::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn bind_ephemeral() -> (
        Listener,
        mpsc::UnboundedReceiver<SessionEvent>,
        mpsc::UnboundedReceiver<ExecRequest>,
    ) {
        let (session_tx, session_rx) = mpsc::unbounded_channel();
        let (exec_tx, exec_rx) = mpsc::unbounded_channel();
        let listener = Listener::bind(
            "127.0.0.1:0".parse().unwrap(),
            Arc::new(SessionConfig::default()),
            session_tx,
            exec_tx,
        )
        .await
        .unwrap();
        (listener, session_rx, exec_rx)
    }

    async fn http_get(addr: SocketAddr, target: &str) -> String {
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {target} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_exec_echoes_and_forwards() {
        let (listener, _sessions, mut execs) = bind_ephemeral().await;

        let response = http_get(listener.local_addr(), "/exec?cmd=save&path=%2Ffoo").await;

        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.contains("this command is:save-->/foo"));
        assert_eq!(
            execs.recv().await.unwrap(),
            ExecRequest {
                cmd: "save".into(),
                path: "/foo".into()
            }
        );
        listener.shutdown().await;
    }

    #[tokio::test]
    async fn test_unknown_path_is_404() {
        let (listener, _sessions, mut execs) = bind_ephemeral().await;

        let response = http_get(listener.local_addr(), "/nope").await;

        assert!(response.starts_with("HTTP/1.1 404"));
        assert!(execs.try_recv().is_err());
        listener.shutdown().await;
    }

    #[tokio::test]
    async fn test_bind_conflict_is_server_error() {
        let (listener, _sessions, _execs) = bind_ephemeral().await;
        let (session_tx, _) = mpsc::unbounded_channel();
        let (exec_tx, _) = mpsc::unbounded_channel();

        let err = Listener::bind(
            listener.local_addr(),
            Arc::new(SessionConfig::default()),
            session_tx,
            exec_tx,
        )
        .await
        .err()
        .unwrap();

        assert!(err.is_fatal());
        listener.shutdown().await;
    }
}
