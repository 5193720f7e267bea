//! WebSocket transport server using Axum.
//!
//! Handles the HTTP upgrade, the connection limit, and the per-connection
//! loop that feeds inbound text frames to the session handler and writes
//! outbound frames from a single channel. `POST /stop[?timeout=ms]` lets a
//! parent process stop the host remotely.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::{
    Router,
    extract::{
        Query, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
};
use futures_util::{SinkExt, StreamExt};
use host_protocol::ConnectionId;
use serde_json::json;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Implemented by the host's session manager. Called from connection tasks;
/// implementations must not block.
pub trait SessionHandler: Send + Sync + 'static {
    /// A connection was accepted. Frames sent on `outbound` are written to
    /// that connection, in order.
    fn on_connect(&self, outbound: mpsc::UnboundedSender<String>) -> ConnectionId;

    /// One inbound text frame.
    fn on_message(&self, connection: ConnectionId, text: String);

    /// The connection closed, for whatever reason.
    fn on_disconnect(&self, connection: ConnectionId);

    /// Body of `GET /status`.
    fn status(&self) -> serde_json::Value;

    /// `POST /stop`. `None` stops now; otherwise stop after `delay` unless a
    /// connection opens first.
    fn stop(&self, delay: Option<Duration>);
}

/// Transport server configuration.
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Port to listen on (0 for OS-assigned)
    pub port: u16,
    /// Hostname to bind to
    pub hostname: String,
    /// Maximum concurrent connections
    pub max_connections: Option<usize>,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            port: 0,
            hostname: "127.0.0.1".into(),
            max_connections: None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Invalid listen address {0}")]
    InvalidAddress(String),

    #[error("Failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// Shared state for the transport server.
struct AppState<H: SessionHandler> {
    handler: Arc<H>,
    config: TransportConfig,
    /// Flips to true when the server is stopping
    closing: watch::Receiver<bool>,
    /// Open WebSocket connections (for health check and the limit)
    connection_count: AtomicUsize,
}

/// The transport server. Owns the listener task.
pub struct TransportServer {
    closing_tx: watch::Sender<bool>,
    handle: Option<tokio::task::JoinHandle<()>>,
    local_addr: SocketAddr,
}

impl TransportServer {
    /// Bind and start serving. Returns once the listener is bound, so
    /// [`port`](Self::port) reports the OS-assigned port when `config.port`
    /// is 0.
    pub async fn start<H: SessionHandler>(
        config: TransportConfig,
        handler: Arc<H>,
    ) -> Result<Self, TransportError> {
        let raw = format!("{}:{}", config.hostname, config.port);
        let addr: SocketAddr = tokio::net::lookup_host(&raw)
            .await
            .ok()
            .and_then(|mut addrs| addrs.next())
            .ok_or_else(|| TransportError::InvalidAddress(raw.clone()))?;

        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|source| TransportError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| TransportError::Bind { addr, source })?;

        let (closing_tx, closing_rx) = watch::channel(false);
        let state = Arc::new(AppState {
            handler,
            config,
            closing: closing_rx.clone(),
            connection_count: AtomicUsize::new(0),
        });

        let app = Router::new()
            .route("/ws", get(ws_upgrade_handler::<H>))
            .route("/health", get(health_handler::<H>))
            .route("/status", get(status_handler::<H>))
            .route("/stop", post(stop_handler::<H>))
            .with_state(state);

        info!("Transport listening on ws://{local_addr}/ws");

        let mut shutdown_rx = closing_rx;
        let handle = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.changed().await;
                })
                .await
                .ok();
        });

        Ok(Self {
            closing_tx,
            handle: Some(handle),
            local_addr,
        })
    }

    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Close every connection and stop accepting new ones.
    pub async fn stop(&mut self) {
        let _ = self.closing_tx.send(true);
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
        info!("Transport stopped");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// HTTP Handlers
// ─────────────────────────────────────────────────────────────────────────────

async fn ws_upgrade_handler<H: SessionHandler>(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState<H>>>,
) -> impl IntoResponse {
    if let Some(max) = state.config.max_connections {
        let current = state.connection_count.load(Ordering::Relaxed);
        if current >= max {
            warn!("Connection rejected: max connections reached ({max})");
            return StatusCode::SERVICE_UNAVAILABLE.into_response();
        }
    }

    ws.on_upgrade(move |socket| handle_ws_connection(socket, state))
        .into_response()
}

async fn health_handler<H: SessionHandler>(
    State(state): State<Arc<AppState<H>>>,
) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "connections": state.connection_count.load(Ordering::Relaxed),
    }))
}

async fn status_handler<H: SessionHandler>(
    State(state): State<Arc<AppState<H>>>,
) -> impl IntoResponse {
    Json(state.handler.status())
}

async fn stop_handler<H: SessionHandler>(
    State(state): State<Arc<AppState<H>>>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let timeout = match params.get("timeout").map(|raw| raw.parse::<u64>()) {
        None => None,
        Some(Ok(ms)) => Some(ms),
        Some(Err(_)) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": "timeout must be a whole number of milliseconds" })),
            )
                .into_response();
        }
    };

    state.handler.stop(timeout.map(Duration::from_millis));
    Json(json!({ "status": "stopping", "timeout": timeout })).into_response()
}

// ─────────────────────────────────────────────────────────────────────────────
// WebSocket Connection Handler
// ─────────────────────────────────────────────────────────────────────────────

async fn handle_ws_connection<H: SessionHandler>(socket: WebSocket, state: Arc<AppState<H>>) {
    state.connection_count.fetch_add(1, Ordering::Relaxed);

    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
    let connection = state.handler.on_connect(outbound_tx);
    let (mut ws_tx, mut ws_rx) = socket.split();
    let mut closing = state.closing.clone();

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        state.handler.on_message(connection, text.as_str().to_owned());
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = ws_tx.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!("{connection} closed by peer");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error for {connection}: {e}");
                        break;
                    }
                    _ => {}
                }
            }

            frame = outbound_rx.recv() => {
                let Some(frame) = frame else { break };
                if let Err(e) = ws_tx.send(Message::Text(frame.into())).await {
                    warn!("Failed to send to {connection}: {e}");
                    break;
                }
            }

            _ = closing.changed() => {
                let _ = ws_tx.send(Message::Close(None)).await;
                break;
            }
        }
    }

    state.handler.on_disconnect(connection);
    let remaining = state.connection_count.fetch_sub(1, Ordering::Relaxed) - 1;
    debug!("{connection} disconnected ({remaining} open)");
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicU64;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_tungstenite::{connect_async, tungstenite};

    /// Echoes every frame back with a prefix and records lifecycle calls.
    #[derive(Default)]
    struct EchoSessions {
        next_id: AtomicU64,
        outbound: Mutex<Vec<(ConnectionId, mpsc::UnboundedSender<String>)>>,
        disconnected: Mutex<Vec<ConnectionId>>,
        stops: Mutex<Vec<Option<Duration>>>,
    }

    impl SessionHandler for EchoSessions {
        fn on_connect(&self, outbound: mpsc::UnboundedSender<String>) -> ConnectionId {
            let id = ConnectionId(self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
            self.outbound.lock().push((id, outbound));
            id
        }

        fn on_message(&self, connection: ConnectionId, text: String) {
            let outbound = self.outbound.lock();
            if let Some((_, tx)) = outbound.iter().find(|(id, _)| *id == connection) {
                let _ = tx.send(format!("{connection}:{text}"));
            }
        }

        fn on_disconnect(&self, connection: ConnectionId) {
            self.disconnected.lock().push(connection);
        }

        fn status(&self) -> serde_json::Value {
            json!({ "type": "Host" })
        }

        fn stop(&self, delay: Option<Duration>) {
            self.stops.lock().push(delay);
        }
    }

    async fn start(max_connections: Option<usize>) -> (TransportServer, Arc<EchoSessions>) {
        let sessions = Arc::new(EchoSessions::default());
        let config = TransportConfig {
            max_connections,
            ..Default::default()
        };
        let server = TransportServer::start(config, sessions.clone()).await.unwrap();
        (server, sessions)
    }

    async fn http_get(port: u16, path: &str) -> String {
        http(port, "GET", path).await
    }

    async fn http(port: u16, method: &str, path: &str) -> String {
        let mut stream = tokio::net::TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let request = format!(
            "{method} {path} HTTP/1.1\r\nHost: localhost\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    async fn wait_until(pred: impl Fn() -> bool) {
        for _ in 0..200 {
            if pred() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn binds_os_assigned_port() {
        let (mut server, _) = start(None).await;
        assert_ne!(server.port(), 0);
        server.stop().await;
    }

    #[tokio::test]
    async fn frames_round_trip_through_session_handler() {
        let (mut server, sessions) = start(None).await;
        let url = format!("ws://127.0.0.1:{}/ws", server.port());
        let (mut ws, _) = connect_async(&url).await.unwrap();

        ws.send(tungstenite::Message::Text("hello".into())).await.unwrap();
        let reply = ws.next().await.unwrap().unwrap();
        assert_eq!(reply.into_text().unwrap().as_str(), "conn-1:hello");

        ws.close(None).await.unwrap();
        wait_until(|| sessions.disconnected.lock().len() == 1).await;
        assert_eq!(sessions.disconnected.lock()[0], ConnectionId(1));

        server.stop().await;
    }

    #[tokio::test]
    async fn health_and_status_endpoints() {
        let (mut server, _) = start(None).await;

        let health = http_get(server.port(), "/health").await;
        assert!(health.starts_with("HTTP/1.1 200"));
        assert!(health.contains(r#""connections":0"#));

        let status = http_get(server.port(), "/status").await;
        assert!(status.contains(r#""type":"Host""#));

        server.stop().await;
    }

    #[tokio::test]
    async fn stop_endpoint_passes_the_delay() {
        let (mut server, sessions) = start(None).await;

        let now = http(server.port(), "POST", "/stop").await;
        assert!(now.starts_with("HTTP/1.1 200"));
        assert!(now.contains(r#""status":"stopping""#));

        let later = http(server.port(), "POST", "/stop?timeout=250").await;
        assert!(later.contains(r#""timeout":250"#));

        let bad = http(server.port(), "POST", "/stop?timeout=soon").await;
        assert!(bad.starts_with("HTTP/1.1 400"));

        let get = http_get(server.port(), "/stop").await;
        assert!(get.starts_with("HTTP/1.1 405"));

        assert_eq!(*sessions.stops.lock(), [None, Some(Duration::from_millis(250))]);
        server.stop().await;
    }

    #[tokio::test]
    async fn rejects_connections_over_the_limit() {
        let (mut server, sessions) = start(Some(1)).await;
        let url = format!("ws://127.0.0.1:{}/ws", server.port());

        let (_first, _) = connect_async(&url).await.unwrap();
        wait_until(|| sessions.outbound.lock().len() == 1).await;

        match connect_async(&url).await {
            Err(tungstenite::Error::Http(response)) => assert_eq!(response.status(), 503),
            other => panic!("expected 503, got {other:?}"),
        }

        server.stop().await;
    }

    #[tokio::test]
    async fn stop_closes_open_connections() {
        let (mut server, sessions) = start(None).await;
        let url = format!("ws://127.0.0.1:{}/ws", server.port());
        let (mut ws, _) = connect_async(&url).await.unwrap();
        wait_until(|| sessions.outbound.lock().len() == 1).await;

        server.stop().await;

        let next = tokio::time::timeout(Duration::from_secs(2), ws.next()).await.unwrap();
        assert!(matches!(next, Some(Ok(tungstenite::Message::Close(_))) | None | Some(Err(_))));
        wait_until(|| sessions.disconnected.lock().len() == 1).await;
    }
}
