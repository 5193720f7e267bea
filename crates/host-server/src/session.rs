//! Connection tracking and the idle-disconnect policy.
//!
//! ```text
//! Active ──(last connection closes)──▶ Idle ──(disconnectTimeout elapses)──▶ Shutdown
//!   ▲                                    │
//!   └───────(connection arrives)─────────┘
//! ```
//!
//! The idle timer is armed only when the connection count drops to zero, so
//! a host that never sees a connection never shuts itself down. Messages do
//! not reset it: there are none while no connection is open.
//!
//! `POST /stop?timeout=ms` arms the same timer without waiting for the count
//! to drop. Any new connection cancels either kind of pending shutdown.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use host_protocol::{ConnectionId, HostStatus, decode_request};
use host_supervisor::Supervisor;
use host_transport::SessionHandler;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::dispatcher::{Dispatcher, Outbound, send};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum HostPhase {
    /// At least one connection is open.
    Active,
    /// No connection is open. The idle timer runs if one has closed.
    Idle,
    /// The idle timer fired or a stop was requested. Terminal.
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HostIdleState {
    pub active_connections: usize,
    /// Set when the count last dropped to zero, cleared when it rises again.
    pub idle_since: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionAge {
    pub id: ConnectionId,
    pub open_ms: u64,
    pub idle_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PendingShutdown {
    /// Armed when the last connection closes
    Idle,
    /// Armed by a delayed stop request
    Stop,
}

/// One open connection.
#[derive(Debug)]
struct Connection {
    opened_at: Instant,
    last_activity_at: Instant,
    outbound: Outbound,
}

impl Connection {
    fn new(outbound: Outbound) -> Self {
        let now = Instant::now();
        Self {
            opened_at: now,
            last_activity_at: now,
            outbound,
        }
    }

    fn touch(&mut self) {
        self.last_activity_at = Instant::now();
    }
}

struct SessionState {
    connections: HashMap<ConnectionId, Connection>,
    idle_since: Option<DateTime<Utc>>,
    /// Bumped whenever a shutdown timer is armed or cancelled; a timer only
    /// fires if the epoch it was armed with is still current.
    idle_epoch: u64,
    timer: Option<(PendingShutdown, JoinHandle<()>)>,
}

pub struct SessionManager {
    next_id: AtomicU64,
    state: Arc<Mutex<SessionState>>,
    phase: Arc<watch::Sender<HostPhase>>,
    dispatcher: Arc<Dispatcher>,
    disconnect_timeout: Option<Duration>,
    supervisor: Option<Arc<Supervisor>>,
    /// Set once the transport is bound and the port is known
    status: OnceLock<HostStatus>,
}

impl SessionManager {
    pub fn new(
        dispatcher: Arc<Dispatcher>,
        disconnect_timeout: Option<Duration>,
        supervisor: Option<Arc<Supervisor>>,
    ) -> Self {
        let (phase, _) = watch::channel(HostPhase::Idle);
        Self {
            next_id: AtomicU64::new(1),
            state: Arc::new(Mutex::new(SessionState {
                connections: HashMap::new(),
                idle_since: None,
                idle_epoch: 0,
                timer: None,
            })),
            phase: Arc::new(phase),
            dispatcher,
            disconnect_timeout,
            supervisor,
            status: OnceLock::new(),
        }
    }

    pub fn set_status(&self, status: HostStatus) {
        let _ = self.status.set(status);
    }

    pub fn phase(&self) -> HostPhase {
        *self.phase.borrow()
    }

    pub fn connection_count(&self) -> usize {
        self.state.lock().connections.len()
    }

    pub fn idle_state(&self) -> HostIdleState {
        let state = self.state.lock();
        HostIdleState {
            active_connections: state.connections.len(),
            idle_since: state.idle_since,
        }
    }

    /// Age and time since the last message of every open connection.
    pub fn connection_ages(&self) -> Vec<ConnectionAge> {
        let state = self.state.lock();
        let mut ages: Vec<_> = state
            .connections
            .iter()
            .map(|(id, c)| ConnectionAge {
                id: *id,
                open_ms: c.opened_at.elapsed().as_millis() as u64,
                idle_ms: c.last_activity_at.elapsed().as_millis() as u64,
            })
            .collect();
        ages.sort_by_key(|age| age.id);
        ages
    }

    /// Resolves once the host has entered [`HostPhase::Shutdown`].
    pub async fn wait_for_shutdown(&self) {
        let mut rx = self.phase.subscribe();
        loop {
            let phase = *rx.borrow_and_update();
            if phase == HostPhase::Shutdown {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Enter [`HostPhase::Shutdown`] now (explicit stop).
    pub fn shutdown(&self) {
        let timer = {
            let mut state = self.state.lock();
            state.idle_epoch += 1;
            state.timer.take()
        };
        if let Some((_, timer)) = timer {
            timer.abort();
        }
        self.phase.send_replace(HostPhase::Shutdown);
    }

    /// Requested stop. Without a delay the host shuts down at once; with
    /// one, shutdown follows unless a connection opens first.
    pub fn request_stop(&self, delay: Option<Duration>) {
        match delay.filter(|d| !d.is_zero()) {
            None => {
                info!("Stop requested");
                self.shutdown();
            }
            Some(delay) => {
                info!("Stop requested in {delay:?}");
                let mut state = self.state.lock();
                self.arm_timer(&mut state, delay, PendingShutdown::Stop);
            }
        }
    }

    fn arm_timer(&self, state: &mut SessionState, timeout: Duration, kind: PendingShutdown) {
        state.idle_epoch += 1;
        let epoch = state.idle_epoch;
        let shared = self.state.clone();
        let phase = self.phase.clone();
        if let Some((_, previous)) = state.timer.take() {
            previous.abort();
        }

        debug!("{kind:?} shutdown in {timeout:?}");
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let mut state = shared.lock();
            if state.idle_epoch != epoch {
                return;
            }
            if kind == PendingShutdown::Idle && !state.connections.is_empty() {
                return;
            }
            state.timer = None;
            match kind {
                PendingShutdown::Idle => info!("No connections for {timeout:?}; shutting down"),
                PendingShutdown::Stop => info!("Stop delay elapsed; shutting down"),
            }
            phase.send_replace(HostPhase::Shutdown);
        });
        state.timer = Some((kind, handle));
    }

    fn status_body(&self) -> Value {
        let Some(status) = self.status.get() else {
            return json!({ "status": "starting" });
        };
        let mut body = serde_json::to_value(status).unwrap_or_else(|_| json!({}));
        body["phase"] = json!(self.phase());
        body["connections"] = json!(self.connection_count());
        body["connectionAges"] = json!(self.connection_ages());
        body["operations"] = json!(self.dispatcher.registry().names());
        body["pendingInvocations"] = json!(self.dispatcher.tracker().pending_count());
        if let Some(supervisor) = &self.supervisor {
            body["serviceStates"] = json!(supervisor.snapshot());
        }
        body
    }
}

impl SessionHandler for SessionManager {
    fn on_connect(&self, outbound: mpsc::UnboundedSender<String>) -> ConnectionId {
        let id = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let timer = {
            let mut state = self.state.lock();
            state.connections.insert(id, Connection::new(outbound));
            state.idle_since = None;
            state.idle_epoch += 1;
            state.timer.take()
        };
        if let Some((_, timer)) = timer {
            debug!("Pending shutdown cancelled by {id}");
            timer.abort();
        }
        self.phase.send_if_modified(|phase| {
            if *phase == HostPhase::Idle {
                *phase = HostPhase::Active;
                true
            } else {
                false
            }
        });
        info!("{id} connected");
        id
    }

    fn on_message(&self, connection: ConnectionId, text: String) {
        let outbound = {
            let mut state = self.state.lock();
            let Some(conn) = state.connections.get_mut(&connection) else {
                return;
            };
            conn.touch();
            conn.outbound.clone()
        };

        match decode_request(&text) {
            Ok(request) => self.dispatcher.handle(connection, request, &outbound),
            Err(failure) => {
                debug!("{connection}: rejected message: {:?}", failure.error);
                send(&outbound, failure);
            }
        }
    }

    fn on_disconnect(&self, connection: ConnectionId) {
        let abandoned = self.dispatcher.tracker().abandon_all_for(connection);
        if !abandoned.is_empty() {
            debug!("{connection}: abandoned {} pending invocation(s)", abandoned.len());
        }

        let mut state = self.state.lock();
        if state.connections.remove(&connection).is_none() {
            return;
        }
        info!("{connection} disconnected ({} open)", state.connections.len());
        if !state.connections.is_empty() {
            return;
        }

        state.idle_since = Some(Utc::now());
        self.phase.send_if_modified(|phase| {
            if *phase == HostPhase::Active {
                *phase = HostPhase::Idle;
                true
            } else {
                false
            }
        });
        let stop_pending = matches!(state.timer, Some((PendingShutdown::Stop, _)));
        if let Some(timeout) = self.disconnect_timeout.filter(|_| !stop_pending) {
            self.arm_timer(&mut state, timeout, PendingShutdown::Idle);
        }
    }

    fn status(&self) -> Value {
        self.status_body()
    }

    fn stop(&self, delay: Option<Duration>) {
        self.request_stop(delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{HandlerDescriptor, HandlerKind, HandlerRegistry};
    use crate::tracker::InvocationTracker;
    use host_protocol::{HostErrorCode, Response};
    use host_services::builtin;

    fn manager(disconnect_timeout: Option<Duration>) -> SessionManager {
        let mut registry = HandlerRegistry::new();
        for kind in ["double", "async_echo"] {
            registry
                .register(HandlerDescriptor {
                    name: kind.into(),
                    kind: HandlerKind::InProcess,
                    handler: builtin(kind, &Value::Null).unwrap(),
                    cacheable: false,
                })
                .unwrap();
        }
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::new(registry),
            Arc::new(InvocationTracker::new()),
            None,
            None,
        ));
        SessionManager::new(dispatcher, disconnect_timeout, None)
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<String>) -> Response {
        let text = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        serde_json::from_str(&text).unwrap()
    }

    #[tokio::test]
    async fn connection_ids_are_never_reused() {
        let sessions = manager(None);
        let (tx, _rx) = mpsc::unbounded_channel();
        let a = sessions.on_connect(tx.clone());
        sessions.on_disconnect(a);
        let b = sessions.on_connect(tx);
        assert_ne!(a, b);
        assert!(b > a);
    }

    #[tokio::test]
    async fn messages_are_dispatched_and_malformed_ones_rejected() {
        let sessions = manager(None);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = sessions.on_connect(tx);

        sessions.on_message(
            conn,
            r#"{"correlationId":1,"operationName":"double","payload":{"number":21}}"#.into(),
        );
        assert_eq!(recv(&mut rx).await.result, Some(json!(42)));

        sessions.on_message(conn, "not json".into());
        let resp = recv(&mut rx).await;
        assert!(resp.correlation_id.is_none());
        assert_eq!(resp.error.unwrap().kind, HostErrorCode::ParseError);
    }

    #[tokio::test]
    async fn disconnect_abandons_pending_invocations() {
        let sessions = manager(None);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = sessions.on_connect(tx);

        for id in 1..=3 {
            sessions.on_message(
                conn,
                json!({ "correlationId": id, "operationName": "async_echo", "payload": { "echo": "x" } })
                    .to_string(),
            );
        }
        assert_eq!(sessions.dispatcher.tracker().pending_for(conn), 3);

        sessions.on_disconnect(conn);
        assert_eq!(sessions.dispatcher.tracker().pending_count(), 0);

        // async_echo completes after 500ms; nothing may be delivered
        tokio::time::sleep(Duration::from_millis(700)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn idle_state_follows_connection_count() {
        let sessions = manager(None);
        assert_eq!(sessions.phase(), HostPhase::Idle);
        assert!(sessions.idle_state().idle_since.is_none());

        let (tx, _rx) = mpsc::unbounded_channel();
        let a = sessions.on_connect(tx.clone());
        let b = sessions.on_connect(tx);
        assert_eq!(sessions.phase(), HostPhase::Active);
        assert_eq!(sessions.connection_count(), 2);

        sessions.on_disconnect(a);
        assert!(sessions.idle_state().idle_since.is_none());
        sessions.on_disconnect(b);
        let idle = sessions.idle_state();
        assert_eq!(idle.active_connections, 0);
        assert!(idle.idle_since.is_some());
        assert_eq!(sessions.phase(), HostPhase::Idle);
    }

    #[tokio::test]
    async fn idle_timer_shuts_down_after_timeout() {
        let sessions = manager(Some(Duration::from_millis(100)));
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = sessions.on_connect(tx);
        sessions.on_disconnect(conn);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sessions.phase(), HostPhase::Idle);

        tokio::time::timeout(Duration::from_secs(2), sessions.wait_for_shutdown())
            .await
            .unwrap();
        assert_eq!(sessions.phase(), HostPhase::Shutdown);
    }

    #[tokio::test]
    async fn reconnect_cancels_idle_shutdown() {
        let sessions = manager(Some(Duration::from_millis(100)));
        let (tx, _rx) = mpsc::unbounded_channel();
        let first = sessions.on_connect(tx.clone());
        sessions.on_disconnect(first);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let _second = sessions.on_connect(tx);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(sessions.phase(), HostPhase::Active);
    }

    #[tokio::test]
    async fn no_timer_before_first_connection() {
        let sessions = manager(Some(Duration::from_millis(20)));
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(sessions.phase(), HostPhase::Idle);
    }

    #[tokio::test]
    async fn delayed_stop_fires_with_connections_open() {
        let sessions = manager(None);
        let (tx, _rx) = mpsc::unbounded_channel();
        let _conn = sessions.on_connect(tx);

        sessions.request_stop(Some(Duration::from_millis(50)));
        assert_eq!(sessions.phase(), HostPhase::Active);
        tokio::time::timeout(Duration::from_secs(2), sessions.wait_for_shutdown())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn new_connection_cancels_delayed_stop() {
        let sessions = manager(None);
        sessions.request_stop(Some(Duration::from_millis(100)));

        tokio::time::sleep(Duration::from_millis(30)).await;
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = sessions.on_connect(tx);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(sessions.phase(), HostPhase::Active);

        // Without a disconnect timeout, leaving does not re-arm anything
        sessions.on_disconnect(conn);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sessions.phase(), HostPhase::Idle);
    }

    #[tokio::test]
    async fn disconnect_keeps_a_pending_delayed_stop() {
        let sessions = manager(Some(Duration::from_secs(60)));
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = sessions.on_connect(tx);
        sessions.request_stop(Some(Duration::from_millis(100)));
        sessions.on_disconnect(conn);

        tokio::time::timeout(Duration::from_secs(2), sessions.wait_for_shutdown())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn stop_without_delay_is_immediate() {
        let sessions = manager(Some(Duration::from_secs(60)));
        let (tx, _rx) = mpsc::unbounded_channel();
        let _conn = sessions.on_connect(tx);
        sessions.request_stop(Some(Duration::ZERO));
        assert_eq!(sessions.phase(), HostPhase::Shutdown);
    }

    #[tokio::test]
    async fn connection_ages_track_activity() {
        let sessions = manager(None);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let a = sessions.on_connect(tx.clone());
        tokio::time::sleep(Duration::from_millis(60)).await;
        let b = sessions.on_connect(tx);

        sessions.on_message(
            a,
            r#"{"correlationId":1,"operationName":"double","payload":{"number":1}}"#.into(),
        );
        recv(&mut rx).await;

        let ages = sessions.connection_ages();
        assert_eq!(ages.iter().map(|age| age.id).collect::<Vec<_>>(), [a, b]);
        assert!(ages[0].open_ms >= 60);
        assert!(ages[0].idle_ms < ages[0].open_ms);
        assert!(ages[1].open_ms < ages[0].open_ms);
    }

    #[tokio::test]
    async fn zero_timeout_never_shuts_down() {
        let sessions = manager(None);
        let (tx, _rx) = mpsc::unbounded_channel();
        let conn = sessions.on_connect(tx);
        sessions.on_disconnect(conn);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(sessions.phase(), HostPhase::Idle);

        sessions.shutdown();
        sessions.wait_for_shutdown().await;
    }
}
