//! Service supervisor.
//!
//! All lifecycle transitions happen on one monitor task that consumes
//! [`MonitorEvent`]s: start requests, spawn results, process exits and
//! backoff timers. Routing never mutates state; it reads a snapshot of
//! lifecycle and process handle taken under a single lock.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use host_protocol::{HandlerResult, HostError};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::process::{ProcessExit, ServiceProcess};
use crate::state::{Lifecycle, ServiceProcessState};
use crate::{ServiceSpec, SupervisorError, SupervisorPolicy};

/// A request held while its service is not ready.
struct Queued {
    payload: Value,
    reply: oneshot::Sender<HandlerResult>,
}

struct SlotInner {
    state: ServiceProcessState,
    process: Option<Arc<ServiceProcess>>,
}

struct ServiceSlot {
    spec: ServiceSpec,
    inner: RwLock<SlotInner>,
    /// Lock order: `queue` before `inner`.
    queue: Mutex<VecDeque<Queued>>,
}

type StartAck = oneshot::Sender<Result<(), SupervisorError>>;

enum MonitorEvent {
    Start {
        name: String,
        ack: StartAck,
    },
    Started {
        name: String,
        generation: u64,
        result: Result<Arc<ServiceProcess>, SupervisorError>,
    },
    Exited {
        name: String,
        generation: u64,
        exit: ProcessExit,
    },
    RestartDue {
        name: String,
        generation: u64,
    },
    Stable {
        name: String,
        generation: u64,
    },
    Shutdown {
        ack: Option<oneshot::Sender<()>>,
    },
}

enum Route {
    Forward(Arc<ServiceProcess>, Value),
    Queued(oneshot::Receiver<HandlerResult>),
}

/// Owns one child process per configured service.
pub struct Supervisor {
    services: Arc<HashMap<String, Arc<ServiceSlot>>>,
    /// Declaration order, for snapshots
    order: Vec<String>,
    policy: SupervisorPolicy,
    events: mpsc::UnboundedSender<MonitorEvent>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl Supervisor {
    /// Register `specs` and spawn the monitor task. No process is started
    /// until [`start`](Self::start) or [`start_all`](Self::start_all).
    pub fn new(specs: Vec<ServiceSpec>, policy: SupervisorPolicy) -> Result<Self, SupervisorError> {
        let mut services = HashMap::new();
        let mut order = Vec::with_capacity(specs.len());
        for spec in specs {
            if services.contains_key(&spec.name) {
                return Err(SupervisorError::DuplicateService(spec.name));
            }
            order.push(spec.name.clone());
            let slot = ServiceSlot {
                inner: RwLock::new(SlotInner {
                    state: ServiceProcessState::new(&spec.name),
                    process: None,
                }),
                queue: Mutex::new(VecDeque::new()),
                spec,
            };
            services.insert(slot.spec.name.clone(), Arc::new(slot));
        }
        let services = Arc::new(services);

        let (events, rx) = mpsc::unbounded_channel();
        let monitor = Monitor {
            services: services.clone(),
            policy,
            events: events.clone(),
            start_waiters: HashMap::new(),
        };
        let handle = tokio::spawn(monitor.run(rx));

        Ok(Self {
            services,
            order,
            policy,
            events,
            monitor: Mutex::new(Some(handle)),
        })
    }

    /// Start one service and wait for the outcome of its first attempt.
    ///
    /// A failed attempt is still supervised: the service is marked crashed
    /// and a restart is scheduled.
    pub async fn start(&self, name: &str) -> Result<(), SupervisorError> {
        let (ack, result) = oneshot::channel();
        self.events
            .send(MonitorEvent::Start {
                name: name.to_string(),
                ack,
            })
            .map_err(|_| SupervisorError::Stopped)?;
        result.await.unwrap_or(Err(SupervisorError::Stopped))
    }

    /// Start every service concurrently. Returns the first failure, after
    /// all attempts have resolved.
    pub async fn start_all(&self) -> Result<(), SupervisorError> {
        let mut pending = Vec::with_capacity(self.order.len());
        for name in &self.order {
            let (ack, result) = oneshot::channel();
            self.events
                .send(MonitorEvent::Start {
                    name: name.clone(),
                    ack,
                })
                .map_err(|_| SupervisorError::Stopped)?;
            pending.push(result);
        }

        let mut first_error = None;
        for result in pending {
            if let Err(e) = result.await.unwrap_or(Err(SupervisorError::Stopped)) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Forward `payload` to the named service and wait for its reply.
    pub async fn route_request(&self, service: &str, payload: Value) -> HandlerResult {
        let slot = self
            .services
            .get(service)
            .ok_or_else(|| HostError::unknown_operation(service))?;

        let route = {
            let mut queue = slot.queue.lock();
            let inner = slot.inner.read();
            let lifecycle = inner.state.lifecycle;
            match &inner.process {
                Some(process) if lifecycle == Lifecycle::Ready => {
                    Route::Forward(process.clone(), payload)
                }
                _ if lifecycle == Lifecycle::Stopped || self.policy.queue_depth == 0 => {
                    return Err(HostError::service_unavailable(service, lifecycle.as_str()));
                }
                _ if queue.len() >= self.policy.queue_depth => {
                    return Err(HostError::queue_full(service, queue.len()));
                }
                _ => {
                    let (reply, rx) = oneshot::channel();
                    queue.push_back(Queued { payload, reply });
                    debug!("Queued request for {service} ({lifecycle}, {} waiting)", queue.len());
                    Route::Queued(rx)
                }
            }
        };

        match route {
            Route::Forward(process, payload) => process.request(payload).await,
            Route::Queued(rx) => match rx.await {
                Ok(outcome) => outcome,
                Err(_) => Err(HostError::service_unavailable(service, "stopped")),
            },
        }
    }

    /// Stop every service, fail queued requests and end the monitor task.
    pub async fn shutdown(&self) {
        let (ack, done) = oneshot::channel();
        if self
            .events
            .send(MonitorEvent::Shutdown { ack: Some(ack) })
            .is_ok()
        {
            let _ = done.await;
        }
        let monitor = self.monitor.lock().take();
        if let Some(handle) = monitor {
            let _ = handle.await;
        }
    }

    pub fn state(&self, name: &str) -> Option<ServiceProcessState> {
        self.services
            .get(name)
            .map(|slot| slot.inner.read().state.clone())
    }

    /// States of all services in declaration order.
    pub fn snapshot(&self) -> Vec<ServiceProcessState> {
        self.order
            .iter()
            .filter_map(|name| self.state(name))
            .collect()
    }

    pub fn names(&self) -> &[String] {
        &self.order
    }

    pub fn policy(&self) -> SupervisorPolicy {
        self.policy
    }
}

impl Drop for Supervisor {
    fn drop(&mut self) {
        let _ = self.events.send(MonitorEvent::Shutdown { ack: None });
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Monitor task
// ─────────────────────────────────────────────────────────────────────────────

struct Monitor {
    services: Arc<HashMap<String, Arc<ServiceSlot>>>,
    policy: SupervisorPolicy,
    events: mpsc::UnboundedSender<MonitorEvent>,
    start_waiters: HashMap<String, Vec<StartAck>>,
}

impl Monitor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<MonitorEvent>) {
        while let Some(event) = rx.recv().await {
            match event {
                MonitorEvent::Start { name, ack } => self.on_start(name, ack),
                MonitorEvent::Started {
                    name,
                    generation,
                    result,
                } => self.on_started(&name, generation, result),
                MonitorEvent::Exited {
                    name,
                    generation,
                    exit,
                } => self.on_exited(&name, generation, exit),
                MonitorEvent::RestartDue { name, generation } => {
                    self.on_restart_due(&name, generation)
                }
                MonitorEvent::Stable { name, generation } => self.on_stable(&name, generation),
                MonitorEvent::Shutdown { ack } => {
                    self.on_shutdown();
                    if let Some(ack) = ack {
                        let _ = ack.send(());
                    }
                    break;
                }
            }
        }
        debug!("Supervisor monitor stopped");
    }

    fn slot(&self, name: &str) -> Option<Arc<ServiceSlot>> {
        self.services.get(name).cloned()
    }

    fn on_start(&mut self, name: String, ack: StartAck) {
        let Some(slot) = self.slot(&name) else {
            let _ = ack.send(Err(SupervisorError::UnknownService(name)));
            return;
        };

        let lifecycle = slot.inner.read().state.lifecycle;
        match lifecycle {
            Lifecycle::Ready => {
                let _ = ack.send(Ok(()));
            }
            Lifecycle::Starting | Lifecycle::Restarting => {
                self.start_waiters.entry(name).or_default().push(ack);
            }
            Lifecycle::Stopped | Lifecycle::Crashed => {
                self.start_waiters.entry(name).or_default().push(ack);
                self.begin_start(&slot, Lifecycle::Starting);
            }
        }
    }

    /// Spawn a new generation. `lifecycle` is `Starting` for requested
    /// starts and `Restarting` for crash recovery; it holds until the
    /// process reports ready or fails.
    fn begin_start(&self, slot: &Arc<ServiceSlot>, lifecycle: Lifecycle) {
        let generation = {
            let mut inner = slot.inner.write();
            inner.state.generation += 1;
            inner.state.lifecycle = lifecycle;
            inner.state.pid = None;
            inner.process = None;
            inner.state.generation
        };

        let spec = slot.spec.clone();
        let events = self.events.clone();
        tokio::spawn(async move {
            let name = spec.name.clone();
            match ServiceProcess::spawn(&spec).await {
                Ok((process, exited)) => {
                    let _ = events.send(MonitorEvent::Started {
                        name: name.clone(),
                        generation,
                        result: Ok(process),
                    });
                    let exit = exited.await.unwrap_or(ProcessExit::Killed);
                    let _ = events.send(MonitorEvent::Exited {
                        name,
                        generation,
                        exit,
                    });
                }
                Err(e) => {
                    let _ = events.send(MonitorEvent::Started {
                        name,
                        generation,
                        result: Err(e),
                    });
                }
            }
        });
    }

    fn on_started(
        &mut self,
        name: &str,
        generation: u64,
        result: Result<Arc<ServiceProcess>, SupervisorError>,
    ) {
        let Some(slot) = self.slot(name) else { return };

        let process = match result {
            Ok(process) => process,
            Err(e) => {
                if !is_launching(&slot, generation) {
                    return;
                }
                warn!("{e}");
                self.crashed(&slot);
                self.answer_waiters(name, Err(e));
                return;
            }
        };

        {
            let mut inner = slot.inner.write();
            if inner.state.generation != generation || !inner.state.lifecycle.is_launching() {
                drop(inner);
                process.kill();
                return;
            }
            inner.state.lifecycle = Lifecycle::Ready;
            inner.state.pid = process.pid();
            inner.process = Some(process.clone());
        }
        info!("Service {name} ready (generation {generation})");

        self.answer_waiters(name, Ok(()));
        self.schedule(
            self.policy.backoff.stable_after,
            MonitorEvent::Stable {
                name: name.to_string(),
                generation,
            },
        );

        let queued: Vec<Queued> = slot.queue.lock().drain(..).collect();
        if !queued.is_empty() {
            debug!("Forwarding {} queued request(s) to {name}", queued.len());
        }
        for item in queued {
            let process = process.clone();
            tokio::spawn(async move {
                let _ = item.reply.send(process.request(item.payload).await);
            });
        }
    }

    fn on_exited(&mut self, name: &str, generation: u64, exit: ProcessExit) {
        let Some(slot) = self.slot(name) else { return };
        if exit == ProcessExit::Killed || !is_current(&slot, generation, Lifecycle::Ready) {
            return;
        }
        match exit {
            ProcessExit::Exited { code } => {
                warn!("Service {name} exited unexpectedly (code {code:?})")
            }
            ProcessExit::StdoutClosed => warn!("Service {name} stopped answering"),
            ProcessExit::Killed => {}
        }
        self.crashed(&slot);
    }

    /// Record a crash and schedule the restart.
    fn crashed(&self, slot: &Arc<ServiceSlot>) {
        let (restart_count, generation) = {
            let mut inner = slot.inner.write();
            inner.process = None;
            inner.state.pid = None;
            inner.state.lifecycle = Lifecycle::Crashed;
            inner.state.restart_count = inner.state.restart_count.saturating_add(1);
            inner.state.last_crash_at = Some(Utc::now());
            (inner.state.restart_count, inner.state.generation)
        };

        let delay = self.policy.backoff.delay(restart_count);
        warn!(
            "Service {} crashed; restart #{restart_count} in {delay:?}",
            slot.spec.name
        );
        self.schedule(
            delay,
            MonitorEvent::RestartDue {
                name: slot.spec.name.clone(),
                generation,
            },
        );
    }

    fn on_restart_due(&mut self, name: &str, generation: u64) {
        let Some(slot) = self.slot(name) else { return };
        if !is_current(&slot, generation, Lifecycle::Crashed) {
            return;
        }
        info!("Restarting service {name}");
        self.begin_start(&slot, Lifecycle::Restarting);
    }

    fn on_stable(&mut self, name: &str, generation: u64) {
        let Some(slot) = self.slot(name) else { return };
        let mut inner = slot.inner.write();
        if inner.state.generation == generation
            && inner.state.lifecycle == Lifecycle::Ready
            && inner.state.restart_count > 0
        {
            debug!("Service {name} stable; restart count reset");
            inner.state.restart_count = 0;
        }
    }

    fn on_shutdown(&mut self) {
        info!("Stopping {} service(s)", self.services.len());
        for (name, slot) in self.services.iter() {
            let process = {
                let mut inner = slot.inner.write();
                inner.state.lifecycle = Lifecycle::Stopped;
                inner.state.pid = None;
                inner.process.take()
            };
            if let Some(process) = process {
                process.kill();
            }

            let queued: Vec<Queued> = slot.queue.lock().drain(..).collect();
            for item in queued {
                let _ = item
                    .reply
                    .send(Err(HostError::service_unavailable(name, "stopped")));
            }
        }

        for (_, waiters) in self.start_waiters.drain() {
            for ack in waiters {
                let _ = ack.send(Err(SupervisorError::Stopped));
            }
        }
    }

    fn answer_waiters(&mut self, name: &str, result: Result<(), SupervisorError>) {
        for ack in self.start_waiters.remove(name).unwrap_or_default() {
            let _ = ack.send(result.clone());
        }
    }

    fn schedule(&self, delay: Duration, event: MonitorEvent) {
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(event);
        });
    }
}

fn is_current(slot: &ServiceSlot, generation: u64, lifecycle: Lifecycle) -> bool {
    let inner = slot.inner.read();
    inner.state.generation == generation && inner.state.lifecycle == lifecycle
}

fn is_launching(slot: &ServiceSlot, generation: u64) -> bool {
    let inner = slot.inner.read();
    inner.state.generation == generation && inner.state.lifecycle.is_launching()
}
