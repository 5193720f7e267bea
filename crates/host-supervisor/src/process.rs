//! One running service process, connected via newline-delimited JSON over
//! stdin/stdout.
//!
//! Every request gets a numeric correlation id unique within the process,
//! so any number of requests can be outstanding and replies may arrive in
//! any order. When the process exits, every outstanding request is failed
//! immediately instead of being left to hang. A process that closes stdout
//! can no longer reply, so it is killed and treated the same way.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use host_protocol::{CorrelationId, HandlerResult, HostError, Request, Response, ServiceEvent};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::{ServiceSpec, SupervisorError};

/// How a service process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessExit {
    /// The process exited on its own (crash or unexpected exit).
    Exited { code: Option<i32> },
    /// Stdout closed while the process kept running; it was killed.
    StdoutClosed,
    /// The supervisor killed it.
    Killed,
}

/// How long a process may keep running after closing stdout. A normal exit
/// closes stdout first, so this lets its exit code win.
const STDOUT_CLOSE_GRACE: Duration = Duration::from_millis(100);

/// Requests awaiting a reply. `closed` flips once the process is gone, after
/// which nothing new may be inserted.
struct PendingRequests {
    closed: bool,
    replies: HashMap<i64, oneshot::Sender<HandlerResult>>,
}

/// Handle to a live service process.
pub struct ServiceProcess {
    name: String,
    pid: Option<u32>,
    /// Encoded request lines for the stdin writer task
    line_tx: mpsc::Sender<String>,
    pending: Arc<Mutex<PendingRequests>>,
    next_id: AtomicI64,
    kill_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl ServiceProcess {
    /// Spawn the process described by `spec` and wire up its stdio tasks.
    ///
    /// With `await_ready`, returns only once the process has written the
    /// ready event, failing after `startup_timeout`. The receiver resolves
    /// when the process ends.
    pub async fn spawn(
        spec: &ServiceSpec,
    ) -> Result<(Arc<Self>, oneshot::Receiver<ProcessExit>), SupervisorError> {
        info!("Starting service {}: {} {:?}", spec.name, spec.program.display(), spec.args);

        let mut child = Command::new(&spec.program)
            .args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| SupervisorError::Spawn {
                service: spec.name.clone(),
                reason: e.to_string(),
            })?;

        let stdio_err = || SupervisorError::Stdio {
            service: spec.name.clone(),
        };
        let mut stdin = child.stdin.take().ok_or_else(stdio_err)?;
        let stdout = child.stdout.take().ok_or_else(stdio_err)?;
        let stderr = child.stderr.take().ok_or_else(stdio_err)?;
        let pid = child.id();

        let (line_tx, mut line_rx) = mpsc::channel::<String>(256);
        let (kill_tx, kill_rx) = oneshot::channel::<()>();
        let (exit_tx, exit_rx) = oneshot::channel::<ProcessExit>();
        let (ready_tx, ready_rx) = oneshot::channel::<()>();
        let (eof_tx, eof_rx) = oneshot::channel::<()>();

        let pending = Arc::new(Mutex::new(PendingRequests {
            closed: false,
            replies: HashMap::new(),
        }));

        // Writer task: one line per request
        let name = spec.name.clone();
        tokio::spawn(async move {
            while let Some(line) = line_rx.recv().await {
                if let Err(e) = stdin.write_all(line.as_bytes()).await {
                    debug!("[{name}] stdin closed: {e}");
                    break;
                }
                if stdin.flush().await.is_err() {
                    break;
                }
            }
        });

        // Reader task: replies and the ready event
        let name = spec.name.clone();
        let reader_pending = pending.clone();
        tokio::spawn(async move {
            let mut ready_tx = Some(ready_tx);
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if let Ok(response) = serde_json::from_str::<Response>(&line) {
                    let Some(CorrelationId::Number(id)) = response.correlation_id else {
                        warn!("[{name}] reply without a numeric correlation id: {line}");
                        continue;
                    };
                    let reply = reader_pending.lock().replies.remove(&id);
                    match reply {
                        Some(tx) => {
                            let _ = tx.send(response.into_outcome());
                        }
                        None => debug!("[{name}] reply for unknown request {id}"),
                    }
                } else if let Ok(event) = serde_json::from_str::<ServiceEvent>(&line) {
                    if event.is_ready() {
                        if let Some(tx) = ready_tx.take() {
                            let _ = tx.send(());
                        }
                    }
                } else {
                    debug!("[{name}] {line}");
                }
            }
            debug!("[{name}] stdout reader ended");
            let _ = eof_tx.send(());
        });

        // Stderr logger
        let name = spec.name.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!("[{name}] {line}");
            }
        });

        // Exit watcher: owns the child, fails outstanding requests on exit
        let name = spec.name.clone();
        let watcher_pending = pending.clone();
        tokio::spawn(async move {
            let exit = tokio::select! {
                status = child.wait() => ProcessExit::Exited {
                    code: status.ok().and_then(|s| s.code()),
                },
                _ = kill_rx => {
                    let _ = child.kill().await;
                    ProcessExit::Killed
                }
                _ = eof_rx => {
                    match tokio::time::timeout(STDOUT_CLOSE_GRACE, child.wait()).await {
                        Ok(status) => ProcessExit::Exited {
                            code: status.ok().and_then(|s| s.code()),
                        },
                        Err(_) => {
                            warn!("[{name}] closed stdout but kept running; killing it");
                            let _ = child.kill().await;
                            ProcessExit::StdoutClosed
                        }
                    }
                }
            };

            let orphaned: Vec<_> = {
                let mut pending = watcher_pending.lock();
                pending.closed = true;
                pending.replies.drain().map(|(_, tx)| tx).collect()
            };
            if !orphaned.is_empty() {
                warn!("[{name}] failing {} in-flight request(s)", orphaned.len());
            }
            for tx in orphaned {
                let err = match exit {
                    ProcessExit::Killed => HostError::service_unavailable(&name, "stopped"),
                    ProcessExit::Exited { .. } | ProcessExit::StdoutClosed => {
                        HostError::service_crashed(&name)
                    }
                };
                let _ = tx.send(Err(err));
            }

            let _ = exit_tx.send(exit);
        });

        let process = Arc::new(Self {
            name: spec.name.clone(),
            pid,
            line_tx,
            pending,
            next_id: AtomicI64::new(1),
            kill_tx: Mutex::new(Some(kill_tx)),
        });

        if spec.await_ready {
            match tokio::time::timeout(spec.startup_timeout, ready_rx).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => {
                    process.kill();
                    return Err(SupervisorError::ExitedDuringStartup {
                        service: spec.name.clone(),
                    });
                }
                Err(_) => {
                    process.kill();
                    return Err(SupervisorError::StartupTimeout {
                        service: spec.name.clone(),
                        timeout_ms: spec.startup_timeout.as_millis() as u64,
                    });
                }
            }
        }

        info!("Service {} running (pid {:?})", spec.name, pid);
        Ok((process, exit_rx))
    }

    /// Send one request and wait for its reply.
    pub async fn request(&self, payload: Value) -> HandlerResult {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (reply_tx, reply_rx) = oneshot::channel();

        {
            let mut pending = self.pending.lock();
            if pending.closed {
                return Err(HostError::service_crashed(&self.name));
            }
            pending.replies.insert(id, reply_tx);
        }

        let mut line = serde_json::to_string(&Request::new(id, &self.name, payload))
            .map_err(|e| HostError::internal(format!("Failed to encode request: {e}")))?;
        line.push('\n');

        if self.line_tx.send(line).await.is_err() {
            self.pending.lock().replies.remove(&id);
            return Err(HostError::service_crashed(&self.name));
        }

        reply_rx
            .await
            .map_err(|_| HostError::service_crashed(&self.name))?
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Ask the exit watcher to kill the process. Idempotent.
    pub fn kill(&self) {
        if let Some(tx) = self.kill_tx.lock().take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for ServiceProcess {
    fn drop(&mut self) {
        self.kill();
    }
}
