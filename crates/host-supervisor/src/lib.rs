//! Supervision of service child processes.
//!
//! Each configured service runs in its own child process speaking the
//! newline-delimited JSON wire protocol on stdin/stdout. The [`Supervisor`]
//! starts them, routes requests to whichever process is ready, restarts
//! crashed processes with capped exponential backoff, and stops everything
//! on shutdown.

pub mod process;
pub mod state;
pub mod supervisor;

use std::path::PathBuf;
use std::time::Duration;

pub use process::{ProcessExit, ServiceProcess};
pub use state::{BackoffPolicy, Lifecycle, ServiceProcessState};
pub use supervisor::Supervisor;

/// How to launch one service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceSpec {
    pub name: String,
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Stay `starting` until the process writes `{"event":"ready"}`.
    pub await_ready: bool,
    pub startup_timeout: Duration,
}

impl ServiceSpec {
    pub fn new(name: impl Into<String>, program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args,
            await_ready: false,
            startup_timeout: Duration::from_secs(5),
        }
    }

    pub fn await_ready(mut self, startup_timeout: Duration) -> Self {
        self.await_ready = true;
        self.startup_timeout = startup_timeout;
        self
    }
}

/// Restart and routing policy shared by every service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SupervisorPolicy {
    pub backoff: BackoffPolicy,
    /// Requests held per service while it is not ready. 0 fails fast with
    /// `ServiceUnavailable`.
    pub queue_depth: usize,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum SupervisorError {
    #[error("Duplicate service name: {0}")]
    DuplicateService(String),

    #[error("Unknown service: {0}")]
    UnknownService(String),

    #[error("Failed to spawn service {service}: {reason}")]
    Spawn { service: String, reason: String },

    #[error("Service {service} did not expose its stdio pipes")]
    Stdio { service: String },

    #[error("Service {service} was not ready within {timeout_ms}ms")]
    StartupTimeout { service: String, timeout_ms: u64 },

    #[error("Service {service} exited before reporting ready")]
    ExitedDuringStartup { service: String },

    #[error("Supervisor is stopped")]
    Stopped,
}
