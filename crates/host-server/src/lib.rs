//! svc-host runtime: dispatches requests to named handlers and supervises
//! the child processes that back services.
//!
//! [`Host`] assembles the pieces; the worker module is the child side of a
//! supervised sample-handler service.

pub mod cache;
pub mod config;
pub mod dispatcher;
pub mod host;
pub mod registry;
pub mod session;
pub mod tracker;
pub mod worker;

pub use cache::ResultCache;
pub use config::{ConfigError, FunctionConfig, HostConfig, ServiceConfig, SupervisorConfig};
pub use dispatcher::Dispatcher;
pub use host::{Host, HostStartError};
pub use registry::{HandlerDescriptor, HandlerKind, HandlerRegistry};
pub use session::{ConnectionAge, HostIdleState, HostPhase, SessionManager};
pub use tracker::{Invocation, InvocationTracker, TrackerError};
pub use worker::{WorkerConfig, WorkerError, run_worker};
