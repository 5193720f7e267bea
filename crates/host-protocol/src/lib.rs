//! svc-host protocol types.
//!
//! The single source of truth for what crosses a process boundary: the
//! Request/Response pair and its correlation id, the error taxonomy, and
//! the status payloads a client reads to identify a host.

pub mod connection;
pub mod error;
pub mod status;
pub mod wire;

pub use connection::ConnectionId;
pub use error::{HostError, HostErrorCode};
pub use status::{HostStatus, HostType, ListenInfo, StatusConfig};
pub use wire::{
    CorrelationId, HandlerResult, Request, Response, ServiceEvent, decode_request,
};
