//! svc-host transport layer.
//!
//! Serves the WebSocket endpoint callers send requests over, plus the
//! `/health` and `/status` HTTP endpoints. The transport knows nothing about
//! operations: every connection event is handed to a [`SessionHandler`],
//! and every outbound frame comes back through the per-connection channel
//! it was given.

pub mod server;

pub use server::{SessionHandler, TransportConfig, TransportError, TransportServer};
