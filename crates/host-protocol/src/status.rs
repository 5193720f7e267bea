//! Status payloads served at `/status` and printed when the host starts
//! listening.
//!
//! A client compares the reported config against the one it expects before
//! sending work, so it can tell it reached the right host.

use serde::{Deserialize, Serialize};

/// Which flavour of host is answering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostType {
    /// Functions only, all handled in-process.
    Host,
    /// At least one service runs in a supervised child process.
    ServiceHost,
}

/// The externally visible part of a host's configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusConfig {
    pub address: String,
    pub port: u16,
    pub functions: Vec<String>,
    pub services: Vec<String>,
    /// Milliseconds; 0 means the host never shuts itself down.
    pub disconnect_timeout: u64,
}

/// Response body of `GET /status`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostStatus {
    #[serde(rename = "type")]
    pub host_type: HostType,
    pub version: String,
    pub config: StatusConfig,
}

/// One line written to stdout once the listener is bound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListenInfo {
    #[serde(rename = "type")]
    pub host_type: HostType,
    pub version: String,
    pub address: String,
    pub port: u16,
}

impl HostStatus {
    pub fn listen_info(&self) -> ListenInfo {
        ListenInfo {
            host_type: self.host_type,
            version: self.version.clone(),
            address: self.config.address.clone(),
            port: self.config.port,
        }
    }
}
