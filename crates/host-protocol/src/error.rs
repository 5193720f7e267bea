//! Host error taxonomy and wire error object.

use serde::{Deserialize, Serialize};

/// Every failure a caller can observe in a Response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum HostErrorCode {
    // Decoding
    ParseError,
    InvalidRequest,

    // Dispatch
    UnknownOperation,
    InvalidParams,
    #[default]
    HandlerError,
    DuplicateCorrelationId,
    InvocationTimeout,

    // Service routing
    ServiceUnavailable,
    QueueFull,
    ServiceCrashed,

    InternalError,
}

impl HostErrorCode {
    pub fn code(&self) -> i32 {
        match self {
            Self::ParseError => -32700,
            Self::InvalidRequest => -32600,
            Self::UnknownOperation => -32601,
            Self::InvalidParams => -32602,
            Self::InternalError => -32603,
            Self::HandlerError => -32000,
            Self::DuplicateCorrelationId => -32010,
            Self::InvocationTimeout => -32011,
            Self::ServiceUnavailable => -32020,
            Self::QueueFull => -32021,
            Self::ServiceCrashed => -32022,
        }
    }

    /// Map a numeric code back to its kind. Unrecognised codes become
    /// `HandlerError`, since only handlers can produce arbitrary codes.
    pub fn from_code(code: i32) -> Self {
        match code {
            -32700 => Self::ParseError,
            -32600 => Self::InvalidRequest,
            -32601 => Self::UnknownOperation,
            -32602 => Self::InvalidParams,
            -32603 => Self::InternalError,
            -32010 => Self::DuplicateCorrelationId,
            -32011 => Self::InvocationTimeout,
            -32020 => Self::ServiceUnavailable,
            -32021 => Self::QueueFull,
            -32022 => Self::ServiceCrashed,
            _ => Self::HandlerError,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::ParseError => "ParseError",
            Self::InvalidRequest => "InvalidRequest",
            Self::UnknownOperation => "UnknownOperation",
            Self::InvalidParams => "InvalidParams",
            Self::HandlerError => "HandlerError",
            Self::DuplicateCorrelationId => "DuplicateCorrelationId",
            Self::InvocationTimeout => "InvocationTimeout",
            Self::ServiceUnavailable => "ServiceUnavailable",
            Self::QueueFull => "QueueFull",
            Self::ServiceCrashed => "ServiceCrashed",
            Self::InternalError => "InternalError",
        }
    }
}

/// Error object carried by a failed Response.
///
/// Only `message` is required on the way in: service processes written in
/// other languages may report bare `{ "message": ... }` errors. A missing
/// `kind` is recovered from `code`, and a missing `code` from `kind`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "WireError")]
pub struct HostError {
    pub kind: HostErrorCode,
    pub code: i32,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Inbound shape of [`HostError`], with every field but `message` optional.
#[derive(Deserialize)]
struct WireError {
    #[serde(default)]
    kind: Option<HostErrorCode>,
    #[serde(default)]
    code: Option<i32>,
    message: String,
    #[serde(default)]
    data: Option<serde_json::Value>,
}

impl From<WireError> for HostError {
    fn from(wire: WireError) -> Self {
        let kind = match (wire.kind, wire.code) {
            (Some(kind), _) => kind,
            (None, Some(code)) => HostErrorCode::from_code(code),
            (None, None) => HostErrorCode::HandlerError,
        };
        Self {
            kind,
            code: wire.code.unwrap_or_else(|| kind.code()),
            message: wire.message,
            data: wire.data,
        }
    }
}

impl HostError {
    pub fn new(kind: HostErrorCode, message: impl Into<String>) -> Self {
        Self {
            kind,
            code: kind.code(),
            message: message.into(),
            data: None,
        }
    }

    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new(HostErrorCode::ParseError, message)
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(HostErrorCode::InvalidRequest, message)
    }

    pub fn unknown_operation(name: &str) -> Self {
        Self::new(HostErrorCode::UnknownOperation, format!("UnknownOperation: {name}"))
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::new(HostErrorCode::InvalidParams, message)
    }

    /// An error reported by a handler through its completion. The message is
    /// passed to the caller verbatim.
    pub fn handler(message: impl Into<String>) -> Self {
        Self::new(HostErrorCode::HandlerError, message)
    }

    pub fn duplicate_correlation_id(id: impl std::fmt::Display) -> Self {
        Self::new(
            HostErrorCode::DuplicateCorrelationId,
            format!("Correlation id {id} is already pending on this connection"),
        )
    }

    pub fn invocation_timeout(operation: &str, timeout_ms: u64) -> Self {
        Self::new(
            HostErrorCode::InvocationTimeout,
            format!("{operation} did not complete within {timeout_ms}ms"),
        )
    }

    pub fn service_unavailable(service: &str, lifecycle: &str) -> Self {
        Self::new(
            HostErrorCode::ServiceUnavailable,
            format!("Service {service} is not ready ({lifecycle})"),
        )
    }

    pub fn queue_full(service: &str, depth: usize) -> Self {
        Self::new(
            HostErrorCode::QueueFull,
            format!("Service {service} queue is full ({depth} waiting)"),
        )
    }

    pub fn service_crashed(service: &str) -> Self {
        Self::new(
            HostErrorCode::ServiceCrashed,
            format!("Service {service} exited while the request was in flight"),
        )
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(HostErrorCode::InternalError, message)
    }

    pub fn error_code(&self) -> HostErrorCode {
        self.kind
    }
}

impl std::fmt::Display for HostError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} [{}]: {}", self.kind.name(), self.code, self.message)
    }
}

impl std::error::Error for HostError {}
