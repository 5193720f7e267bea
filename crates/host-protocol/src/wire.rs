//! Request/Response messages exchanged with callers and service processes.
//!
//! One JSON object per message. Callers send it as a WebSocket text frame;
//! service processes exchange it as one line on stdin/stdout.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::HostError;

/// Opaque caller-chosen id pairing a Request with its Response.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CorrelationId {
    String(String),
    Number(i64),
}

impl std::fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::String(s) => write!(f, "{s:?}"),
            Self::Number(n) => write!(f, "{n}"),
        }
    }
}

impl From<i64> for CorrelationId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl From<&str> for CorrelationId {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

/// An invocation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Request {
    pub correlation_id: CorrelationId,
    pub operation_name: String,
    #[serde(default)]
    pub payload: Value,
    /// Return a previously cached success stored under this key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_key: Option<String>,
    /// Fail with `InvocationTimeout` if not completed within this many ms.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// Result of one invocation.
pub type HandlerResult = Result<Value, HostError>;

/// The single reply to a Request.
///
/// `correlation_id` is `None` only when the request could not be decoded far
/// enough to learn its id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Response {
    pub correlation_id: Option<CorrelationId>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<HostError>,
}

/// Out-of-band line a service process writes on stdout.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServiceEvent {
    pub event: String,
}

pub const READY_EVENT: &str = "ready";

// ─────────────────────────────────────────────────────────────────────────────
// Helper constructors
// ─────────────────────────────────────────────────────────────────────────────

impl Request {
    pub fn new(
        correlation_id: impl Into<CorrelationId>,
        operation_name: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            operation_name: operation_name.into(),
            payload,
            cache_key: None,
            timeout_ms: None,
        }
    }

    pub fn is_valid(&self) -> bool {
        !self.operation_name.is_empty()
    }
}

impl Response {
    pub fn success(id: CorrelationId, result: Value) -> Self {
        Self {
            correlation_id: Some(id),
            success: true,
            result: Some(result),
            error: None,
        }
    }

    pub fn failure(id: Option<CorrelationId>, error: HostError) -> Self {
        Self {
            correlation_id: id,
            success: false,
            result: None,
            error: Some(error),
        }
    }

    pub fn from_outcome(id: CorrelationId, outcome: HandlerResult) -> Self {
        match outcome {
            Ok(value) => Self::success(id, value),
            Err(err) => Self::failure(Some(id), err),
        }
    }

    /// Convert back into a handler outcome (used on the host side of a
    /// service process).
    pub fn into_outcome(self) -> HandlerResult {
        if self.success {
            Ok(self.result.unwrap_or(Value::Null))
        } else {
            Err(self
                .error
                .unwrap_or_else(|| HostError::handler("Service reported failure without an error")))
        }
    }

    pub fn to_json(&self) -> String {
        // Response holds only strings, numbers and JSON values: serialization
        // cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

impl ServiceEvent {
    pub fn ready() -> Self {
        Self {
            event: READY_EVENT.into(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.event == READY_EVENT
    }
}

/// Decode one inbound text message into a Request.
///
/// On failure returns the failure Response to send back, carrying the
/// correlation id when it could be recovered.
pub fn decode_request(text: &str) -> Result<Request, Response> {
    let parsed: Value = serde_json::from_str(text)
        .map_err(|_| Response::failure(None, HostError::parse_error("Failed to parse JSON")))?;

    let id: Option<CorrelationId> = parsed
        .get("correlationId")
        .cloned()
        .and_then(|v| serde_json::from_value(v).ok());

    let request: Request = serde_json::from_value(parsed).map_err(|e| {
        Response::failure(id.clone(), HostError::invalid_request(format!("Invalid request: {e}")))
    })?;

    if !request.is_valid() {
        return Err(Response::failure(
            id,
            HostError::invalid_request("operationName must not be empty"),
        ));
    }

    Ok(request)
}
