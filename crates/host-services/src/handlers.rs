//! Sample handlers selectable by kind from the host configuration.
//!
//! | kind          | behavior                                        |
//! |---------------|-------------------------------------------------|
//! | `echo`        | returns `payload.echo`                          |
//! | `echo_data`   | returns the payload serialized as a JSON string |
//! | `error`       | always fails                                    |
//! | `async_echo`  | `echo` after a delay (`delayMs`, default 500)   |
//! | `double`      | returns `payload.number * 2`                    |
//! | `hello_world` | returns `"Hello, NAME!"`                        |
//! | `read_file`   | returns the contents of `payload.file`          |
//! | `counter`     | returns how many times it has been called       |

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use host_protocol::{HandlerResult, HostError};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::{AsyncHandler, Completion, Handler, is_truthy, spawned};

pub const BUILTIN_KINDS: &[&str] = &[
    "echo",
    "echo_data",
    "error",
    "async_echo",
    "double",
    "hello_world",
    "read_file",
    "counter",
];

#[derive(Debug, Clone, thiserror::Error)]
pub enum BuildError {
    #[error("Unknown handler kind: {0}")]
    UnknownKind(String),

    #[error("Invalid options for {kind}: {reason}")]
    InvalidOptions { kind: String, reason: String },
}

/// Build the sample handler named `kind`, configured with `options`
/// (`null` for defaults).
pub fn builtin(kind: &str, options: &Value) -> Result<Arc<dyn Handler>, BuildError> {
    let handler: Arc<dyn Handler> = match kind {
        "echo" => Arc::new(Echo),
        "echo_data" => Arc::new(EchoData),
        "error" => {
            let opts: ErrorOptions = parse_options(kind, options)?;
            Arc::new(Fail {
                message: opts
                    .message
                    .unwrap_or_else(|| "Hello from error function".into()),
            })
        }
        "async_echo" => {
            let opts: AsyncEchoOptions = parse_options(kind, options)?;
            spawned(AsyncEcho {
                delay: Duration::from_millis(opts.delay_ms.unwrap_or(500)),
            })
        }
        "double" => Arc::new(Double),
        "hello_world" => Arc::new(HelloWorld),
        "read_file" => spawned(ReadFile),
        "counter" => {
            let opts: CounterOptions = parse_options(kind, options)?;
            Arc::new(Counter {
                count: AtomicU64::new(opts.start),
            })
        }
        other => return Err(BuildError::UnknownKind(other.to_string())),
    };
    Ok(handler)
}

fn parse_options<T: for<'de> Deserialize<'de> + Default>(
    kind: &str,
    options: &Value,
) -> Result<T, BuildError> {
    if options.is_null() {
        return Ok(T::default());
    }
    serde_json::from_value(options.clone()).map_err(|e| BuildError::InvalidOptions {
        kind: kind.to_string(),
        reason: e.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorOptions {
    message: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AsyncEchoOptions {
    delay_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CounterOptions {
    #[serde(default)]
    start: u64,
}

fn echo_value(payload: &Value) -> HandlerResult {
    let echo = payload.get("echo");
    if !is_truthy(echo) {
        return Err(HostError::handler("No `echo` prop provided"));
    }
    Ok(echo.cloned().unwrap_or(Value::Null))
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

pub struct Echo;

impl Handler for Echo {
    fn accept(&self, payload: Value, completion: Completion) -> Result<(), HostError> {
        completion.done(echo_value(&payload));
        Ok(())
    }
}

pub struct EchoData;

impl Handler for EchoData {
    fn accept(&self, payload: Value, completion: Completion) -> Result<(), HostError> {
        let text = serde_json::to_string(&payload)
            .map_err(|e| HostError::internal(format!("Failed to encode payload: {e}")))?;
        completion.succeed(Value::String(text));
        Ok(())
    }
}

pub struct Fail {
    message: String,
}

impl Handler for Fail {
    fn accept(&self, _payload: Value, completion: Completion) -> Result<(), HostError> {
        completion.fail(HostError::handler(self.message.clone()));
        Ok(())
    }
}

pub struct AsyncEcho {
    delay: Duration,
}

impl AsyncHandler for AsyncEcho {
    async fn handle(&self, payload: Value) -> HandlerResult {
        tokio::time::sleep(self.delay).await;
        echo_value(&payload)
    }
}

pub struct Double;

impl Handler for Double {
    fn accept(&self, payload: Value, completion: Completion) -> Result<(), HostError> {
        let number = payload.get("number");
        if !is_truthy(number) {
            return Err(HostError::handler("No number was provided"));
        }
        let doubled = match number.and_then(Value::as_i64) {
            Some(n) => n.checked_mul(2).map(|d| json!(d)),
            None => None,
        };
        let doubled = match doubled {
            Some(d) => d,
            None => number
                .and_then(Value::as_f64)
                .map(|f| json!(f * 2.0))
                .ok_or_else(|| HostError::invalid_params("`number` must be numeric"))?,
        };
        completion.succeed(doubled);
        Ok(())
    }
}

pub struct HelloWorld;

impl Handler for HelloWorld {
    fn accept(&self, payload: Value, completion: Completion) -> Result<(), HostError> {
        let name = payload.get("name");
        if !is_truthy(name) {
            return Err(HostError::handler("No name was provided"));
        }
        let name = match name {
            Some(Value::String(s)) => s.clone(),
            Some(other) => other.to_string(),
            None => String::new(),
        };
        completion.succeed(Value::String(format!("Hello, {name}!")));
        Ok(())
    }
}

pub struct ReadFile;

impl AsyncHandler for ReadFile {
    async fn handle(&self, payload: Value) -> HandlerResult {
        let file = payload
            .get("file")
            .and_then(Value::as_str)
            .filter(|f| !f.is_empty())
            .ok_or_else(|| HostError::handler("No file was provided"))?;
        let contents = tokio::fs::read_to_string(file)
            .await
            .map_err(|e| HostError::handler(format!("Failed to read {file}: {e}")))?;
        Ok(Value::String(contents))
    }
}

pub struct Counter {
    count: AtomicU64,
}

impl Handler for Counter {
    fn accept(&self, _payload: Value, completion: Completion) -> Result<(), HostError> {
        let count = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        completion.succeed(json!(count));
        Ok(())
    }
}
