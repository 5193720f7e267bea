//! Worker mode: serve a single sample handler over stdin/stdout.
//!
//! This is the child side of a supervised `handler` service. It writes the
//! ready event, then reads one Request per line and writes one Response per
//! line, completing requests concurrently and in any order. It returns when
//! stdin closes.

use std::sync::Arc;
use std::time::Duration;

use host_protocol::{ConnectionId, ServiceEvent, decode_request};
use host_services::{BuildError, builtin};
use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::config::ConfigError;
use crate::dispatcher::{Dispatcher, send};
use crate::registry::{HandlerDescriptor, HandlerKind, HandlerRegistry};
use crate::tracker::InvocationTracker;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error(transparent)]
    Build(#[from] BuildError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Invalid --options JSON: {0}")]
    Options(#[from] serde_json::Error),

    #[error("stdio error: {0}")]
    Io(#[from] std::io::Error),
}

/// The only connection a worker has: its parent.
const PARENT: ConnectionId = ConnectionId(0);

/// How long queued responses may take to flush once stdin has closed.
const FLUSH_GRACE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub handler: String,
    /// Operation name requests arrive under; the service name.
    pub name: String,
    pub options: Value,
}

impl WorkerConfig {
    pub fn new(handler: &str, name: Option<&str>, options: Option<&str>) -> Result<Self, WorkerError> {
        let options = match options {
            Some(text) => serde_json::from_str(text)?,
            None => Value::Null,
        };
        Ok(Self {
            handler: handler.to_string(),
            name: name.unwrap_or(handler).to_string(),
            options,
        })
    }
}

/// Run the worker on the process's stdin/stdout.
pub async fn run_worker(config: WorkerConfig) -> Result<(), WorkerError> {
    serve(config, BufReader::new(tokio::io::stdin()), tokio::io::stdout()).await
}

/// Serve `config` over arbitrary line streams.
pub async fn serve<R, W>(config: WorkerConfig, input: R, mut output: W) -> Result<(), WorkerError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let mut registry = HandlerRegistry::new();
    registry
        .register(HandlerDescriptor {
            name: config.name.clone(),
            kind: HandlerKind::InProcess,
            handler: builtin(&config.handler, &config.options)?,
            cacheable: false,
        })?;
    let dispatcher = Dispatcher::new(
        Arc::new(registry),
        Arc::new(InvocationTracker::new()),
        None,
        None,
    );

    let mut ready = serde_json::to_string(&ServiceEvent::ready())?;
    ready.push('\n');
    output.write_all(ready.as_bytes()).await?;
    output.flush().await?;
    info!("Worker {} ({}) ready", config.name, config.handler);

    // Writer task: one Response per line
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let mut writer = tokio::spawn(async move {
        while let Some(mut line) = rx.recv().await {
            line.push('\n');
            if output.write_all(line.as_bytes()).await.is_err() || output.flush().await.is_err() {
                break;
            }
        }
    });

    let mut lines = input.lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        match decode_request(&line) {
            Ok(request) => dispatcher.handle(PARENT, request, &tx),
            Err(failure) => send(&tx, failure),
        }
    }

    debug!("Worker {}: stdin closed", config.name);
    let abandoned = dispatcher.tracker().abandon_all_for(PARENT);
    if !abandoned.is_empty() {
        debug!("Worker {}: dropped {} pending request(s)", config.name, abandoned.len());
    }
    drop(tx);
    if tokio::time::timeout(FLUSH_GRACE, &mut writer).await.is_err() {
        writer.abort();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use host_protocol::{CorrelationId, Response};
    use serde_json::json;

    /// Start a worker on in-memory pipes; returns (request writer, response lines).
    fn spawn_worker(
        handler: &str,
        options: Option<&str>,
    ) -> (
        tokio::io::DuplexStream,
        tokio::io::Lines<BufReader<tokio::io::DuplexStream>>,
    ) {
        let config = WorkerConfig::new(handler, Some("svc"), options).unwrap();
        let (requests, worker_in) = tokio::io::duplex(4096);
        let (worker_out, responses) = tokio::io::duplex(4096);
        tokio::spawn(serve(config, BufReader::new(worker_in), worker_out));
        (requests, BufReader::new(responses).lines())
    }

    async fn next_line(lines: &mut tokio::io::Lines<BufReader<tokio::io::DuplexStream>>) -> String {
        tokio::time::timeout(Duration::from_secs(2), lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn announces_ready_then_answers() {
        let (mut requests, mut lines) = spawn_worker("double", None);
        assert_eq!(next_line(&mut lines).await, r#"{"event":"ready"}"#);

        requests
            .write_all(b"{\"correlationId\":1,\"operationName\":\"svc\",\"payload\":{\"number\":4}}\n")
            .await
            .unwrap();
        let resp: Response = serde_json::from_str(&next_line(&mut lines).await).unwrap();
        assert_eq!(resp.correlation_id, Some(CorrelationId::Number(1)));
        assert_eq!(resp.result, Some(json!(8)));
    }

    #[tokio::test]
    async fn completes_out_of_order() {
        let (mut requests, mut lines) = spawn_worker("async_echo", Some(r#"{"delayMs":20}"#));
        next_line(&mut lines).await;

        for (id, echo) in [(1, "a"), (2, "b"), (3, "c")] {
            let line = json!({ "correlationId": id, "operationName": "svc", "payload": { "echo": echo } });
            requests
                .write_all(format!("{line}\n").as_bytes())
                .await
                .unwrap();
        }

        let mut seen = Vec::new();
        for _ in 0..3 {
            let resp: Response = serde_json::from_str(&next_line(&mut lines).await).unwrap();
            seen.push((resp.correlation_id.unwrap(), resp.result.unwrap()));
        }
        seen.sort_by_key(|(id, _)| id.to_string());
        assert_eq!(
            seen,
            vec![
                (CorrelationId::Number(1), json!("a")),
                (CorrelationId::Number(2), json!("b")),
                (CorrelationId::Number(3), json!("c")),
            ]
        );
    }

    #[tokio::test]
    async fn malformed_line_gets_a_parse_error() {
        let (mut requests, mut lines) = spawn_worker("echo", None);
        next_line(&mut lines).await;

        requests.write_all(b"garbage\n").await.unwrap();
        let resp: Response = serde_json::from_str(&next_line(&mut lines).await).unwrap();
        assert!(!resp.success);
        assert!(resp.correlation_id.is_none());
    }

    #[test]
    fn rejects_unknown_kind_and_bad_options() {
        assert!(WorkerConfig::new("echo", None, Some("{bad")).is_err());
        let config = WorkerConfig::new("teleport", None, None).unwrap();
        assert_eq!(config.name, "teleport");
    }

    #[tokio::test]
    async fn unknown_kind_fails_to_serve() {
        let config = WorkerConfig::new("teleport", None, None).unwrap();
        let (_requests, worker_in) = tokio::io::duplex(64);
        let (worker_out, _responses) = tokio::io::duplex(64);
        let result = serve(config, BufReader::new(worker_in), worker_out).await;
        assert!(matches!(result, Err(WorkerError::Build(BuildError::UnknownKind(_)))));
    }
}
