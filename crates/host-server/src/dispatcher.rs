//! Dispatcher: routes decoded requests to handlers and completions back to
//! the requesting connection.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use host_protocol::{ConnectionId, HandlerResult, HostError, Request, Response};
use host_services::Completion;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

use crate::cache::ResultCache;
use crate::registry::HandlerRegistry;
use crate::tracker::{Invocation, InvocationTracker};

/// Outbound text frames for one connection.
pub type Outbound = mpsc::UnboundedSender<String>;

/// Timeout task of one invocation, aborted once the invocation completes.
type TimeoutSlot = Arc<Mutex<Option<AbortHandle>>>;

pub struct Dispatcher {
    registry: Arc<HandlerRegistry>,
    tracker: Arc<InvocationTracker>,
    cache: Option<Arc<ResultCache>>,
    /// Applied when a request carries no `timeoutMs`
    default_timeout: Option<Duration>,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<HandlerRegistry>,
        tracker: Arc<InvocationTracker>,
        cache: Option<Arc<ResultCache>>,
        default_timeout: Option<Duration>,
    ) -> Self {
        Self {
            registry,
            tracker,
            cache,
            default_timeout,
        }
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn tracker(&self) -> &Arc<InvocationTracker> {
        &self.tracker
    }

    /// Start handling `request`. Returns as soon as the handler has accepted
    /// it; the Response is sent on `outbound` whenever it completes.
    pub fn handle(&self, connection: ConnectionId, request: Request, outbound: &Outbound) {
        let Request {
            correlation_id,
            operation_name,
            payload,
            cache_key,
            timeout_ms,
        } = request;
        debug!("{connection} → {operation_name} ({correlation_id})");

        let Some(descriptor) = self.registry.resolve(&operation_name) else {
            send(
                outbound,
                Response::failure(
                    Some(correlation_id),
                    HostError::unknown_operation(&operation_name),
                ),
            );
            return;
        };

        let cache = match (&self.cache, cache_key) {
            (Some(cache), Some(key)) if descriptor.cacheable => Some((cache.clone(), key)),
            _ => None,
        };
        if let Some((cache, key)) = &cache {
            if let Some(hit) = cache.get(&operation_name, key) {
                debug!("{operation_name}: cache hit for {key:?}");
                send(outbound, Response::success(correlation_id, hit));
                return;
            }
        }

        let invocation = match self.tracker.begin(correlation_id.clone(), connection) {
            Ok(invocation) => invocation,
            Err(e) => {
                warn!("{e}");
                send(
                    outbound,
                    Response::failure(
                        Some(correlation_id.clone()),
                        HostError::duplicate_correlation_id(&correlation_id),
                    ),
                );
                return;
            }
        };

        let timeout_slot = TimeoutSlot::default();
        let completion = self.completion(
            invocation,
            operation_name.clone(),
            cache,
            outbound.clone(),
            timeout_slot.clone(),
        );

        let timeout = timeout_ms
            .filter(|ms| *ms > 0)
            .map(Duration::from_millis)
            .or(self.default_timeout);
        if let Some(timeout) = timeout {
            let completion = completion.clone();
            let operation = operation_name.clone();
            let task = tokio::spawn(async move {
                tokio::time::sleep(timeout).await;
                completion.fail(HostError::invocation_timeout(
                    &operation,
                    timeout.as_millis() as u64,
                ));
            });
            *timeout_slot.lock() = Some(task.abort_handle());
        }

        accept(&operation_name, &descriptor.handler, payload, completion);
    }

    /// Completion bound to one invocation: the first report becomes the
    /// Response, everything after it is dropped.
    fn completion(
        &self,
        invocation: Invocation,
        operation: String,
        cache: Option<(Arc<ResultCache>, String)>,
        outbound: Outbound,
        timeout_slot: TimeoutSlot,
    ) -> Completion {
        let tracker = self.tracker.clone();
        Completion::new(move |outcome: HandlerResult| {
            if let Some(timer) = timeout_slot.lock().take() {
                timer.abort();
            }
            match tracker.complete(&invocation, outcome) {
                Ok(response) => {
                    if let (Some((cache, key)), Some(result)) = (&cache, success_value(&response)) {
                        cache.store(&operation, key, result.clone());
                    }
                    trace!(
                        "{} ← {operation} ({:?})",
                        invocation.connection,
                        invocation.started_at.elapsed()
                    );
                    send(&outbound, response);
                }
                Err(e) => trace!("Dropping completion for {operation}: {e}"),
            }
        })
    }
}

/// Call the handler, turning a synchronous error or a panic into a failed
/// completion.
fn accept(
    operation: &str,
    handler: &Arc<dyn host_services::Handler>,
    payload: Value,
    completion: Completion,
) {
    let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
        handler.accept(payload, completion.clone())
    }));
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => completion.fail(e),
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".into());
            warn!("Handler {operation} panicked: {message}");
            completion.fail(HostError::internal(format!(
                "Handler {operation} panicked: {message}"
            )));
        }
    }
}

fn success_value(response: &Response) -> Option<&Value> {
    if response.success {
        response.result.as_ref()
    } else {
        None
    }
}

pub(crate) fn send(outbound: &Outbound, response: Response) {
    if outbound.send(response.to_json()).is_err() {
        trace!("Connection gone; dropping response");
    }
}
