//! Completion token handed to a handler for one invocation.

use std::sync::Arc;

use host_protocol::{HandlerResult, HostError};
use serde_json::Value;
use tokio::sync::mpsc;

/// Reports the outcome of one invocation.
///
/// Cheap to clone and safe to call from any task. The token does not
/// enforce single use itself; the invocation tracker behind it ignores
/// every report after the first.
#[derive(Clone)]
pub struct Completion {
    sink: Arc<dyn Fn(HandlerResult) + Send + Sync>,
}

impl Completion {
    pub fn new(sink: impl Fn(HandlerResult) + Send + Sync + 'static) -> Self {
        Self {
            sink: Arc::new(sink),
        }
    }

    /// A completion that forwards every report into a channel.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<HandlerResult>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let completion = Self::new(move |outcome| {
            let _ = tx.send(outcome);
        });
        (completion, rx)
    }

    pub fn done(&self, outcome: HandlerResult) {
        (self.sink)(outcome);
    }

    pub fn succeed(&self, value: Value) {
        self.done(Ok(value));
    }

    pub fn fail(&self, error: HostError) {
        self.done(Err(error));
    }
}

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion").finish_non_exhaustive()
    }
}
