//! Handlers behind svc-host operations.
//!
//! Every operation, in-process or proxied to a service process, is a
//! [`Handler`]: it accepts a payload plus a [`Completion`] and reports its
//! outcome through the completion whenever it is done. Handlers that are
//! naturally `async` implement [`AsyncHandler`] instead and are adapted with
//! [`spawned`].

pub mod completion;
pub mod handlers;
pub mod proxy;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use host_protocol::{HandlerResult, HostError};
use serde_json::Value;

pub use completion::Completion;
pub use handlers::{BUILTIN_KINDS, BuildError, builtin};
pub use proxy::ProxyHandler;

/// Completion-based handler.
///
/// `accept` must return promptly. The outcome is reported through
/// `completion`, possibly from another task and possibly more than once;
/// only the first report counts. Returning `Err` is the same as completing
/// with that error.
pub trait Handler: Send + Sync {
    fn accept(&self, payload: Value, completion: Completion) -> Result<(), HostError>;
}

/// Handler written as a single async call.
pub trait AsyncHandler: Send + Sync + 'static {
    fn handle(&self, payload: Value) -> impl std::future::Future<Output = HandlerResult> + Send;
}

/// Runs an [`AsyncHandler`] on its own task per invocation.
pub struct Spawned<H> {
    inner: Arc<H>,
}

impl<H: AsyncHandler> Handler for Spawned<H> {
    fn accept(&self, payload: Value, completion: Completion) -> Result<(), HostError> {
        let handler = self.inner.clone();
        tokio::spawn(async move {
            let outcome = AssertUnwindSafe(handler.handle(payload))
                .catch_unwind()
                .await
                .unwrap_or_else(|_| Err(HostError::internal("Handler panicked")));
            completion.done(outcome);
        });
        Ok(())
    }
}

pub fn spawned<H: AsyncHandler>(handler: H) -> Arc<dyn Handler> {
    Arc::new(Spawned {
        inner: Arc::new(handler),
    })
}

/// JavaScript-style truthiness, used by the sample handlers to decide
/// whether a required prop was provided.
pub(crate) fn is_truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0 && !f.is_nan()),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(_)) | Some(Value::Object(_)) => true,
    }
}
