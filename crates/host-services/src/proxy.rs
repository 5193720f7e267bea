//! Proxied handler: forwards every invocation to a supervised service
//! process. All logic runs in the child; this side is a routing shim.

use std::sync::Arc;

use host_protocol::HandlerResult;
use host_supervisor::Supervisor;
use serde_json::Value;

use crate::AsyncHandler;

pub struct ProxyHandler {
    service: String,
    supervisor: Arc<Supervisor>,
}

impl ProxyHandler {
    pub fn new(service: impl Into<String>, supervisor: Arc<Supervisor>) -> Self {
        Self {
            service: service.into(),
            supervisor,
        }
    }

    pub fn service(&self) -> &str {
        &self.service
    }
}

impl AsyncHandler for ProxyHandler {
    async fn handle(&self, payload: Value) -> HandlerResult {
        self.supervisor.route_request(&self.service, payload).await
    }
}
