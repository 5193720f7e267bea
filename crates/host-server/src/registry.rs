//! Operation name → handler. Built once from the loaded configuration and
//! never mutated afterwards, so lookups take no lock.

use std::collections::HashMap;
use std::sync::Arc;

use host_services::{Handler, ProxyHandler, builtin, spawned};
use host_supervisor::Supervisor;
use tracing::info;

use crate::config::{ConfigError, HostConfig};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerKind {
    InProcess,
    Proxied { service: String },
}

pub struct HandlerDescriptor {
    pub name: String,
    pub kind: HandlerKind,
    pub handler: Arc<dyn Handler>,
    /// Successful results may be served from the result cache.
    pub cacheable: bool,
}

impl std::fmt::Debug for HandlerDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerDescriptor")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("cacheable", &self.cacheable)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<HandlerDescriptor>>,
    /// Registration order, for status output
    order: Vec<String>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the registry for `config`: functions run in-process, services
    /// are proxied through `supervisor`.
    pub fn from_config(
        config: &HostConfig,
        supervisor: Option<&Arc<Supervisor>>,
    ) -> Result<Self, ConfigError> {
        let mut registry = Self::new();

        for function in &config.functions {
            let handler = builtin(&function.handler, &function.options).map_err(|e| {
                ConfigError::InvalidHandler {
                    name: function.name.clone(),
                    reason: e.to_string(),
                }
            })?;
            registry.register(HandlerDescriptor {
                name: function.name.clone(),
                kind: HandlerKind::InProcess,
                handler,
                cacheable: function.cache,
            })?;
        }

        if !config.services.is_empty() {
            let supervisor = supervisor.ok_or_else(|| ConfigError::InvalidService {
                name: config.services[0].name.clone(),
                reason: "services configured without a supervisor".into(),
            })?;
            for service in &config.services {
                registry.register(HandlerDescriptor {
                    name: service.name.clone(),
                    kind: HandlerKind::Proxied {
                        service: service.name.clone(),
                    },
                    handler: spawned(ProxyHandler::new(&service.name, supervisor.clone())),
                    cacheable: service.cache,
                })?;
            }
        }

        info!(
            "Registered {} operation(s): {}",
            registry.len(),
            registry.order.join(", ")
        );
        Ok(registry)
    }

    pub fn register(&mut self, descriptor: HandlerDescriptor) -> Result<(), ConfigError> {
        if self.handlers.contains_key(&descriptor.name) {
            return Err(ConfigError::DuplicateHandlerName(descriptor.name));
        }
        self.order.push(descriptor.name.clone());
        self.handlers
            .insert(descriptor.name.clone(), Arc::new(descriptor));
        Ok(())
    }

    pub fn resolve(&self, name: &str) -> Option<Arc<HandlerDescriptor>> {
        self.handlers.get(name).cloned()
    }

    pub fn names(&self) -> &[String] {
        &self.order
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
