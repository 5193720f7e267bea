//! The assembled host: registry, dispatcher, sessions, supervisor and
//! transport wired together from one [`HostConfig`].

use std::sync::Arc;

use host_protocol::HostStatus;
use host_supervisor::{Supervisor, SupervisorError};
use host_transport::{TransportConfig, TransportError, TransportServer};
use tracing::{info, warn};
use uuid::Uuid;

use crate::cache::ResultCache;
use crate::config::{ConfigError, HostConfig};
use crate::dispatcher::Dispatcher;
use crate::registry::HandlerRegistry;
use crate::session::SessionManager;
use crate::tracker::InvocationTracker;

#[derive(Debug, thiserror::Error)]
pub enum HostStartError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Supervisor(#[from] SupervisorError),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

pub struct Host {
    instance_id: Uuid,
    transport: TransportServer,
    sessions: Arc<SessionManager>,
    supervisor: Option<Arc<Supervisor>>,
    status: HostStatus,
}

impl Host {
    /// Build everything `config` describes, start its services and bind the
    /// listener. A service that fails its first start is logged and left to
    /// the supervisor's restart policy; it does not fail the host.
    pub async fn start(config: HostConfig) -> Result<Self, HostStartError> {
        config.validate()?;
        let instance_id = Uuid::new_v4();

        let supervisor = if config.services.is_empty() {
            None
        } else {
            let specs = config.service_specs()?;
            Some(Arc::new(Supervisor::new(specs, config.supervisor_policy())?))
        };

        let registry = Arc::new(HandlerRegistry::from_config(&config, supervisor.as_ref())?);
        let cache = config.cache.then(|| Arc::new(ResultCache::new()));
        let dispatcher = Arc::new(Dispatcher::new(
            registry,
            Arc::new(InvocationTracker::new()),
            cache,
            config.invocation_timeout(),
        ));
        let sessions = Arc::new(SessionManager::new(
            dispatcher,
            config.disconnect_timeout(),
            supervisor.clone(),
        ));

        if let Some(supervisor) = &supervisor {
            if let Err(e) = supervisor.start_all().await {
                warn!("Service startup incomplete: {e}");
            }
        }

        let transport = TransportServer::start(
            TransportConfig {
                port: config.port,
                hostname: config.address.clone(),
                max_connections: config.max_connections,
            },
            sessions.clone(),
        )
        .await?;

        let status = HostStatus {
            host_type: config.host_type(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            config: config.status_config(transport.port()),
        };
        sessions.set_status(status.clone());

        info!(
            "Host {instance_id} ({:?}) listening on {}",
            status.host_type,
            transport.local_addr()
        );

        Ok(Self {
            instance_id,
            transport,
            sessions,
            supervisor,
            status,
        })
    }

    pub fn instance_id(&self) -> Uuid {
        self.instance_id
    }

    pub fn port(&self) -> u16 {
        self.transport.port()
    }

    pub fn status(&self) -> &HostStatus {
        &self.status
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn supervisor(&self) -> Option<&Arc<Supervisor>> {
        self.supervisor.as_ref()
    }

    /// Resolves when the idle policy decides the host should exit.
    pub async fn wait_for_shutdown(&self) {
        self.sessions.wait_for_shutdown().await;
    }

    /// Stop accepting connections, close the open ones and stop every
    /// supervised service.
    pub async fn stop(mut self) {
        info!("Host {} stopping", self.instance_id);
        self.sessions.shutdown();
        self.transport.stop().await;
        if let Some(supervisor) = &self.supervisor {
            supervisor.shutdown().await;
        }
    }
}
