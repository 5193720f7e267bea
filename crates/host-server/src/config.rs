//! Host configuration, loaded from a JSON file with camelCase keys.
//!
//! ```json
//! {
//!   "port": 30403,
//!   "disconnectTimeout": 1000,
//!   "functions": [{ "name": "double", "handler": "double" }],
//!   "services": [{ "name": "echo", "handler": "echo" },
//!                { "name": "external", "command": ["python3", "svc.py"] }]
//! }
//! ```

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use host_protocol::{HostType, StatusConfig};
use host_services::BUILTIN_KINDS;
use host_supervisor::{BackoffPolicy, ServiceSpec, SupervisorPolicy};
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Duplicate handler name: {0}")]
    DuplicateHandlerName(String),

    #[error("Handler {name}: unknown handler kind {kind:?}")]
    UnknownHandlerKind { name: String, kind: String },

    #[error("Handler {name}: {reason}")]
    InvalidHandler { name: String, reason: String },

    #[error("Service {name}: {reason}")]
    InvalidService { name: String, reason: String },

    #[error("Invalid supervisor policy: {0}")]
    InvalidSupervisor(String),

    #[error("Cannot locate the worker executable: {0}")]
    WorkerProgram(String),
}

fn default_address() -> String {
    "127.0.0.1".into()
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostConfig {
    #[serde(default = "default_address")]
    pub address: String,
    /// 0 lets the OS pick a port.
    #[serde(default)]
    pub port: u16,
    /// Milliseconds with zero connections before the host exits. 0 disables.
    #[serde(default)]
    pub disconnect_timeout: u64,
    /// Enables the result cache for requests that carry a `cacheKey`.
    #[serde(default = "default_true")]
    pub cache: bool,
    /// Default per-invocation timeout in milliseconds. 0 disables.
    #[serde(default)]
    pub invocation_timeout: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_connections: Option<usize>,
    #[serde(default)]
    pub functions: Vec<FunctionConfig>,
    #[serde(default)]
    pub services: Vec<ServiceConfig>,
    #[serde(default)]
    pub supervisor: SupervisorConfig,
    /// Executable used for `handler` services, run as `<program> worker ...`.
    /// Defaults to the running executable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker_program: Option<PathBuf>,
}

/// An in-process function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionConfig {
    pub name: String,
    /// Sample handler kind, e.g. `"double"`.
    pub handler: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub options: Value,
    #[serde(default = "default_true")]
    pub cache: bool,
}

/// A service run in its own child process. Exactly one of `handler` (a
/// sample handler served by this binary in worker mode) or `command` (any
/// program speaking the stdio wire protocol) must be set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfig {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub options: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<Vec<String>>,
    /// Defaults to true for `handler` services, false for `command` ones.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub await_ready: Option<bool>,
    #[serde(default = "default_true")]
    pub cache: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SupervisorConfig {
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub stable_after_ms: u64,
    pub startup_timeout_ms: u64,
    /// Requests held per service while it is not ready. 0 fails fast.
    pub queue_depth: usize,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            backoff_base_ms: 100,
            backoff_max_ms: 30_000,
            stable_after_ms: 10_000,
            startup_timeout_ms: 5_000,
            queue_depth: 0,
        }
    }
}

impl SupervisorConfig {
    /// Restart delays must be non-zero and the cap must not undercut the base.
    fn validate(&self) -> Result<(), ConfigError> {
        if self.backoff_base_ms == 0 {
            return Err(ConfigError::InvalidSupervisor(
                "backoffBaseMs must be greater than 0".into(),
            ));
        }
        if self.backoff_max_ms < self.backoff_base_ms {
            return Err(ConfigError::InvalidSupervisor(format!(
                "backoffMaxMs ({}) must not be less than backoffBaseMs ({})",
                self.backoff_max_ms, self.backoff_base_ms
            )));
        }
        Ok(())
    }
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            address: default_address(),
            port: 0,
            disconnect_timeout: 0,
            cache: true,
            invocation_timeout: 0,
            max_connections: None,
            functions: Vec::new(),
            services: Vec::new(),
            supervisor: SupervisorConfig::default(),
            worker_program: None,
        }
    }
}

impl HostConfig {
    /// Read, parse and validate a config file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Check names and handler descriptors. Called by [`load`](Self::load)
    /// and again when a host starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        let names = self
            .functions
            .iter()
            .map(|f| &f.name)
            .chain(self.services.iter().map(|s| &s.name));
        for name in names {
            if !seen.insert(name.as_str()) {
                return Err(ConfigError::DuplicateHandlerName(name.clone()));
            }
        }

        for function in &self.functions {
            if function.name.is_empty() {
                return Err(ConfigError::InvalidHandler {
                    name: function.name.clone(),
                    reason: "name must not be empty".into(),
                });
            }
            check_kind(&function.name, &function.handler)?;
        }

        for service in &self.services {
            let invalid = |reason: &str| ConfigError::InvalidService {
                name: service.name.clone(),
                reason: reason.into(),
            };
            if service.name.is_empty() {
                return Err(invalid("name must not be empty"));
            }
            match (&service.handler, &service.command) {
                (Some(kind), None) => check_kind(&service.name, kind)?,
                (None, Some(command)) if command.is_empty() => {
                    return Err(invalid("command must not be empty"));
                }
                (None, Some(_)) => {}
                (Some(_), Some(_)) => return Err(invalid("set either handler or command, not both")),
                (None, None) => return Err(invalid("one of handler or command is required")),
            }
        }

        self.supervisor.validate()
    }

    pub fn disconnect_timeout(&self) -> Option<Duration> {
        (self.disconnect_timeout > 0).then(|| Duration::from_millis(self.disconnect_timeout))
    }

    pub fn invocation_timeout(&self) -> Option<Duration> {
        (self.invocation_timeout > 0).then(|| Duration::from_millis(self.invocation_timeout))
    }

    pub fn host_type(&self) -> HostType {
        if self.services.is_empty() {
            HostType::Host
        } else {
            HostType::ServiceHost
        }
    }

    pub fn supervisor_policy(&self) -> SupervisorPolicy {
        SupervisorPolicy {
            backoff: BackoffPolicy {
                base: Duration::from_millis(self.supervisor.backoff_base_ms),
                max: Duration::from_millis(self.supervisor.backoff_max_ms),
                stable_after: Duration::from_millis(self.supervisor.stable_after_ms),
            },
            queue_depth: self.supervisor.queue_depth,
        }
    }

    /// Launch descriptors for every configured service, in order.
    pub fn service_specs(&self) -> Result<Vec<ServiceSpec>, ConfigError> {
        let worker = match &self.worker_program {
            Some(program) => program.clone(),
            None if self.services.iter().any(|s| s.handler.is_some()) => {
                std::env::current_exe().map_err(|e| ConfigError::WorkerProgram(e.to_string()))?
            }
            None => PathBuf::new(),
        };
        self.services.iter().map(|s| s.spec(&worker, &self.supervisor)).collect()
    }

    /// Externally visible config reported by `/status`.
    pub fn status_config(&self, bound_port: u16) -> StatusConfig {
        StatusConfig {
            address: self.address.clone(),
            port: bound_port,
            functions: self.functions.iter().map(|f| f.name.clone()).collect(),
            services: self.services.iter().map(|s| s.name.clone()).collect(),
            disconnect_timeout: self.disconnect_timeout,
        }
    }
}

impl ServiceConfig {
    fn spec(&self, worker: &Path, supervisor: &SupervisorConfig) -> Result<ServiceSpec, ConfigError> {
        let startup_timeout = Duration::from_millis(supervisor.startup_timeout_ms);
        let spec = match (&self.handler, &self.command) {
            (Some(kind), _) => {
                let mut args = vec![
                    "worker".to_string(),
                    "--handler".to_string(),
                    kind.clone(),
                    "--name".to_string(),
                    self.name.clone(),
                ];
                if !self.options.is_null() {
                    args.push("--options".into());
                    args.push(self.options.to_string());
                }
                ServiceSpec::new(&self.name, worker, args)
            }
            (None, Some(command)) => {
                let (program, args) = command.split_first().ok_or_else(|| {
                    ConfigError::InvalidService {
                        name: self.name.clone(),
                        reason: "command must not be empty".into(),
                    }
                })?;
                ServiceSpec::new(&self.name, program, args.to_vec())
            }
            (None, None) => {
                return Err(ConfigError::InvalidService {
                    name: self.name.clone(),
                    reason: "one of handler or command is required".into(),
                });
            }
        };

        let await_ready = self.await_ready.unwrap_or(self.handler.is_some());
        Ok(if await_ready {
            spec.await_ready(startup_timeout)
        } else {
            ServiceSpec {
                startup_timeout,
                ..spec
            }
        })
    }
}

fn check_kind(name: &str, kind: &str) -> Result<(), ConfigError> {
    if BUILTIN_KINDS.contains(&kind) {
        Ok(())
    } else {
        Err(ConfigError::UnknownHandlerKind {
            name: name.to_string(),
            kind: kind.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    fn parse(value: Value) -> HostConfig {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn defaults_apply_to_empty_config() {
        let config = parse(json!({}));
        assert_eq!(config, HostConfig::default());
        assert_eq!(config.address, "127.0.0.1");
        assert!(config.cache);
        assert!(config.disconnect_timeout().is_none());
        assert!(config.invocation_timeout().is_none());
        assert_eq!(config.supervisor_policy().queue_depth, 0);
        assert_eq!(config.host_type(), HostType::Host);
    }

    #[test]
    fn parses_full_config() {
        let config = parse(json!({
            "address": "0.0.0.0",
            "port": 30403,
            "disconnectTimeout": 1000,
            "cache": false,
            "invocationTimeout": 250,
            "functions": [
                { "name": "double", "handler": "double" },
                { "name": "slow", "handler": "async_echo", "options": { "delayMs": 50 }, "cache": false }
            ],
            "services": [
                { "name": "echo", "handler": "echo" },
                { "name": "external", "command": ["python3", "svc.py"], "awaitReady": true }
            ],
            "supervisor": { "backoffBaseMs": 10, "queueDepth": 8 }
        }));
        config.validate().unwrap();

        assert_eq!(config.disconnect_timeout(), Some(Duration::from_secs(1)));
        assert_eq!(config.invocation_timeout(), Some(Duration::from_millis(250)));
        assert!(!config.functions[1].cache);
        assert_eq!(config.host_type(), HostType::ServiceHost);

        let policy = config.supervisor_policy();
        assert_eq!(policy.backoff.base, Duration::from_millis(10));
        assert_eq!(policy.backoff.max, Duration::from_secs(30));
        assert_eq!(policy.queue_depth, 8);

        let status = config.status_config(40000);
        assert_eq!(status.port, 40000);
        assert_eq!(status.functions, vec!["double", "slow"]);
        assert_eq!(status.services, vec!["echo", "external"]);
    }

    #[test]
    fn duplicate_names_across_functions_and_services() {
        let config = parse(json!({
            "functions": [{ "name": "echo", "handler": "echo" }],
            "services": [{ "name": "echo", "handler": "echo" }]
        }));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::DuplicateHandlerName(name)) if name == "echo"
        ));
    }

    #[test]
    fn unknown_handler_kind_is_rejected() {
        let config = parse(json!({ "functions": [{ "name": "x", "handler": "teleport" }] }));
        assert!(matches!(config.validate(), Err(ConfigError::UnknownHandlerKind { .. })));
    }

    #[test]
    fn service_needs_exactly_one_target() {
        let neither = parse(json!({ "services": [{ "name": "s" }] }));
        assert!(matches!(neither.validate(), Err(ConfigError::InvalidService { .. })));

        let both = parse(json!({ "services": [{ "name": "s", "handler": "echo", "command": ["cat"] }] }));
        assert!(matches!(both.validate(), Err(ConfigError::InvalidService { .. })));

        let empty = parse(json!({ "services": [{ "name": "s", "command": [] }] }));
        assert!(matches!(empty.validate(), Err(ConfigError::InvalidService { .. })));
    }

    #[test]
    fn zero_or_inverted_backoff_is_rejected() {
        let zero = parse(json!({ "supervisor": { "backoffBaseMs": 0, "backoffMaxMs": 0 } }));
        assert!(matches!(zero.validate(), Err(ConfigError::InvalidSupervisor(_))));

        let inverted = parse(json!({ "supervisor": { "backoffBaseMs": 500, "backoffMaxMs": 100 } }));
        assert!(matches!(inverted.validate(), Err(ConfigError::InvalidSupervisor(_))));

        let ok = parse(json!({ "supervisor": { "backoffBaseMs": 1, "backoffMaxMs": 1 } }));
        ok.validate().unwrap();
        assert!(ok.supervisor_policy().backoff.delay(5) > Duration::ZERO);
    }

    #[test]
    fn service_specs_use_worker_mode_for_handlers() {
        let config = parse(json!({
            "workerProgram": "/usr/local/bin/svc-host",
            "services": [
                { "name": "echo", "handler": "async_echo", "options": { "delayMs": 5 } },
                { "name": "ext", "command": ["python3", "svc.py", "--fast"] }
            ]
        }));
        let specs = config.service_specs().unwrap();

        assert_eq!(specs[0].program, PathBuf::from("/usr/local/bin/svc-host"));
        assert_eq!(
            specs[0].args,
            vec!["worker", "--handler", "async_echo", "--name", "echo", "--options", r#"{"delayMs":5}"#]
        );
        assert!(specs[0].await_ready);
        assert_eq!(specs[0].startup_timeout, Duration::from_secs(5));

        assert_eq!(specs[1].program, PathBuf::from("python3"));
        assert_eq!(specs[1].args, vec!["svc.py", "--fast"]);
        assert!(!specs[1].await_ready);
    }

    #[test]
    fn load_reports_read_and_parse_errors() {
        let missing = HostConfig::load(Path::new("/nonexistent/host.json"));
        assert!(matches!(missing, Err(ConfigError::Read { .. })));

        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "{{ not json").unwrap();
        assert!(matches!(HostConfig::load(file.path()), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn load_validates() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            "{}",
            json!({ "functions": [
                { "name": "a", "handler": "echo" },
                { "name": "a", "handler": "double" }
            ]})
        )
        .unwrap();
        assert!(matches!(
            HostConfig::load(file.path()),
            Err(ConfigError::DuplicateHandlerName(_))
        ));
    }
}
