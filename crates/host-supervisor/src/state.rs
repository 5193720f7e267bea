//! Per-service lifecycle state and restart backoff.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of one supervised service.
///
/// ```text
/// starting ──▶ ready ──(unexpected exit)──▶ crashed ──(backoff)──▶ restarting ──▶ ready
///     │                                        ▲                       │
///     └────────(spawn / readiness failure)─────┴───────────────────────┘
/// any ──(shutdown)──▶ stopped
/// ```
///
/// `restarting` is the crash-recovery form of `starting`: a new process is
/// being spawned and has not reported ready yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Lifecycle {
    Starting,
    Ready,
    Crashed,
    Restarting,
    Stopped,
}

impl Lifecycle {
    /// A process for the current generation is being spawned.
    pub fn is_launching(&self) -> bool {
        matches!(self, Self::Starting | Self::Restarting)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Crashed => "crashed",
            Self::Restarting => "restarting",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for Lifecycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health record of one service. Written only by the supervisor's monitor
/// task; everything else reads clones of it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceProcessState {
    pub service_name: String,
    pub lifecycle: Lifecycle,
    pub pid: Option<u32>,
    /// Consecutive crashes since the service was last stable.
    pub restart_count: u32,
    pub last_crash_at: Option<DateTime<Utc>>,
    /// Bumped on every start attempt; events from older attempts are stale.
    pub generation: u64,
}

impl ServiceProcessState {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            lifecycle: Lifecycle::Stopped,
            pid: None,
            restart_count: 0,
            last_crash_at: None,
            generation: 0,
        }
    }
}

/// Capped exponential restart delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay before the first restart.
    pub base: Duration,
    /// Upper bound on any delay.
    pub max: Duration,
    /// A service ready for this long has its restart count reset.
    pub stable_after: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(100),
            max: Duration::from_secs(30),
            stable_after: Duration::from_secs(10),
        }
    }
}

impl BackoffPolicy {
    /// Delay before restart number `restart_count` (1-based).
    pub fn delay(&self, restart_count: u32) -> Duration {
        let exponent = restart_count.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.max, |d| d.min(self.max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_then_caps() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(100),
            max: Duration::from_millis(1000),
            stable_after: Duration::from_secs(1),
        };
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(400));
        assert_eq!(policy.delay(4), Duration::from_millis(800));
        assert_eq!(policy.delay(5), Duration::from_millis(1000));
        assert_eq!(policy.delay(u32::MAX), Duration::from_millis(1000));
    }

    #[test]
    fn new_state_is_stopped() {
        let state = ServiceProcessState::new("echo");
        assert_eq!(state.lifecycle, Lifecycle::Stopped);
        assert_eq!(state.restart_count, 0);
        assert!(state.pid.is_none());
    }

    #[test]
    fn lifecycle_serializes_lowercase() {
        assert_eq!(serde_json::to_value(Lifecycle::Restarting).unwrap(), "restarting");
        assert_eq!(Lifecycle::Ready.to_string(), "ready");
    }
}
