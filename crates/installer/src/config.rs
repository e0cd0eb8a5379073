use std::time::Duration;

use serde::{Deserialize, Serialize};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_RESOLUTION_TIMEOUT: Duration = Duration::from_secs(120);
pub const DEFAULT_CONVERGENCE_TIMEOUT: Duration = Duration::from_secs(300);
pub const SUCCEEDED_PHASE: &str = "Succeeded";
pub const FAILED_PHASE: &str = "Failed";

/// Polling policy for the resolution waiter.
///
/// Convergence time depends on the cluster and on how large the operator
/// bundle is, so every bound here is tunable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitConfig {
    /// Fixed delay between attempts (no backoff).
    pub poll_interval: Duration,
    /// Bound on waiting for the subscription to point at a resolved-version record.
    pub resolution_timeout: Duration,
    /// Bound on waiting for that record to reach `success_phase`.
    pub convergence_timeout: Duration,
    pub success_phase: String,
    /// Phases that end the wait immediately with a failure.
    pub failure_phases: Vec<String>,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            resolution_timeout: DEFAULT_RESOLUTION_TIMEOUT,
            convergence_timeout: DEFAULT_CONVERGENCE_TIMEOUT,
            success_phase: SUCCEEDED_PHASE.to_string(),
            failure_phases: vec![FAILED_PHASE.to_string()],
        }
    }
}

fn env_u64(name: &str) -> Option<u64> {
    std::env::var(name).ok().and_then(|s| s.parse::<u64>().ok())
}

impl WaitConfig {
    /// Defaults overridden by `OLMCTL_POLL_INTERVAL_MS`, `OLMCTL_RESOLUTION_TIMEOUT_SECS`
    /// and `OLMCTL_CONVERGENCE_TIMEOUT_SECS` when set and parseable.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            poll_interval: env_u64("OLMCTL_POLL_INTERVAL_MS").map(Duration::from_millis).unwrap_or(d.poll_interval),
            resolution_timeout: env_u64("OLMCTL_RESOLUTION_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.resolution_timeout),
            convergence_timeout: env_u64("OLMCTL_CONVERGENCE_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(d.convergence_timeout),
            ..d
        }
    }

    pub fn is_failure(&self, phase: &str) -> bool {
        self.failure_phases.iter().any(|p| p == phase)
    }
}
