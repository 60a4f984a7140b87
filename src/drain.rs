//! Evacuating a node before it is rebooted
//!
//! Cordoning is fatal on failure: if the control plane will not accept the
//! mutation the cluster is broken and the run must stop. Waiting for pods to
//! leave is best-effort: once [`EVICTION_WAIT`] has passed the drain reports
//! [`EvictionOutcome::TimedOut`] and the reboot terminates the stragglers.

use std::time::Duration;

use tokio::time::Instant;
use tracing::{info, warn};

use crate::cluster::NodeLifecycle;
use crate::retry::{retry_until, RetryPolicy};
use crate::Result;

/// How long to wait for pods to leave before giving up on them
pub const EVICTION_WAIT: Duration = Duration::from_secs(165);

/// Fatal bound for the eviction polling loop
///
/// Longer than [`EVICTION_WAIT`] plus one poll interval, so the best-effort
/// bound is always observed first.
pub const EVICTION_RETRY_DEADLINE: Duration = Duration::from_secs(3 * 60);

/// How the eviction wait ended
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EvictionOutcome {
    /// Every non-daemonset pod is gone
    Evacuated,
    /// The wait timed out with pods still on the node
    TimedOut {
        /// Pods still present
        remaining: Vec<String>,
    },
}

impl EvictionOutcome {
    /// Whether the wait gave up
    pub fn timed_out(&self) -> bool {
        matches!(self, EvictionOutcome::TimedOut { .. })
    }
}

/// Cordons, taints and waits for eviction
pub struct DrainCoordinator {
    lifecycle: NodeLifecycle,
    eviction_wait: Duration,
}

impl DrainCoordinator {
    /// Create a coordinator using the standard eviction wait
    pub fn new(lifecycle: NodeLifecycle) -> Self {
        Self {
            lifecycle,
            eviction_wait: EVICTION_WAIT,
        }
    }

    /// Drain the node
    pub async fn drain(&self, name: &str) -> Result<EvictionOutcome> {
        info!(node = %name, "initiating node drain");
        self.lifecycle.cordon_and_taint(name).await?;
        self.wait_for_eviction(name).await
    }

    /// Poll until the node has no remaining pods or the wait times out
    pub async fn wait_for_eviction(&self, name: &str) -> Result<EvictionOutcome> {
        let started = Instant::now();
        let wait = self.eviction_wait;
        info!(node = %name, max_wait = ?wait, "waiting for pods to be evicted");

        retry_until(
            self.lifecycle.cancel_token(),
            name,
            "wait_for_eviction",
            &RetryPolicy::with_deadline(EVICTION_RETRY_DEADLINE),
            || async move {
                let remaining = self
                    .lifecycle
                    .remaining_pods(name)
                    .await
                    .map_err(|e| e.to_string())?;

                if remaining.is_empty() {
                    info!(node = %name, "no pods left");
                    return Ok(EvictionOutcome::Evacuated);
                }
                if started.elapsed() >= wait {
                    warn!(
                        node = %name,
                        remaining = remaining.len(),
                        "eviction wait timed out, continuing"
                    );
                    return Ok(EvictionOutcome::TimedOut { remaining });
                }
                Err(format!("pods remaining: {}", remaining.len()))
            },
        )
        .await
    }
}
