//! Bounded polling retry with a deadline and cancellation.
//!
//! Every cluster API interaction goes through [`retry_until`]. The operation is
//! invoked on a fixed cadence until it succeeds, the run is cancelled, or the
//! deadline elapses. Exhaustion is returned as a typed, fatal
//! [`Error::RetryExhausted`]; callers that want best-effort semantics must
//! check their own bound inside the operation and report success.
//!
//! # Example
//!
//! ```ignore
//! use ignis::retry::{retry_until, RetryPolicy};
//!
//! let nodes = retry_until(
//!     &cancel,
//!     "worker-1",
//!     "list_nodes",
//!     &RetryPolicy::minutes(5),
//!     || async { api.list_nodes().await },
//! ).await?;
//! ```

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;

use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::Error;

/// Fixed interval between attempts
pub const RETRY_INTERVAL: Duration = Duration::from_secs(5);

/// Cadence and deadline for one retried interaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Time between the start of successive attempts
    pub interval: Duration,
    /// Absolute bound measured from the first attempt
    pub deadline: Duration,
}

impl RetryPolicy {
    /// Policy with the standard interval and the given deadline
    pub fn with_deadline(deadline: Duration) -> Self {
        Self {
            interval: RETRY_INTERVAL,
            deadline,
        }
    }

    /// Policy with the standard interval and a deadline in whole minutes
    pub fn minutes(minutes: u64) -> Self {
        Self::with_deadline(Duration::from_secs(minutes * 60))
    }
}

/// Run `operation` until it succeeds, `cancel` fires, or the deadline elapses.
///
/// Cancellation always wins over the deadline, and an attempt still in flight
/// when either fires is dropped. Every failed attempt is logged with the node
/// so concurrent workers stay distinguishable in the output.
pub async fn retry_until<F, Fut, T, E>(
    cancel: &CancellationToken,
    node: &str,
    operation_name: &str,
    policy: &RetryPolicy,
    mut operation: F,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let started = Instant::now();
    let deadline = started + policy.deadline;
    let mut ticker = tokio::time::interval_at(started + policy.interval, policy.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let cancelled = || Error::Cancelled {
        node: node.to_string(),
        operation: operation_name.to_string(),
    };
    let exhausted = |last_error: String| {
        error!(
            node = %node,
            operation = %operation_name,
            deadline = ?policy.deadline,
            error = %last_error,
            "giving up, deadline reached"
        );
        Error::RetryExhausted {
            node: node.to_string(),
            operation: operation_name.to_string(),
            deadline: policy.deadline,
            last_error,
        }
    };

    let mut attempt = 0u32;
    loop {
        attempt += 1;

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled()),
            _ = tokio::time::sleep_until(deadline) => {
                return Err(exhausted("attempt still running at deadline".to_string()));
            }
            result = operation() => result,
        };

        let err = match result {
            Ok(value) => return Ok(value),
            Err(e) => e.to_string(),
        };

        info!(
            node = %node,
            operation = %operation_name,
            attempt = attempt,
            error = %err,
            retry_in = ?policy.interval,
            max_wait = ?policy.deadline,
            "operation failed, retrying"
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled()),
            _ = tokio::time::sleep_until(deadline) => return Err(exhausted(err)),
            _ = ticker.tick() => {}
        }
    }
}
