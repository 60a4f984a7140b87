//! Role ordering and worker pool dispatch
//!
//! Roles run in the fixed order etcd, apiserver, worker, prometheus. Every
//! role except worker runs one node at a time on the scheduling task. Workers
//! are spawned onto a bounded pool without blocking the scheduler, so
//! prometheus nodes may run while workers are still in flight. The first
//! `max_parallelism` worker dispatches are spaced [`WORKER_STAGGER`] apart
//! to ramp load on the control plane gradually.
//!
//! The first failure cancels the run: nodes not yet started are skipped,
//! in-flight retries abort, and the scheduler waits for every spawned worker
//! before returning the error.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::policy::Dispatch;
use crate::provision::{NodeReport, Provision};
use crate::topology::{ClusterTopology, Node, Role};
use crate::{Error, Result};

/// Delay between the first worker dispatches
pub const WORKER_STAGGER: Duration = Duration::from_secs(7);

/// Outcome of a completed run
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RunReport {
    /// Provisioned nodes in completion order
    pub nodes: Vec<NodeReport>,
}

impl RunReport {
    /// Nodes whose eviction wait timed out
    pub fn evictions_timed_out(&self) -> usize {
        self.nodes.iter().filter(|n| n.eviction_timed_out()).count()
    }

    /// Log one line per node and a total
    pub fn log_summary(&self) {
        for node in &self.nodes {
            info!(
                node = %node.hostname,
                role = %node.role,
                elapsed = ?node.elapsed,
                eviction_timed_out = node.eviction_timed_out(),
                "provisioned"
            );
        }
        info!(
            nodes = self.nodes.len(),
            evictions_timed_out = self.evictions_timed_out(),
            "run complete"
        );
    }
}

/// Orders roles and dispatches node provisioning
pub struct RoleScheduler {
    provisioner: Arc<dyn Provision>,
    max_parallelism: usize,
    stagger: Duration,
}

impl RoleScheduler {
    /// Create a scheduler with a worker pool of `max_parallelism`
    pub fn new(provisioner: Arc<dyn Provision>, max_parallelism: usize) -> Self {
        Self {
            provisioner,
            max_parallelism: max_parallelism.max(1),
            stagger: WORKER_STAGGER,
        }
    }

    /// Override the delay between the first worker dispatches
    pub fn with_stagger(mut self, stagger: Duration) -> Self {
        self.stagger = stagger;
        self
    }

    /// Provision every node of `topology`
    pub async fn run(
        &self,
        topology: &ClusterTopology,
        cancel: &CancellationToken,
    ) -> Result<RunReport> {
        let run = cancel.child_token();
        let pool = Arc::new(Semaphore::new(self.max_parallelism));
        let mut workers = JoinSet::new();
        let mut worker_names = HashMap::new();
        let mut report = RunReport::default();
        let mut failure: Option<Error> = None;

        'roles: for role in Role::ALL {
            let nodes = topology.nodes(role);
            if nodes.is_empty() {
                continue;
            }
            info!(role = %role, count = nodes.len(), "provisioning role");

            match role.policy().dispatch {
                Dispatch::Sequential => {
                    for node in nodes {
                        if run.is_cancelled() {
                            break 'roles;
                        }
                        match self.provisioner.provision(node, &run).await {
                            Ok(node_report) => report.nodes.push(node_report),
                            Err(e) => {
                                error!(node = %node.hostname, error = %e, "provisioning failed, stopping run");
                                run.cancel();
                                record_failure(&mut failure, e);
                                break 'roles;
                            }
                        }
                    }
                }
                Dispatch::Pooled => {
                    for (index, node) in nodes.iter().enumerate() {
                        if index > 0 && index < self.max_parallelism {
                            tokio::select! {
                                biased;
                                _ = run.cancelled() => break 'roles,
                                _ = tokio::time::sleep(self.stagger) => {}
                            }
                        }
                        if run.is_cancelled() {
                            break 'roles;
                        }
                        info!(node = %node.hostname, "dispatching worker");
                        let handle = workers.spawn(provision_worker(
                            self.provisioner.clone(),
                            pool.clone(),
                            node.clone(),
                            run.clone(),
                        ));
                        worker_names.insert(handle.id(), node.hostname.clone());
                    }
                }
            }
        }

        while let Some(joined) = workers.join_next_with_id().await {
            match joined {
                Ok((_, Ok(node_report))) => report.nodes.push(node_report),
                Ok((_, Err(e))) => record_failure(&mut failure, e),
                Err(join_error) => {
                    let node = worker_names
                        .get(&join_error.id())
                        .cloned()
                        .unwrap_or_default();
                    error!(node = %node, error = %join_error, "worker task aborted");
                    run.cancel();
                    record_failure(
                        &mut failure,
                        Error::WorkerFailed {
                            node,
                            message: join_error.to_string(),
                        },
                    );
                }
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(report),
        }
    }
}

/// Wait for a pool slot, then provision; a failure cancels the run
async fn provision_worker(
    provisioner: Arc<dyn Provision>,
    pool: Arc<Semaphore>,
    node: Node,
    run: CancellationToken,
) -> Result<NodeReport> {
    let result = async {
        let _permit = tokio::select! {
            biased;
            _ = run.cancelled() => {
                return Err(Error::Cancelled {
                    node: node.hostname.clone(),
                    operation: "await_worker_slot".to_string(),
                });
            }
            permit = pool.acquire() => permit.map_err(|e| Error::WorkerFailed {
                node: node.hostname.clone(),
                message: e.to_string(),
            })?,
        };
        provisioner.provision(&node, &run).await
    }
    .await;

    if let Err(e) = &result {
        if e.is_fatal() {
            error!(node = %node.hostname, error = %e, "worker failed, stopping run");
            run.cancel();
        } else {
            warn!(node = %node.hostname, "worker cancelled");
        }
    }
    result
}

/// Keep the first real failure; a cancellation only stands in until one arrives
fn record_failure(slot: &mut Option<Error>, err: Error) {
    match slot {
        None => *slot = Some(err),
        Some(existing) if existing.is_cancellation() && !err.is_cancellation() => {
            *slot = Some(err)
        }
        Some(_) => {}
    }
}
