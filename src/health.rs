//! Post-reboot health gates

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::cluster::{NodeLifecycle, ROLE_LABEL};
use crate::retry::RETRY_INTERVAL;
use crate::topology::Role;
use crate::transport::RemoteTransport;
use crate::{Error, Result};

/// Substring of a healthy `etcdctl endpoint health` report
pub const HEALTHY_MARKER: &str = "is healthy";

const ETCD_CLIENT_PORT: u16 = 2379;

/// Health check of the etcd member running on `host`
pub fn etcd_health_command(host: &str) -> String {
    format!(
        "/opt/etcd/bin/etcdctl endpoint health \
         --key=/etc/ssl/etcd/etcd-client-key.pem \
         --cacert=/etc/ssl/etcd/ca.pem \
         --cert=/etc/ssl/etcd/etcd-client.pem \
         --endpoints=https://{host}:{ETCD_CLIENT_PORT}"
    )
}

/// Quorum and rejoin checks run after a node reboots
pub struct HealthGate {
    transport: Arc<dyn RemoteTransport>,
    lifecycle: NodeLifecycle,
    quorum_budget: u32,
    poll_interval: Duration,
}

impl HealthGate {
    /// Create a gate tolerating `quorum_budget` unhealthy etcd observations
    pub fn new(
        transport: Arc<dyn RemoteTransport>,
        lifecycle: NodeLifecycle,
        quorum_budget: u32,
    ) -> Self {
        Self {
            transport,
            lifecycle,
            quorum_budget,
            poll_interval: RETRY_INTERVAL,
        }
    }

    /// Poll the etcd member on `host` until it reports healthy
    ///
    /// A failing health command counts as an unhealthy observation. Returns
    /// the number of checks made.
    pub async fn check_quorum(&self, host: &str) -> Result<u32> {
        let command = etcd_health_command(host);
        let cancel = self.lifecycle.cancel_token();
        let cancelled = || Error::Cancelled {
            node: host.to_string(),
            operation: "check_quorum".to_string(),
        };

        let mut observations = 0u32;
        loop {
            let result = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(cancelled()),
                result = self.transport.execute_command_with_output(host, &command) => result,
            };
            observations += 1;

            match result {
                Ok(output) if output.contains(HEALTHY_MARKER) => {
                    info!(node = %host, observations, "etcd member healthy");
                    return Ok(observations);
                }
                Ok(output) => {
                    info!(node = %host, observations, output = %output.trim(), "etcd member not healthy yet");
                }
                Err(e) => {
                    warn!(node = %host, observations, error = %e, "etcd health check failed");
                }
            }

            if observations > self.quorum_budget {
                return Err(Error::QuorumUnhealthy {
                    node: host.to_string(),
                    observations,
                });
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(cancelled()),
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
    }

    /// Wait for the node to register with the cluster again
    pub async fn rejoin(&self, host: &str) -> Result<()> {
        self.lifecycle.wait_for_node_join(host).await?;
        info!(node = %host, "node joined cluster");
        Ok(())
    }

    /// Apply the role label
    pub async fn relabel(&self, host: &str, role: Role) -> Result<()> {
        self.lifecycle
            .label_node(host, ROLE_LABEL, role.as_str())
            .await
    }
}
