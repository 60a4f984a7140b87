//! Per-node provisioning state machine
//!
//! ```text
//! Start -> (drain) -> config delivered -> rebooted -> (health gate) -> (relabel) -> done
//! ```
//!
//! Any error is fatal for the node and is returned to the scheduler, which
//! stops the run. Only the eviction wait degrades instead of failing.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, info_span, Instrument};

use crate::cluster::{NodeApi, NodeLifecycle};
use crate::config::{
    upload_path, ProvisionSettings, FIRST_BOOT_DIR, FIRST_BOOT_FLAG, INSTALLED_CONFIG_PATH,
    MACHINE_ID_PATH,
};
use crate::drain::{DrainCoordinator, EvictionOutcome};
use crate::health::HealthGate;
use crate::policy::HealthGateKind;
use crate::topology::{Node, Role};
use crate::transport::{RemoteTransport, TransportError};
use crate::{Error, Result};

/// What happened to one node
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NodeReport {
    /// The node's hostname
    pub hostname: String,
    /// The node's role
    pub role: Role,
    /// Wall-clock time spent on the node
    pub elapsed: Duration,
    /// Eviction result, if the node was drained
    pub eviction: Option<EvictionOutcome>,
}

impl NodeReport {
    /// Whether the eviction wait gave up with pods left on the node
    pub fn eviction_timed_out(&self) -> bool {
        self.eviction.as_ref().is_some_and(EvictionOutcome::timed_out)
    }
}

/// Provisions a single node
#[async_trait]
pub trait Provision: Send + Sync {
    /// Run the full state machine for `node`, aborting when `cancel` fires
    async fn provision(&self, node: &Node, cancel: &CancellationToken) -> Result<NodeReport>;
}

/// Remote command moving the uploaded configuration into place and
/// resetting the host's identity for its next boot
pub fn prepare_for_reboot_command(uploaded: &str) -> String {
    format!(
        "sudo mv {uploaded} {INSTALLED_CONFIG_PATH} && \
         sudo mkdir -p {FIRST_BOOT_DIR} && \
         sudo touch {FIRST_BOOT_FLAG} && \
         sudo rm -f {MACHINE_ID_PATH}"
    )
}

/// Production [`Provision`] implementation
pub struct NodeProvisioner {
    transport: Arc<dyn RemoteTransport>,
    api: Arc<dyn NodeApi>,
    settings: ProvisionSettings,
}

impl NodeProvisioner {
    /// Create a provisioner
    pub fn new(
        transport: Arc<dyn RemoteTransport>,
        api: Arc<dyn NodeApi>,
        settings: ProvisionSettings,
    ) -> Self {
        Self {
            transport,
            api,
            settings,
        }
    }

    async fn deliver_config(&self, host: &str) -> Result<()> {
        let local = self.settings.local_config(host);
        let remote = upload_path(&self.settings.remote_user);

        self.transport
            .upload_file(host, &local, &remote)
            .await
            .map_err(|e| Error::transport(host, e))?;
        self.transport
            .execute_command(host, &prepare_for_reboot_command(&remote))
            .await
            .map_err(|e| Error::transport(host, e))?;
        info!("configuration installed");
        Ok(())
    }

    async fn reboot(&self, host: &str) -> Result<()> {
        match self.transport.reboot(host).await {
            Ok(()) | Err(TransportError::ConnectionDropped) => {
                info!("reboot issued");
                Ok(())
            }
            Err(e) => Err(Error::transport(host, e)),
        }
    }

    async fn run(&self, node: &Node, cancel: &CancellationToken) -> Result<NodeReport> {
        let started = Instant::now();
        let host = node.hostname.as_str();
        let policy = node.role.policy();
        let lifecycle = NodeLifecycle::new(
            self.api.clone(),
            cancel.clone(),
            self.settings.daemonset_match,
        );
        info!("provisioning node");

        let mut eviction = None;
        if policy.may_drain(&self.settings) {
            if lifecycle.node_exists(host).await? {
                let outcome = DrainCoordinator::new(lifecycle.clone()).drain(host).await?;
                lifecycle.delete_node(host).await?;
                eviction = Some(outcome);
            } else {
                info!("node not in cluster, nothing to drain");
            }
        }

        // nothing past this point can be undone
        if cancel.is_cancelled() {
            return Err(Error::Cancelled {
                node: host.to_string(),
                operation: "deliver_config".to_string(),
            });
        }

        self.deliver_config(host).await?;
        self.reboot(host).await?;

        let gate = HealthGate::new(
            self.transport.clone(),
            lifecycle,
            self.settings.health_profile.quorum_budget(),
        );
        match policy.effective_health_gate(&self.settings) {
            HealthGateKind::Quorum => {
                gate.check_quorum(host).await?;
            }
            HealthGateKind::Rejoin => gate.rejoin(host).await?,
            HealthGateKind::None => {}
        }
        if policy.should_relabel(&self.settings) {
            gate.relabel(host, node.role).await?;
        }

        let elapsed = started.elapsed();
        info!(elapsed = ?elapsed, "node provisioned");
        Ok(NodeReport {
            hostname: node.hostname.clone(),
            role: node.role,
            elapsed,
            eviction,
        })
    }
}

#[async_trait]
impl Provision for NodeProvisioner {
    async fn provision(&self, node: &Node, cancel: &CancellationToken) -> Result<NodeReport> {
        let span = info_span!("provision", node = %node.hostname, role = %node.role);
        self.run(node, cancel).instrument(span).await
    }
}
