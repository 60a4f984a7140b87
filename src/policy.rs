//! Per-role provisioning policy
//!
//! Which roles drain, which health gate runs after reboot, whether the node
//! gets relabelled and how the scheduler dispatches it. Kept as a table so
//! each role's behaviour is checked in one place.

use crate::config::ProvisionSettings;
use crate::topology::Role;

/// Post-reboot check
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HealthGateKind {
    /// No check
    None,
    /// etcd member health via remote command
    Quorum,
    /// Wait for the node to rejoin the cluster
    Rejoin,
}

/// How the scheduler runs nodes of a role
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Dispatch {
    /// One node at a time on the scheduling task
    Sequential,
    /// Bounded, staggered worker pool
    Pooled,
}

/// Fixed behaviour of a role
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RolePolicy {
    /// Evacuate workloads before reboot
    pub drains: bool,
    /// Check run after reboot
    pub health_gate: HealthGateKind,
    /// Apply the role label after rejoin
    pub relabels: bool,
    /// Dispatch mode
    pub dispatch: Dispatch,
}

impl Role {
    /// The policy for this role
    pub fn policy(&self) -> RolePolicy {
        match self {
            Role::Etcd => RolePolicy {
                drains: false,
                health_gate: HealthGateKind::Quorum,
                relabels: false,
                dispatch: Dispatch::Sequential,
            },
            Role::Apiserver => RolePolicy {
                drains: false,
                health_gate: HealthGateKind::None,
                relabels: false,
                dispatch: Dispatch::Sequential,
            },
            Role::Worker => RolePolicy {
                drains: true,
                health_gate: HealthGateKind::Rejoin,
                relabels: true,
                dispatch: Dispatch::Pooled,
            },
            Role::Prometheus => RolePolicy {
                drains: false,
                health_gate: HealthGateKind::Rejoin,
                relabels: true,
                dispatch: Dispatch::Sequential,
            },
        }
    }
}

impl RolePolicy {
    /// Whether this run drains the role at all
    ///
    /// Only a node that is currently registered can actually be drained.
    pub fn may_drain(&self, settings: &ProvisionSettings) -> bool {
        self.drains && !settings.skip_drain
    }

    /// The gate to run for this run's settings
    pub fn effective_health_gate(&self, settings: &ProvisionSettings) -> HealthGateKind {
        match self.health_gate {
            HealthGateKind::Quorum if settings.new_cluster => HealthGateKind::None,
            HealthGateKind::Rejoin if settings.skip_drain => HealthGateKind::None,
            gate => gate,
        }
    }

    /// Whether to relabel after rejoin
    pub fn should_relabel(&self, settings: &ProvisionSettings) -> bool {
        self.relabels && !settings.skip_drain
    }
}
