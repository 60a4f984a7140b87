//! Run settings, deployment profiles and fixed filesystem locations

use std::path::{Path, PathBuf};

use clap::ValueEnum;

use crate::{Error, Result};

/// Remote location the OS reads its boot configuration from
pub const INSTALLED_CONFIG_PATH: &str = "/usr/share/oem/config.ign";

/// Directory holding the first-boot marker
pub const FIRST_BOOT_DIR: &str = "/boot/flatcar";

/// Marker forcing a first-boot configuration pass
pub const FIRST_BOOT_FLAG: &str = "/boot/flatcar/first_boot";

/// Machine identity cleared so the host rejoins as fresh hardware
pub const MACHINE_ID_PATH: &str = "/etc/machine-id";

/// File name of a node's generated boot configuration
pub const CONFIG_FILE_NAME: &str = "config.ign";

/// Default remote user
pub const DEFAULT_USER: &str = "deployer";

/// Default worker pool capacity
pub const DEFAULT_MAX_PARALLELISM: usize = 2;

/// Local path of a node's generated configuration
pub fn local_config_path(output_dir: &Path, hostname: &str) -> PathBuf {
    output_dir.join(hostname).join(CONFIG_FILE_NAME)
}

/// Remote path the configuration is uploaded to before installation
pub fn upload_path(user: &str) -> String {
    format!("/home/{user}/{CONFIG_FILE_NAME}")
}

/// How patient the etcd quorum gate is after a reboot
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum HealthProfile {
    /// Tolerates slow member recovery
    #[default]
    Conservative,
    /// Fails quickly on an unhealthy member
    Fast,
}

impl HealthProfile {
    /// Unhealthy observations tolerated before the gate fails
    pub fn quorum_budget(&self) -> u32 {
        match self {
            HealthProfile::Conservative => 12,
            HealthProfile::Fast => 5,
        }
    }
}

/// How a pod is recognised as daemonset managed
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum DaemonSetMatch {
    /// Controller owner reference of kind `DaemonSet`
    #[default]
    OwnerReference,
    /// Pod name contains the name of an existing daemonset
    NameSubstring,
}

/// Validated settings for one provisioning run
#[derive(Clone, Debug)]
pub struct ProvisionSettings {
    /// Cluster name, also the kubeconfig context
    pub cluster: String,
    /// Worker pool capacity
    pub max_parallelism: usize,
    /// Skip drain and the post-reboot rejoin/relabel step
    pub skip_drain: bool,
    /// Bootstrapping a cluster with no prior etcd members
    pub new_cluster: bool,
    /// Quorum gate patience
    pub health_profile: HealthProfile,
    /// Daemonset ownership strategy
    pub daemonset_match: DaemonSetMatch,
    /// Remote user the configuration is uploaded as
    pub remote_user: String,
    /// Directory holding generated per-node configuration
    pub output_dir: PathBuf,
}

impl ProvisionSettings {
    /// Settings with defaults for the given cluster
    pub fn new(cluster: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            max_parallelism: DEFAULT_MAX_PARALLELISM,
            skip_drain: false,
            new_cluster: false,
            health_profile: HealthProfile::default(),
            daemonset_match: DaemonSetMatch::default(),
            remote_user: DEFAULT_USER.to_string(),
            output_dir: PathBuf::from("output"),
        }
    }

    /// Reject settings no run can use
    pub fn validate(&self) -> Result<()> {
        if self.cluster.trim().is_empty() {
            return Err(Error::validation("cluster name must not be empty"));
        }
        if self.max_parallelism == 0 {
            return Err(Error::validation("max parallelism must be at least 1"));
        }
        if self.remote_user.trim().is_empty() {
            return Err(Error::validation("remote user must not be empty"));
        }
        Ok(())
    }

    /// Local configuration file for a host
    pub fn local_config(&self, hostname: &str) -> PathBuf {
        local_config_path(&self.output_dir, hostname)
    }
}
