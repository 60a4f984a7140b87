//! Deciding which nodes need new configuration
//!
//! A node is selected when the configuration installed on it is missing or
//! differs (by SHA-256) from the locally generated one. An explicit host
//! allow-list bypasses the comparison.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::stream::{self, StreamExt, TryStreamExt};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::config::{local_config_path, INSTALLED_CONFIG_PATH};
use crate::topology::{ClusterTopology, Node};
use crate::transport::RemoteTransport;
use crate::{Error, Result};

/// Remote checks run concurrently
const CHECK_CONCURRENCY: usize = 8;

/// Hex SHA-256 of a file
pub fn sha256_file(path: &Path) -> Result<String> {
    let content = std::fs::read(path).map_err(|e| Error::io(path, e))?;
    Ok(format!("{:x}", Sha256::digest(&content)))
}

/// Compares local and installed configuration checksums
pub struct ChangeSelector {
    transport: Arc<dyn RemoteTransport>,
    output_dir: PathBuf,
}

impl ChangeSelector {
    /// Create a selector reading local configuration from `output_dir`
    pub fn new(transport: Arc<dyn RemoteTransport>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            transport,
            output_dir: output_dir.into(),
        }
    }

    /// The subset of `topology` that needs provisioning
    ///
    /// With a non-empty `allow_list` exactly those hosts are returned, each
    /// under its original role.
    pub async fn select(
        &self,
        topology: &ClusterTopology,
        allow_list: &[String],
    ) -> Result<ClusterTopology> {
        if !allow_list.is_empty() {
            info!(hosts = ?allow_list, "using explicit host list");
            return topology.filter_hosts(allow_list);
        }

        let changed: Vec<(String, bool)> = stream::iter(topology.iter())
            .map(|node| async move {
                let changed = self.needs_change(node).await?;
                Ok::<_, Error>((node.hostname.clone(), changed))
            })
            .buffered(CHECK_CONCURRENCY)
            .try_collect()
            .await?;

        let selected = topology.retain(|node| {
            changed
                .iter()
                .any(|(host, changed)| *changed && host == &node.hostname)
        });
        info!(
            selected = selected.len(),
            total = topology.len(),
            "nodes needing new configuration"
        );
        Ok(selected)
    }

    /// Whether the node's installed configuration differs from the local one
    pub async fn needs_change(&self, node: &Node) -> Result<bool> {
        let local = sha256_file(&local_config_path(&self.output_dir, &node.hostname))?;
        match self.remote_checksum(&node.hostname).await? {
            None => {
                info!(node = %node.hostname, "no configuration installed");
                Ok(true)
            }
            Some(remote) if remote != local => {
                info!(node = %node.hostname, local = %local, remote = %remote, "configuration changed");
                Ok(true)
            }
            Some(_) => {
                debug!(node = %node.hostname, "configuration unchanged");
                Ok(false)
            }
        }
    }

    /// Checksum of the installed configuration, `None` when absent
    pub async fn remote_checksum(&self, host: &str) -> Result<Option<String>> {
        let exists = self
            .transport
            .execute_command_with_output(
                host,
                &format!("sudo test -e {INSTALLED_CONFIG_PATH} && echo exists || true"),
            )
            .await
            .map_err(|e| Error::transport(host, e))?;
        if !exists.contains("exists") {
            return Ok(None);
        }

        let output = self
            .transport
            .execute_command_with_output(host, &format!("sudo sha256sum {INSTALLED_CONFIG_PATH}"))
            .await
            .map_err(|e| Error::transport(host, e))?;
        let checksum = output
            .split_whitespace()
            .next()
            .ok_or_else(|| Error::serialization(format!("empty sha256sum output from {host}")))?;
        Ok(Some(checksum.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::Role;
    use crate::transport::MockRemoteTransport;

    const CONFIG: &str = r#"{"ignition":{"version":"3.3.0"}}"#;

    fn write_config(dir: &Path, host: &str, content: &str) -> String {
        let path = local_config_path(dir, host);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, content).unwrap();
        sha256_file(&path).unwrap()
    }

    fn topology() -> ClusterTopology {
        let mut topology = ClusterTopology::default();
        topology.push(Node::new("etcd-0", Role::Etcd));
        topology.push(Node::new("apiserver-0", Role::Apiserver));
        topology.push(Node::new("worker-0", Role::Worker));
        topology.push(Node::new("worker-1", Role::Worker));
        topology
    }

    #[test]
    fn test_sha256_matches_known_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, "abc").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[tokio::test]
    async fn test_selects_changed_and_missing_only() {
        let dir = tempfile::tempdir().unwrap();
        let same = write_config(dir.path(), "etcd-0", CONFIG);
        write_config(dir.path(), "apiserver-0", CONFIG);
        write_config(dir.path(), "worker-0", CONFIG);
        write_config(dir.path(), "worker-1", "{}");

        let mut transport = MockRemoteTransport::new();
        transport
            .expect_execute_command_with_output()
            .returning(move |host, cmd| {
                if cmd.starts_with("sudo test -e") {
                    // worker-0 was never provisioned
                    return Ok(if host == "worker-0" {
                        String::new()
                    } else {
                        "exists\n".to_string()
                    });
                }
                Ok(format!("{same}  /usr/share/oem/config.ign\n"))
            });

        let selector = ChangeSelector::new(Arc::new(transport), dir.path());
        let selected = selector.select(&topology(), &[]).await.unwrap();

        // worker-1's local config differs from what is installed
        assert_eq!(selected.hostnames(), vec!["worker-0", "worker-1"]);
        assert_eq!(selected.role_of("worker-1"), Some(Role::Worker));
    }

    #[tokio::test]
    async fn test_allow_list_bypasses_hashing() {
        let mut transport = MockRemoteTransport::new();
        transport.expect_execute_command_with_output().never();

        let selector = ChangeSelector::new(Arc::new(transport), "/nonexistent");
        let selected = selector
            .select(&topology(), &["worker-1".to_string(), "etcd-0".to_string()])
            .await
            .unwrap();

        assert_eq!(selected.hostnames(), vec!["etcd-0", "worker-1"]);
        assert_eq!(selected.role_of("etcd-0"), Some(Role::Etcd));
    }

    #[tokio::test]
    async fn test_missing_local_config_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let selector = ChangeSelector::new(Arc::new(MockRemoteTransport::new()), dir.path());
        let err = selector
            .needs_change(&Node::new("worker-0", Role::Worker))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
    }

    #[tokio::test]
    async fn test_unreachable_host_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path(), "worker-0", CONFIG);
        let mut transport = MockRemoteTransport::new();
        transport
            .expect_execute_command_with_output()
            .returning(|_, _| Err(crate::transport::TransportError::ConnectionDropped));

        let selector = ChangeSelector::new(Arc::new(transport), dir.path());
        let err = selector
            .needs_change(&Node::new("worker-0", Role::Worker))
            .await
            .unwrap_err();
        assert_eq!(err.node(), Some("worker-0"));
    }
}
