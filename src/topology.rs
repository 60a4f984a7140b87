//! Cluster topology: which hosts exist and what role each one plays.
//!
//! A topology is read once from `<clusters-dir>/<cluster>.yaml` and never
//! mutated. The file maps a role name to an ordered list of hosts:
//!
//! ```yaml
//! etcd:
//!   - hostname: etcd-0.example.com
//! apiserver:
//!   - hostname: apiserver-0.example.com
//! worker:
//!   - hostname: worker-0.example.com
//!     location: azure
//! ```

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Node role. Declaration order is the fixed provisioning order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Consensus store member
    Etcd,
    /// Kubernetes control plane
    Apiserver,
    /// General workload node
    Worker,
    /// Monitoring node
    Prometheus,
}

impl Role {
    /// All roles in provisioning order
    pub const ALL: [Role; 4] = [Role::Etcd, Role::Apiserver, Role::Worker, Role::Prometheus];

    /// Lowercase role name as used in topology files and labels
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Etcd => "etcd",
            Role::Apiserver => "apiserver",
            Role::Worker => "worker",
            Role::Prometheus => "prometheus",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "etcd" => Ok(Role::Etcd),
            "apiserver" => Ok(Role::Apiserver),
            "worker" => Ok(Role::Worker),
            "prometheus" => Ok(Role::Prometheus),
            other => Err(Error::topology(format!("unknown role '{other}'"))),
        }
    }
}

/// A host in the fleet
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Node {
    /// Hostname, also the node's name in the cluster
    pub hostname: String,
    /// Role this host plays
    pub role: Role,
    /// Optional placement tag (datacenter, cloud)
    pub location: Option<String>,
}

impl Node {
    /// Create a node without a location tag
    pub fn new(hostname: impl Into<String>, role: Role) -> Self {
        Self {
            hostname: hostname.into(),
            role,
            location: None,
        }
    }

    /// First DNS label of the hostname
    pub fn short_name(&self) -> &str {
        self.hostname
            .split('.')
            .next()
            .unwrap_or(self.hostname.as_str())
    }
}

#[derive(Debug, Deserialize)]
struct HostEntry {
    hostname: String,
    #[serde(default)]
    location: Option<String>,
}

/// Role to ordered hosts mapping
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClusterTopology {
    roles: BTreeMap<Role, Vec<Node>>,
}

impl ClusterTopology {
    /// Parse a topology from YAML
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let raw: BTreeMap<String, Vec<HostEntry>> = serde_yaml::from_str(yaml)
            .map_err(|e| Error::serialization(format!("invalid topology YAML: {e}")))?;

        let mut topology = Self::default();
        let mut seen = HashSet::new();
        for (role_name, hosts) in raw {
            let role: Role = role_name.parse()?;
            for entry in hosts {
                if !seen.insert(entry.hostname.clone()) {
                    return Err(Error::topology(format!(
                        "host '{}' listed more than once",
                        entry.hostname
                    )));
                }
                topology.push(Node {
                    hostname: entry.hostname,
                    role,
                    location: entry.location,
                });
            }
        }
        Ok(topology)
    }

    /// Load and validate `<clusters_dir>/<cluster>.yaml`
    pub fn load(clusters_dir: &Path, cluster: &str) -> Result<Self> {
        let path = clusters_dir.join(format!("{cluster}.yaml"));
        let content = std::fs::read_to_string(&path).map_err(|e| Error::io(&path, e))?;
        let topology = Self::from_yaml_str(&content)?;
        topology.validate()?;
        Ok(topology)
    }

    /// Append a node to its role, keeping insertion order
    pub fn push(&mut self, node: Node) {
        self.roles.entry(node.role).or_default().push(node);
    }

    /// Check the structural invariants of a complete topology
    pub fn validate(&self) -> Result<()> {
        let apiservers = self.nodes(Role::Apiserver).len();
        if apiservers != 1 {
            return Err(Error::topology(format!(
                "exactly one apiserver node required, found {apiservers}"
            )));
        }
        Ok(())
    }

    /// Hosts of a role in listed order
    pub fn nodes(&self, role: Role) -> &[Node] {
        self.roles.get(&role).map(Vec::as_slice).unwrap_or(&[])
    }

    /// All nodes, roles in provisioning order
    pub fn iter(&self) -> impl Iterator<Item = &Node> {
        Role::ALL.into_iter().flat_map(move |role| self.nodes(role).iter())
    }

    /// All hostnames, roles in provisioning order
    pub fn hostnames(&self) -> Vec<&str> {
        self.iter().map(|n| n.hostname.as_str()).collect()
    }

    /// The single apiserver node
    pub fn apiserver(&self) -> Option<&Node> {
        self.nodes(Role::Apiserver).first()
    }

    /// Role of a host, if it is part of this topology
    pub fn role_of(&self, hostname: &str) -> Option<Role> {
        self.iter().find(|n| n.hostname == hostname).map(|n| n.role)
    }

    /// Number of nodes
    pub fn len(&self) -> usize {
        self.roles.values().map(Vec::len).sum()
    }

    /// Whether no node is present
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keep only nodes matching the predicate, preserving order and roles
    pub fn retain(&self, mut keep: impl FnMut(&Node) -> bool) -> Self {
        let mut subset = Self::default();
        for node in self.iter() {
            if keep(node) {
                subset.push(node.clone());
            }
        }
        subset
    }

    /// Restrict to an explicit host allow-list
    ///
    /// Every allow-listed host must exist in the topology; each keeps its
    /// original role.
    pub fn filter_hosts(&self, hosts: &[String]) -> Result<Self> {
        let wanted: HashSet<&str> = hosts.iter().map(String::as_str).collect();
        if let Some(unknown) = wanted.iter().find(|h| self.role_of(h).is_none()) {
            return Err(Error::topology(format!(
                "host '{unknown}' is not part of the cluster"
            )));
        }
        Ok(self.retain(|n| wanted.contains(n.hostname.as_str())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
worker:
  - hostname: worker-0.example.com
    location: azure
  - hostname: worker-1.example.com
etcd:
  - hostname: etcd-0.example.com
  - hostname: etcd-1.example.com
apiserver:
  - hostname: apiserver-0.example.com
prometheus:
  - hostname: prometheus-0.example.com
"#;

    fn sample() -> ClusterTopology {
        ClusterTopology::from_yaml_str(SAMPLE).unwrap()
    }

    #[test]
    fn test_roles_iterate_in_provisioning_order() {
        let topology = sample();
        assert_eq!(
            topology.hostnames(),
            vec![
                "etcd-0.example.com",
                "etcd-1.example.com",
                "apiserver-0.example.com",
                "worker-0.example.com",
                "worker-1.example.com",
                "prometheus-0.example.com",
            ]
        );
        assert!(Role::Etcd < Role::Apiserver);
        assert!(Role::Worker < Role::Prometheus);
    }

    #[test]
    fn test_location_and_short_name() {
        let topology = sample();
        let worker = &topology.nodes(Role::Worker)[0];
        assert_eq!(worker.location.as_deref(), Some("azure"));
        assert_eq!(worker.short_name(), "worker-0");
        assert_eq!(topology.nodes(Role::Worker)[1].location, None);
    }

    #[test]
    fn test_unknown_role_rejected() {
        let err = ClusterTopology::from_yaml_str("database:\n  - hostname: db-0\n").unwrap_err();
        assert!(err.to_string().contains("unknown role 'database'"));
    }

    #[test]
    fn test_duplicate_host_rejected() {
        let yaml = "etcd:\n  - hostname: a\nworker:\n  - hostname: a\n";
        assert!(ClusterTopology::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn test_exactly_one_apiserver() {
        assert!(sample().validate().is_ok());

        let none = ClusterTopology::from_yaml_str("etcd:\n  - hostname: e\n").unwrap();
        assert!(none.validate().is_err());

        let two = ClusterTopology::from_yaml_str(
            "apiserver:\n  - hostname: a\n  - hostname: b\n",
        )
        .unwrap();
        assert!(two.validate().is_err());
    }

    #[test]
    fn test_filter_hosts_keeps_original_roles() {
        let topology = sample();
        let filtered = topology
            .filter_hosts(&[
                "prometheus-0.example.com".to_string(),
                "etcd-1.example.com".to_string(),
            ])
            .unwrap();

        assert_eq!(filtered.len(), 2);
        assert_eq!(filtered.nodes(Role::Etcd)[0].hostname, "etcd-1.example.com");
        assert_eq!(
            filtered.nodes(Role::Prometheus)[0].hostname,
            "prometheus-0.example.com"
        );
        assert!(filtered.nodes(Role::Worker).is_empty());
    }

    #[test]
    fn test_filter_hosts_rejects_unknown_host() {
        let err = sample()
            .filter_hosts(&["ghost.example.com".to_string()])
            .unwrap_err();
        assert!(err.to_string().contains("ghost.example.com"));
    }

    #[test]
    fn test_load_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("prod.yaml"), SAMPLE).unwrap();

        let topology = ClusterTopology::load(dir.path(), "prod").unwrap();
        assert_eq!(topology.len(), 6);
        assert_eq!(
            topology.apiserver().map(|n| n.hostname.as_str()),
            Some("apiserver-0.example.com")
        );
        assert!(ClusterTopology::load(dir.path(), "missing").is_err());
    }
}
