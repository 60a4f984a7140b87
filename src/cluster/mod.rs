//! Node lifecycle operations against the cluster control plane
//!
//! [`NodeApi`] is the raw API seam. [`NodeLifecycle`] wraps it with the
//! retry executor and a deadline per operation, sized to how much damage a
//! stuck call can do: reads of the whole node list get the longest budget,
//! mutations of a single node the shortest.

mod client;
mod taint;

pub use client::{connect, KubeNodeApi};
pub use taint::{
    add_taint_if_absent, has_taint, shutdown_taints, NETWORK_UNAVAILABLE_TAINT_KEY,
    SHUTDOWN_TAINT_KEY,
};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::{Node as KubeNode, Pod};
#[cfg(test)]
use mockall::automock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::DaemonSetMatch;
use crate::retry::{retry_until, RetryPolicy};
use crate::{Error, Result};

/// Label carrying a node's role for downstream tooling
pub const ROLE_LABEL: &str = "kubernetes.io/role";

const GET_NODE_DEADLINE: Duration = Duration::from_secs(5 * 60);
const JOIN_DEADLINE: Duration = Duration::from_secs(10 * 60);
const LABEL_DEADLINE: Duration = Duration::from_secs(2 * 60);
const CORDON_DEADLINE: Duration = Duration::from_secs(2 * 60);
const DELETE_DEADLINE: Duration = Duration::from_secs(2 * 60);

/// Raw cluster API calls used by the rollout
///
/// Implementations make exactly one request per call; retrying is the
/// caller's business.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait NodeApi: Send + Sync {
    /// List every node in the cluster
    async fn list_nodes(&self) -> Result<Vec<KubeNode>>;

    /// Replace a node object
    ///
    /// The object's `resourceVersion` makes this an optimistic update: it
    /// fails if the node changed since it was read.
    async fn replace_node(&self, node: &KubeNode) -> Result<KubeNode>;

    /// Merge the given labels into a node's labels
    async fn patch_node_labels(&self, name: &str, labels: BTreeMap<String, String>) -> Result<()>;

    /// List pods scheduled on a node, across namespaces
    async fn list_pods_on_node(&self, name: &str) -> Result<Vec<Pod>>;

    /// List every daemonset in the cluster
    async fn list_daemonsets(&self) -> Result<Vec<DaemonSet>>;

    /// Delete a node object. Deleting an absent node succeeds.
    async fn delete_node(&self, name: &str) -> Result<()>;
}

/// Retry-wrapped node operations for one provisioning run
#[derive(Clone)]
pub struct NodeLifecycle {
    api: Arc<dyn NodeApi>,
    cancel: CancellationToken,
    daemonset_match: DaemonSetMatch,
}

impl NodeLifecycle {
    /// Wrap `api`, aborting retries when `cancel` fires
    pub fn new(
        api: Arc<dyn NodeApi>,
        cancel: CancellationToken,
        daemonset_match: DaemonSetMatch,
    ) -> Self {
        Self {
            api,
            cancel,
            daemonset_match,
        }
    }

    /// Token that aborts this lifecycle's retries
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Find a node by name
    ///
    /// Lists all nodes; there is no get-by-name call.
    pub async fn get_node(&self, name: &str) -> Result<Option<KubeNode>> {
        let nodes = retry_until(
            &self.cancel,
            name,
            "get_node",
            &RetryPolicy::with_deadline(GET_NODE_DEADLINE),
            || async move { self.api.list_nodes().await },
        )
        .await?;
        Ok(find_node(nodes, name))
    }

    /// Whether the node is currently registered
    pub async fn node_exists(&self, name: &str) -> Result<bool> {
        Ok(self.get_node(name).await?.is_some())
    }

    /// Wait for a rebooted node to register again
    pub async fn wait_for_node_join(&self, name: &str) -> Result<KubeNode> {
        info!(node = %name, "waiting for node to join cluster");
        retry_until(
            &self.cancel,
            name,
            "wait_for_node_join",
            &RetryPolicy::with_deadline(JOIN_DEADLINE),
            || async move {
                let nodes = self.api.list_nodes().await?;
                find_node(nodes, name).ok_or_else(|| Error::NodeNotFound(name.to_string()))
            },
        )
        .await
    }

    /// Set a single label on the node
    pub async fn label_node(&self, name: &str, key: &str, value: &str) -> Result<()> {
        info!(node = %name, label = %key, value = %value, "labelling node");
        let labels = BTreeMap::from([(key.to_string(), value.to_string())]);
        retry_until(
            &self.cancel,
            name,
            "label_node",
            &RetryPolicy::with_deadline(LABEL_DEADLINE),
            || {
                let labels = labels.clone();
                async move { self.api.patch_node_labels(name, labels).await }
            },
        )
        .await
    }

    /// Mark the node unschedulable and apply the shutdown taints
    ///
    /// The node is re-read on every attempt so a conflicting concurrent
    /// update is retried against fresh state.
    pub async fn cordon_and_taint(&self, name: &str) -> Result<()> {
        info!(node = %name, "cordoning node");
        retry_until(
            &self.cancel,
            name,
            "cordon_and_taint",
            &RetryPolicy::with_deadline(CORDON_DEADLINE),
            || async move {
                let nodes = self.api.list_nodes().await?;
                let mut node =
                    find_node(nodes, name).ok_or_else(|| Error::NodeNotFound(name.to_string()))?;
                cordon(&mut node);
                self.api.replace_node(&node).await.map(|_| ())
            },
        )
        .await
    }

    /// Names of pods that still have to leave the node
    ///
    /// One unretried evaluation; the drain runs its own polling loop around
    /// it. Daemonsets are listed at most once per call.
    pub async fn remaining_pods(&self, name: &str) -> Result<Vec<String>> {
        let pods = self.api.list_pods_on_node(name).await?;
        let daemonsets = match self.daemonset_match {
            DaemonSetMatch::OwnerReference => Vec::new(),
            DaemonSetMatch::NameSubstring => names_of(&self.api.list_daemonsets().await?),
        };
        Ok(remaining_pod_names(&pods, self.daemonset_match, &daemonsets))
    }

    /// Remove the node object so the host can register again cleanly
    pub async fn delete_node(&self, name: &str) -> Result<()> {
        info!(node = %name, "deleting node object");
        retry_until(
            &self.cancel,
            name,
            "delete_node",
            &RetryPolicy::with_deadline(DELETE_DEADLINE),
            || async move { self.api.delete_node(name).await },
        )
        .await
    }
}

/// Pick a node out of a list by name
pub fn find_node(nodes: Vec<KubeNode>, name: &str) -> Option<KubeNode> {
    nodes
        .into_iter()
        .find(|n| n.metadata.name.as_deref() == Some(name))
}

/// Set `unschedulable` and add any missing shutdown taint
pub fn cordon(node: &mut KubeNode) {
    let spec = node.spec.get_or_insert_with(Default::default);
    spec.unschedulable = Some(true);
    let taints = spec.taints.get_or_insert_with(Vec::new);
    for taint in shutdown_taints() {
        if !add_taint_if_absent(taints, taint) {
            debug!("shutdown taint already present");
        }
    }
}

/// Whether the pod finished and no longer occupies the node
pub fn is_terminal(pod: &Pod) -> bool {
    matches!(
        pod.status.as_ref().and_then(|s| s.phase.as_deref()),
        Some("Succeeded") | Some("Failed")
    )
}

/// Whether the pod's controller is a daemonset
pub fn owned_by_daemonset(pod: &Pod) -> bool {
    pod.metadata
        .owner_references
        .as_ref()
        .map(|refs| {
            refs.iter()
                .any(|r| r.controller == Some(true) && r.kind == "DaemonSet")
        })
        .unwrap_or(false)
}

/// Whether the pod name embeds one of the daemonset names
pub fn name_matches_daemonset(pod_name: &str, daemonsets: &[String]) -> bool {
    daemonsets.iter().any(|ds| pod_name.contains(ds.as_str()))
}

fn names_of(daemonsets: &[DaemonSet]) -> Vec<String> {
    daemonsets
        .iter()
        .filter_map(|ds| ds.metadata.name.clone())
        .collect()
}

/// Pods that are neither daemonset managed nor terminal
pub fn remaining_pod_names(
    pods: &[Pod],
    strategy: DaemonSetMatch,
    daemonsets: &[String],
) -> Vec<String> {
    pods.iter()
        .filter(|pod| !is_terminal(pod))
        .filter_map(|pod| {
            let name = pod.metadata.name.as_deref()?;
            let managed = match strategy {
                DaemonSetMatch::OwnerReference => owned_by_daemonset(pod),
                DaemonSetMatch::NameSubstring => name_matches_daemonset(name, daemonsets),
            };
            (!managed).then(|| name.to_string())
        })
        .collect()
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn lifecycle(api: MockNodeApi, strategy: DaemonSetMatch) -> NodeLifecycle {
        NodeLifecycle::new(Arc::new(api), CancellationToken::new(), strategy)
    }

    #[tokio::test(start_paused = true)]
    async fn test_get_node_matches_by_name() {
        let mut api = MockNodeApi::new();
        api.expect_list_nodes()
            .returning(|| Ok(vec![node("worker-0"), node("worker-1")]));
        let lifecycle = lifecycle(api, DaemonSetMatch::OwnerReference);

        let found = lifecycle.get_node("worker-1").await.unwrap();
        assert_eq!(
            found.and_then(|n| n.metadata.name),
            Some("worker-1".to_string())
        );
        assert!(!lifecycle.node_exists("worker-9").await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_node_join_polls_until_registered() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let mut api = MockNodeApi::new();
        api.expect_list_nodes().returning(move || {
            if c.fetch_add(1, Ordering::SeqCst) < 2 {
                Ok(vec![])
            } else {
                Ok(vec![node("worker-1")])
            }
        });
        let lifecycle = lifecycle(api, DaemonSetMatch::OwnerReference);

        let joined = lifecycle.wait_for_node_join("worker-1").await.unwrap();
        assert_eq!(joined.metadata.name.as_deref(), Some("worker-1"));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_node_join_fails_when_node_never_appears() {
        let mut api = MockNodeApi::new();
        api.expect_list_nodes().returning(|| Ok(vec![]));
        let lifecycle = lifecycle(api, DaemonSetMatch::OwnerReference);

        let err = lifecycle.wait_for_node_join("worker-1").await.unwrap_err();
        match err {
            Error::RetryExhausted { deadline, .. } => assert_eq!(deadline, JOIN_DEADLINE),
            other => panic!("expected RetryExhausted, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cordon_rereads_node_after_conflict() {
        let lists = Arc::new(AtomicU32::new(0));
        let l = lists.clone();
        let replaces = Arc::new(AtomicU32::new(0));
        let r = replaces.clone();

        let mut api = MockNodeApi::new();
        api.expect_list_nodes().returning(move || {
            l.fetch_add(1, Ordering::SeqCst);
            Ok(vec![node("worker-1")])
        });
        api.expect_replace_node()
            .withf(|n| {
                let spec = n.spec.as_ref().unwrap();
                spec.unschedulable == Some(true) && spec.taints.as_ref().unwrap().len() == 2
            })
            .returning(move |n| {
                if r.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(Error::validation("the object has been modified"))
                } else {
                    Ok(n.clone())
                }
            });
        let lifecycle = lifecycle(api, DaemonSetMatch::OwnerReference);

        lifecycle.cordon_and_taint("worker-1").await.unwrap();
        assert_eq!(lists.load(Ordering::SeqCst), 2);
        assert_eq!(replaces.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_cordon_keeps_existing_taints() {
        let mut n = node("worker-1");
        cordon(&mut n);
        cordon(&mut n);
        let spec = n.spec.unwrap();
        assert_eq!(spec.unschedulable, Some(true));
        assert_eq!(spec.taints.unwrap(), shutdown_taints());
    }

    #[tokio::test(start_paused = true)]
    async fn test_label_node_merges_role_label() {
        let mut api = MockNodeApi::new();
        api.expect_patch_node_labels()
            .withf(|name, labels| {
                name == "worker-1"
                    && labels.get(ROLE_LABEL).map(String::as_str) == Some("worker")
                    && labels.len() == 1
            })
            .times(1)
            .returning(|_, _| Ok(()));
        let lifecycle = lifecycle(api, DaemonSetMatch::OwnerReference);

        lifecycle
            .label_node("worker-1", ROLE_LABEL, "worker")
            .await
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_remaining_pods_by_owner_reference() {
        let mut api = MockNodeApi::new();
        api.expect_list_pods_on_node().returning(|_| {
            Ok(vec![
                pod("app-1", "Running"),
                pod("job-1", "Succeeded"),
                pod("crashed-1", "Failed"),
                daemonset_pod("node-exporter-x7k2p"),
            ])
        });
        api.expect_list_daemonsets().never();
        let lifecycle = lifecycle(api, DaemonSetMatch::OwnerReference);

        let remaining = lifecycle.remaining_pods("worker-1").await.unwrap();
        assert_eq!(remaining, vec!["app-1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remaining_pods_by_name_lists_daemonsets_once() {
        let mut api = MockNodeApi::new();
        api.expect_list_pods_on_node().returning(|_| {
            Ok(vec![
                pod("app-1", "Running"),
                pod("fluentd-abcde", "Running"),
                pod("kube-proxy-12345", "Running"),
            ])
        });
        api.expect_list_daemonsets()
            .times(1)
            .returning(|| Ok(vec![daemonset("fluentd"), daemonset("kube-proxy")]));
        let lifecycle = lifecycle(api, DaemonSetMatch::NameSubstring);

        let remaining = lifecycle.remaining_pods("worker-1").await.unwrap();
        assert_eq!(remaining, vec!["app-1".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_remaining_pods_does_not_retry() {
        let mut api = MockNodeApi::new();
        api.expect_list_pods_on_node()
            .times(1)
            .returning(|_| Err(Error::validation("connection refused")));
        let lifecycle = lifecycle(api, DaemonSetMatch::OwnerReference);

        assert!(lifecycle.remaining_pods("worker-1").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_delete_node_retries_transient_failures() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let mut api = MockNodeApi::new();
        api.expect_delete_node().returning(move |_| {
            if c.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(Error::validation("etcdserver: request timed out"))
            } else {
                Ok(())
            }
        });
        let lifecycle = lifecycle(api, DaemonSetMatch::OwnerReference);

        lifecycle.delete_node("worker-1").await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_substring_heuristic_false_positive() {
        // an unrelated pod that happens to embed a daemonset name
        assert!(name_matches_daemonset(
            "my-fluentd-consumer-7d9f",
            &["fluentd".to_string()]
        ));
        assert!(!owned_by_daemonset(&pod("my-fluentd-consumer-7d9f", "Running")));
    }
}
