//! [`NodeApi`] backed by a kube client

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::DaemonSet;
use k8s_openapi::api::core::v1::{Node as KubeNode, Pod};
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::config::KubeConfigOptions;
use kube::{Client, Config};
use tracing::debug;

use super::NodeApi;
use crate::{Error, Result};

/// Server-side timeout for list calls
const LIST_TIMEOUT_SECS: u32 = 2;

/// Build a client for the given kubeconfig context
///
/// The kubeconfig is located the usual way (`KUBECONFIG`, then
/// `~/.kube/config`).
pub async fn connect(context: &str) -> Result<Client> {
    let options = KubeConfigOptions {
        context: Some(context.to_string()),
        ..Default::default()
    };
    let config = Config::from_kubeconfig(&options)
        .await
        .map_err(|e| Error::validation(format!("failed to load kubeconfig context {context}: {e}")))?;
    Ok(Client::try_from(config)?)
}

/// Production node API
pub struct KubeNodeApi {
    client: Client,
}

impl KubeNodeApi {
    /// Create a new KubeNodeApi wrapping the given kube Client
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn nodes(&self) -> Api<KubeNode> {
        Api::all(self.client.clone())
    }

    fn list_params() -> ListParams {
        ListParams::default().timeout(LIST_TIMEOUT_SECS)
    }
}

#[async_trait]
impl NodeApi for KubeNodeApi {
    async fn list_nodes(&self) -> Result<Vec<KubeNode>> {
        Ok(self.nodes().list(&Self::list_params()).await?.items)
    }

    async fn replace_node(&self, node: &KubeNode) -> Result<KubeNode> {
        let name = node
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::validation("node has no name"))?;
        Ok(self
            .nodes()
            .replace(name, &PostParams::default(), node)
            .await?)
    }

    async fn patch_node_labels(&self, name: &str, labels: BTreeMap<String, String>) -> Result<()> {
        let patch = serde_json::json!({
            "metadata": {
                "labels": labels
            }
        });
        self.nodes()
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn list_pods_on_node(&self, name: &str) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::all(self.client.clone());
        let params = Self::list_params().fields(&format!("spec.nodeName={name}"));
        Ok(api.list(&params).await?.items)
    }

    async fn list_daemonsets(&self) -> Result<Vec<DaemonSet>> {
        let api: Api<DaemonSet> = Api::all(self.client.clone());
        Ok(api.list(&Self::list_params()).await?.items)
    }

    async fn delete_node(&self, name: &str) -> Result<()> {
        match self.nodes().delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(node = %name, "node already deleted");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
