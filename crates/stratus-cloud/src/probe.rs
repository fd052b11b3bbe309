//! Control plane readiness
//!
//! Apply waits for the control plane before reconciling node groups, and an
//! upgrade waits for the masters to report the new version. Both go through
//! [`wait_for_control_plane`], which tolerates the API server being
//! unreachable while it boots.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, ListParams};
#[cfg(test)]
use mockall::automock;
use stratus_common::resources::Cluster;
use stratus_common::store::ResourceStore;
use stratus_common::wait::{poll_until, PollConfig};
use stratus_common::Result;
use tracing::debug;

use crate::kube_access::admin_client;

/// Label carried by control plane nodes
pub const CONTROL_PLANE_LABEL: &str = "node-role.kubernetes.io/control-plane";

/// Snapshot of the control plane nodes
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ControlPlaneStatus {
    /// Control plane nodes with a Ready condition
    pub ready_nodes: u32,
    /// kubelet versions of the ready nodes, without the leading `v`
    pub versions: Vec<String>,
}

/// Observes a cluster's control plane
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ControlPlaneProbe: Send + Sync {
    /// Current control plane status
    async fn control_plane_status(&self, cluster: &Cluster) -> Result<ControlPlaneStatus>;
}

/// Wait until `min_ready` control plane nodes are Ready, all at `version` if given
pub async fn wait_for_control_plane(
    probe: &dyn ControlPlaneProbe,
    cluster: &Cluster,
    min_ready: u32,
    version: Option<&str>,
    poll: PollConfig,
) -> Result<()> {
    let what = match version {
        Some(v) => format!("control plane of {} to run {}", cluster.name(), v),
        None => format!("control plane of {} to become ready", cluster.name()),
    };

    poll_until(poll, &what, move || async move {
        let status = match probe.control_plane_status(cluster).await {
            Ok(status) => status,
            Err(e) if e.is_retryable() => {
                debug!(cluster = %cluster.name(), error = %e, "Control plane not reachable yet");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let versions_match = match version {
            Some(v) => status.versions.iter().all(|have| have == v),
            None => true,
        };
        Ok((status.ready_nodes >= min_ready && versions_match).then_some(()))
    })
    .await
}

/// Probe that reads Node objects through the cluster's API server
pub struct KubeControlPlaneProbe {
    store: Arc<dyn ResourceStore>,
}

impl KubeControlPlaneProbe {
    /// Reach clusters through admin kubeconfigs in `store`
    pub fn new(store: Arc<dyn ResourceStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ControlPlaneProbe for KubeControlPlaneProbe {
    async fn control_plane_status(&self, cluster: &Cluster) -> Result<ControlPlaneStatus> {
        let client = admin_client(self.store.as_ref(), cluster.name()).await?;
        let nodes: Api<Node> = Api::all(client);
        let list = nodes
            .list(&ListParams::default().labels(CONTROL_PLANE_LABEL))
            .await?;
        Ok(summarize(&list.items))
    }
}

fn summarize(nodes: &[Node]) -> ControlPlaneStatus {
    let ready: Vec<&Node> = nodes.iter().filter(|n| is_node_ready(n)).collect();
    ControlPlaneStatus {
        ready_nodes: ready.len() as u32,
        versions: ready
            .iter()
            .filter_map(|n| n.status.as_ref()?.node_info.as_ref())
            .map(|info| info.kubelet_version.trim_start_matches('v').to_string())
            .collect(),
    }
}

/// Check if a node has condition Ready=True
pub fn is_node_ready(node: &Node) -> bool {
    node.status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .map(|conds| {
            conds
                .iter()
                .any(|c| c.type_ == "Ready" && c.status == "True")
        })
        .unwrap_or(false)
}
