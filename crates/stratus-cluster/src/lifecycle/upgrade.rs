//! Kubernetes version upgrades
//!
//! Masters are upgraded in place one at a time, then the control plane must
//! report the new version before any worker is touched. Workers are replaced
//! group by group. A failure leaves the cluster Upgrading with the reason
//! recorded; retrying resumes with whatever still runs the old version.

use stratus_cloud::wait_for_control_plane;
use stratus_common::resources::{Cluster, ClusterPhase, Machine};
use stratus_common::Result;
use tracing::{info, instrument};

use super::{create::masters, Scope};
use crate::phase::{record_reason, transition};

#[instrument(skip(scope, cluster), fields(cluster = %cluster.name(), version = %cluster.spec.kubernetes_version))]
pub(super) async fn run(scope: &Scope, cluster: &mut Cluster) -> Result<()> {
    transition(scope.store.as_ref(), cluster, ClusterPhase::Upgrading, None).await?;

    match upgrade(scope, cluster).await {
        Ok(()) => {
            cluster.status.kubernetes_version = Some(cluster.spec.kubernetes_version.clone());
            transition(scope.store.as_ref(), cluster, ClusterPhase::Ready, None).await?;
            info!("Upgrade complete");
            Ok(())
        }
        Err(e) => {
            record_reason(scope.store.as_ref(), cluster, e.to_string()).await?;
            Err(e)
        }
    }
}

async fn upgrade(scope: &Scope, cluster: &mut Cluster) -> Result<()> {
    let target = cluster.spec.kubernetes_version.clone();

    let masters = masters(scope.store.as_ref(), cluster.name()).await?;
    for current in masters.iter().filter(|m| !at_version(m, &target)) {
        info!(machine = %current.name(), "Upgrading master");
        let mut desired = current.clone();
        desired.spec.versions.kubelet = target.clone();
        desired.spec.versions.control_plane = Some(target.clone());
        scope.actuator.update(cluster, current, &mut desired).await?;
    }

    wait_for_control_plane(
        scope.handles.probe.as_ref(),
        cluster,
        masters.len().max(1) as u32,
        Some(&target),
        scope.config.control_plane_poll,
    )
    .await?;

    for mut group in scope.store.list_node_groups(cluster.name()).await? {
        let workers: Vec<Machine> = scope
            .store
            .list_machines(cluster.name())
            .await?
            .into_iter()
            .filter(|m| m.spec.node_group.as_deref() == Some(group.name()))
            .filter(|m| !at_version(m, &target))
            .collect();

        info!(node_group = %group.name(), outdated = workers.len(), "Upgrading node group");
        for current in &workers {
            let mut desired = current.clone();
            desired.spec.versions.kubelet = target.clone();
            scope.actuator.update(cluster, current, &mut desired).await?;
        }
        scope.scaler.reconcile(cluster, &mut group).await?;
    }
    Ok(())
}

fn at_version(machine: &Machine, version: &str) -> bool {
    machine.spec.versions.kubelet == version
        && machine
            .spec
            .versions
            .control_plane
            .as_deref()
            .map_or(true, |v| v == version)
}
