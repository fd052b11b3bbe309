//! Provisioning a Pending cluster
//!
//! 1. Prepare the cloud: network, SSH key, load balancer, reserved IP
//! 2. Bring up the control plane: the managed one, or the leader master
//! 3. Wait for the control plane to report ready
//! 4. Add the remaining masters
//! 5. Reconcile node groups
//! 6. Record the version and move to Ready

use stratus_cloud::wait_for_control_plane;
use stratus_common::resources::{Cluster, ClusterPhase, Machine, ReservedIp};
use stratus_common::store::ResourceStore;
use stratus_common::{Error, Result};
use tracing::{debug, info, instrument};

use super::{scale, Scope};
use crate::phase::transition;

#[instrument(skip(scope, cluster), fields(cluster = %cluster.name()))]
pub(super) async fn run(scope: &Scope, cluster: &mut Cluster) -> Result<()> {
    if cluster.status.phase != ClusterPhase::Pending {
        return Err(Error::internal_with_context(
            "lifecycle",
            format!(
                "cannot provision cluster {} in phase {}",
                cluster.name(),
                cluster.status.phase
            ),
        ));
    }

    prepare_cloud(scope, cluster).await?;

    let followers = if cluster.spec.provider.is_managed() {
        ensure_managed_control_plane(scope, cluster).await?;
        Vec::new()
    } else {
        let mut masters = masters(scope.store.as_ref(), cluster.name()).await?;
        if masters.is_empty() {
            return Err(Error::validation_for(
                cluster.name(),
                "cluster has no master machine",
            ));
        }
        set_master_sku(scope, cluster, &mut masters).await?;
        let followers = masters.split_off(1);
        ensure_machine(scope, cluster, &mut masters[0]).await?;
        followers
    };

    info!("Waiting for control plane");
    wait_for_control_plane(
        scope.handles.probe.as_ref(),
        cluster,
        1,
        None,
        scope.config.control_plane_poll,
    )
    .await?;

    for mut master in followers {
        ensure_machine(scope, cluster, &mut master).await?;
    }

    scale(scope, cluster).await?;

    cluster.status.kubernetes_version = Some(cluster.spec.kubernetes_version.clone());
    transition(scope.store.as_ref(), cluster, ClusterPhase::Ready, None).await?;
    info!("Cluster ready");
    Ok(())
}

/// Master machine records of a cluster, sorted by name
pub(super) async fn masters(store: &dyn ResourceStore, cluster: &str) -> Result<Vec<Machine>> {
    let mut masters: Vec<Machine> = store
        .list_machines(cluster)
        .await?
        .into_iter()
        .filter(Machine::is_master)
        .collect();
    masters.sort_by(|a, b| a.name().cmp(b.name()));
    Ok(masters)
}

/// Create the shared infrastructure, persisting each ID as soon as it exists
async fn prepare_cloud(scope: &Scope, cluster: &mut Cluster) -> Result<()> {
    let connector = scope.handles.connector.as_ref();
    let store = scope.store.as_ref();

    let network = connector.ensure_network(cluster).await?;
    cluster.status.cloud.network_id = network.network_id;
    cluster.status.cloud.security_group_id = network.security_group_id;
    *cluster = store.update_cluster_status(cluster).await?;
    debug!(network = ?cluster.status.cloud.network_id, "Network ready");

    if let Some(public_key) = cluster.spec.ssh_public_key.clone() {
        if cluster.status.cloud.ssh_key_id.is_none() {
            let key_id = connector.import_ssh_key(cluster, &public_key).await?;
            cluster.status.cloud.ssh_key_id = Some(key_id);
            *cluster = store.update_cluster_status(cluster).await?;
        }
    }

    if cluster.status.cloud.load_balancer.is_none() {
        let lb = connector.ensure_load_balancer(cluster).await?;
        info!(lb = %lb.id, address = %lb.address, "Load balancer ready");
        cluster.status.cloud.load_balancer = Some(lb);
        *cluster = store.update_cluster_status(cluster).await?;
    }

    if cluster.wants_auto_reserved_ip() {
        if !cluster.status.reserved_ips.iter().any(|ip| ip.auto) {
            let ip = connector.reserve_ip(cluster).await?;
            info!(ip = %ip, "Reserved master IP");
            cluster.status.reserved_ips.push(ReservedIp { ip, auto: true });
            *cluster = store.update_cluster_status(cluster).await?;
        }
    } else if let Some(ip) = cluster.spec.master_reserved_ip.clone() {
        if !cluster.status.reserved_ips.iter().any(|r| r.ip == ip) {
            cluster.status.reserved_ips.push(ReservedIp { ip, auto: false });
            *cluster = store.update_cluster_status(cluster).await?;
        }
    }
    Ok(())
}

async fn ensure_managed_control_plane(scope: &Scope, cluster: &mut Cluster) -> Result<()> {
    if cluster.status.cloud.managed_control_plane_id.is_some() {
        return Ok(());
    }
    let id = scope
        .handles
        .connector
        .ensure_managed_control_plane(cluster)
        .await?;
    info!(id = %id, "Managed control plane created");
    cluster.status.cloud.managed_control_plane_id = Some(id);
    *cluster = scope.store.update_cluster_status(cluster).await?;
    Ok(())
}

/// Size unprovisioned masters without an explicit SKU for the cluster's node count
async fn set_master_sku(scope: &Scope, cluster: &Cluster, masters: &mut [Machine]) -> Result<()> {
    let total: u32 = scope
        .store
        .list_node_groups(cluster.name())
        .await?
        .iter()
        .map(|g| g.spec.replicas)
        .sum();
    let sku = scope.handles.connector.master_sku(total);

    for master in masters.iter_mut() {
        if master.status.provider_id.is_some() || !master.spec.sku.is_empty() {
            continue;
        }
        debug!(machine = %master.name(), sku = %sku, total_nodes = total, "Setting master SKU");
        master.spec.sku = sku.clone();
        *master = scope.store.update_machine(cluster.name(), master).await?;
    }
    Ok(())
}

async fn ensure_machine(scope: &Scope, cluster: &mut Cluster, machine: &mut Machine) -> Result<()> {
    if scope.actuator.exists(cluster, machine).await? {
        debug!(machine = %machine.name(), "Machine already exists");
        return Ok(());
    }
    scope.actuator.create(cluster, machine).await
}
