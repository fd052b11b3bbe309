//! Cluster teardown
//!
//! Every step runs no matter how the ones before it went. Failures are
//! collected and returned together as [`Error::Teardown`]; resources that
//! were removed have their IDs cleared from the cluster status so a second
//! teardown only retries what is left.

use stratus_cloud::{InstanceFilter, InstanceStatus};
use stratus_common::resources::{Cluster, Machine};
use stratus_common::{Error, Result};
use tracing::{info, instrument, warn};

use super::Scope;
use crate::scaler::untracked;

/// What a teardown keeps
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TeardownOptions {
    /// Release addresses stratus reserved itself; user-supplied ones are never released
    pub release_reserved_ips: bool,
    /// Keep master and node group records so the cluster can be provisioned again
    pub keep_records: bool,
}

impl TeardownOptions {
    /// Cleanup after failed provisioning: the records and reserved addresses
    /// stay for the next attempt
    pub fn cleanup() -> Self {
        Self {
            release_reserved_ips: false,
            keep_records: true,
        }
    }

    /// Explicit deletion: everything goes
    pub fn delete() -> Self {
        Self {
            release_reserved_ips: true,
            keep_records: false,
        }
    }
}

#[derive(Default)]
struct Failures(Vec<String>);

impl Failures {
    fn check<T>(&mut self, step: &str, result: Result<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(step, error = %e, "Teardown step failed");
                self.0.push(format!("{step}: {e}"));
                None
            }
        }
    }
}

#[instrument(skip(scope, cluster), fields(cluster = %cluster.name()))]
pub(super) async fn teardown(
    scope: &Scope,
    cluster: &mut Cluster,
    options: TeardownOptions,
) -> Result<()> {
    let connector = scope.handles.connector.as_ref();
    let store = scope.store.as_ref();
    let name = cluster.name().to_string();
    let mut failures = Failures::default();
    info!(?options, "Tearing down cluster");

    // Workers, group by group
    if let Some(groups) = failures.check("list node groups", store.list_node_groups(&name).await) {
        for mut group in groups {
            let step = format!("node group {}", group.name());
            if failures
                .check(&step, scope.scaler.drain(cluster, &mut group).await)
                .is_some()
                && !options.keep_records
            {
                failures.check(&step, store.delete_node_group(&name, group.name()).await);
            }
        }
    }

    // Masters and any machine record left over
    if let Some(machines) = failures.check("list machines", store.list_machines(&name).await) {
        for machine in machines {
            let step = format!("machine {}", machine.name());
            if failures
                .check(&step, scope.actuator.delete(cluster, &machine).await)
                .is_some()
                && options.keep_records
                && machine.is_master()
            {
                let fresh = Machine::new(machine.name(), machine.spec.clone());
                failures.check(&step, store.create_machine(&name, &fresh).await);
            }
        }
    }

    // Instances no record points at
    if let Some(instances) = failures.check(
        "list instances",
        connector.list_instances(&InstanceFilter::cluster(&name)).await,
    ) {
        for instance in instances
            .iter()
            .filter(|i| i.status != InstanceStatus::Deleting)
        {
            let step = format!("instance {}", instance.provider_id);
            failures.check(&step, scope.actuator.delete(cluster, &untracked(instance)).await);
        }
    }

    if let Some(id) = cluster.status.cloud.managed_control_plane_id.clone() {
        if failures
            .check("managed control plane", connector.delete_managed_control_plane(&id).await)
            .is_some()
        {
            cluster.status.cloud.managed_control_plane_id = None;
        }
    }

    if let Some(lb) = cluster.status.cloud.load_balancer.clone() {
        if failures
            .check("load balancer", connector.delete_load_balancer(&lb.id).await)
            .is_some()
        {
            cluster.status.cloud.load_balancer = None;
        }
    }

    if let Some(key_id) = cluster.status.cloud.ssh_key_id.clone() {
        if failures
            .check("ssh key", connector.delete_ssh_key(&key_id).await)
            .is_some()
        {
            cluster.status.cloud.ssh_key_id = None;
        }
    }

    failures.check("dns records", connector.delete_dns_records(cluster).await);

    if options.release_reserved_ips {
        let mut kept = Vec::new();
        for reserved in std::mem::take(&mut cluster.status.reserved_ips) {
            if !reserved.auto {
                kept.push(reserved);
                continue;
            }
            let step = format!("reserved ip {}", reserved.ip);
            if failures
                .check(&step, connector.release_ip(&reserved.ip).await)
                .is_none()
            {
                kept.push(reserved);
            }
        }
        cluster.status.reserved_ips = kept;
    }

    if cluster.status.cloud.network_id.is_some() || cluster.status.cloud.security_group_id.is_some() {
        if failures
            .check("network", connector.delete_network(cluster).await)
            .is_some()
        {
            cluster.status.cloud.network_id = None;
            cluster.status.cloud.security_group_id = None;
        }
    }

    if let Some(stored) = failures.check("cluster status", store.update_cluster_status(cluster).await) {
        *cluster = stored;
    }

    if failures.0.is_empty() {
        info!("Teardown complete");
        Ok(())
    } else {
        Err(Error::Teardown {
            cluster: name,
            failures: failures.0,
        })
    }
}
