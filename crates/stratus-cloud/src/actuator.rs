//! Machine reconciliation contract
//!
//! [`Actuator`] is what the scaler and lifecycle drive; [`MachineActuator`]
//! implements it once for every provider on top of a [`CloudConnector`].
//!
//! A machine moves `Absent -> Provisioning -> Ready -> Deleting -> Absent`.
//! There is no failed state: a create that fails leaves the machine absent
//! (or provisioning with a recorded instance ID, so teardown can still find
//! it) and the error goes back to the caller.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use stratus_common::resources::{
    ApiAddress, Cluster, Machine, MachinePhase, MACHINE_FINALIZER,
};
use stratus_common::store::ResourceStore;
use stratus_common::wait::PollConfig;
use stratus_common::{Error, Result, BOOTSTRAP_TOKEN_TTL, CLUSTER_TAG, NODE_GROUP_TAG};
use tracing::{debug, info, instrument};

use crate::bootstrap::{BootstrapTokenService, ScriptRenderer};
use crate::connector::{
    wait_for_instance_gone, wait_for_instance_status, CloudConnector, Instance, InstanceRequest,
    InstanceStatus,
};

/// Tag recording a machine's role on its instance
pub const ROLE_TAG: &str = "stratus-role";

/// etcd peer port on control plane machines
const ETCD_PEER_PORT: u16 = 2380;

/// Create/Update/Delete/Exists over a single machine
#[async_trait]
pub trait Actuator: Send + Sync {
    /// Whether a live instance backs the machine; never mutates anything
    async fn exists(&self, cluster: &Cluster, machine: &Machine) -> Result<bool>;

    /// Provision the machine's instance
    ///
    /// Only called after `exists` returned false. On success the machine
    /// record is persisted with the finalizer, instance ID and addresses, and
    /// masters are registered in the cluster's API endpoints.
    async fn create(&self, cluster: &mut Cluster, machine: &mut Machine) -> Result<()>;

    /// Bring `current` in line with `desired`
    ///
    /// Status-only differences are a no-op. Masters are upgraded in place;
    /// workers are replaced.
    async fn update(
        &self,
        cluster: &mut Cluster,
        current: &Machine,
        desired: &mut Machine,
    ) -> Result<()>;

    /// Tear the machine's instance down; succeeds if it is already gone
    async fn delete(&self, cluster: &mut Cluster, machine: &Machine) -> Result<()>;
}

/// Provider-agnostic actuator over a connector
pub struct MachineActuator {
    connector: Arc<dyn CloudConnector>,
    tokens: Arc<dyn BootstrapTokenService>,
    store: Arc<dyn ResourceStore>,
    renderer: Arc<ScriptRenderer>,
    poll: PollConfig,
}

impl MachineActuator {
    /// Create an actuator
    pub fn new(
        connector: Arc<dyn CloudConnector>,
        tokens: Arc<dyn BootstrapTokenService>,
        store: Arc<dyn ResourceStore>,
        renderer: Arc<ScriptRenderer>,
        poll: PollConfig,
    ) -> Self {
        Self {
            connector,
            tokens,
            store,
            renderer,
            poll,
        }
    }

    async fn locate(&self, cluster: &Cluster, machine: &Machine) -> Result<Option<Instance>> {
        let found = match &machine.status.provider_id {
            Some(id) => self.connector.get_instance(id).await?,
            None => {
                self.connector
                    .find_instance(cluster.name(), machine.name())
                    .await?
            }
        };
        Ok(found.filter(|i| i.status != InstanceStatus::Deleting))
    }

    fn request(
        &self,
        cluster: &Cluster,
        machine: &Machine,
        spec: crate::connector::InstanceSpec,
        user_data: String,
        startup_script_id: Option<String>,
    ) -> InstanceRequest {
        let mut tags = BTreeMap::new();
        tags.insert(CLUSTER_TAG.to_string(), cluster.name().to_string());
        tags.insert(ROLE_TAG.to_string(), machine.spec.role.to_string());
        if let Some(group) = &machine.spec.node_group {
            tags.insert(NODE_GROUP_TAG.to_string(), group.clone());
        }

        InstanceRequest {
            cluster: cluster.name().to_string(),
            name: machine.name().to_string(),
            node_group: machine.spec.node_group.clone(),
            role: machine.spec.role,
            spec,
            kubernetes_version: machine
                .spec
                .versions
                .control_plane
                .clone()
                .unwrap_or_else(|| machine.spec.versions.kubelet.clone()),
            user_data,
            startup_script_id,
            ssh_key_id: cluster.status.cloud.ssh_key_id.clone(),
            network_id: cluster.status.cloud.network_id.clone(),
            tags,
        }
    }

    /// Write the machine record, creating it on first provision
    async fn persist(&self, cluster: &str, machine: &mut Machine) -> Result<()> {
        match self.store.get_machine(cluster, machine.name()).await {
            Ok(_) => {
                let mut updated = self.store.update_machine(cluster, machine).await?;
                updated.status = machine.status.clone();
                *machine = self.store.update_machine_status(cluster, &updated).await?;
            }
            Err(e) if e.is_not_found() => {
                *machine = self.store.create_machine(cluster, machine).await?;
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }

    /// Drop the finalizer and the record, if there is one
    async fn release(&self, cluster: &str, name: &str) -> Result<()> {
        match self.store.get_machine(cluster, name).await {
            Ok(mut record) => {
                record.metadata.remove_finalizer(MACHINE_FINALIZER);
                self.store.update_machine(cluster, &record).await?;
                self.store.delete_machine(cluster, name).await
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn register_master(&self, cluster: &mut Cluster, instance: &Instance) -> Result<()> {
        if let Some(lb) = &cluster.status.cloud.load_balancer {
            self.connector
                .attach_to_load_balancer(&lb.id, instance)
                .await?;
        }

        let Some(address) = instance.address() else {
            return Err(Error::provider_for(
                cluster.name(),
                self.connector.provider().as_str(),
                format!("master {} has no address", instance.name),
            ));
        };

        let api = ApiAddress {
            host: address.to_string(),
            port: cluster.spec.api_server_port,
        };
        if !cluster.status.api_addresses.contains(&api) {
            cluster.status.api_addresses.push(api);
        }
        let peer = etcd_peer(address);
        if !cluster.status.etcd_peers.contains(&peer) {
            cluster.status.etcd_peers.push(peer);
        }
        *cluster = self.store.update_cluster_status(cluster).await?;
        Ok(())
    }

    async fn deregister_master(&self, cluster: &mut Cluster, instance: &Instance) -> Result<()> {
        if let Some(lb) = &cluster.status.cloud.load_balancer {
            self.connector
                .detach_from_load_balancer(&lb.id, instance)
                .await?;
        }

        let Some(address) = instance.address() else {
            return Ok(());
        };
        let peer = etcd_peer(address);
        cluster.status.api_addresses.retain(|a| a.host != address);
        cluster.status.etcd_peers.retain(|p| p != &peer);
        *cluster = self.store.update_cluster_status(cluster).await?;
        Ok(())
    }
}

fn etcd_peer(address: &str) -> String {
    format!("https://{}:{}", address, ETCD_PEER_PORT)
}

fn record_instance(machine: &mut Machine, instance: &Instance) {
    machine.status.provider_id = Some(instance.provider_id.clone());
    machine.status.public_ip = instance.public_ip.clone();
    machine.status.private_ip = instance.private_ip.clone();
    machine.status.instance_status = Some(instance.status.to_string());
}

/// Specs equal apart from component versions
fn same_shape(a: &Machine, b: &Machine) -> bool {
    let mut a = a.spec.clone();
    a.versions = b.spec.versions.clone();
    a == b.spec
}

#[async_trait]
impl Actuator for MachineActuator {
    async fn exists(&self, cluster: &Cluster, machine: &Machine) -> Result<bool> {
        Ok(self.locate(cluster, machine).await?.is_some())
    }

    #[instrument(skip(self, cluster, machine), fields(cluster = %cluster.name(), machine = %machine.name()))]
    async fn create(&self, cluster: &mut Cluster, machine: &mut Machine) -> Result<()> {
        let spec = self.connector.instance_spec(machine)?;

        let token = if machine.is_master() {
            None
        } else {
            Some(
                self.tokens
                    .create_join_token(cluster, BOOTSTRAP_TOKEN_TTL)
                    .await?,
            )
        };

        let startup_script_id = match &machine.spec.node_group {
            Some(group) => self.connector.find_startup_script(group).await?,
            None => None,
        };

        let user_data = self.renderer.bootstrap(
            cluster,
            machine,
            token.as_ref(),
            startup_script_id.as_deref(),
        )?;

        let request = self.request(cluster, machine, spec, user_data, startup_script_id);
        let instance = self.connector.create_instance(&request).await?;
        info!(provider_id = %instance.provider_id, "Created instance");

        // Record the instance before waiting so teardown can find it
        machine.metadata.add_finalizer(MACHINE_FINALIZER);
        machine.status.phase = MachinePhase::Provisioning;
        record_instance(machine, &instance);
        self.persist(cluster.name(), machine).await?;

        let instance = wait_for_instance_status(
            self.connector.as_ref(),
            &instance.provider_id,
            InstanceStatus::Active,
            self.poll,
        )
        .await?;

        if machine.is_master() {
            self.register_master(cluster, &instance).await?;
        }

        machine.status.phase = MachinePhase::Ready;
        record_instance(machine, &instance);
        self.persist(cluster.name(), machine).await?;
        info!("Machine ready");
        Ok(())
    }

    #[instrument(skip(self, cluster, current, desired), fields(cluster = %cluster.name(), machine = %current.name()))]
    async fn update(
        &self,
        cluster: &mut Cluster,
        current: &Machine,
        desired: &mut Machine,
    ) -> Result<()> {
        if current.spec == desired.spec {
            debug!("Only status differs, nothing to update");
            desired.status = current.status.clone();
            return Ok(());
        }

        if !current.is_master() {
            info!("Replacing worker");
            self.delete(cluster, current).await?;
            desired.status = Default::default();
            return self.create(cluster, desired).await;
        }

        if !same_shape(current, desired) {
            return Err(Error::validation_for(
                cluster.name(),
                format!(
                    "master {} can only change versions in place",
                    current.name()
                ),
            ));
        }

        let instance = self
            .locate(cluster, current)
            .await?
            .ok_or_else(|| Error::not_found("instance", current.name()))?;

        let version = desired
            .spec
            .versions
            .control_plane
            .clone()
            .unwrap_or_else(|| desired.spec.versions.kubelet.clone());
        info!(version = %version, "Upgrading master in place");
        self.connector.upgrade_instance(&instance, &version).await?;

        let instance = wait_for_instance_status(
            self.connector.as_ref(),
            &instance.provider_id,
            InstanceStatus::Active,
            self.poll,
        )
        .await?;

        desired.status = current.status.clone();
        record_instance(desired, &instance);
        self.persist(cluster.name(), desired).await
    }

    #[instrument(skip(self, cluster, machine), fields(cluster = %cluster.name(), machine = %machine.name()))]
    async fn delete(&self, cluster: &mut Cluster, machine: &Machine) -> Result<()> {
        let Some(instance) = self.locate(cluster, machine).await? else {
            info!("Skipped deleting a VM that is already deleted");
            return self.release(cluster.name(), machine.name()).await;
        };

        if let Ok(mut record) = self.store.get_machine(cluster.name(), machine.name()).await {
            record.status.phase = MachinePhase::Deleting;
            self.store
                .update_machine_status(cluster.name(), &record)
                .await?;
        }

        if machine.is_master() || instance.role.is_master() {
            self.deregister_master(cluster, &instance).await?;
        }

        self.connector.delete_instance(&instance.provider_id).await?;
        wait_for_instance_gone(self.connector.as_ref(), &instance.provider_id, self.poll).await?;
        info!(provider_id = %instance.provider_id, "Deleted instance");

        self.release(cluster.name(), machine.name()).await
    }
}
