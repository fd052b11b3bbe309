//! Fixtures shared by this crate's tests

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use stratus_cloud::bootstrap::ScriptRenderer;
use stratus_cloud::simulated::{SimulatedCloud, SimulatedControlPlane, SimulatedFactory, SimulatedMachineSpec};
use stratus_cloud::{Actuator, CloudConnector, ProviderRegistry};
use stratus_common::resources::{
    Cluster, ClusterPhase, ClusterSpec, Credential, Machine, MachineRole, MachineSpec,
    MachineTemplate, MachineVersions, NodeGroup, ProviderBlob, ProviderType,
};
use stratus_common::retry::RetryConfig;
use stratus_common::store::{MemoryStore, ResourceStore, Store};
use stratus_common::wait::PollConfig;
use stratus_common::{Error, Result};

use crate::lifecycle::{ClusterLifecycle, LifecycleConfig};

pub const OWNER: &str = "acme";
pub const VERSION: &str = "1.30.4";

pub fn poll() -> PollConfig {
    PollConfig::new(Duration::from_secs(1), Duration::from_secs(60))
}

pub struct Harness {
    pub store: Arc<dyn ResourceStore>,
    pub cloud: SimulatedCloud,
    pub renderer: Arc<ScriptRenderer>,
}

impl Harness {
    pub async fn new() -> Self {
        let store = MemoryStore::in_memory().scoped(OWNER);
        store
            .put_credential(
                &Credential::new("do", ProviderType::DigitalOcean)
                    .with("DIGITALOCEAN_TOKEN", "dop_v1_test"),
            )
            .await
            .unwrap();
        Self {
            store,
            cloud: SimulatedCloud::default(),
            renderer: Arc::new(ScriptRenderer::new().unwrap()),
        }
    }

    pub fn registry(&self) -> Arc<ProviderRegistry> {
        let factory = Arc::new(SimulatedFactory::new(self.cloud.clone()));
        Arc::new(
            ProviderRegistry::new(Arc::new(SimulatedControlPlane::new(self.cloud.clone())))
                .with_retry(RetryConfig::none())
                .register(ProviderType::DigitalOcean, factory.clone())
                .register(ProviderType::Dokube, factory),
        )
    }

    pub fn lifecycle(&self, preserve_failed: bool) -> ClusterLifecycle {
        ClusterLifecycle::new(
            self.registry(),
            self.renderer.clone(),
            LifecycleConfig {
                preserve_failed,
                poll: poll(),
                control_plane_poll: poll(),
            },
        )
    }

    pub fn connector(&self) -> Arc<dyn CloudConnector> {
        Arc::new(self.cloud.clone())
    }

    pub fn actuator(&self) -> Arc<dyn Actuator> {
        Arc::new(stratus_cloud::MachineActuator::new(
            self.connector(),
            Arc::new(SimulatedControlPlane::new(self.cloud.clone())),
            self.store.clone(),
            self.renderer.clone(),
            poll(),
        ))
    }

    /// A pending cluster with one master record
    pub async fn cluster(&self, name: &str, provider: ProviderType) -> Cluster {
        let cluster = self
            .store
            .create_cluster(&Cluster::new(
                name,
                ClusterSpec {
                    provider,
                    credential_name: "do".into(),
                    region: "nyc1".into(),
                    kubernetes_version: VERSION.into(),
                    ssh_public_key: Some("ssh-ed25519 AAAA test".into()),
                    ..Default::default()
                },
            ))
            .await
            .unwrap();
        if !provider.is_managed() {
            self.master(&cluster, 0).await;
        }
        cluster
    }

    /// A pending cluster whose load balancer already exists
    pub async fn provisioned(&self, name: &str) -> Cluster {
        let mut cluster = self.cluster(name, ProviderType::DigitalOcean).await;
        cluster.status.cloud.load_balancer =
            Some(self.cloud.ensure_load_balancer(&cluster).await.unwrap());
        self.store.update_cluster_status(&cluster).await.unwrap()
    }

    pub async fn master(&self, cluster: &Cluster, index: u32) -> Machine {
        let machine = Machine::new(
            format!("{}-master-{index}", cluster.name()),
            MachineSpec {
                role: MachineRole::Master,
                node_group: None,
                sku: String::new(),
                versions: MachineVersions {
                    kubelet: VERSION.into(),
                    control_plane: Some(VERSION.into()),
                },
                labels: BTreeMap::new(),
                provider_spec: blob(cluster.spec.provider),
            },
        );
        self.store
            .create_machine(cluster.name(), &machine)
            .await
            .unwrap()
    }

    pub async fn node_group(&self, cluster: &Cluster, replicas: u32) -> NodeGroup {
        let group = NodeGroup::new(
            cluster.name(),
            replicas,
            template(cluster.spec.provider, "s-2vcpu-4gb"),
        );
        self.store
            .create_node_group(cluster.name(), &group)
            .await
            .unwrap()
    }

    pub async fn reload(&self, cluster: &str) -> Cluster {
        self.store.get_cluster(cluster).await.unwrap()
    }

    /// Worker instances of a cluster
    pub fn workers(&self, cluster: &str) -> usize {
        self.cloud
            .instances(cluster)
            .iter()
            .filter(|i| !i.role.is_master())
            .count()
    }
}

pub fn blob(provider: ProviderType) -> ProviderBlob {
    ProviderBlob::encode(
        provider,
        &SimulatedMachineSpec {
            image: "ubuntu-22-04-x64".into(),
            region: "nyc1".into(),
            plan: None,
        },
    )
    .unwrap()
}

pub fn template(provider: ProviderType, sku: &str) -> MachineTemplate {
    MachineTemplate {
        role: MachineRole::Node,
        sku: sku.into(),
        disk_size_gb: None,
        disk_type: None,
        spot: false,
        labels: BTreeMap::new(),
        provider_spec: blob(provider),
    }
}

/// What [`ReloadStore`] answers once its pass-through cluster reads are spent
#[derive(Clone, Copy, Debug)]
pub enum Reload {
    /// Fail with a retryable store error
    Fail,
    /// Return the stored record with its phase replaced
    Phase(ClusterPhase),
}

/// Store whose cluster reads go wrong after the first `passes`
///
/// Every other call goes straight to the wrapped store.
pub struct ReloadStore {
    inner: Arc<dyn ResourceStore>,
    passes: AtomicU32,
    reload: Reload,
}

impl ReloadStore {
    pub fn new(inner: Arc<dyn ResourceStore>, passes: u32, reload: Reload) -> Arc<Self> {
        Arc::new(Self {
            inner,
            passes: AtomicU32::new(passes),
            reload,
        })
    }
}

#[async_trait]
impl ResourceStore for ReloadStore {
    fn owner(&self) -> &str {
        self.inner.owner()
    }

    async fn list_clusters(&self) -> Result<Vec<Cluster>> {
        self.inner.list_clusters().await
    }

    async fn get_cluster(&self, name: &str) -> Result<Cluster> {
        let passed = self
            .passes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if passed {
            return self.inner.get_cluster(name).await;
        }
        match self.reload {
            Reload::Fail => Err(Error::store("clusters", format!("read of {name} timed out"))),
            Reload::Phase(phase) => {
                let mut cluster = self.inner.get_cluster(name).await?;
                cluster.status.phase = phase;
                Ok(cluster)
            }
        }
    }

    async fn create_cluster(&self, cluster: &Cluster) -> Result<Cluster> {
        self.inner.create_cluster(cluster).await
    }

    async fn update_cluster(&self, cluster: &Cluster) -> Result<Cluster> {
        self.inner.update_cluster(cluster).await
    }

    async fn update_cluster_status(&self, cluster: &Cluster) -> Result<Cluster> {
        self.inner.update_cluster_status(cluster).await
    }

    async fn delete_cluster(&self, name: &str) -> Result<()> {
        self.inner.delete_cluster(name).await
    }

    async fn list_node_groups(&self, cluster: &str) -> Result<Vec<NodeGroup>> {
        self.inner.list_node_groups(cluster).await
    }

    async fn get_node_group(&self, cluster: &str, name: &str) -> Result<NodeGroup> {
        self.inner.get_node_group(cluster, name).await
    }

    async fn create_node_group(&self, cluster: &str, group: &NodeGroup) -> Result<NodeGroup> {
        self.inner.create_node_group(cluster, group).await
    }

    async fn update_node_group(&self, cluster: &str, group: &NodeGroup) -> Result<NodeGroup> {
        self.inner.update_node_group(cluster, group).await
    }

    async fn update_node_group_status(
        &self,
        cluster: &str,
        group: &NodeGroup,
    ) -> Result<NodeGroup> {
        self.inner.update_node_group_status(cluster, group).await
    }

    async fn delete_node_group(&self, cluster: &str, name: &str) -> Result<()> {
        self.inner.delete_node_group(cluster, name).await
    }

    async fn list_machines(&self, cluster: &str) -> Result<Vec<Machine>> {
        self.inner.list_machines(cluster).await
    }

    async fn get_machine(&self, cluster: &str, name: &str) -> Result<Machine> {
        self.inner.get_machine(cluster, name).await
    }

    async fn create_machine(&self, cluster: &str, machine: &Machine) -> Result<Machine> {
        self.inner.create_machine(cluster, machine).await
    }

    async fn update_machine(&self, cluster: &str, machine: &Machine) -> Result<Machine> {
        self.inner.update_machine(cluster, machine).await
    }

    async fn update_machine_status(&self, cluster: &str, machine: &Machine) -> Result<Machine> {
        self.inner.update_machine_status(cluster, machine).await
    }

    async fn delete_machine(&self, cluster: &str, name: &str) -> Result<()> {
        self.inner.delete_machine(cluster, name).await
    }

    async fn get_credential(&self, name: &str) -> Result<Credential> {
        self.inner.get_credential(name).await
    }

    async fn put_credential(&self, credential: &Credential) -> Result<Credential> {
        self.inner.put_credential(credential).await
    }

    async fn get_kubeconfig(&self, cluster: &str) -> Result<String> {
        self.inner.get_kubeconfig(cluster).await
    }

    async fn put_kubeconfig(&self, cluster: &str, kubeconfig: &str) -> Result<()> {
        self.inner.put_kubeconfig(cluster, kubeconfig).await
    }
}
