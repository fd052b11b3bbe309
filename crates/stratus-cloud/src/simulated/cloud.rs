//! In-process cloud
//!
//! Keeps instances, load balancers, keys, addresses and startup scripts in
//! memory. Every call is counted, and faults can be injected per operation
//! so failure paths can be exercised without a vendor account.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use stratus_common::resources::{Cluster, LoadBalancerStatus, Machine, ProviderType};
use stratus_common::{Error, Result};
use tracing::debug;

use crate::connector::{
    CloudConnector, Instance, InstanceFilter, InstanceRequest, InstanceSpec, InstanceStatus,
    NetworkInfo,
};

/// Provider spec accepted by the simulated cloud
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SimulatedMachineSpec {
    /// Image slug
    #[serde(default)]
    pub image: String,
    /// Region
    #[serde(default)]
    pub region: String,
    /// Plan; defaults to the machine's SKU
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<String>,
}

/// A failure to inject into one operation
#[derive(Clone, Debug)]
pub struct Fault {
    op: &'static str,
    after: u32,
    times: Option<u32>,
    retryable: bool,
    panics: bool,
}

impl Fault {
    /// Fail the next call to `op` with a retryable error
    pub fn transient(op: &'static str) -> Self {
        Self {
            op,
            after: 0,
            times: Some(1),
            retryable: true,
            panics: false,
        }
    }

    /// Fail every call to `op` with a permanent error
    pub fn permanent(op: &'static str) -> Self {
        Self {
            op,
            after: 0,
            times: None,
            retryable: false,
            panics: false,
        }
    }

    /// Panic in the next call to `op`, as a connector bug would
    pub fn panic(op: &'static str) -> Self {
        Self {
            op,
            after: 0,
            times: Some(1),
            retryable: false,
            panics: true,
        }
    }

    /// Let `calls` calls succeed first
    pub fn after(mut self, calls: u32) -> Self {
        self.after = calls;
        self
    }

    /// Fail this many calls, then stop
    pub fn times(mut self, times: u32) -> Self {
        self.times = Some(times);
        self
    }
}

#[derive(Default)]
struct State {
    next_id: u64,
    instances: BTreeMap<String, (String, Instance)>,
    networks: BTreeMap<String, NetworkInfo>,
    ssh_keys: BTreeSet<String>,
    load_balancers: BTreeMap<String, (LoadBalancerStatus, BTreeSet<String>)>,
    reserved_ips: BTreeSet<String>,
    startup_scripts: BTreeMap<String, String>,
    managed_control_planes: BTreeMap<String, String>,
    calls: HashMap<&'static str, u32>,
    faults: Vec<Fault>,
}

impl State {
    fn next(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

/// Simulated connector; clones share state
#[derive(Clone)]
pub struct SimulatedCloud {
    provider: ProviderType,
    state: Arc<Mutex<State>>,
}

impl Default for SimulatedCloud {
    fn default() -> Self {
        Self::new(ProviderType::DigitalOcean)
    }
}

impl SimulatedCloud {
    /// An empty cloud reporting itself as `provider`
    pub fn new(provider: ProviderType) -> Self {
        Self {
            provider,
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    /// A view of the same cloud reporting a different provider
    pub fn as_provider(&self, provider: ProviderType) -> Self {
        Self {
            provider,
            state: self.state.clone(),
        }
    }

    /// Register a fault
    pub fn inject(&self, fault: Fault) {
        self.state.lock().faults.push(fault);
    }

    /// Remove every fault
    pub fn clear_faults(&self) {
        self.state.lock().faults.clear();
    }

    /// Calls made to `op`, including failed ones
    pub fn calls(&self, op: &str) -> u32 {
        self.state.lock().calls.get(op).copied().unwrap_or(0)
    }

    /// Instances of a cluster, oldest first
    pub fn instances(&self, cluster: &str) -> Vec<Instance> {
        let mut found: Vec<Instance> = self
            .state
            .lock()
            .instances
            .values()
            .filter(|(c, _)| c == cluster)
            .map(|(_, i)| i.clone())
            .collect();
        found.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));
        found
    }

    /// Backends registered with a load balancer
    pub fn load_balancer_backends(&self, lb_id: &str) -> Vec<String> {
        self.state
            .lock()
            .load_balancers
            .get(lb_id)
            .map(|(_, backends)| backends.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Whether any resource of the cluster remains
    pub fn has_resources(&self, cluster: &str) -> bool {
        let state = self.state.lock();
        state.instances.values().any(|(c, _)| c == cluster)
            || state.networks.contains_key(cluster)
            || state.ssh_keys.contains(&ssh_key_id(cluster))
            || state.load_balancers.contains_key(&lb_id(cluster))
            || state.managed_control_planes.contains_key(cluster)
    }

    /// Reserved addresses currently held
    pub fn reserved_ips(&self) -> Vec<String> {
        self.state.lock().reserved_ips.iter().cloned().collect()
    }

    /// Startup script ID of a node group
    pub fn startup_script(&self, group: &str) -> Option<String> {
        self.state.lock().startup_scripts.get(group).cloned()
    }

    /// Managed control plane of a cluster
    pub fn managed_control_plane(&self, cluster: &str) -> Option<String> {
        self.state.lock().managed_control_planes.get(cluster).cloned()
    }

    /// Insert an instance directly, as if created out of band
    pub fn seed_instance(&self, cluster: &str, instance: Instance) {
        self.state
            .lock()
            .instances
            .insert(instance.provider_id.clone(), (cluster.to_string(), instance));
    }

    /// Count a call to `op` and fail it if a fault says so
    ///
    /// # Panics
    ///
    /// When a [`Fault::panic`] fires for `op`.
    pub(crate) fn check(&self, op: &'static str) -> Result<()> {
        let fired = {
            let mut state = self.state.lock();
            *state.calls.entry(op).or_default() += 1;
            fire(&mut state.faults, op)
        };

        let Some(fault) = fired else {
            return Ok(());
        };
        if fault.panics {
            panic!("injected panic in {op}");
        }
        let message = format!("injected failure in {op}");
        Err(if fault.retryable {
            Error::provider_for("simulated", self.provider.as_str(), message)
        } else {
            Error::provider_permanent("simulated", self.provider.as_str(), message)
        })
    }
}

/// First fault for `op` that fires on this call, consuming one of its uses
fn fire(faults: &mut [Fault], op: &str) -> Option<Fault> {
    for fault in faults.iter_mut().filter(|f| f.op == op) {
        if fault.after > 0 {
            fault.after -= 1;
            continue;
        }
        match fault.times {
            Some(0) => continue,
            Some(ref mut n) => *n -= 1,
            None => {}
        }
        return Some(fault.clone());
    }
    None
}

fn ssh_key_id(cluster: &str) -> String {
    format!("key-{cluster}")
}

fn lb_id(cluster: &str) -> String {
    format!("lb-{cluster}")
}

#[async_trait]
impl CloudConnector for SimulatedCloud {
    fn provider(&self) -> ProviderType {
        self.provider
    }

    fn instance_spec(&self, machine: &Machine) -> Result<InstanceSpec> {
        let sim: SimulatedMachineSpec = machine.spec.provider_spec.decode(self.provider)?;
        let spec = InstanceSpec {
            image: sim.image,
            region: sim.region,
            instance_type: sim.plan.unwrap_or_else(|| machine.spec.sku.clone()),
            zone: None,
        };
        spec.validate(machine.name())?;
        Ok(spec)
    }

    fn master_sku(&self, total_nodes: u32) -> String {
        match total_nodes {
            0..=5 => "sim-2c-4gb",
            6..=10 => "sim-4c-8gb",
            _ => "sim-8c-16gb",
        }
        .to_string()
    }

    async fn ensure_network(&self, cluster: &Cluster) -> Result<NetworkInfo> {
        self.check("ensure_network")?;
        let mut state = self.state.lock();
        let network = state
            .networks
            .entry(cluster.name().to_string())
            .or_insert_with(|| NetworkInfo {
                network_id: Some(format!("vpc-{}", cluster.name())),
                security_group_id: Some(format!("fw-{}", cluster.name())),
            });
        Ok(network.clone())
    }

    async fn delete_network(&self, cluster: &Cluster) -> Result<()> {
        self.check("delete_network")?;
        self.state.lock().networks.remove(cluster.name());
        Ok(())
    }

    async fn import_ssh_key(&self, cluster: &Cluster, _public_key: &str) -> Result<String> {
        self.check("import_ssh_key")?;
        let id = ssh_key_id(cluster.name());
        self.state.lock().ssh_keys.insert(id.clone());
        Ok(id)
    }

    async fn delete_ssh_key(&self, key_id: &str) -> Result<()> {
        self.check("delete_ssh_key")?;
        self.state.lock().ssh_keys.remove(key_id);
        Ok(())
    }

    async fn ensure_load_balancer(&self, cluster: &Cluster) -> Result<LoadBalancerStatus> {
        self.check("ensure_load_balancer")?;
        let mut state = self.state.lock();
        let n = state.next();
        let (lb, _) = state
            .load_balancers
            .entry(lb_id(cluster.name()))
            .or_insert_with(|| {
                (
                    LoadBalancerStatus {
                        id: lb_id(cluster.name()),
                        address: format!("203.0.113.{}", n % 250 + 1),
                    },
                    BTreeSet::new(),
                )
            });
        Ok(lb.clone())
    }

    async fn delete_load_balancer(&self, lb_id: &str) -> Result<()> {
        self.check("delete_load_balancer")?;
        self.state.lock().load_balancers.remove(lb_id);
        Ok(())
    }

    async fn attach_to_load_balancer(&self, lb_id: &str, instance: &Instance) -> Result<()> {
        self.check("attach_to_load_balancer")?;
        let mut state = self.state.lock();
        let (_, backends) = state.load_balancers.get_mut(lb_id).ok_or_else(|| {
            Error::provider_permanent(
                instance.name.clone(),
                self.provider.as_str(),
                format!("load balancer {lb_id} does not exist"),
            )
        })?;
        backends.insert(instance.provider_id.clone());
        Ok(())
    }

    async fn detach_from_load_balancer(&self, lb_id: &str, instance: &Instance) -> Result<()> {
        self.check("detach_from_load_balancer")?;
        if let Some((_, backends)) = self.state.lock().load_balancers.get_mut(lb_id) {
            backends.remove(&instance.provider_id);
        }
        Ok(())
    }

    async fn reserve_ip(&self, _cluster: &Cluster) -> Result<String> {
        self.check("reserve_ip")?;
        let mut state = self.state.lock();
        let ip = format!("198.51.100.{}", state.next() % 250 + 1);
        state.reserved_ips.insert(ip.clone());
        Ok(ip)
    }

    async fn release_ip(&self, ip: &str) -> Result<()> {
        self.check("release_ip")?;
        self.state.lock().reserved_ips.remove(ip);
        Ok(())
    }

    async fn delete_dns_records(&self, _cluster: &Cluster) -> Result<()> {
        self.check("delete_dns_records")
    }

    async fn create_instance(&self, request: &InstanceRequest) -> Result<Instance> {
        self.check("create_instance")?;
        let mut state = self.state.lock();
        let n = state.next();
        // Distinct creation times keep oldest-first ordering stable
        let instance = Instance {
            provider_id: format!("{}://{}", self.provider, n),
            name: request.name.clone(),
            node_group: request.node_group.clone(),
            role: request.role,
            status: InstanceStatus::Provisioning,
            public_ip: Some(format!("203.0.113.{}", n % 250 + 1)),
            private_ip: Some(format!("10.0.{}.{}", n / 250, n % 250 + 1)),
            created_at: Utc::now() + ChronoDuration::milliseconds(n as i64),
            kubernetes_version: Some(request.kubernetes_version.clone()),
        };
        debug!(name = %instance.name, provider_id = %instance.provider_id, "Simulated instance created");
        state.instances.insert(
            instance.provider_id.clone(),
            (request.cluster.clone(), instance.clone()),
        );
        Ok(instance)
    }

    async fn get_instance(&self, provider_id: &str) -> Result<Option<Instance>> {
        self.check("get_instance")?;
        let mut state = self.state.lock();
        Ok(state.instances.get_mut(provider_id).map(|(_, instance)| {
            // Instances finish booting by the time anyone looks
            if instance.status == InstanceStatus::Provisioning {
                instance.status = InstanceStatus::Active;
            }
            instance.clone()
        }))
    }

    async fn find_instance(&self, cluster: &str, name: &str) -> Result<Option<Instance>> {
        self.check("find_instance")?;
        Ok(self
            .state
            .lock()
            .instances
            .values()
            .find(|(c, i)| c == cluster && i.name == name)
            .map(|(_, i)| i.clone()))
    }

    async fn list_instances(&self, filter: &InstanceFilter) -> Result<Vec<Instance>> {
        self.check("list_instances")?;
        Ok(self
            .instances(&filter.cluster)
            .into_iter()
            .filter(|i| match &filter.node_group {
                Some(group) => i.node_group.as_ref() == Some(group),
                None => true,
            })
            .collect())
    }

    async fn delete_instance(&self, provider_id: &str) -> Result<()> {
        self.check("delete_instance")?;
        let mut state = self.state.lock();
        state.instances.remove(provider_id);
        for (_, backends) in state.load_balancers.values_mut() {
            backends.remove(provider_id);
        }
        Ok(())
    }

    async fn upgrade_instance(&self, instance: &Instance, version: &str) -> Result<()> {
        self.check("upgrade_instance")?;
        let mut state = self.state.lock();
        let (_, stored) = state.instances.get_mut(&instance.provider_id).ok_or_else(|| {
            Error::provider_permanent(
                instance.name.clone(),
                self.provider.as_str(),
                format!("instance {} does not exist", instance.provider_id),
            )
        })?;
        stored.kubernetes_version = Some(version.to_string());
        Ok(())
    }

    async fn find_startup_script(&self, group: &str) -> Result<Option<String>> {
        self.check("find_startup_script")?;
        Ok(self.startup_script(group))
    }

    async fn ensure_startup_script(&self, group: &str, _script: &str) -> Result<String> {
        self.check("ensure_startup_script")?;
        let mut state = self.state.lock();
        let n = state.next();
        Ok(state
            .startup_scripts
            .entry(group.to_string())
            .or_insert_with(|| format!("script-{n}"))
            .clone())
    }

    async fn delete_startup_script(&self, script_id: &str) -> Result<()> {
        self.check("delete_startup_script")?;
        self.state
            .lock()
            .startup_scripts
            .retain(|_, id| id != script_id);
        Ok(())
    }

    async fn ensure_managed_control_plane(&self, cluster: &Cluster) -> Result<String> {
        self.check("ensure_managed_control_plane")?;
        if !self.provider.is_managed() {
            return Err(Error::provider_permanent(
                cluster.name(),
                self.provider.as_str(),
                "provider does not offer a managed control plane",
            ));
        }
        Ok(self
            .state
            .lock()
            .managed_control_planes
            .entry(cluster.name().to_string())
            .or_insert_with(|| format!("mcp-{}", cluster.name()))
            .clone())
    }

    async fn delete_managed_control_plane(&self, id: &str) -> Result<()> {
        self.check("delete_managed_control_plane")?;
        self.state
            .lock()
            .managed_control_planes
            .retain(|_, existing| existing != id);
        Ok(())
    }
}
