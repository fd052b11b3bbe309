//! Backoff at the connector boundary
//!
//! Every connector handed out by the registry is wrapped in a
//! [`RetryingConnector`]. Retryable errors are retried with bounded
//! exponential backoff; anything else, and anything still failing after the
//! last attempt, goes straight back to the caller. Nothing above this layer
//! retries in-process.

use std::sync::Arc;

use async_trait::async_trait;
use stratus_common::resources::{Cluster, LoadBalancerStatus, Machine, ProviderType};
use stratus_common::retry::{retry_transient, RetryConfig};
use stratus_common::Result;

use crate::connector::{
    CloudConnector, Instance, InstanceFilter, InstanceRequest, InstanceSpec, NetworkInfo,
};

/// A connector whose calls retry transient failures
pub struct RetryingConnector {
    inner: Arc<dyn CloudConnector>,
    config: RetryConfig,
}

impl RetryingConnector {
    /// Wrap `inner` with the given retry policy
    pub fn new(inner: Arc<dyn CloudConnector>, config: RetryConfig) -> Self {
        Self { inner, config }
    }

    fn op(&self, name: &str) -> String {
        format!("{}.{}", self.inner.provider(), name)
    }
}

#[async_trait]
impl CloudConnector for RetryingConnector {
    fn provider(&self) -> ProviderType {
        self.inner.provider()
    }

    fn instance_spec(&self, machine: &Machine) -> Result<InstanceSpec> {
        self.inner.instance_spec(machine)
    }

    fn master_sku(&self, total_nodes: u32) -> String {
        self.inner.master_sku(total_nodes)
    }

    async fn ensure_network(&self, cluster: &Cluster) -> Result<NetworkInfo> {
        retry_transient(&self.config, &self.op("ensure_network"), || {
            self.inner.ensure_network(cluster)
        })
        .await
    }

    async fn delete_network(&self, cluster: &Cluster) -> Result<()> {
        retry_transient(&self.config, &self.op("delete_network"), || {
            self.inner.delete_network(cluster)
        })
        .await
    }

    async fn import_ssh_key(&self, cluster: &Cluster, public_key: &str) -> Result<String> {
        retry_transient(&self.config, &self.op("import_ssh_key"), || {
            self.inner.import_ssh_key(cluster, public_key)
        })
        .await
    }

    async fn delete_ssh_key(&self, key_id: &str) -> Result<()> {
        retry_transient(&self.config, &self.op("delete_ssh_key"), || {
            self.inner.delete_ssh_key(key_id)
        })
        .await
    }

    async fn ensure_load_balancer(&self, cluster: &Cluster) -> Result<LoadBalancerStatus> {
        retry_transient(&self.config, &self.op("ensure_load_balancer"), || {
            self.inner.ensure_load_balancer(cluster)
        })
        .await
    }

    async fn delete_load_balancer(&self, lb_id: &str) -> Result<()> {
        retry_transient(&self.config, &self.op("delete_load_balancer"), || {
            self.inner.delete_load_balancer(lb_id)
        })
        .await
    }

    async fn attach_to_load_balancer(&self, lb_id: &str, instance: &Instance) -> Result<()> {
        retry_transient(&self.config, &self.op("attach_to_load_balancer"), || {
            self.inner.attach_to_load_balancer(lb_id, instance)
        })
        .await
    }

    async fn detach_from_load_balancer(&self, lb_id: &str, instance: &Instance) -> Result<()> {
        retry_transient(&self.config, &self.op("detach_from_load_balancer"), || {
            self.inner.detach_from_load_balancer(lb_id, instance)
        })
        .await
    }

    async fn reserve_ip(&self, cluster: &Cluster) -> Result<String> {
        retry_transient(&self.config, &self.op("reserve_ip"), || {
            self.inner.reserve_ip(cluster)
        })
        .await
    }

    async fn release_ip(&self, ip: &str) -> Result<()> {
        retry_transient(&self.config, &self.op("release_ip"), || self.inner.release_ip(ip)).await
    }

    async fn delete_dns_records(&self, cluster: &Cluster) -> Result<()> {
        retry_transient(&self.config, &self.op("delete_dns_records"), || {
            self.inner.delete_dns_records(cluster)
        })
        .await
    }

    async fn create_instance(&self, request: &InstanceRequest) -> Result<Instance> {
        // A create that timed out may have succeeded; look before retrying.
        retry_transient(&self.config, &self.op("create_instance"), || async {
            if let Some(existing) = self
                .inner
                .find_instance(&request.cluster, &request.name)
                .await?
            {
                return Ok(existing);
            }
            self.inner.create_instance(request).await
        })
        .await
    }

    async fn get_instance(&self, provider_id: &str) -> Result<Option<Instance>> {
        retry_transient(&self.config, &self.op("get_instance"), || {
            self.inner.get_instance(provider_id)
        })
        .await
    }

    async fn find_instance(&self, cluster: &str, name: &str) -> Result<Option<Instance>> {
        retry_transient(&self.config, &self.op("find_instance"), || {
            self.inner.find_instance(cluster, name)
        })
        .await
    }

    async fn list_instances(&self, filter: &InstanceFilter) -> Result<Vec<Instance>> {
        retry_transient(&self.config, &self.op("list_instances"), || {
            self.inner.list_instances(filter)
        })
        .await
    }

    async fn delete_instance(&self, provider_id: &str) -> Result<()> {
        retry_transient(&self.config, &self.op("delete_instance"), || {
            self.inner.delete_instance(provider_id)
        })
        .await
    }

    async fn upgrade_instance(&self, instance: &Instance, version: &str) -> Result<()> {
        retry_transient(&self.config, &self.op("upgrade_instance"), || {
            self.inner.upgrade_instance(instance, version)
        })
        .await
    }

    async fn find_startup_script(&self, group: &str) -> Result<Option<String>> {
        retry_transient(&self.config, &self.op("find_startup_script"), || {
            self.inner.find_startup_script(group)
        })
        .await
    }

    async fn ensure_startup_script(&self, group: &str, script: &str) -> Result<String> {
        retry_transient(&self.config, &self.op("ensure_startup_script"), || {
            self.inner.ensure_startup_script(group, script)
        })
        .await
    }

    async fn delete_startup_script(&self, script_id: &str) -> Result<()> {
        retry_transient(&self.config, &self.op("delete_startup_script"), || {
            self.inner.delete_startup_script(script_id)
        })
        .await
    }

    async fn ensure_managed_control_plane(&self, cluster: &Cluster) -> Result<String> {
        retry_transient(&self.config, &self.op("ensure_managed_control_plane"), || {
            self.inner.ensure_managed_control_plane(cluster)
        })
        .await
    }

    async fn delete_managed_control_plane(&self, id: &str) -> Result<()> {
        retry_transient(&self.config, &self.op("delete_managed_control_plane"), || {
            self.inner.delete_managed_control_plane(id)
        })
        .await
    }
}
