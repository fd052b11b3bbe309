//! Cloud connector capability
//!
//! A [`CloudConnector`] wraps one vendor's API. It offers instance lifecycle
//! primitives plus the networking and access setup a cluster needs, and
//! nothing else: every decision about *when* to call them lives in the
//! actuator, scaler, and lifecycle.
//!
//! Conventions every implementation follows:
//! - Deleting something that is already gone succeeds.
//! - Lookups return `Ok(None)` for absent resources, never a not-found error.
//! - Transient failures are returned as retryable errors; the
//!   [`RetryingConnector`](crate::RetryingConnector) decorator owns backoff.

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
#[cfg(test)]
use mockall::automock;
use serde::{Deserialize, Serialize};
use stratus_common::resources::{Cluster, LoadBalancerStatus, Machine, MachineRole, ProviderType};
use stratus_common::wait::{poll_until, PollConfig};
use stratus_common::{Error, Result};

/// Provider-reported instance state
#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
pub enum InstanceStatus {
    /// Being created or booting
    Provisioning,
    /// Running
    Active,
    /// Powered off
    Stopped,
    /// Being destroyed
    Deleting,
}

impl std::fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Provisioning => write!(f, "provisioning"),
            Self::Active => write!(f, "active"),
            Self::Stopped => write!(f, "stopped"),
            Self::Deleting => write!(f, "deleting"),
        }
    }
}

/// A cloud instance as the provider reports it
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Instance {
    /// Provider-assigned ID, prefixed with the provider (e.g. "linode://4521")
    pub provider_id: String,
    /// Instance name, equal to the machine name
    pub name: String,
    /// Node group tag
    pub node_group: Option<String>,
    /// Role tag
    pub role: MachineRole,
    /// Current state
    pub status: InstanceStatus,
    /// Public address
    pub public_ip: Option<String>,
    /// Private address
    pub private_ip: Option<String>,
    /// Creation time reported by the provider
    pub created_at: DateTime<Utc>,
    /// Kubernetes version installed on the instance
    pub kubernetes_version: Option<String>,
}

impl Instance {
    /// Address peers and load balancers should use
    pub fn address(&self) -> Option<&str> {
        self.private_ip.as_deref().or(self.public_ip.as_deref())
    }
}

/// Fields every provider needs from a machine's provider spec
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
pub struct InstanceSpec {
    /// OS image
    pub image: String,
    /// Region
    pub region: String,
    /// Instance type / plan
    pub instance_type: String,
    /// Zone, for providers that have them
    #[serde(default)]
    pub zone: Option<String>,
}

impl InstanceSpec {
    /// Reject specs missing a required field
    pub fn validate(&self, machine: &str) -> Result<()> {
        let missing = |field: &str, message: &str| {
            Error::validation_for_field(machine, format!("spec.providerSpec.{field}"), message)
        };
        if self.image.trim().is_empty() {
            return Err(missing("image", "image slug must be provided"));
        }
        if self.region.trim().is_empty() {
            return Err(missing("region", "region must be provided"));
        }
        if self.instance_type.trim().is_empty() {
            return Err(missing("instanceType", "type must be provided"));
        }
        Ok(())
    }
}

/// Everything a provider needs to create one instance
#[derive(Clone, Debug, PartialEq)]
pub struct InstanceRequest {
    /// Owning cluster
    pub cluster: String,
    /// Instance name
    pub name: String,
    /// Node group, for worker instances
    pub node_group: Option<String>,
    /// Master or node
    pub role: MachineRole,
    /// Validated provider fields
    pub spec: InstanceSpec,
    /// Kubernetes version the instance is bootstrapped with
    pub kubernetes_version: String,
    /// Per-instance bootstrap script
    pub user_data: String,
    /// Group-level startup script, when the provider keeps one
    pub startup_script_id: Option<String>,
    /// Imported SSH key
    pub ssh_key_id: Option<String>,
    /// Cluster network
    pub network_id: Option<String>,
    /// Tags applied to the instance
    pub tags: BTreeMap<String, String>,
}

/// Selects instances by cluster and optionally node group
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InstanceFilter {
    /// Cluster tag
    pub cluster: String,
    /// Node group tag, `None` for every instance in the cluster
    pub node_group: Option<String>,
}

impl InstanceFilter {
    /// Every instance of a cluster
    pub fn cluster(cluster: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            node_group: None,
        }
    }

    /// Instances of one node group
    pub fn node_group(cluster: impl Into<String>, group: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            node_group: Some(group.into()),
        }
    }
}

/// Network resources created for a cluster
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct NetworkInfo {
    /// VPC / private network
    pub network_id: Option<String>,
    /// Firewall / security group
    pub security_group_id: Option<String>,
}

/// Provider-specific cloud operations
#[cfg_attr(test, automock)]
#[async_trait]
pub trait CloudConnector: Send + Sync {
    /// Provider this connector talks to
    fn provider(&self) -> ProviderType;

    /// Decode and validate a machine's provider spec
    ///
    /// Missing required fields are a validation error.
    fn instance_spec(&self, machine: &Machine) -> Result<InstanceSpec>;

    /// Master instance type for a cluster with `total_nodes` nodes
    fn master_sku(&self, total_nodes: u32) -> String;

    // Networking and access

    /// Create the cluster network and firewall, or return the existing ones
    async fn ensure_network(&self, cluster: &Cluster) -> Result<NetworkInfo>;

    /// Remove the cluster network and firewall
    async fn delete_network(&self, cluster: &Cluster) -> Result<()>;

    /// Import the cluster's SSH public key; returns the provider key ID
    async fn import_ssh_key(&self, cluster: &Cluster, public_key: &str) -> Result<String>;

    /// Remove an imported SSH key
    async fn delete_ssh_key(&self, key_id: &str) -> Result<()>;

    /// Create the API server load balancer, or return the existing one
    async fn ensure_load_balancer(&self, cluster: &Cluster) -> Result<LoadBalancerStatus>;

    /// Remove a load balancer
    async fn delete_load_balancer(&self, lb_id: &str) -> Result<()>;

    /// Add an instance to a load balancer's backends
    async fn attach_to_load_balancer(&self, lb_id: &str, instance: &Instance) -> Result<()>;

    /// Remove an instance from a load balancer's backends
    async fn detach_from_load_balancer(&self, lb_id: &str, instance: &Instance) -> Result<()>;

    /// Reserve a public IP in the cluster's region
    async fn reserve_ip(&self, cluster: &Cluster) -> Result<String>;

    /// Release a reserved IP
    async fn release_ip(&self, ip: &str) -> Result<()>;

    /// Remove DNS records published for the cluster
    async fn delete_dns_records(&self, cluster: &Cluster) -> Result<()>;

    // Instances

    /// Create an instance; returns as soon as the provider accepts the request
    async fn create_instance(&self, request: &InstanceRequest) -> Result<Instance>;

    /// Look an instance up by provider ID
    async fn get_instance(&self, provider_id: &str) -> Result<Option<Instance>>;

    /// Look an instance up by cluster and name
    async fn find_instance(&self, cluster: &str, name: &str) -> Result<Option<Instance>>;

    /// List instances matching a filter
    async fn list_instances(&self, filter: &InstanceFilter) -> Result<Vec<Instance>>;

    /// Destroy an instance
    async fn delete_instance(&self, provider_id: &str) -> Result<()>;

    /// Upgrade kubeadm and kubelet on a running instance
    async fn upgrade_instance(&self, instance: &Instance, version: &str) -> Result<()>;

    // Node group resources

    /// Look up a node group's startup script
    async fn find_startup_script(&self, group: &str) -> Result<Option<String>>;

    /// Create a node group's startup script, or return the existing one
    async fn ensure_startup_script(&self, group: &str, script: &str) -> Result<String>;

    /// Remove a startup script
    async fn delete_startup_script(&self, script_id: &str) -> Result<()>;

    // Managed control planes

    /// Create the vendor-managed control plane; returns its ID
    async fn ensure_managed_control_plane(&self, cluster: &Cluster) -> Result<String> {
        Err(Error::provider_permanent(
            cluster.name(),
            self.provider().as_str(),
            "provider does not offer a managed control plane",
        ))
    }

    /// Remove the vendor-managed control plane
    async fn delete_managed_control_plane(&self, id: &str) -> Result<()> {
        Err(Error::provider_permanent(
            stratus_common::error::UNKNOWN_CONTEXT,
            self.provider().as_str(),
            format!("cannot delete managed control plane {id}: not supported"),
        ))
    }
}

/// Wait until an instance reports `status`
pub async fn wait_for_instance_status(
    connector: &dyn CloudConnector,
    provider_id: &str,
    status: InstanceStatus,
    poll: PollConfig,
) -> Result<Instance> {
    let what = format!("instance {provider_id} to become {status}");
    poll_until(poll, &what, move || async move {
        match connector.get_instance(provider_id).await? {
            Some(instance) if instance.status == status => Ok(Some(instance)),
            Some(_) => Ok(None),
            None => Err(Error::provider_for(
                stratus_common::error::UNKNOWN_CONTEXT,
                connector.provider().as_str(),
                format!("instance {provider_id} disappeared while waiting for {status}"),
            )),
        }
    })
    .await
}

/// Wait until an instance no longer exists
pub async fn wait_for_instance_gone(
    connector: &dyn CloudConnector,
    provider_id: &str,
    poll: PollConfig,
) -> Result<()> {
    let what = format!("instance {provider_id} to be deleted");
    poll_until(poll, &what, move || async move {
        Ok(connector.get_instance(provider_id).await?.is_none().then_some(()))
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn instance(status: InstanceStatus) -> Instance {
        Instance {
            provider_id: "linode://1".into(),
            name: "prod-master-0".into(),
            node_group: None,
            role: MachineRole::Master,
            status,
            public_ip: Some("198.51.100.4".into()),
            private_ip: Some("192.168.1.4".into()),
            created_at: Utc::now(),
            kubernetes_version: None,
        }
    }

    fn poll() -> PollConfig {
        PollConfig::new(Duration::from_secs(5), Duration::from_secs(60))
    }

    #[test]
    fn test_instance_spec_validation_messages() {
        let mut spec = InstanceSpec::default();
        assert_eq!(
            spec.validate("m").unwrap_err().to_string(),
            "validation error for m: image slug must be provided"
        );
        spec.image = "ubuntu-22-04".into();
        assert!(spec
            .validate("m")
            .unwrap_err()
            .to_string()
            .contains("region must be provided"));
        spec.region = "us-east".into();
        assert!(spec
            .validate("m")
            .unwrap_err()
            .to_string()
            .contains("type must be provided"));
        spec.instance_type = "g6-standard-2".into();
        assert!(spec.validate("m").is_ok());
    }

    #[test]
    fn test_address_prefers_private() {
        assert_eq!(instance(InstanceStatus::Active).address(), Some("192.168.1.4"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_status_polls_until_active() {
        let calls = Arc::new(AtomicU32::new(0));
        let c = calls.clone();
        let mut mock = MockCloudConnector::new();
        mock.expect_provider().return_const(ProviderType::Linode);
        mock.expect_get_instance().returning(move |_| {
            let n = c.fetch_add(1, Ordering::SeqCst);
            let status = if n < 2 {
                InstanceStatus::Provisioning
            } else {
                InstanceStatus::Active
            };
            Ok(Some(instance(status)))
        });

        let found = wait_for_instance_status(&mock, "linode://1", InstanceStatus::Active, poll())
            .await
            .unwrap();
        assert_eq!(found.status, InstanceStatus::Active);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_status_fails_if_instance_vanishes() {
        let mut mock = MockCloudConnector::new();
        mock.expect_provider().return_const(ProviderType::Linode);
        mock.expect_get_instance().returning(|_| Ok(None));

        let err = wait_for_instance_status(&mock, "linode://1", InstanceStatus::Active, poll())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("disappeared"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_gone_times_out() {
        let mut mock = MockCloudConnector::new();
        mock.expect_get_instance()
            .returning(|_| Ok(Some(instance(InstanceStatus::Deleting))));

        let err = wait_for_instance_gone(&mock, "linode://1", poll())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout { .. }));
    }
}
