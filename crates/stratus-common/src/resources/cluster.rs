//! Cluster records

use serde::{Deserialize, Serialize};

use super::{ClusterPhase, ObjectMeta, ProviderBlob, ProviderType};

/// Value of `spec.master_reserved_ip` that asks stratus to reserve an address
pub const AUTO_RESERVED_IP: &str = "auto";

/// Default Kubernetes API server port
pub const DEFAULT_API_SERVER_PORT: u16 = 6443;

/// A provisioned Kubernetes cluster
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Cluster {
    /// Identity; `metadata.uid` is the cluster ID operations refer to
    pub metadata: ObjectMeta,
    /// Desired configuration
    pub spec: ClusterSpec,
    /// Observed state
    #[serde(default)]
    pub status: ClusterStatus,
}

impl Cluster {
    /// A new pending cluster
    pub fn new(name: impl Into<String>, spec: ClusterSpec) -> Self {
        Self {
            metadata: ObjectMeta::new(name),
            spec,
            status: ClusterStatus::default(),
        }
    }

    /// Cluster name
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Cluster ID referenced by operations
    pub fn id(&self) -> &str {
        &self.metadata.uid
    }

    /// Name of the cluster's API load balancer
    pub fn load_balancer_name(&self) -> String {
        format!("{}-lb", self.metadata.name)
    }

    /// Returns true if the spec asks for an automatically reserved master IP
    pub fn wants_auto_reserved_ip(&self) -> bool {
        self.spec.master_reserved_ip.as_deref() == Some(AUTO_RESERVED_IP)
    }

    /// Returns true if a version upgrade is pending
    pub fn upgrade_requested(&self) -> bool {
        match &self.status.kubernetes_version {
            Some(current) => current != &self.spec.kubernetes_version,
            None => false,
        }
    }
}

/// Desired cluster configuration
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Cloud provider
    pub provider: ProviderType,
    /// Name of the credential record used to talk to the provider
    pub credential_name: String,
    /// Provider region
    pub region: String,
    /// Provider zone, where the provider has them
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
    /// Kubernetes version (e.g. "1.30.4")
    pub kubernetes_version: String,
    /// Master IP: an existing reserved address, `"auto"`, or unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub master_reserved_ip: Option<String>,
    /// Cluster networking
    #[serde(default)]
    pub network: NetworkSpec,
    /// Public key installed on every machine
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_public_key: Option<String>,
    /// API server port
    #[serde(default = "default_api_server_port")]
    pub api_server_port: u16,
}

fn default_api_server_port() -> u16 {
    DEFAULT_API_SERVER_PORT
}

impl Default for ClusterSpec {
    fn default() -> Self {
        Self {
            provider: ProviderType::default(),
            credential_name: String::new(),
            region: String::new(),
            zone: None,
            kubernetes_version: String::new(),
            master_reserved_ip: None,
            network: NetworkSpec::default(),
            ssh_public_key: None,
            api_server_port: DEFAULT_API_SERVER_PORT,
        }
    }
}

/// Cluster networking configuration
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NetworkSpec {
    /// Pod CIDR
    pub pod_subnet: String,
    /// Service CIDR
    pub service_subnet: String,
    /// Cluster DNS domain
    pub dns_domain: String,
}

impl Default for NetworkSpec {
    fn default() -> Self {
        Self {
            pod_subnet: "10.244.0.0/16".to_string(),
            service_subnet: "10.96.0.0/12".to_string(),
            dns_domain: "cluster.local".to_string(),
        }
    }
}

/// Observed cluster state
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ClusterStatus {
    /// Lifecycle phase
    #[serde(default)]
    pub phase: ClusterPhase,
    /// Last failure, cleared on reaching Ready
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Kubernetes version the cluster last reached Ready with
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes_version: Option<String>,
    /// Provider-side infrastructure IDs
    #[serde(default)]
    pub cloud: CloudStatus,
    /// Reserved public addresses held by the cluster
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reserved_ips: Vec<ReservedIp>,
    /// API server endpoints
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub api_addresses: Vec<ApiAddress>,
    /// etcd peer addresses of the control plane machines
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub etcd_peers: Vec<String>,
}

/// Infrastructure created on the provider for this cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CloudStatus {
    /// Network / VPC
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network_id: Option<String>,
    /// Firewall / security group
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_group_id: Option<String>,
    /// Imported SSH key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_key_id: Option<String>,
    /// API server load balancer
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub load_balancer: Option<LoadBalancerStatus>,
    /// Vendor-managed control plane, for managed providers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub managed_control_plane_id: Option<String>,
    /// Anything else the provider wants to remember
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_status: Option<ProviderBlob>,
}

/// A provider load balancer
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct LoadBalancerStatus {
    /// Provider ID
    pub id: String,
    /// Public address
    pub address: String,
}

/// A reserved public IP
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ReservedIp {
    /// The address
    pub ip: String,
    /// True if stratus reserved it, false if the user supplied it
    #[serde(default)]
    pub auto: bool,
}

/// An API server endpoint
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ApiAddress {
    /// Host or IP
    pub host: String,
    /// Port
    pub port: u16,
}

impl std::fmt::Display for ApiAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ClusterSpec {
        ClusterSpec {
            provider: ProviderType::Linode,
            credential_name: "linode-cred".into(),
            region: "us-east".into(),
            kubernetes_version: "1.30.4".into(),
            ..Default::default()
        }
    }

    #[test]
    fn test_new_cluster_is_pending() {
        let cluster = Cluster::new("prod", spec());
        assert_eq!(cluster.status.phase, ClusterPhase::Pending);
        assert_eq!(cluster.name(), "prod");
        assert!(!cluster.id().is_empty());
        assert_eq!(cluster.load_balancer_name(), "prod-lb");
    }

    #[test]
    fn test_default_spec_uses_standard_api_port() {
        assert_eq!(spec().api_server_port, DEFAULT_API_SERVER_PORT);
        assert_eq!(ClusterSpec::default().api_server_port, 6443);

        let decoded: ClusterSpec = serde_json::from_value(serde_json::json!({
            "provider": "linode",
            "credentialName": "linode-cred",
            "region": "us-east",
            "kubernetesVersion": "1.30.4",
        }))
        .unwrap();
        assert_eq!(decoded.api_server_port, DEFAULT_API_SERVER_PORT);
    }

    #[test]
    fn test_auto_reserved_ip() {
        let mut cluster = Cluster::new("prod", spec());
        assert!(!cluster.wants_auto_reserved_ip());
        cluster.spec.master_reserved_ip = Some("203.0.113.7".into());
        assert!(!cluster.wants_auto_reserved_ip());
        cluster.spec.master_reserved_ip = Some(AUTO_RESERVED_IP.into());
        assert!(cluster.wants_auto_reserved_ip());
    }

    #[test]
    fn test_upgrade_requested_only_after_first_ready() {
        let mut cluster = Cluster::new("prod", spec());
        assert!(!cluster.upgrade_requested());

        cluster.status.kubernetes_version = Some("1.30.4".into());
        assert!(!cluster.upgrade_requested());

        cluster.spec.kubernetes_version = "1.31.0".into();
        assert!(cluster.upgrade_requested());
    }

    #[test]
    fn test_spec_defaults_on_deserialize() {
        let spec: ClusterSpec = serde_json::from_value(serde_json::json!({
            "provider": "vultr",
            "credentialName": "v",
            "region": "ewr",
            "kubernetesVersion": "1.30.0"
        }))
        .unwrap();
        assert_eq!(spec.api_server_port, DEFAULT_API_SERVER_PORT);
        assert_eq!(spec.network.dns_domain, "cluster.local");
    }
}
