//! Machine and node group records

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::{MachinePhase, MachineRole, ObjectMeta, ProviderBlob};

/// Finalizer held by every provisioned machine until its instance is gone
pub const MACHINE_FINALIZER: &str = "machine.stratus.io";

/// Label naming the node group a machine belongs to
pub const NODE_GROUP_LABEL: &str = "stratus.io/node-group";

/// A single node's declared and observed state
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct Machine {
    /// Identity; the name doubles as the cloud instance name
    pub metadata: ObjectMeta,
    /// Desired state
    pub spec: MachineSpec,
    /// Observed state
    #[serde(default)]
    pub status: MachineStatus,
}

impl Machine {
    /// A new machine record
    pub fn new(name: impl Into<String>, spec: MachineSpec) -> Self {
        Self {
            metadata: ObjectMeta::new(name),
            spec,
            status: MachineStatus::default(),
        }
    }

    /// Machine name
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Returns true for control plane machines
    pub fn is_master(&self) -> bool {
        self.spec.role.is_master()
    }
}

/// Desired machine configuration
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineSpec {
    /// Master or node
    pub role: MachineRole,
    /// Node group this machine was created for
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_group: Option<String>,
    /// Instance size / plan
    pub sku: String,
    /// Component versions
    pub versions: MachineVersions,
    /// Labels applied to the Kubernetes node
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Vendor-specific fields (image, region, plan, ...)
    pub provider_spec: ProviderBlob,
}

/// Component versions on a machine
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct MachineVersions {
    /// kubelet version
    pub kubelet: String,
    /// Control plane version, for masters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control_plane: Option<String>,
}

/// Observed machine state
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatus {
    /// Lifecycle phase
    #[serde(default)]
    pub phase: MachinePhase,
    /// Provider-assigned instance ID (e.g. "linode://4521")
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
    /// Public address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_ip: Option<String>,
    /// Private address
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_ip: Option<String>,
    /// Provider's instance status string
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_status: Option<String>,
    /// Vendor-specific status
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_status: Option<ProviderBlob>,
}

/// A homogeneous pool of machines
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct NodeGroup {
    /// Identity; the name is the instance prefix and group tag
    pub metadata: ObjectMeta,
    /// Desired state
    pub spec: NodeGroupSpec,
    /// Observed state
    #[serde(default)]
    pub status: NodeGroupStatus,
}

impl NodeGroup {
    /// A new node group named `<cluster>-<sku>`
    pub fn new(cluster: &str, replicas: u32, template: MachineTemplate) -> Self {
        let name = Self::generated_name(cluster, &template.sku);
        Self {
            metadata: ObjectMeta::new(name),
            spec: NodeGroupSpec { replicas, template },
            status: NodeGroupStatus::default(),
        }
    }

    /// Name derived from cluster and instance size
    pub fn generated_name(cluster: &str, sku: &str) -> String {
        let sku: String = sku
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() {
                    c.to_ascii_lowercase()
                } else {
                    '-'
                }
            })
            .collect();
        format!("{}-{}", cluster, sku.trim_matches('-'))
    }

    /// Group name
    pub fn name(&self) -> &str {
        &self.metadata.name
    }
}

/// Desired node group state
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeGroupSpec {
    /// Desired instance count
    pub replicas: u32,
    /// Shape of every instance in the group
    pub template: MachineTemplate,
}

/// Shape of a node group's instances
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MachineTemplate {
    /// Master or node
    #[serde(default)]
    pub role: MachineRole,
    /// Instance size / plan
    pub sku: String,
    /// Root disk size
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_size_gb: Option<u32>,
    /// Root disk type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disk_type: Option<String>,
    /// Use spot / preemptible capacity
    #[serde(default)]
    pub spot: bool,
    /// Labels applied to the Kubernetes nodes
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Vendor-specific fields
    pub provider_spec: ProviderBlob,
}

/// Observed node group state
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NodeGroupStatus {
    /// Instance count seen after the last reconciliation pass
    #[serde(default)]
    pub replicas: u32,
    /// Last reconciliation failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Spec generation the status reflects
    #[serde(default)]
    pub observed_generation: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::ProviderType;

    fn template(sku: &str) -> MachineTemplate {
        MachineTemplate {
            role: MachineRole::Node,
            sku: sku.into(),
            disk_size_gb: None,
            disk_type: None,
            spot: false,
            labels: BTreeMap::new(),
            provider_spec: ProviderBlob {
                provider: ProviderType::Linode,
                value: serde_json::json!({}),
            },
        }
    }

    #[test]
    fn test_generated_name_sanitizes_sku() {
        assert_eq!(NodeGroup::generated_name("prod", "g6-standard-2"), "prod-g6-standard-2");
        assert_eq!(NodeGroup::generated_name("prod", "vc2.1C_2GB"), "prod-vc2-1c-2gb");
    }

    #[test]
    fn test_new_node_group_starts_unobserved() {
        let group = NodeGroup::new("prod", 3, template("g6-standard-2"));
        assert_eq!(group.name(), "prod-g6-standard-2");
        assert_eq!(group.spec.replicas, 3);
        assert_eq!(group.status.replicas, 0);
    }
}
