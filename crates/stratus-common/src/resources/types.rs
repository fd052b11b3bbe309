//! Enumerations shared by stratus resource records

use serde::{Deserialize, Serialize};

/// Supported cloud providers
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    /// Amazon EC2 with a self-hosted control plane
    Aws,
    /// Amazon Elastic Kubernetes Service
    Eks,
    /// Microsoft Azure virtual machines
    Azure,
    /// Azure Kubernetes Service
    Aks,
    /// Google Compute Engine
    Gce,
    /// Google Kubernetes Engine
    Gke,
    /// DigitalOcean droplets
    #[default]
    DigitalOcean,
    /// DigitalOcean Kubernetes
    Dokube,
    /// Linode
    Linode,
    /// Vultr
    Vultr,
    /// Hetzner Cloud
    Hetzner,
    /// OVH Public Cloud
    Ovh,
    /// Amazon Lightsail
    Lightsail,
    /// Equinix Metal (formerly Packet)
    Packet,
    /// Scaleway
    Scaleway,
}

impl ProviderType {
    /// Every provider, in declaration order
    pub const ALL: [ProviderType; 15] = [
        Self::Aws,
        Self::Eks,
        Self::Azure,
        Self::Aks,
        Self::Gce,
        Self::Gke,
        Self::DigitalOcean,
        Self::Dokube,
        Self::Linode,
        Self::Vultr,
        Self::Hetzner,
        Self::Ovh,
        Self::Lightsail,
        Self::Packet,
        Self::Scaleway,
    ];

    /// Returns true if the vendor runs the control plane
    ///
    /// Managed clusters have no master machines; the connector's managed
    /// control plane operations stand in for master provisioning.
    pub fn is_managed(&self) -> bool {
        matches!(self, Self::Eks | Self::Aks | Self::Gke | Self::Dokube)
    }

    /// Lowercase identifier used in records, tags, and CLI flags
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Aws => "aws",
            Self::Eks => "eks",
            Self::Azure => "azure",
            Self::Aks => "aks",
            Self::Gce => "gce",
            Self::Gke => "gke",
            Self::DigitalOcean => "digitalocean",
            Self::Dokube => "dokube",
            Self::Linode => "linode",
            Self::Vultr => "vultr",
            Self::Hetzner => "hetzner",
            Self::Ovh => "ovh",
            Self::Lightsail => "lightsail",
            Self::Packet => "packet",
            Self::Scaleway => "scaleway",
        }
    }
}

impl std::str::FromStr for ProviderType {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_lowercase();
        Self::ALL
            .iter()
            .copied()
            .find(|p| p.as_str() == lower)
            .ok_or_else(|| {
                let known: Vec<&str> = Self::ALL.iter().map(|p| p.as_str()).collect();
                crate::Error::validation(format!(
                    "invalid provider type: {s}, expected one of: {}",
                    known.join(", ")
                ))
            })
    }
}

impl std::fmt::Display for ProviderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Cluster lifecycle phase
///
/// Allowed moves are encoded in [`ClusterPhase::can_transition_to`]. Staying
/// in the same phase is always allowed so status writes stay idempotent.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub enum ClusterPhase {
    /// Recorded, not yet provisioned
    #[default]
    Pending,
    /// Control plane up and node groups reconciled
    Ready,
    /// Teardown in progress
    Deleting,
    /// Teardown finished; the record remains for audit
    Deleted,
    /// Kubernetes version upgrade in progress
    Upgrading,
    /// Provisioning failed before reaching Ready
    Failing,
}

impl ClusterPhase {
    /// Returns true if moving from `self` to `next` is a legal transition
    pub fn can_transition_to(&self, next: ClusterPhase) -> bool {
        use ClusterPhase::*;

        if *self == next {
            return true;
        }

        matches!(
            (self, next),
            (Pending, Ready)
                | (Pending, Failing)
                | (Pending, Deleting)
                | (Ready, Upgrading)
                | (Upgrading, Ready)
                | (Ready, Deleting)
                | (Failing, Deleting)
                | (Upgrading, Deleting)
                | (Failing, Pending)
                | (Deleting, Deleted)
        )
    }

    /// Returns true once nothing further will happen to the cluster
    pub fn is_terminal(&self) -> bool {
        matches!(self, ClusterPhase::Deleted)
    }
}

impl std::fmt::Display for ClusterPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Ready => write!(f, "Ready"),
            Self::Deleting => write!(f, "Deleting"),
            Self::Deleted => write!(f, "Deleted"),
            Self::Upgrading => write!(f, "Upgrading"),
            Self::Failing => write!(f, "Failing"),
        }
    }
}

/// Role a machine plays in the cluster
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum MachineRole {
    /// Control plane (API server, etcd)
    Master,
    /// Worker
    #[default]
    Node,
}

impl MachineRole {
    /// Returns true for control plane machines
    pub fn is_master(&self) -> bool {
        matches!(self, MachineRole::Master)
    }
}

impl std::fmt::Display for MachineRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Master => write!(f, "master"),
            Self::Node => write!(f, "node"),
        }
    }
}

/// Observed lifecycle of a single machine
///
/// There is no failed state: a failed create leaves the machine absent.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub enum MachinePhase {
    /// No cloud instance
    #[default]
    Absent,
    /// Instance requested, not yet active
    Provisioning,
    /// Instance active and registered
    Ready,
    /// Instance teardown in progress
    Deleting,
}
