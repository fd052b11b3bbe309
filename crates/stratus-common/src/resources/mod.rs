//! Records stratus reads and writes through the store
//!
//! - [`Operation`]: one lifecycle request
//! - [`Cluster`]: the provisioned cluster, its phase and infrastructure IDs
//! - [`NodeGroup`] and [`Machine`]: desired pools and the nodes in them
//! - [`Credential`]: provider secrets

mod cluster;
mod credential;
mod machine;
mod meta;
mod operation;
mod provider;
mod types;

pub use cluster::{
    ApiAddress, CloudStatus, Cluster, ClusterSpec, ClusterStatus, LoadBalancerStatus, NetworkSpec,
    ReservedIp, AUTO_RESERVED_IP, DEFAULT_API_SERVER_PORT,
};
pub use credential::{required_keys, Credential};
pub use machine::{
    Machine, MachineSpec, MachineStatus, MachineTemplate, MachineVersions, NodeGroup,
    NodeGroupSpec, NodeGroupStatus, MACHINE_FINALIZER, NODE_GROUP_LABEL,
};
pub use meta::ObjectMeta;
pub use operation::{Operation, OperationState};
pub use provider::ProviderBlob;
pub use types::{ClusterPhase, MachinePhase, MachineRole, ProviderType};
