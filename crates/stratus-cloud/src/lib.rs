//! Cloud access for stratus
//!
//! This crate holds everything that talks to a provider or to a provisioned
//! cluster's API server: the [`CloudConnector`] capability, the machine
//! [`Actuator`], bootstrap tokens and scripts, control plane readiness, and
//! the [`ProviderRegistry`] that ties a cluster to its connector.
//!
//! Related crates:
//! - `stratus-common`: records, store, errors
//! - `stratus-cluster`: node group scaling and the cluster lifecycle

#![deny(missing_docs)]

pub mod actuator;
pub mod bootstrap;
pub mod connector;
pub mod kube_access;
pub mod probe;
pub mod registry;
pub mod retrying;
pub mod simulated;

pub use actuator::{Actuator, MachineActuator};
pub use bootstrap::{BootstrapTokenService, JoinToken, KubeadmTokenService, ScriptRenderer};
pub use connector::{
    wait_for_instance_gone, wait_for_instance_status, CloudConnector, Instance, InstanceFilter,
    InstanceRequest, InstanceSpec, InstanceStatus, NetworkInfo,
};
pub use probe::{wait_for_control_plane, ControlPlaneProbe, ControlPlaneStatus};
pub use registry::{
    ConnectorFactory, ControlPlaneAccess, KubeAccess, ProviderHandles, ProviderRegistry,
};
pub use retrying::RetryingConnector;

pub use stratus_common::{Error, Result};
