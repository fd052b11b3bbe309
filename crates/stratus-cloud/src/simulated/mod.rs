//! Simulated provider
//!
//! Registered for every provider when the operator runs with `--simulate`,
//! and used by tests across the workspace.

mod cloud;
mod control_plane;

use std::sync::Arc;

use stratus_common::resources::{Cluster, Credential};
use stratus_common::Result;

pub use cloud::{Fault, SimulatedCloud, SimulatedMachineSpec};
pub use control_plane::SimulatedControlPlane;

use crate::connector::CloudConnector;
use crate::registry::ConnectorFactory;

/// Factory handing out views of one shared [`SimulatedCloud`]
#[derive(Clone, Default)]
pub struct SimulatedFactory {
    cloud: SimulatedCloud,
}

impl SimulatedFactory {
    /// Connect every cluster to `cloud`
    pub fn new(cloud: SimulatedCloud) -> Self {
        Self { cloud }
    }
}

impl ConnectorFactory for SimulatedFactory {
    fn connect(
        &self,
        cluster: &Cluster,
        _credential: &Credential,
    ) -> Result<Arc<dyn CloudConnector>> {
        Ok(Arc::new(self.cloud.as_provider(cluster.spec.provider)))
    }
}
