//! Control plane of simulated clusters
//!
//! Readiness is derived from the simulated cloud: a cluster's control plane
//! is up once its master instances are active, or once its managed control
//! plane exists.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use stratus_common::resources::Cluster;
use stratus_common::store::ResourceStore;
use stratus_common::Result;

use super::SimulatedCloud;
use crate::bootstrap::{BootstrapTokenService, JoinToken};
use crate::connector::InstanceStatus;
use crate::probe::{ControlPlaneProbe, ControlPlaneStatus};
use crate::registry::ControlPlaneAccess;

/// Token service, probe, and access for simulated clusters
#[derive(Clone, Default)]
pub struct SimulatedControlPlane {
    cloud: SimulatedCloud,
}

impl SimulatedControlPlane {
    /// Observe clusters living in `cloud`
    pub fn new(cloud: SimulatedCloud) -> Self {
        Self { cloud }
    }
}

#[async_trait]
impl ControlPlaneProbe for SimulatedControlPlane {
    async fn control_plane_status(&self, cluster: &Cluster) -> Result<ControlPlaneStatus> {
        self.cloud.check("control_plane_status")?;

        if self.cloud.managed_control_plane(cluster.name()).is_some() {
            return Ok(ControlPlaneStatus {
                ready_nodes: 1,
                versions: vec![cluster.spec.kubernetes_version.clone()],
            });
        }

        let masters: Vec<_> = self
            .cloud
            .instances(cluster.name())
            .into_iter()
            .filter(|i| i.role.is_master() && i.status == InstanceStatus::Active)
            .collect();
        Ok(ControlPlaneStatus {
            ready_nodes: masters.len() as u32,
            versions: masters
                .into_iter()
                .filter_map(|i| i.kubernetes_version)
                .collect(),
        })
    }
}

#[async_trait]
impl BootstrapTokenService for SimulatedControlPlane {
    async fn create_join_token(&self, _cluster: &Cluster, _ttl: Duration) -> Result<JoinToken> {
        self.cloud.check("create_join_token")?;
        Ok(JoinToken::generate())
    }
}

impl ControlPlaneAccess for SimulatedControlPlane {
    fn tokens(&self, _store: Arc<dyn ResourceStore>) -> Arc<dyn BootstrapTokenService> {
        Arc::new(self.clone())
    }

    fn probe(&self, _store: Arc<dyn ResourceStore>) -> Arc<dyn ControlPlaneProbe> {
        Arc::new(self.clone())
    }
}
