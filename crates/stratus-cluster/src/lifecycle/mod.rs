//! Cluster lifecycle
//!
//! [`ClusterLifecycle`] drives a cluster through its phases:
//!
//! ```text
//! Pending ──► Ready ──► Upgrading ──► Ready
//!    │          │            │
//!    ▼          ▼            ▼
//! Failing ──► Deleting ──► Deleted
//!    │
//!    └──► Pending (retry)
//! ```
//!
//! Provisioning runs inside a guard: whatever way it ends (error, panic,
//! or returning without reaching Ready) the cluster is marked Failing and,
//! unless failed clusters are preserved, everything it created is torn
//! down again.

mod create;
mod delete;
mod upgrade;

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use chrono::Utc;
use futures::FutureExt;
use stratus_cloud::bootstrap::ScriptRenderer;
use stratus_cloud::{Actuator, ProviderHandles, ProviderRegistry};
use stratus_common::resources::{Cluster, ClusterPhase};
use stratus_common::store::ResourceStore;
use stratus_common::wait::PollConfig;
use stratus_common::{Error, Result};
use tracing::{error, info, instrument, warn};

use crate::phase::{record_reason, transition};
use crate::scaler::{Action, ActionKind, NodeGroupScaler};

pub use delete::TeardownOptions;

/// Knobs for lifecycle runs
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LifecycleConfig {
    /// Leave failed clusters in place instead of tearing them down
    pub preserve_failed: bool,
    /// Polling for instance state changes
    pub poll: PollConfig,
    /// Polling for control plane readiness
    pub control_plane_poll: PollConfig,
}

/// Collaborators for one run against one cluster
pub(crate) struct Scope {
    pub store: Arc<dyn ResourceStore>,
    pub handles: ProviderHandles,
    pub actuator: Arc<dyn Actuator>,
    pub scaler: NodeGroupScaler,
    pub config: LifecycleConfig,
}

/// Applies, upgrades, deletes and retries clusters
pub struct ClusterLifecycle {
    registry: Arc<ProviderRegistry>,
    renderer: Arc<ScriptRenderer>,
    config: LifecycleConfig,
}

impl ClusterLifecycle {
    /// Create a lifecycle over a provider registry
    pub fn new(
        registry: Arc<ProviderRegistry>,
        renderer: Arc<ScriptRenderer>,
        config: LifecycleConfig,
    ) -> Self {
        Self {
            registry,
            renderer,
            config,
        }
    }

    /// Active configuration
    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    async fn scope(&self, store: Arc<dyn ResourceStore>, cluster: &Cluster) -> Result<Scope> {
        let handles = self.registry.resolve(cluster, store.clone()).await?;
        let actuator: Arc<dyn Actuator> = Arc::new(handles.actuator(
            store.clone(),
            self.renderer.clone(),
            self.config.poll,
        ));
        let scaler = NodeGroupScaler::new(
            actuator.clone(),
            handles.connector.clone(),
            store.clone(),
            self.renderer.clone(),
        );
        Ok(Scope {
            store,
            handles,
            actuator,
            scaler,
            config: self.config,
        })
    }

    /// Bring a cluster in line with its records
    ///
    /// - Pending clusters are provisioned
    /// - Ready clusters are upgraded if their version changed, scaled otherwise
    /// - Clusters with a deletion timestamp are torn down
    /// - Deleted clusters are left alone
    #[instrument(skip(self, store), fields(owner = %store.owner()))]
    pub async fn apply(&self, store: Arc<dyn ResourceStore>, cluster: &str) -> Result<Cluster> {
        let cluster = store.get_cluster(cluster).await?;
        let phase = cluster.status.phase;

        if phase == ClusterPhase::Deleted {
            info!(cluster = %cluster.name(), "Cluster is already deleted");
            return Ok(cluster);
        }
        if cluster.metadata.is_deleting() || phase == ClusterPhase::Deleting {
            return self.run_delete(store, cluster).await;
        }

        match phase {
            ClusterPhase::Pending => self.run_create(store, cluster).await,
            ClusterPhase::Ready => self.run_reconcile(store, cluster).await,
            ClusterPhase::Upgrading => Err(Error::validation_for(
                cluster.name(),
                "cluster is being upgraded. Retry after the cluster returns to Ready state",
            )),
            ClusterPhase::Failing => Err(Error::validation_for(
                cluster.name(),
                "cluster is failing. Retry it to provision again, or delete it",
            )),
            ClusterPhase::Deleting | ClusterPhase::Deleted => Ok(cluster),
        }
    }

    /// Request deletion and tear the cluster down
    ///
    /// Node groups are marked for deletion with zero replicas first, so an
    /// interrupted delete resumes from the records.
    #[instrument(skip(self, store), fields(owner = %store.owner()))]
    pub async fn delete(&self, store: Arc<dyn ResourceStore>, cluster: &str) -> Result<Cluster> {
        let mut record = store.get_cluster(cluster).await?;
        if record.status.phase == ClusterPhase::Deleted {
            info!(cluster = %cluster, "Cluster is already deleted");
            return Ok(record);
        }

        if !record.metadata.is_deleting() {
            record.metadata.deletion_timestamp = Some(Utc::now());
            record = store.update_cluster(&record).await?;
        }

        for mut group in store.list_node_groups(cluster).await? {
            if group.metadata.is_deleting() && group.spec.replicas == 0 {
                continue;
            }
            group.spec.replicas = 0;
            group
                .metadata
                .deletion_timestamp
                .get_or_insert_with(Utc::now);
            store.update_node_group(cluster, &group).await?;
        }

        self.run_delete(store, record).await
    }

    /// Re-run whatever the cluster's phase calls for
    ///
    /// A Failing cluster goes back to Pending and is provisioned again, a
    /// Deleting cluster resumes teardown, and an Upgrading cluster resumes
    /// its upgrade. Ready and Pending clusters are applied as usual.
    #[instrument(skip(self, store), fields(owner = %store.owner()))]
    pub async fn retry(&self, store: Arc<dyn ResourceStore>, cluster: &str) -> Result<Cluster> {
        let mut record = store.get_cluster(cluster).await?;
        let phase = record.status.phase;
        info!(cluster = %cluster, phase = %phase, "Retrying cluster");

        if phase == ClusterPhase::Deleted {
            return Ok(record);
        }
        if record.metadata.is_deleting() || phase == ClusterPhase::Deleting {
            return self.run_delete(store, record).await;
        }

        match phase {
            ClusterPhase::Failing => {
                record.status.reason = None;
                transition(store.as_ref(), &mut record, ClusterPhase::Pending, None).await?;
                self.run_create(store, record).await
            }
            ClusterPhase::Upgrading => {
                let scope = self.scope(store, &record).await?;
                upgrade::run(&scope, &mut record).await?;
                Ok(record)
            }
            _ => self.apply(store, cluster).await,
        }
    }

    /// Report what applying the cluster would do, without changing anything
    pub async fn plan(&self, store: Arc<dyn ResourceStore>, cluster: &str) -> Result<Vec<Action>> {
        let record = store.get_cluster(cluster).await?;
        let scope = self.scope(store.clone(), &record).await?;
        let mut actions = Vec::new();

        if record.status.phase == ClusterPhase::Deleted {
            return Ok(actions);
        }

        let groups = store.list_node_groups(cluster).await?;
        if record.metadata.is_deleting() || record.status.phase == ClusterPhase::Deleting {
            for group in &groups {
                actions.push(Action {
                    kind: ActionKind::Delete,
                    resource: format!("NodeGroup/{}", group.name()),
                    message: "node group will be deleted".to_string(),
                });
            }
            actions.push(Action {
                kind: ActionKind::Delete,
                resource: format!("Cluster/{cluster}"),
                message: "cluster infrastructure will be deleted".to_string(),
            });
            return Ok(actions);
        }

        if record.status.phase == ClusterPhase::Pending {
            if record.spec.provider.is_managed() {
                if record.status.cloud.managed_control_plane_id.is_none() {
                    actions.push(Action {
                        kind: ActionKind::Add,
                        resource: format!("ManagedControlPlane/{cluster}"),
                        message: "managed control plane will be created".to_string(),
                    });
                }
            } else {
                for machine in create::masters(store.as_ref(), cluster).await? {
                    if !scope.actuator.exists(&record, &machine).await? {
                        actions.push(Action {
                            kind: ActionKind::Add,
                            resource: format!("Machine/{}", machine.name()),
                            message: "master machine will be created".to_string(),
                        });
                    }
                }
            }
        }

        if record.upgrade_requested() {
            actions.push(Action {
                kind: ActionKind::Upgrade,
                resource: format!("Cluster/{cluster}"),
                message: format!(
                    "cluster will be upgraded from {} to {}",
                    record.status.kubernetes_version.as_deref().unwrap_or_default(),
                    record.spec.kubernetes_version
                ),
            });
        }

        for group in &groups {
            let action = scope.scaler.plan(&record, group).await?;
            actions.push(action.describe(group.name()));
        }
        Ok(actions)
    }

    /// Provision a Pending cluster under the cleanup guard
    async fn run_create(&self, store: Arc<dyn ResourceStore>, mut cluster: Cluster) -> Result<Cluster> {
        let scope = match self.scope(store.clone(), &cluster).await {
            Ok(scope) => scope,
            Err(e) => {
                // Nothing was created, so there is nothing to clean up
                transition(
                    store.as_ref(),
                    &mut cluster,
                    ClusterPhase::Failing,
                    Some(e.to_string()),
                )
                .await?;
                return Err(e);
            }
        };

        let name = cluster.name().to_string();
        let outcome = AssertUnwindSafe(create::run(&scope, &mut cluster))
            .catch_unwind()
            .await;
        let result = match outcome {
            Ok(result) => result,
            Err(panic) => Err(Error::internal_with_context(
                "lifecycle",
                format!("provisioning panicked: {}", panic_message(&panic)),
            )),
        };

        let mut current = match store.get_cluster(&name).await {
            Ok(current) => current,
            Err(e) => {
                warn!(cluster = %name, error = %e, "Failed to reload cluster, using last known state");
                cluster
            }
        };
        let err = match result {
            Ok(()) if current.status.phase == ClusterPhase::Ready => return Ok(current),
            Ok(()) => Error::internal_with_context(
                "lifecycle",
                format!("provisioning ended in phase {}", current.status.phase),
            ),
            Err(e) => e,
        };

        error!(cluster = %name, error = %err, "Provisioning failed");
        self.cleanup_failed(&scope, &mut current, &err).await;
        Err(err)
    }

    /// Mark a cluster Failing and tear down what provisioning left behind
    async fn cleanup_failed(&self, scope: &Scope, cluster: &mut Cluster, err: &Error) {
        if let Err(e) = transition(
            scope.store.as_ref(),
            cluster,
            ClusterPhase::Failing,
            Some(err.to_string()),
        )
        .await
        {
            warn!(cluster = %cluster.name(), error = %e, "Failed to mark cluster Failing");
        }

        if self.config.preserve_failed {
            info!(cluster = %cluster.name(), "Preserving failed cluster for inspection");
            return;
        }

        info!(cluster = %cluster.name(), "Cleaning up failed cluster");
        if let Err(e) = delete::teardown(scope, cluster, TeardownOptions::cleanup()).await {
            warn!(cluster = %cluster.name(), error = %e, "Cleanup of failed cluster was incomplete");
        }
    }

    /// Scale a Ready cluster, or upgrade it if its version changed
    async fn run_reconcile(&self, store: Arc<dyn ResourceStore>, mut cluster: Cluster) -> Result<Cluster> {
        let scope = self.scope(store, &cluster).await?;

        if cluster.upgrade_requested() {
            upgrade::run(&scope, &mut cluster).await?;
            return Ok(cluster);
        }

        match scale(&scope, &mut cluster).await {
            Ok(()) => {
                if cluster.status.reason.is_some() {
                    transition(scope.store.as_ref(), &mut cluster, ClusterPhase::Ready, None).await?;
                }
                Ok(cluster)
            }
            Err(e) => {
                record_reason(scope.store.as_ref(), &mut cluster, e.to_string()).await?;
                Err(e)
            }
        }
    }

    /// Tear a cluster down and mark it Deleted
    async fn run_delete(&self, store: Arc<dyn ResourceStore>, mut cluster: Cluster) -> Result<Cluster> {
        transition(store.as_ref(), &mut cluster, ClusterPhase::Deleting, None).await?;

        let scope = match self.scope(store.clone(), &cluster).await {
            Ok(scope) => scope,
            Err(e) => {
                record_reason(store.as_ref(), &mut cluster, e.to_string()).await?;
                return Err(e);
            }
        };

        match delete::teardown(&scope, &mut cluster, TeardownOptions::delete()).await {
            Ok(()) => {
                cluster.status.reason = None;
                transition(store.as_ref(), &mut cluster, ClusterPhase::Deleted, None).await?;
                info!(cluster = %cluster.name(), "Cluster deleted");
                Ok(cluster)
            }
            Err(e) => {
                record_reason(store.as_ref(), &mut cluster, e.to_string()).await?;
                Err(e)
            }
        }
    }
}

/// Reconcile every node group of a cluster
///
/// Every group gets its pass; the first failure is returned afterwards.
pub(crate) async fn scale(scope: &Scope, cluster: &mut Cluster) -> Result<()> {
    let mut first_error = None;
    for mut group in scope.store.list_node_groups(cluster.name()).await? {
        if let Err(e) = scope.scaler.reconcile(cluster, &mut group).await {
            first_error.get_or_insert(e);
        }
    }
    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

fn panic_message(panic: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
