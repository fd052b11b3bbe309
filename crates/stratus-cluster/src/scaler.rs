//! Node group scaling
//!
//! Scaling is split in two:
//! - [`plan`] is a pure function from desired and observed counts to a
//!   [`ScaleAction`]
//! - [`NodeGroupScaler`] lists the group's instances, executes the action
//!   through the [`Actuator`], and records what it observed afterwards
//!
//! A pass never rolls back. If the third of five creates fails, two new
//! instances stay, the group's status says so, and the next pass picks up
//! from there.

use std::sync::Arc;

use rand::Rng;
use stratus_cloud::bootstrap::ScriptRenderer;
use stratus_cloud::{Actuator, CloudConnector, Instance, InstanceFilter, InstanceStatus};
use stratus_common::resources::{
    Cluster, Machine, MachineSpec, MachineVersions, NodeGroup, NODE_GROUP_LABEL,
};
use stratus_common::store::ResourceStore;
use stratus_common::Result;
use tracing::{debug, info, instrument, warn};

/// What one scaling pass does to a node group
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScaleAction {
    /// Desired and observed agree
    Nop,
    /// The group has no instances yet; create its shared resources, then `count` instances
    CreateGroup {
        /// Instances to create
        count: u32,
    },
    /// Add instances to an existing group
    Grow {
        /// Instances to create
        count: u32,
    },
    /// Remove some instances from a group that stays
    Shrink {
        /// Instances to delete
        count: u32,
    },
    /// Remove every instance and the group's shared resources
    DeleteGroup {
        /// Instances to delete
        count: u32,
    },
}

impl ScaleAction {
    /// Instances created or deleted by this action
    pub fn count(&self) -> u32 {
        match self {
            Self::Nop => 0,
            Self::CreateGroup { count }
            | Self::Grow { count }
            | Self::Shrink { count }
            | Self::DeleteGroup { count } => *count,
        }
    }

    /// Dry-run description of this action against `group`
    pub fn describe(&self, group: &str) -> Action {
        let (kind, message) = match self {
            Self::Nop => (ActionKind::Nop, "node group is at its desired size".to_string()),
            Self::CreateGroup { count } => (
                ActionKind::Add,
                format!("node group will be created with {count} instance(s)"),
            ),
            Self::Grow { count } => (ActionKind::Add, format!("{count} instance(s) will be added")),
            Self::Shrink { count } => (
                ActionKind::Delete,
                format!("{count} instance(s) will be deleted"),
            ),
            Self::DeleteGroup { count } => (
                ActionKind::Delete,
                format!("node group will be deleted with its {count} instance(s)"),
            ),
        };
        Action {
            kind,
            resource: format!("NodeGroup/{group}"),
            message,
        }
    }
}

/// Compute the scaling action for a group
///
/// `Nop` iff `desired == observed`; otherwise a create of the whole group
/// when nothing is observed, a delete of the whole group when nothing is
/// desired, and a grow or shrink by the difference in between.
pub fn plan(desired: u32, observed: u32) -> ScaleAction {
    match (desired, observed) {
        (d, o) if d == o => ScaleAction::Nop,
        (d, 0) => ScaleAction::CreateGroup { count: d },
        (0, o) => ScaleAction::DeleteGroup { count: o },
        (d, o) if d > o => ScaleAction::Grow { count: d - o },
        (d, o) => ScaleAction::Shrink { count: o - d },
    }
}

/// Kind of change a dry run reports
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActionKind {
    /// Nothing changes
    Nop,
    /// Something is created
    Add,
    /// Something is deleted
    Delete,
    /// Something is upgraded in place or replaced
    Upgrade,
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Nop => write!(f, "Nop"),
            Self::Add => write!(f, "Add"),
            Self::Delete => write!(f, "Delete"),
            Self::Upgrade => write!(f, "Upgrade"),
        }
    }
}

/// One entry of a dry-run plan
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Action {
    /// Kind of change
    pub kind: ActionKind,
    /// Affected resource, as `Kind/name`
    pub resource: String,
    /// Human-readable description
    pub message: String,
}

/// Outcome of a scaling pass
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScaleOutcome {
    /// Action that was executed
    pub action: ScaleAction,
    /// Instances observed after the pass
    pub observed: u32,
    /// True if the group record was removed
    pub removed: bool,
}

/// Executes scaling passes for one cluster's node groups
pub struct NodeGroupScaler {
    actuator: Arc<dyn Actuator>,
    connector: Arc<dyn CloudConnector>,
    store: Arc<dyn ResourceStore>,
    renderer: Arc<ScriptRenderer>,
}

impl NodeGroupScaler {
    /// Create a scaler
    pub fn new(
        actuator: Arc<dyn Actuator>,
        connector: Arc<dyn CloudConnector>,
        store: Arc<dyn ResourceStore>,
        renderer: Arc<ScriptRenderer>,
    ) -> Self {
        Self {
            actuator,
            connector,
            store,
            renderer,
        }
    }

    /// Live instances of a group, oldest first
    pub async fn observe(&self, cluster: &Cluster, group: &NodeGroup) -> Result<Vec<Instance>> {
        let mut instances: Vec<Instance> = self
            .connector
            .list_instances(&InstanceFilter::node_group(cluster.name(), group.name()))
            .await?
            .into_iter()
            .filter(|i| i.status != InstanceStatus::Deleting)
            .collect();
        instances.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.name.cmp(&b.name)));
        Ok(instances)
    }

    /// Dry-run the next pass for a group
    pub async fn plan(&self, cluster: &Cluster, group: &NodeGroup) -> Result<ScaleAction> {
        let observed = self.observe(cluster, group).await?.len() as u32;
        Ok(plan(desired(group), observed))
    }

    /// Run one scaling pass and persist the group's observed status
    ///
    /// On a mid-pass failure the status still reflects what exists, the
    /// failure is recorded in the group's reason, and the error is returned.
    #[instrument(skip(self, cluster, group), fields(cluster = %cluster.name(), node_group = %group.name()))]
    pub async fn reconcile(&self, cluster: &mut Cluster, group: &mut NodeGroup) -> Result<ScaleOutcome> {
        let instances = self.observe(cluster, group).await?;
        let desired = desired(group);
        let action = plan(desired, instances.len() as u32);
        info!(desired, observed = instances.len(), action = ?action, "Reconciling node group");

        let result = self.execute(cluster, group, action, &instances).await;

        let observed = self.observe(cluster, group).await?.len() as u32;
        if let Err(e) = &result {
            warn!(error = %e, observed, "Node group pass failed");
        }

        if desired == 0 && observed == 0 && result.is_ok() {
            self.remove_startup_script(group).await?;
            self.store
                .delete_node_group(cluster.name(), group.name())
                .await?;
            info!("Node group removed");
            return Ok(ScaleOutcome {
                action,
                observed,
                removed: true,
            });
        }

        group.status.replicas = observed;
        group.status.observed_generation = group.metadata.generation;
        group.status.reason = result.as_ref().err().map(|e| e.to_string());
        *group = self
            .store
            .update_node_group_status(cluster.name(), group)
            .await?;

        result.map(|()| ScaleOutcome {
            action,
            observed,
            removed: false,
        })
    }

    /// Delete every instance of a group and its startup script, keeping the record
    #[instrument(skip(self, cluster, group), fields(cluster = %cluster.name(), node_group = %group.name()))]
    pub async fn drain(&self, cluster: &mut Cluster, group: &mut NodeGroup) -> Result<()> {
        let instances = self.observe(cluster, group).await?;
        info!(observed = instances.len(), "Draining node group");

        let mut result = self.remove(cluster, &instances).await;
        if result.is_ok() {
            result = self.remove_startup_script(group).await;
        }

        group.status.replicas = self.observe(cluster, group).await?.len() as u32;
        group.status.reason = result.as_ref().err().map(|e| e.to_string());
        *group = self
            .store
            .update_node_group_status(cluster.name(), group)
            .await?;
        result
    }

    async fn execute(
        &self,
        cluster: &mut Cluster,
        group: &NodeGroup,
        action: ScaleAction,
        instances: &[Instance],
    ) -> Result<()> {
        match action {
            ScaleAction::Nop => Ok(()),
            ScaleAction::CreateGroup { count } => {
                let script = self.renderer.node_group(cluster, group)?;
                self.connector
                    .ensure_startup_script(group.name(), &script)
                    .await?;
                self.add(cluster, group, count).await
            }
            ScaleAction::Grow { count } => {
                if self.connector.find_startup_script(group.name()).await?.is_none() {
                    let script = self.renderer.node_group(cluster, group)?;
                    self.connector
                        .ensure_startup_script(group.name(), &script)
                        .await?;
                }
                self.add(cluster, group, count).await
            }
            ScaleAction::Shrink { count } => {
                self.remove(cluster, &instances[..count as usize]).await
            }
            ScaleAction::DeleteGroup { .. } => self.remove(cluster, instances).await,
        }
    }

    async fn add(&self, cluster: &mut Cluster, group: &NodeGroup, count: u32) -> Result<()> {
        for _ in 0..count {
            let mut machine = machine_for(cluster, group);
            debug!(machine = %machine.name(), "Adding machine");
            self.actuator.create(cluster, &mut machine).await?;
        }
        Ok(())
    }

    async fn remove(&self, cluster: &mut Cluster, victims: &[Instance]) -> Result<()> {
        let records = self.store.list_machines(cluster.name()).await?;
        for instance in victims {
            let machine = records
                .iter()
                .find(|m| {
                    m.status.provider_id.as_deref() == Some(instance.provider_id.as_str())
                        || m.name() == instance.name
                })
                .cloned()
                .unwrap_or_else(|| untracked(instance));
            debug!(machine = %machine.name(), provider_id = %instance.provider_id, "Removing machine");
            self.actuator.delete(cluster, &machine).await?;
        }
        Ok(())
    }

    async fn remove_startup_script(&self, group: &NodeGroup) -> Result<()> {
        if let Some(id) = self.connector.find_startup_script(group.name()).await? {
            self.connector.delete_startup_script(&id).await?;
        }
        Ok(())
    }
}

/// Desired count; a group being deleted wants nothing
fn desired(group: &NodeGroup) -> u32 {
    if group.metadata.is_deleting() {
        0
    } else {
        group.spec.replicas
    }
}

const NAME_SUFFIX_CHARS: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

fn random_suffix() -> String {
    let mut rng = rand::thread_rng();
    (0..5)
        .map(|_| NAME_SUFFIX_CHARS[rng.gen_range(0..NAME_SUFFIX_CHARS.len())] as char)
        .collect()
}

/// A new machine from the group's template
fn machine_for(cluster: &Cluster, group: &NodeGroup) -> Machine {
    let template = &group.spec.template;
    let mut labels = template.labels.clone();
    labels.insert(NODE_GROUP_LABEL.to_string(), group.name().to_string());

    let mut machine = Machine::new(
        format!("{}-{}", group.name(), random_suffix()),
        MachineSpec {
            role: template.role,
            node_group: Some(group.name().to_string()),
            sku: template.sku.clone(),
            versions: MachineVersions {
                kubelet: cluster.spec.kubernetes_version.clone(),
                control_plane: None,
            },
            labels,
            provider_spec: template.provider_spec.clone(),
        },
    );
    machine
        .metadata
        .labels
        .insert(NODE_GROUP_LABEL.to_string(), group.name().to_string());
    machine
}

/// Stand-in record for an instance the store does not know about
pub(crate) fn untracked(instance: &Instance) -> Machine {
    let mut machine = Machine::new(
        instance.name.clone(),
        MachineSpec {
            role: instance.role,
            node_group: instance.node_group.clone(),
            sku: String::new(),
            versions: MachineVersions::default(),
            labels: Default::default(),
            provider_spec: stratus_common::resources::ProviderBlob {
                provider: cluster_provider(instance),
                value: serde_json::Value::Null,
            },
        },
    );
    machine.status.provider_id = Some(instance.provider_id.clone());
    machine
}

fn cluster_provider(instance: &Instance) -> stratus_common::resources::ProviderType {
    instance
        .provider_id
        .split_once("://")
        .and_then(|(provider, _)| provider.parse().ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Harness;
    use stratus_cloud::simulated::Fault;
    use stratus_common::resources::ProviderType;

    // =========================================================================
    // Planning
    // =========================================================================

    #[test]
    fn test_plan_nop_iff_equal() {
        for n in 0..6 {
            assert_eq!(plan(n, n), ScaleAction::Nop);
        }
        assert_ne!(plan(1, 2), ScaleAction::Nop);
    }

    #[test]
    fn test_plan_covers_every_pair() {
        for d in 0..8u32 {
            for o in 0..8u32 {
                let action = plan(d, o);
                match action {
                    ScaleAction::Nop => assert_eq!(d, o),
                    ScaleAction::CreateGroup { count } => {
                        assert!(o == 0 && d > 0);
                        assert_eq!(count, d);
                    }
                    ScaleAction::DeleteGroup { count } => {
                        assert!(d == 0 && o > 0);
                        assert_eq!(count, o);
                    }
                    ScaleAction::Grow { count } | ScaleAction::Shrink { count } => {
                        assert!(d > 0 && o > 0);
                        assert_eq!(count, d.abs_diff(o));
                    }
                }
            }
        }
    }

    #[test]
    fn test_plan_examples() {
        assert_eq!(plan(3, 0), ScaleAction::CreateGroup { count: 3 });
        assert_eq!(plan(0, 4), ScaleAction::DeleteGroup { count: 4 });
        assert_eq!(plan(5, 8), ScaleAction::Shrink { count: 3 });
        assert_eq!(plan(5, 2), ScaleAction::Grow { count: 3 });
    }

    #[test]
    fn test_describe_for_dry_run() {
        let action = ScaleAction::CreateGroup { count: 3 }.describe("prod-s-2vcpu-4gb");
        assert_eq!(action.kind, ActionKind::Add);
        assert_eq!(action.resource, "NodeGroup/prod-s-2vcpu-4gb");
        assert!(action.message.contains("3 instance(s)"));
        assert_eq!(ScaleAction::Nop.describe("g").kind, ActionKind::Nop);
    }

    #[test]
    fn test_machine_names_are_group_prefixed() {
        let cluster = Cluster::new("prod", Default::default());
        let group = NodeGroup::new(
            "prod",
            1,
            crate::testing::template(ProviderType::DigitalOcean, "s-1vcpu-2gb"),
        );
        let a = machine_for(&cluster, &group);
        let b = machine_for(&cluster, &group);
        assert!(a.name().starts_with("prod-s-1vcpu-2gb-"));
        assert_eq!(a.name().len(), "prod-s-1vcpu-2gb-".len() + 5);
        assert_ne!(a.name(), b.name());
        assert_eq!(a.metadata.labels[NODE_GROUP_LABEL], group.name());
        assert_eq!(a.spec.node_group.as_deref(), Some(group.name()));
    }

    // =========================================================================
    // Story Tests: Scaling passes against the simulated cloud
    // =========================================================================

    fn scaler(h: &Harness) -> NodeGroupScaler {
        NodeGroupScaler::new(h.actuator(), h.connector(), h.store.clone(), h.renderer.clone())
    }

    /// Story: A new group of three creates its startup script once
    #[tokio::test(start_paused = true)]
    async fn story_new_group_creates_script_once() {
        let h = Harness::new().await;
        let mut cluster = h.provisioned("prod").await;
        let mut group = h.node_group(&cluster, 3).await;

        let outcome = scaler(&h).reconcile(&mut cluster, &mut group).await.unwrap();

        assert_eq!(outcome.action, ScaleAction::CreateGroup { count: 3 });
        assert_eq!(outcome.observed, 3);
        assert_eq!(h.workers("prod"), 3);
        assert_eq!(h.cloud.calls("ensure_startup_script"), 1);
        assert_eq!(h.cloud.calls("create_instance"), 3);

        let stored = h.store.get_node_group("prod", group.name()).await.unwrap();
        assert_eq!(stored.status.replicas, 3);
        assert!(stored.status.reason.is_none());
        assert_eq!(stored.status.observed_generation, stored.metadata.generation);
        assert_eq!(h.store.list_machines("prod").await.unwrap().len(), 4);
    }

    /// Story: Scaling 8 down to 5 deletes the three oldest instances
    #[tokio::test(start_paused = true)]
    async fn story_shrink_deletes_oldest_first() {
        let h = Harness::new().await;
        let mut cluster = h.provisioned("prod").await;
        let mut group = h.node_group(&cluster, 8).await;
        let scaler = scaler(&h);
        scaler.reconcile(&mut cluster, &mut group).await.unwrap();
        let before = scaler.observe(&cluster, &group).await.unwrap();

        group.spec.replicas = 5;
        let mut group = h.store.update_node_group("prod", &group).await.unwrap();
        let outcome = scaler.reconcile(&mut cluster, &mut group).await.unwrap();

        assert_eq!(outcome.action, ScaleAction::Shrink { count: 3 });
        let after: Vec<String> = scaler
            .observe(&cluster, &group)
            .await
            .unwrap()
            .into_iter()
            .map(|i| i.name)
            .collect();
        let expected: Vec<String> = before[3..].iter().map(|i| i.name.clone()).collect();
        assert_eq!(after, expected);
        assert_eq!(group.status.replicas, 5);
    }

    /// Story: Growing reuses the existing startup script
    #[tokio::test(start_paused = true)]
    async fn story_grow_reuses_script() {
        let h = Harness::new().await;
        let mut cluster = h.provisioned("prod").await;
        let mut group = h.node_group(&cluster, 2).await;
        let scaler = scaler(&h);
        scaler.reconcile(&mut cluster, &mut group).await.unwrap();

        group.spec.replicas = 4;
        let mut group = h.store.update_node_group("prod", &group).await.unwrap();
        let outcome = scaler.reconcile(&mut cluster, &mut group).await.unwrap();

        assert_eq!(outcome.action, ScaleAction::Grow { count: 2 });
        assert_eq!(h.workers("prod"), 4);
        assert_eq!(h.cloud.calls("ensure_startup_script"), 1);
    }

    /// Story: Scaling to zero tears everything down and drops the record
    #[tokio::test(start_paused = true)]
    async fn story_delete_group_removes_script_and_record() {
        let h = Harness::new().await;
        let mut cluster = h.provisioned("prod").await;
        let mut group = h.node_group(&cluster, 4).await;
        let scaler = scaler(&h);
        scaler.reconcile(&mut cluster, &mut group).await.unwrap();
        assert!(h.cloud.startup_script(group.name()).is_some());

        group.spec.replicas = 0;
        let mut group = h.store.update_node_group("prod", &group).await.unwrap();
        let outcome = scaler.reconcile(&mut cluster, &mut group).await.unwrap();

        assert_eq!(outcome.action, ScaleAction::DeleteGroup { count: 4 });
        assert!(outcome.removed);
        assert_eq!(h.workers("prod"), 0);
        assert!(h.cloud.startup_script(group.name()).is_none());
        assert!(h
            .store
            .get_node_group("prod", group.name())
            .await
            .unwrap_err()
            .is_not_found());
        // Only the master record is left
        assert_eq!(h.store.list_machines("prod").await.unwrap().len(), 1);
    }

    /// Story: Three of five creates succeed; status reports three
    #[tokio::test(start_paused = true)]
    async fn story_partial_failure_records_observed_count() {
        let h = Harness::new().await;
        let mut cluster = h.provisioned("prod").await;
        let mut group = h.node_group(&cluster, 5).await;
        h.cloud.inject(Fault::permanent("create_instance").after(3));

        let err = scaler(&h)
            .reconcile(&mut cluster, &mut group)
            .await
            .unwrap_err();

        assert!(err.to_string().contains("injected failure in create_instance"));
        assert_eq!(h.cloud.calls("create_instance"), 4);
        let stored = h.store.get_node_group("prod", group.name()).await.unwrap();
        assert_eq!(stored.status.replicas, 3);
        assert!(stored
            .status
            .reason
            .as_deref()
            .is_some_and(|r| r.contains("create_instance")));

        // The next pass finishes the job
        h.cloud.clear_faults();
        let mut group = stored;
        let outcome = scaler(&h).reconcile(&mut cluster, &mut group).await.unwrap();
        assert_eq!(outcome.action, ScaleAction::Grow { count: 2 });
        assert_eq!(group.status.replicas, 5);
        assert!(group.status.reason.is_none());
    }

    /// Story: A group marked for deletion is scaled to zero whatever its spec says
    #[tokio::test(start_paused = true)]
    async fn story_deleting_group_wants_nothing() {
        let h = Harness::new().await;
        let mut cluster = h.provisioned("prod").await;
        let mut group = h.node_group(&cluster, 2).await;
        let scaler = scaler(&h);
        scaler.reconcile(&mut cluster, &mut group).await.unwrap();

        group.metadata.deletion_timestamp = Some(chrono::Utc::now());
        assert_eq!(
            scaler.plan(&cluster, &group).await.unwrap(),
            ScaleAction::DeleteGroup { count: 2 }
        );
    }

    /// Story: Instances the store never recorded are still removed
    #[tokio::test(start_paused = true)]
    async fn story_untracked_instances_are_removed() {
        let h = Harness::new().await;
        let mut cluster = h.provisioned("prod").await;
        let mut group = h.node_group(&cluster, 2).await;
        let scaler = scaler(&h);
        scaler.reconcile(&mut cluster, &mut group).await.unwrap();

        // Lose the worker records, as if a crash happened before persisting
        for machine in h.store.list_machines("prod").await.unwrap() {
            if !machine.is_master() {
                h.store.delete_machine("prod", machine.name()).await.unwrap();
            }
        }

        group.spec.replicas = 0;
        let mut group = h.store.update_node_group("prod", &group).await.unwrap();
        scaler.reconcile(&mut cluster, &mut group).await.unwrap();
        assert_eq!(h.workers("prod"), 0);
    }

    #[test]
    fn test_untracked_provider_from_id() {
        let instance = Instance {
            provider_id: "linode://42".into(),
            name: "prod-g6-x".into(),
            node_group: Some("prod-g6".into()),
            role: stratus_common::resources::MachineRole::Node,
            status: InstanceStatus::Active,
            public_ip: None,
            private_ip: None,
            created_at: chrono::Utc::now(),
            kubernetes_version: None,
        };
        let machine = untracked(&instance);
        assert_eq!(machine.spec.provider_spec.provider, ProviderType::Linode);
        assert_eq!(machine.status.provider_id.as_deref(), Some("linode://42"));
    }
}
