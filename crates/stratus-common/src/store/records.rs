//! Record semantics shared by every store backend

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use super::{ResourceStore, Store};
use crate::resources::{
    Cluster, Credential, Machine, NodeGroup, ObjectMeta, Operation, OperationState,
};
use crate::{Error, Result};

/// Record kinds, used as the top level of a record key
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Kind {
    /// Operation, global
    Operation,
    /// Cluster UID to owner/name, global
    ClusterIndex,
    /// Cluster, owner-scoped
    Cluster,
    /// Node group, cluster-scoped
    NodeGroup,
    /// Machine, cluster-scoped
    Machine,
    /// Credential, owner-scoped
    Credential,
    /// Admin kubeconfig, cluster-scoped
    Kubeconfig,
}

impl Kind {
    /// Directory-safe plural name
    pub fn as_str(&self) -> &'static str {
        match self {
            Kind::Operation => "operations",
            Kind::ClusterIndex => "cluster-index",
            Kind::Cluster => "clusters",
            Kind::NodeGroup => "nodegroups",
            Kind::Machine => "machines",
            Kind::Credential => "credentials",
            Kind::Kubeconfig => "kubeconfigs",
        }
    }

    fn singular(&self) -> &'static str {
        match self {
            Kind::Operation => "operation",
            Kind::ClusterIndex => "cluster id",
            Kind::Cluster => "cluster",
            Kind::NodeGroup => "node group",
            Kind::Machine => "machine",
            Kind::Credential => "credential",
            Kind::Kubeconfig => "kubeconfig",
        }
    }
}

/// Address of one record
///
/// Global records use an empty owner; records not owned by a cluster use an
/// empty parent.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordKey {
    /// Record kind
    pub kind: Kind,
    /// Owning tenant
    pub owner: String,
    /// Owning cluster
    pub parent: String,
    /// Record name
    pub name: String,
}

impl RecordKey {
    fn global(kind: Kind, name: &str) -> Self {
        Self {
            kind,
            owner: String::new(),
            parent: String::new(),
            name: name.to_string(),
        }
    }

    fn scoped(kind: Kind, owner: &str, parent: &str, name: &str) -> Self {
        Self {
            kind,
            owner: owner.to_string(),
            parent: parent.to_string(),
            name: name.to_string(),
        }
    }
}

/// Raw JSON storage underneath [`RecordStore`]
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// Read a record, `None` if absent
    async fn read(&self, key: &RecordKey) -> Result<Option<Value>>;
    /// Write a record, replacing any previous value
    async fn write(&self, key: &RecordKey, value: &Value) -> Result<()>;
    /// Replace a record only if it still holds `expected`
    ///
    /// The comparison and the write happen as one step; returns whether the
    /// write happened.
    async fn swap(&self, key: &RecordKey, expected: &Value, value: &Value) -> Result<bool>;
    /// Remove a record; returns whether it existed
    async fn remove(&self, key: &RecordKey) -> Result<bool>;
    /// Every record of `kind` under `owner` and `parent`, ordered by name
    async fn list(&self, kind: Kind, owner: &str, parent: &str) -> Result<Vec<Value>>;
}

/// Records that carry metadata and a status subresource
trait Record: Serialize + DeserializeOwned + Clone + Send + Sync {
    const KIND: Kind;

    fn meta(&self) -> &ObjectMeta;
    fn meta_mut(&mut self) -> &mut ObjectMeta;
    fn same_spec(&self, other: &Self) -> bool;
    fn copy_status_from(&mut self, other: &Self);
}

macro_rules! impl_record {
    ($ty:ty, $kind:expr) => {
        impl Record for $ty {
            const KIND: Kind = $kind;

            fn meta(&self) -> &ObjectMeta {
                &self.metadata
            }
            fn meta_mut(&mut self) -> &mut ObjectMeta {
                &mut self.metadata
            }
            fn same_spec(&self, other: &Self) -> bool {
                self.spec == other.spec
            }
            fn copy_status_from(&mut self, other: &Self) {
                self.status = other.status.clone();
            }
        }
    };
}

impl_record!(Cluster, Kind::Cluster);
impl_record!(NodeGroup, Kind::NodeGroup);
impl_record!(Machine, Kind::Machine);

#[derive(Debug, Serialize, Deserialize)]
struct ClusterIndexEntry {
    owner: String,
    name: String,
}

fn decode<T: DeserializeOwned>(kind: Kind, value: Value) -> Result<T> {
    serde_json::from_value(value).map_err(|e| Error::serialization_for_kind(kind.as_str(), e.to_string()))
}

fn encode<T: Serialize>(kind: Kind, record: &T) -> Result<Value> {
    serde_json::to_value(record).map_err(|e| Error::serialization_for_kind(kind.as_str(), e.to_string()))
}

/// Store implementation over any [`Backend`]
pub struct RecordStore<B: Backend> {
    backend: Arc<B>,
}

impl<B: Backend> Clone for RecordStore<B> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
        }
    }
}

impl<B: Backend> RecordStore<B> {
    /// Wrap a backend
    pub fn new(backend: B) -> Self {
        Self {
            backend: Arc::new(backend),
        }
    }

    /// Concrete owner scope, for callers that want the full type
    pub fn scope(&self, owner: &str) -> ScopedStore<B> {
        ScopedStore {
            backend: self.backend.clone(),
            owner: owner.to_string(),
        }
    }
}

#[async_trait]
impl<B: Backend> Store for RecordStore<B> {
    async fn get_operation(&self, id: &str) -> Result<Operation> {
        let key = RecordKey::global(Kind::Operation, id);
        match self.backend.read(&key).await? {
            Some(value) => decode(Kind::Operation, value),
            None => Err(Error::not_found(Kind::Operation.singular(), id)),
        }
    }

    async fn create_operation(&self, operation: &Operation) -> Result<Operation> {
        let key = RecordKey::global(Kind::Operation, &operation.id);
        if self.backend.read(&key).await?.is_some() {
            return Err(Error::validation(format!(
                "operation {} already exists",
                operation.id
            )));
        }
        self.backend.write(&key, &encode(Kind::Operation, operation)?).await?;
        Ok(operation.clone())
    }

    async fn update_operation(&self, operation: &Operation) -> Result<Operation> {
        let key = RecordKey::global(Kind::Operation, &operation.id);
        if self.backend.read(&key).await?.is_none() {
            return Err(Error::not_found(Kind::Operation.singular(), &operation.id));
        }
        let mut updated = operation.clone();
        updated.updated_at = Utc::now();
        self.backend.write(&key, &encode(Kind::Operation, &updated)?).await?;
        Ok(updated)
    }

    async fn claim_operation(
        &self,
        id: &str,
        from: OperationState,
        to: OperationState,
    ) -> Result<Option<Operation>> {
        let key = RecordKey::global(Kind::Operation, id);
        loop {
            let Some(current) = self.backend.read(&key).await? else {
                return Err(Error::not_found(Kind::Operation.singular(), id));
            };
            let mut operation: Operation = decode(Kind::Operation, current.clone())?;
            if operation.state != from {
                debug!(operation_id = id, state = %operation.state, "Operation already claimed");
                return Ok(None);
            }
            operation.set_state(to);
            let next = encode(Kind::Operation, &operation)?;
            if self.backend.swap(&key, &current, &next).await? {
                return Ok(Some(operation));
            }
            // Lost a race with another writer; look again
        }
    }

    async fn find_cluster_by_id(&self, id: &str) -> Result<(String, Cluster)> {
        let key = RecordKey::global(Kind::ClusterIndex, id);
        let entry: ClusterIndexEntry = match self.backend.read(&key).await? {
            Some(value) => decode(Kind::ClusterIndex, value)?,
            None => return Err(Error::not_found(Kind::ClusterIndex.singular(), id)),
        };
        let cluster = self.scope(&entry.owner).get_cluster(&entry.name).await?;
        Ok((entry.owner, cluster))
    }

    fn scoped(&self, owner: &str) -> Arc<dyn ResourceStore> {
        Arc::new(self.scope(owner))
    }
}

/// Owner-scoped view of a [`RecordStore`]
pub struct ScopedStore<B: Backend> {
    backend: Arc<B>,
    owner: String,
}

impl<B: Backend> ScopedStore<B> {
    fn key(&self, kind: Kind, parent: &str, name: &str) -> RecordKey {
        RecordKey::scoped(kind, &self.owner, parent, name)
    }

    async fn get<R: Record>(&self, parent: &str, name: &str) -> Result<R> {
        match self.backend.read(&self.key(R::KIND, parent, name)).await? {
            Some(value) => decode(R::KIND, value),
            None => Err(Error::not_found(R::KIND.singular(), name)),
        }
    }

    async fn list<R: Record>(&self, parent: &str) -> Result<Vec<R>> {
        self.backend
            .list(R::KIND, &self.owner, parent)
            .await?
            .into_iter()
            .map(|value| decode(R::KIND, value))
            .collect()
    }

    async fn create<R: Record>(&self, parent: &str, record: &R) -> Result<R> {
        let name = record.meta().name.clone();
        if name.is_empty() {
            return Err(Error::validation(format!("{} name is required", R::KIND.singular())));
        }
        let key = self.key(R::KIND, parent, &name);
        if self.backend.read(&key).await?.is_some() {
            return Err(Error::validation(format!(
                "{} {} already exists",
                R::KIND.singular(),
                name
            )));
        }

        let mut created = record.clone();
        let meta = created.meta_mut();
        if meta.uid.is_empty() {
            meta.uid = uuid::Uuid::new_v4().to_string();
        }
        if meta.creation_timestamp.is_none() {
            meta.creation_timestamp = Some(Utc::now());
        }
        meta.generation = meta.generation.max(1);
        meta.resource_version = 1;

        self.backend.write(&key, &encode(R::KIND, &created)?).await?;
        debug!(kind = R::KIND.as_str(), owner = %self.owner, name = %name, "Created record");
        Ok(created)
    }

    async fn update<R: Record>(&self, parent: &str, record: &R) -> Result<R> {
        let current: R = self.get(parent, &record.meta().name).await?;

        let mut updated = record.clone();
        updated.copy_status_from(&current);
        let generation = if current.same_spec(record) {
            current.meta().generation
        } else {
            current.meta().generation + 1
        };
        let meta = updated.meta_mut();
        meta.uid = current.meta().uid.clone();
        meta.creation_timestamp = current.meta().creation_timestamp;
        meta.generation = generation;
        meta.resource_version = current.meta().resource_version + 1;

        let key = self.key(R::KIND, parent, &updated.meta().name);
        self.backend.write(&key, &encode(R::KIND, &updated)?).await?;
        Ok(updated)
    }

    async fn update_status<R: Record>(&self, parent: &str, record: &R) -> Result<R> {
        let mut current: R = self.get(parent, &record.meta().name).await?;
        current.copy_status_from(record);
        current.meta_mut().resource_version += 1;

        let key = self.key(R::KIND, parent, &current.meta().name);
        self.backend.write(&key, &encode(R::KIND, &current)?).await?;
        Ok(current)
    }

    async fn remove(&self, kind: Kind, parent: &str, name: &str) -> Result<()> {
        if self.backend.remove(&self.key(kind, parent, name)).await? {
            debug!(kind = kind.as_str(), owner = %self.owner, name = %name, "Removed record");
        }
        Ok(())
    }
}

#[async_trait]
impl<B: Backend> ResourceStore for ScopedStore<B> {
    fn owner(&self) -> &str {
        &self.owner
    }

    async fn list_clusters(&self) -> Result<Vec<Cluster>> {
        self.list("").await
    }

    async fn get_cluster(&self, name: &str) -> Result<Cluster> {
        self.get("", name).await
    }

    async fn create_cluster(&self, cluster: &Cluster) -> Result<Cluster> {
        let created: Cluster = self.create("", cluster).await?;
        let entry = ClusterIndexEntry {
            owner: self.owner.clone(),
            name: created.metadata.name.clone(),
        };
        self.backend
            .write(
                &RecordKey::global(Kind::ClusterIndex, &created.metadata.uid),
                &encode(Kind::ClusterIndex, &entry)?,
            )
            .await?;
        Ok(created)
    }

    async fn update_cluster(&self, cluster: &Cluster) -> Result<Cluster> {
        self.update("", cluster).await
    }

    async fn update_cluster_status(&self, cluster: &Cluster) -> Result<Cluster> {
        self.update_status("", cluster).await
    }

    async fn delete_cluster(&self, name: &str) -> Result<()> {
        let cluster: Cluster = match self.get("", name).await {
            Ok(cluster) => cluster,
            Err(e) if e.is_not_found() => return Ok(()),
            Err(e) => return Err(e),
        };

        for machine in self.list_machines(name).await? {
            self.remove(Kind::Machine, name, &machine.metadata.name).await?;
        }
        for group in self.list_node_groups(name).await? {
            self.remove(Kind::NodeGroup, name, &group.metadata.name).await?;
        }
        self.remove(Kind::Kubeconfig, name, name).await?;
        self.backend
            .remove(&RecordKey::global(Kind::ClusterIndex, &cluster.metadata.uid))
            .await?;
        self.remove(Kind::Cluster, "", name).await
    }

    async fn list_node_groups(&self, cluster: &str) -> Result<Vec<NodeGroup>> {
        self.list(cluster).await
    }

    async fn get_node_group(&self, cluster: &str, name: &str) -> Result<NodeGroup> {
        self.get(cluster, name).await
    }

    async fn create_node_group(&self, cluster: &str, group: &NodeGroup) -> Result<NodeGroup> {
        self.create(cluster, group).await
    }

    async fn update_node_group(&self, cluster: &str, group: &NodeGroup) -> Result<NodeGroup> {
        self.update(cluster, group).await
    }

    async fn update_node_group_status(
        &self,
        cluster: &str,
        group: &NodeGroup,
    ) -> Result<NodeGroup> {
        self.update_status(cluster, group).await
    }

    async fn delete_node_group(&self, cluster: &str, name: &str) -> Result<()> {
        self.remove(Kind::NodeGroup, cluster, name).await
    }

    async fn list_machines(&self, cluster: &str) -> Result<Vec<Machine>> {
        self.list(cluster).await
    }

    async fn get_machine(&self, cluster: &str, name: &str) -> Result<Machine> {
        self.get(cluster, name).await
    }

    async fn create_machine(&self, cluster: &str, machine: &Machine) -> Result<Machine> {
        self.create(cluster, machine).await
    }

    async fn update_machine(&self, cluster: &str, machine: &Machine) -> Result<Machine> {
        self.update(cluster, machine).await
    }

    async fn update_machine_status(&self, cluster: &str, machine: &Machine) -> Result<Machine> {
        self.update_status(cluster, machine).await
    }

    async fn delete_machine(&self, cluster: &str, name: &str) -> Result<()> {
        self.remove(Kind::Machine, cluster, name).await
    }

    async fn get_credential(&self, name: &str) -> Result<Credential> {
        match self.backend.read(&self.key(Kind::Credential, "", name)).await? {
            Some(value) => decode(Kind::Credential, value),
            None => Err(Error::validation(format!("credential {name} not found"))),
        }
    }

    async fn put_credential(&self, credential: &Credential) -> Result<Credential> {
        let key = self.key(Kind::Credential, "", &credential.metadata.name);
        self.backend
            .write(&key, &encode(Kind::Credential, credential)?)
            .await?;
        Ok(credential.clone())
    }

    async fn get_kubeconfig(&self, cluster: &str) -> Result<String> {
        match self.backend.read(&self.key(Kind::Kubeconfig, cluster, cluster)).await? {
            Some(Value::String(kubeconfig)) => Ok(kubeconfig),
            Some(_) => Err(Error::serialization_for_kind(
                Kind::Kubeconfig.as_str(),
                format!("kubeconfig for {cluster} is not a string"),
            )),
            None => Err(Error::not_found(Kind::Kubeconfig.singular(), cluster)),
        }
    }

    async fn put_kubeconfig(&self, cluster: &str, kubeconfig: &str) -> Result<()> {
        self.backend
            .write(
                &self.key(Kind::Kubeconfig, cluster, cluster),
                &Value::String(kubeconfig.to_string()),
            )
            .await
    }
}
