//! Store capability
//!
//! The store is the single source of truth for every record. [`Store`] holds
//! the global records (operations, the cluster ID index) and hands out
//! owner-scoped [`ResourceStore`]s for everything a tenant owns.
//!
//! Two backends ship with stratus: [`MemoryBackend`] for tests and
//! single-process runs, and [`FileBackend`] for JSON records on disk. Both
//! plug into the same [`RecordStore`], which owns the record semantics
//! (resource versions, status-only writes, the cluster index).
//!
//! Writes to a single record are serialized by the backend, and
//! [`Store::claim_operation`] is a compare-and-swap on the operation state.
//! Other read-modify-write sequences are last-writer-wins; concurrent
//! operations on the same cluster are kept apart by the claim.

mod file;
mod memory;
mod records;

use std::sync::Arc;

use async_trait::async_trait;

use crate::resources::{Cluster, Credential, Machine, NodeGroup, Operation, OperationState};
use crate::Result;

pub use file::FileBackend;
pub use memory::{MemoryBackend, MemoryStore};
pub use records::{Backend, Kind, RecordKey, RecordStore, ScopedStore};

/// Global records and the entry point to owner scopes
#[async_trait]
pub trait Store: Send + Sync {
    /// Fetch an operation by ID
    async fn get_operation(&self, id: &str) -> Result<Operation>;

    /// Record a new operation
    async fn create_operation(&self, operation: &Operation) -> Result<Operation>;

    /// Overwrite an operation
    async fn update_operation(&self, operation: &Operation) -> Result<Operation>;

    /// Move an operation from `from` to `to` if it is still in `from`
    ///
    /// Atomic against concurrent claims: of two callers that both saw
    /// `from`, exactly one gets `Some`. The other gets `None`, as does any
    /// caller that finds the operation in another state.
    async fn claim_operation(
        &self,
        id: &str,
        from: OperationState,
        to: OperationState,
    ) -> Result<Option<Operation>>;

    /// Fetch a cluster by UID regardless of owner
    ///
    /// Returns the owning scope's name alongside the record.
    async fn find_cluster_by_id(&self, id: &str) -> Result<(String, Cluster)>;

    /// Records owned by `owner`
    fn scoped(&self, owner: &str) -> Arc<dyn ResourceStore>;
}

/// Records owned by a single tenant
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// Owner this scope is bound to
    fn owner(&self) -> &str;

    // Clusters

    /// List clusters
    async fn list_clusters(&self) -> Result<Vec<Cluster>>;
    /// Fetch a cluster by name
    async fn get_cluster(&self, name: &str) -> Result<Cluster>;
    /// Record a new cluster
    async fn create_cluster(&self, cluster: &Cluster) -> Result<Cluster>;
    /// Write metadata and spec; the stored status is kept
    async fn update_cluster(&self, cluster: &Cluster) -> Result<Cluster>;
    /// Write status only
    async fn update_cluster_status(&self, cluster: &Cluster) -> Result<Cluster>;
    /// Remove a cluster and everything it owns
    async fn delete_cluster(&self, name: &str) -> Result<()>;

    // Node groups

    /// List a cluster's node groups
    async fn list_node_groups(&self, cluster: &str) -> Result<Vec<NodeGroup>>;
    /// Fetch a node group
    async fn get_node_group(&self, cluster: &str, name: &str) -> Result<NodeGroup>;
    /// Record a new node group
    async fn create_node_group(&self, cluster: &str, group: &NodeGroup) -> Result<NodeGroup>;
    /// Write metadata and spec; the stored status is kept
    async fn update_node_group(&self, cluster: &str, group: &NodeGroup) -> Result<NodeGroup>;
    /// Write status only
    async fn update_node_group_status(&self, cluster: &str, group: &NodeGroup)
        -> Result<NodeGroup>;
    /// Remove a node group record
    async fn delete_node_group(&self, cluster: &str, name: &str) -> Result<()>;

    // Machines

    /// List a cluster's machines
    async fn list_machines(&self, cluster: &str) -> Result<Vec<Machine>>;
    /// Fetch a machine
    async fn get_machine(&self, cluster: &str, name: &str) -> Result<Machine>;
    /// Record a new machine
    async fn create_machine(&self, cluster: &str, machine: &Machine) -> Result<Machine>;
    /// Write metadata and spec; the stored status is kept
    async fn update_machine(&self, cluster: &str, machine: &Machine) -> Result<Machine>;
    /// Write status only
    async fn update_machine_status(&self, cluster: &str, machine: &Machine) -> Result<Machine>;
    /// Remove a machine record
    async fn delete_machine(&self, cluster: &str, name: &str) -> Result<()>;

    // Credentials and access

    /// Fetch a credential
    async fn get_credential(&self, name: &str) -> Result<Credential>;
    /// Record a credential, replacing any with the same name
    async fn put_credential(&self, credential: &Credential) -> Result<Credential>;
    /// Admin kubeconfig for a cluster's API server
    async fn get_kubeconfig(&self, cluster: &str) -> Result<String>;
    /// Store the admin kubeconfig for a cluster
    async fn put_kubeconfig(&self, cluster: &str, kubeconfig: &str) -> Result<()>;
}
