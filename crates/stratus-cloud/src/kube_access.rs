//! Admin access to workload clusters
//!
//! The admin kubeconfig for each cluster is kept in the store by whoever
//! generated the cluster certificates.

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use stratus_common::store::ResourceStore;
use stratus_common::{Error, Result};

/// Build a client for a cluster's API server from its stored kubeconfig
pub async fn admin_client(store: &dyn ResourceStore, cluster: &str) -> Result<Client> {
    let yaml = store.get_kubeconfig(cluster).await?;
    let kubeconfig = Kubeconfig::from_yaml(&yaml).map_err(|e| {
        Error::validation_for(cluster, format!("invalid admin kubeconfig: {e}"))
    })?;
    let config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| Error::validation_for(cluster, format!("unusable admin kubeconfig: {e}")))?;
    Ok(Client::try_from(config)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratus_common::store::{MemoryStore, Store};

    #[tokio::test]
    async fn test_missing_kubeconfig_is_not_found() {
        let store = MemoryStore::in_memory();
        let Err(err) = admin_client(store.scoped("t").as_ref(), "prod").await else {
            panic!("expected a missing kubeconfig to fail");
        };
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_garbage_kubeconfig_is_validation_error() {
        let store = MemoryStore::in_memory();
        let scope = store.scoped("t");
        scope.put_kubeconfig("prod", "clusters: [[[").await.unwrap();
        let Err(err) = admin_client(scope.as_ref(), "prod").await else {
            panic!("expected a garbage kubeconfig to fail");
        };
        assert!(!err.is_retryable());
    }
}
