//! Cluster phase transitions

use stratus_common::resources::{Cluster, ClusterPhase};
use stratus_common::store::ResourceStore;
use stratus_common::{Error, Result};
use tracing::info;

/// Move a cluster to `next` and persist its status
///
/// Illegal moves are an internal error and nothing is written. Reaching
/// Ready clears the reason; every other phase keeps `reason` when given and
/// the existing one otherwise.
pub async fn transition(
    store: &dyn ResourceStore,
    cluster: &mut Cluster,
    next: ClusterPhase,
    reason: Option<String>,
) -> Result<()> {
    let current = cluster.status.phase;
    if !current.can_transition_to(next) {
        return Err(Error::internal_with_context(
            "lifecycle",
            format!(
                "cluster {} cannot move from {current} to {next}",
                cluster.name()
            ),
        ));
    }

    cluster.status.phase = next;
    if next == ClusterPhase::Ready {
        cluster.status.reason = None;
    } else if reason.is_some() {
        cluster.status.reason = reason;
    }

    *cluster = store.update_cluster_status(cluster).await?;
    if current != next {
        info!(cluster = %cluster.name(), from = %current, to = %next, "Cluster phase changed");
    }
    Ok(())
}

/// Record a failure reason without changing phase
pub async fn record_reason(
    store: &dyn ResourceStore,
    cluster: &mut Cluster,
    reason: String,
) -> Result<()> {
    cluster.status.reason = Some(reason);
    *cluster = store.update_cluster_status(cluster).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use stratus_common::resources::ClusterSpec;
    use stratus_common::store::{MemoryStore, Store};

    async fn stored() -> (std::sync::Arc<dyn ResourceStore>, Cluster) {
        let store = MemoryStore::in_memory().scoped("acme");
        let cluster = store
            .create_cluster(&Cluster::new("prod", ClusterSpec::default()))
            .await
            .unwrap();
        (store, cluster)
    }

    #[tokio::test]
    async fn test_transition_persists_phase_and_reason() {
        let (store, mut cluster) = stored().await;
        transition(
            store.as_ref(),
            &mut cluster,
            ClusterPhase::Failing,
            Some("master never came up".into()),
        )
        .await
        .unwrap();

        let reloaded = store.get_cluster("prod").await.unwrap();
        assert_eq!(reloaded.status.phase, ClusterPhase::Failing);
        assert_eq!(reloaded.status.reason.as_deref(), Some("master never came up"));
    }

    #[tokio::test]
    async fn test_ready_clears_reason() {
        let (store, mut cluster) = stored().await;
        record_reason(store.as_ref(), &mut cluster, "flaky".into())
            .await
            .unwrap();
        transition(store.as_ref(), &mut cluster, ClusterPhase::Ready, None)
            .await
            .unwrap();
        assert!(store.get_cluster("prod").await.unwrap().status.reason.is_none());
    }

    #[tokio::test]
    async fn test_illegal_transition_writes_nothing() {
        let (store, mut cluster) = stored().await;
        let err = transition(store.as_ref(), &mut cluster, ClusterPhase::Deleted, None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cannot move from Pending to Deleted"));
        assert_eq!(
            store.get_cluster("prod").await.unwrap().status.phase,
            ClusterPhase::Pending
        );
    }
}
