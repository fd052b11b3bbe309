use super::*;

use async_trait::async_trait;
use stratus_cloud::bootstrap::ScriptRenderer;
use stratus_cloud::simulated::{SimulatedCloud, SimulatedControlPlane, SimulatedFactory};
use stratus_cloud::ProviderRegistry;
use stratus_cluster::LifecycleConfig;
use stratus_common::resources::{Cluster, ClusterPhase, ClusterSpec, ProviderType};
use stratus_common::retry::RetryConfig;
use stratus_common::store::MemoryStore;
use stratus_common::wait::PollConfig;

use crate::queue::MemoryQueue;

const OWNER: &str = "acme";

// =============================================================================
// Fixtures
// =============================================================================

struct Fixture {
    store: Arc<MemoryStore>,
    queue: MemoryQueue,
    cloud: SimulatedCloud,
}

impl Fixture {
    fn new() -> Self {
        Self {
            store: Arc::new(MemoryStore::in_memory()),
            queue: MemoryQueue::new(),
            cloud: SimulatedCloud::default(),
        }
    }

    fn lifecycle(&self) -> Arc<ClusterLifecycle> {
        let registry = ProviderRegistry::new(Arc::new(SimulatedControlPlane::new(
            self.cloud.clone(),
        )))
        .with_retry(RetryConfig::none())
        .register(
            ProviderType::DigitalOcean,
            Arc::new(SimulatedFactory::new(self.cloud.clone())),
        );
        let poll = PollConfig::new(Duration::from_secs(1), Duration::from_secs(30));
        Arc::new(ClusterLifecycle::new(
            Arc::new(registry),
            Arc::new(ScriptRenderer::new().unwrap()),
            LifecycleConfig {
                preserve_failed: false,
                poll,
                control_plane_poll: poll,
            },
        ))
    }

    fn consumer(&self) -> OperationConsumer {
        OperationConsumer::new(self.store.clone(), self.lifecycle())
    }

    /// A cluster record parked in `phase`, so workflows settle without cloud calls
    async fn cluster(&self, phase: ClusterPhase) -> Cluster {
        let scope = self.store.scoped(OWNER);
        let mut cluster = scope
            .create_cluster(&Cluster::new(
                "prod",
                ClusterSpec {
                    provider: ProviderType::DigitalOcean,
                    credential_name: "do".into(),
                    region: "nyc1".into(),
                    kubernetes_version: "1.30.4".into(),
                    ..Default::default()
                },
            ))
            .await
            .unwrap();
        cluster.status.phase = phase;
        scope.update_cluster_status(&cluster).await.unwrap()
    }

    async fn operation(&self, cluster: &Cluster, state: OperationState) -> Operation {
        let mut operation = Operation::new(cluster.id(), OWNER);
        operation.state = state;
        self.store.create_operation(&operation).await.unwrap()
    }

    /// Publish `payload` and take it back as a delivery
    async fn deliver(&self, intent: Intent, payload: &[u8]) -> Delivery {
        self.queue.publish_raw(intent, payload.to_vec());
        let mut subscription = self.queue.subscribe(intent).await.unwrap();
        subscription.next().await.unwrap().unwrap()
    }

    async fn deliver_envelope(&self, intent: Intent, operation: &Operation) -> Delivery {
        let payload = Envelope::new(&operation.id).encode().unwrap();
        self.deliver(intent, &payload).await
    }

    async fn reload(&self, operation: &Operation) -> Operation {
        self.store.get_operation(&operation.id).await.unwrap()
    }
}

/// Store whose operation reads fail with a fixed error
struct FailingReads {
    inner: MemoryStore,
    retryable: bool,
}

#[async_trait]
impl Store for FailingReads {
    async fn get_operation(&self, id: &str) -> Result<Operation> {
        if self.retryable {
            Err(Error::store("operations", format!("read of {id} timed out")))
        } else {
            Err(Error::serialization_for_kind("Operation", "record is corrupt"))
        }
    }

    async fn create_operation(&self, operation: &Operation) -> Result<Operation> {
        self.inner.create_operation(operation).await
    }

    async fn update_operation(&self, operation: &Operation) -> Result<Operation> {
        self.inner.update_operation(operation).await
    }

    async fn claim_operation(
        &self,
        id: &str,
        from: OperationState,
        to: OperationState,
    ) -> Result<Option<Operation>> {
        self.inner.claim_operation(id, from, to).await
    }

    async fn find_cluster_by_id(&self, id: &str) -> Result<(String, Cluster)> {
        self.inner.find_cluster_by_id(id).await
    }

    fn scoped(&self, owner: &str) -> Arc<dyn ResourceStore> {
        self.inner.scoped(owner)
    }
}

/// Store that yields to the scheduler after every operation read, so two
/// deliveries handled together both see the record before either claims it
struct InterleavedReads {
    inner: Arc<MemoryStore>,
}

#[async_trait]
impl Store for InterleavedReads {
    async fn get_operation(&self, id: &str) -> Result<Operation> {
        let operation = self.inner.get_operation(id).await;
        tokio::task::yield_now().await;
        operation
    }

    async fn create_operation(&self, operation: &Operation) -> Result<Operation> {
        self.inner.create_operation(operation).await
    }

    async fn update_operation(&self, operation: &Operation) -> Result<Operation> {
        self.inner.update_operation(operation).await
    }

    async fn claim_operation(
        &self,
        id: &str,
        from: OperationState,
        to: OperationState,
    ) -> Result<Option<Operation>> {
        self.inner.claim_operation(id, from, to).await
    }

    async fn find_cluster_by_id(&self, id: &str) -> Result<(String, Cluster)> {
        self.inner.find_cluster_by_id(id).await
    }

    fn scoped(&self, owner: &str) -> Arc<dyn ResourceStore> {
        self.inner.scoped(owner)
    }
}

// =============================================================================
// Create gate
// =============================================================================

/// Story: A pending create is claimed, acknowledged, run, and finished
#[tokio::test(start_paused = true)]
async fn story_create_runs_and_records_result() {
    let f = Fixture::new();
    let cluster = f.cluster(ClusterPhase::Failing).await;
    let operation = f.operation(&cluster, OperationState::Pending).await;

    let delivery = f.deliver_envelope(Intent::CreateCluster, &operation).await;
    let outcome = f.consumer().handle(Intent::CreateCluster, delivery).await;

    // A Failing cluster refuses apply; the refusal lands on the operation
    let Outcome::Completed { error: Some(error) } = outcome else {
        panic!("expected a completed operation with an error, got {outcome:?}");
    };
    assert!(error.contains("failing"));

    let stored = f.reload(&operation).await;
    assert_eq!(stored.state, OperationState::Done);
    assert_eq!(stored.error.as_deref(), Some(error.as_str()));
    assert_eq!(f.queue.acked(Intent::CreateCluster), 1);
    assert_eq!(f.queue.in_flight(Intent::CreateCluster), 0);
}

/// Story: A second delivery of a claimed create does nothing but settle
#[tokio::test(start_paused = true)]
async fn story_claimed_create_is_skipped() {
    let f = Fixture::new();
    let cluster = f.cluster(ClusterPhase::Pending).await;
    let operation = f.operation(&cluster, OperationState::Running).await;

    let delivery = f.deliver_envelope(Intent::CreateCluster, &operation).await;
    let outcome = f.consumer().handle(Intent::CreateCluster, delivery).await;

    assert_eq!(outcome, Outcome::Skipped);
    assert_eq!(f.queue.acked(Intent::CreateCluster), 1);
    assert_eq!(f.reload(&operation).await.state, OperationState::Running);
    assert_eq!(f.cloud.calls("ensure_network"), 0);
}

/// Story: Two deliveries of one create in flight at once run it only once
#[tokio::test(start_paused = true)]
async fn story_overlapping_creates_run_once() {
    let f = Fixture::new();
    let cluster = f.cluster(ClusterPhase::Failing).await;
    let operation = f.operation(&cluster, OperationState::Pending).await;

    let first = f.deliver_envelope(Intent::CreateCluster, &operation).await;
    let second = f.deliver_envelope(Intent::CreateCluster, &operation).await;
    let consumer = OperationConsumer::new(
        Arc::new(InterleavedReads {
            inner: f.store.clone(),
        }),
        f.lifecycle(),
    );

    let (a, b) = tokio::join!(
        consumer.handle(Intent::CreateCluster, first),
        consumer.handle(Intent::CreateCluster, second),
    );

    let outcomes = [a, b];
    let completed = outcomes
        .iter()
        .filter(|o| matches!(o, Outcome::Completed { .. }))
        .count();
    let skipped = outcomes.iter().filter(|o| **o == Outcome::Skipped).count();
    assert_eq!((completed, skipped), (1, 1), "outcomes: {outcomes:?}");
    assert_eq!(f.queue.acked(Intent::CreateCluster), 2);
    assert_eq!(f.reload(&operation).await.state, OperationState::Done);
}

#[tokio::test(start_paused = true)]
async fn test_finished_create_is_skipped() {
    let f = Fixture::new();
    let cluster = f.cluster(ClusterPhase::Ready).await;
    let operation = f.operation(&cluster, OperationState::Done).await;

    let delivery = f.deliver_envelope(Intent::CreateCluster, &operation).await;
    assert_eq!(
        f.consumer().handle(Intent::CreateCluster, delivery).await,
        Outcome::Skipped
    );
    assert_eq!(f.reload(&operation).await.state, OperationState::Done);
}

// =============================================================================
// Delete and retry
// =============================================================================

/// Story: Delete runs whatever state the operation was left in
#[tokio::test(start_paused = true)]
async fn story_delete_always_runs() {
    let f = Fixture::new();
    let cluster = f.cluster(ClusterPhase::Deleted).await;
    let operation = f.operation(&cluster, OperationState::Running).await;

    let delivery = f.deliver_envelope(Intent::DeleteCluster, &operation).await;
    let outcome = f.consumer().handle(Intent::DeleteCluster, delivery).await;

    assert_eq!(outcome, Outcome::Completed { error: None });
    assert_eq!(f.queue.acked(Intent::DeleteCluster), 1);
    let stored = f.reload(&operation).await;
    assert_eq!(stored.state, OperationState::Done);
    assert!(stored.error.is_none());
}

#[tokio::test(start_paused = true)]
async fn test_retry_clears_previous_error() {
    let f = Fixture::new();
    let cluster = f.cluster(ClusterPhase::Deleted).await;
    let mut operation = f.operation(&cluster, OperationState::Done).await;
    operation.error = Some("earlier failure".into());
    f.store.update_operation(&operation).await.unwrap();

    let delivery = f.deliver_envelope(Intent::RetryCluster, &operation).await;
    let outcome = f.consumer().handle(Intent::RetryCluster, delivery).await;

    assert_eq!(outcome, Outcome::Completed { error: None });
    assert!(f.reload(&operation).await.error.is_none());
}

// =============================================================================
// Unprocessable messages
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_garbage_is_dropped() {
    let f = Fixture::new();
    let delivery = f.deliver(Intent::CreateCluster, b"{not json").await;

    assert_eq!(
        f.consumer().handle(Intent::CreateCluster, delivery).await,
        Outcome::Dropped
    );
    assert_eq!(f.queue.terminated(Intent::CreateCluster), 1);
    assert_eq!(f.queue.acked(Intent::CreateCluster), 0);
}

#[tokio::test(start_paused = true)]
async fn test_missing_id_is_left_for_redelivery() {
    let f = Fixture::new();
    let delivery = f.deliver(Intent::DeleteCluster, br#"{"operation_id":""}"#).await;

    assert_eq!(
        f.consumer().handle(Intent::DeleteCluster, delivery).await,
        Outcome::Redeliver
    );
    assert_eq!(f.queue.in_flight(Intent::DeleteCluster), 1);
    assert_eq!(f.queue.expire_in_flight(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_operation_is_left_for_redelivery() {
    let f = Fixture::new();
    let delivery = f
        .deliver(Intent::CreateCluster, br#"{"operation_id":"nope"}"#)
        .await;

    assert_eq!(
        f.consumer().handle(Intent::CreateCluster, delivery).await,
        Outcome::Redeliver
    );
    assert_eq!(f.queue.in_flight(Intent::CreateCluster), 1);
}

#[tokio::test(start_paused = true)]
async fn test_unknown_cluster_is_left_for_redelivery() {
    let f = Fixture::new();
    let operation = f
        .store
        .create_operation(&Operation::new("no-such-cluster", OWNER))
        .await
        .unwrap();

    let delivery = f.deliver_envelope(Intent::CreateCluster, &operation).await;
    assert_eq!(
        f.consumer().handle(Intent::CreateCluster, delivery).await,
        Outcome::Redeliver
    );
    assert!(f.reload(&operation).await.is_pending());
}

#[tokio::test(start_paused = true)]
async fn test_lookup_errors_split_on_retryability() {
    let f = Fixture::new();
    let lifecycle = f.lifecycle();

    let transient = OperationConsumer::new(
        Arc::new(FailingReads {
            inner: MemoryStore::in_memory(),
            retryable: true,
        }),
        lifecycle.clone(),
    );
    let delivery = f
        .deliver(Intent::CreateCluster, br#"{"operation_id":"op-1"}"#)
        .await;
    assert_eq!(
        transient.handle(Intent::CreateCluster, delivery).await,
        Outcome::Redeliver
    );

    let corrupt = OperationConsumer::new(
        Arc::new(FailingReads {
            inner: MemoryStore::in_memory(),
            retryable: false,
        }),
        lifecycle,
    );
    let delivery = f
        .deliver(Intent::CreateCluster, br#"{"operation_id":"op-2"}"#)
        .await;
    assert_eq!(
        corrupt.handle(Intent::CreateCluster, delivery).await,
        Outcome::Dropped
    );
    assert_eq!(f.queue.terminated(Intent::CreateCluster), 1);
}

// =============================================================================
// Progress and workers
// =============================================================================

#[tokio::test(start_paused = true)]
async fn test_finished_operation_closes_progress_channel() {
    let f = Fixture::new();
    let hub = Arc::new(ProgressHub::default());
    let cluster = f.cluster(ClusterPhase::Deleted).await;
    let operation = f.operation(&cluster, OperationState::Pending).await;
    let mut rx = hub.subscribe(&operation.id);

    let consumer = f.consumer().with_progress(hub.clone());
    let delivery = f.deliver_envelope(Intent::RetryCluster, &operation).await;
    consumer.handle(Intent::RetryCluster, delivery).await;

    assert_eq!(hub.watched(), 0);
    assert!(matches!(
        rx.try_recv(),
        Err(tokio::sync::broadcast::error::TryRecvError::Closed)
    ));
}

/// Story: Workers drain every intent and stop when the queue closes
#[tokio::test(start_paused = true)]
async fn story_workers_drain_queue() {
    let f = Fixture::new();
    let cluster = f.cluster(ClusterPhase::Deleted).await;
    let delete = f.operation(&cluster, OperationState::Pending).await;
    let retry = f.operation(&cluster, OperationState::Pending).await;
    f.queue
        .publish(Intent::DeleteCluster, &Envelope::new(&delete.id))
        .await
        .unwrap();
    f.queue
        .publish(Intent::RetryCluster, &Envelope::new(&retry.id))
        .await
        .unwrap();
    f.queue.publish_raw(Intent::CreateCluster, "garbage");

    let (_tx, shutdown) = watch::channel(false);
    let queue: Arc<dyn Queue> = Arc::new(f.queue.clone());
    let consumer = Arc::new(f.consumer());
    let run = tokio::spawn(consumer.run(queue, 2, shutdown));

    tokio::time::sleep(Duration::from_secs(1)).await;
    f.queue.close();
    run.await.unwrap().unwrap();

    assert_eq!(f.reload(&delete).await.state, OperationState::Done);
    assert_eq!(f.reload(&retry).await.state, OperationState::Done);
    assert_eq!(f.queue.terminated(Intent::CreateCluster), 1);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_idle_workers() {
    let f = Fixture::new();
    let (tx, shutdown) = watch::channel(false);
    let queue: Arc<dyn Queue> = Arc::new(f.queue.clone());
    let run = tokio::spawn(Arc::new(f.consumer()).run(queue, 1, shutdown));

    tokio::time::sleep(Duration::from_millis(10)).await;
    tx.send(true).unwrap();
    run.await.unwrap().unwrap();
}
