//! Operation queue consumer
//!
//! Turns queue deliveries into lifecycle runs. The rules:
//!
//! - An unparseable payload is dropped; redelivery cannot fix it.
//! - A missing operation ID, or an operation or cluster that cannot be
//!   loaded, leaves the message unacknowledged so it comes back.
//! - `create` only runs for a Pending operation. The move to Running is a
//!   store-side compare-and-swap made before the message is acknowledged;
//!   a delivery that loses the swap acknowledges and does nothing.
//! - `delete` and `retry` acknowledge right away and always run; both are
//!   safe to repeat.
//! - Whatever the workflow returns, the operation ends Done with the error
//!   recorded. The cluster's status reason is where users see it.

use std::sync::Arc;
use std::time::Duration;

use stratus_cluster::ClusterLifecycle;
use stratus_common::resources::{Operation, OperationState};
use stratus_common::store::{ResourceStore, Store};
use stratus_common::{Error, Result};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::envelope::{Envelope, Intent};
use crate::progress::ProgressHub;
use crate::queue::{Delivery, Queue, Subscription};

/// Pause after a failed receive before trying again
const RECEIVE_BACKOFF: Duration = Duration::from_secs(1);

/// How a delivery was settled
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The workflow ran; `error` holds its failure, if any
    Completed {
        /// Failure message recorded on the operation
        error: Option<String>,
    },
    /// The operation was already claimed; acknowledged without running
    Skipped,
    /// Unprocessable message, dropped without redelivery
    Dropped,
    /// Left unacknowledged for redelivery
    Redeliver,
}

/// Drives the cluster lifecycle from queue deliveries
pub struct OperationConsumer {
    store: Arc<dyn Store>,
    lifecycle: Arc<ClusterLifecycle>,
    progress: Option<Arc<ProgressHub>>,
}

impl OperationConsumer {
    /// Consumer over a store and a lifecycle
    pub fn new(store: Arc<dyn Store>, lifecycle: Arc<ClusterLifecycle>) -> Self {
        Self {
            store,
            lifecycle,
            progress: None,
        }
    }

    /// Close progress channels as operations finish
    pub fn with_progress(mut self, hub: Arc<ProgressHub>) -> Self {
        self.progress = Some(hub);
        self
    }

    /// Start `workers` subscribers per intent and serve until `shutdown` flips
    ///
    /// Shutdown stops workers from taking new messages; a workflow already
    /// running is allowed to finish.
    pub async fn run(
        self: Arc<Self>,
        queue: Arc<dyn Queue>,
        workers: usize,
        shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        let mut tasks = JoinSet::new();
        for intent in Intent::ALL {
            for worker in 0..workers {
                let subscription = queue.subscribe(intent).await?;
                let consumer = self.clone();
                let shutdown = shutdown.clone();
                tasks.spawn(
                    async move { consumer.serve(intent, subscription, shutdown).await }
                        .instrument(info_span!("worker", group = intent.group(), worker)),
                );
            }
            info!(intent = %intent, group = intent.group(), workers, "Consumers started");
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "Consumer task ended abnormally");
            }
        }
        info!("All consumers stopped");
        Ok(())
    }

    async fn serve(
        &self,
        intent: Intent,
        mut subscription: Box<dyn Subscription>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            if *shutdown.borrow() {
                break;
            }
            let next = tokio::select! {
                _ = shutdown.changed() => break,
                next = subscription.next() => next,
            };
            match next {
                Ok(Some(delivery)) => {
                    let outcome = self.handle(intent, delivery).await;
                    debug!(?outcome, "Delivery settled");
                }
                Ok(None) => {
                    info!("Subscription closed");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to receive from queue");
                    tokio::time::sleep(RECEIVE_BACKOFF).await;
                }
            }
        }
    }

    /// Process one delivery
    pub async fn handle(&self, intent: Intent, delivery: Delivery) -> Outcome {
        let envelope = match Envelope::decode(&delivery.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(intent = %intent, error = %e, "Dropping unparseable message");
                if let Err(e) = delivery.term().await {
                    warn!(error = %e, "Failed to drop message");
                }
                return Outcome::Dropped;
            }
        };

        let Some(operation_id) = envelope.operation_id() else {
            warn!(intent = %intent, redelivered = delivery.redelivered, "Message has no operation ID");
            return Outcome::Redeliver;
        };

        let operation = match self.store.get_operation(operation_id).await {
            Ok(operation) => operation,
            Err(e) => return self.lookup_failed(&delivery, operation_id, e).await,
        };
        let (owner, cluster) = match self.store.find_cluster_by_id(&operation.cluster_id).await {
            Ok(found) => found,
            Err(e) => return self.lookup_failed(&delivery, operation_id, e).await,
        };

        let span = info_span!(
            "operation",
            operation_id = %operation.id,
            intent = %intent,
            cluster = %cluster.name(),
            owner = %owner,
            code = %operation.code,
        );
        let store = self.store.scoped(&owner);
        let cluster = cluster.name().to_string();

        let outcome = async {
            info!(redelivered = delivery.redelivered, state = %operation.state, "Received operation");
            match intent {
                Intent::CreateCluster => self.create(&delivery, operation, store, &cluster).await,
                Intent::DeleteCluster | Intent::RetryCluster => {
                    self.repeatable(intent, &delivery, operation, store, &cluster)
                        .await
                }
            }
        }
        .instrument(span)
        .await;

        if let (Some(hub), Outcome::Completed { .. }) = (&self.progress, &outcome) {
            hub.finish(operation_id);
        }
        outcome
    }

    async fn lookup_failed(&self, delivery: &Delivery, operation_id: &str, e: Error) -> Outcome {
        if e.is_retryable() {
            warn!(operation_id, error = %e, "Failed to load operation, leaving message for redelivery");
            return Outcome::Redeliver;
        }
        error!(operation_id, error = %e, "Operation cannot be loaded, dropping message");
        if let Err(e) = delivery.term().await {
            warn!(error = %e, "Failed to drop message");
        }
        Outcome::Dropped
    }

    async fn create(
        &self,
        delivery: &Delivery,
        operation: Operation,
        store: Arc<dyn ResourceStore>,
        cluster: &str,
    ) -> Outcome {
        if !operation.is_pending() {
            info!(state = %operation.state, "Operation already claimed, skipping");
            ack(delivery).await;
            return Outcome::Skipped;
        }

        let claimed = self
            .store
            .claim_operation(&operation.id, OperationState::Pending, OperationState::Running)
            .await;
        let operation = match claimed {
            Ok(Some(operation)) => operation,
            Ok(None) => {
                info!("Operation claimed by another worker, skipping");
                ack(delivery).await;
                return Outcome::Skipped;
            }
            Err(e) => {
                error!(error = %e, "Failed to claim operation");
                return Outcome::Redeliver;
            }
        };
        ack(delivery).await;

        let result = self.lifecycle.apply(store, cluster).await;
        self.finish(operation, result.map(|_| ())).await
    }

    async fn repeatable(
        &self,
        intent: Intent,
        delivery: &Delivery,
        mut operation: Operation,
        store: Arc<dyn ResourceStore>,
        cluster: &str,
    ) -> Outcome {
        ack(delivery).await;

        operation.set_state(OperationState::Running);
        operation.error = None;
        let updated = self.store.update_operation(&operation).await;
        let operation = match updated {
            Ok(updated) => updated,
            Err(e) => {
                warn!(error = %e, "Failed to mark operation Running");
                operation
            }
        };

        let result = match intent {
            Intent::DeleteCluster => self.lifecycle.delete(store, cluster).await,
            _ => self.lifecycle.retry(store, cluster).await,
        };
        self.finish(operation, result.map(|_| ())).await
    }

    async fn finish(&self, mut operation: Operation, result: Result<()>) -> Outcome {
        let error = match result {
            Ok(()) => {
                info!("Operation succeeded");
                None
            }
            Err(e) => {
                error!(error = %e, "Operation failed");
                Some(e.to_string())
            }
        };

        operation.error.clone_from(&error);
        operation.set_state(OperationState::Done);
        if let Err(e) = self.store.update_operation(&operation).await {
            error!(error = %e, "Failed to mark operation Done");
        }
        Outcome::Completed { error }
    }
}

async fn ack(delivery: &Delivery) {
    if let Err(e) = delivery.ack().await {
        warn!(error = %e, "Failed to acknowledge message");
    }
}

#[cfg(test)]
mod tests;
