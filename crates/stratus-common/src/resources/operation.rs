//! Operation records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// State of an operation
///
/// Only one worker wins the `Pending -> Running` move; everything after that
/// keys off the persisted state.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub enum OperationState {
    /// Enqueued, not yet picked up
    #[default]
    Pending,
    /// Claimed by a worker
    Running,
    /// Finished, successfully or not
    Done,
}

impl std::fmt::Display for OperationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "Pending"),
            Self::Running => write!(f, "Running"),
            Self::Done => write!(f, "Done"),
        }
    }
}

/// A durable record of one lifecycle request against a cluster
///
/// Operations are never deleted; they are the audit trail.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    /// Opaque identifier, carried in the queue envelope
    pub id: String,
    /// UID of the target cluster
    pub cluster_id: String,
    /// Owner/tenant whose store scope the cluster lives in
    pub owner: String,
    /// Correlation token surfaced to the caller for progress streaming
    pub code: String,
    /// Current state
    #[serde(default)]
    pub state: OperationState,
    /// Failure message from the workflow, when it failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// When the record was created
    pub created_at: DateTime<Utc>,
    /// When the record was last written
    pub updated_at: DateTime<Utc>,
}

impl Operation {
    /// A new pending operation with a generated ID and code
    pub fn new(cluster_id: impl Into<String>, owner: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            cluster_id: cluster_id.into(),
            owner: owner.into(),
            code: uuid::Uuid::new_v4().simple().to_string(),
            state: OperationState::Pending,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns true if no worker has claimed the operation
    pub fn is_pending(&self) -> bool {
        self.state == OperationState::Pending
    }

    /// Move to `state`, stamping the update time
    pub fn set_state(&mut self, state: OperationState) {
        self.state = state;
        self.updated_at = Utc::now();
    }
}
