//! Cluster orchestration for stratus
//!
//! - [`scaler`]: node group scaling, a pure planner plus its executor
//! - [`lifecycle`]: the cluster phase machine (apply, upgrade, delete, retry)
//! - [`phase`]: validated phase transitions
//!
//! Everything here talks to clouds through `stratus-cloud` and keeps its
//! state in a `stratus-common` store, so the whole crate runs unchanged
//! against the simulated provider.

#![deny(missing_docs)]

pub mod lifecycle;
pub mod phase;
pub mod scaler;

#[cfg(test)]
mod testing;

pub use lifecycle::{ClusterLifecycle, LifecycleConfig, TeardownOptions};
pub use scaler::{plan, Action, ActionKind, NodeGroupScaler, ScaleAction, ScaleOutcome};
