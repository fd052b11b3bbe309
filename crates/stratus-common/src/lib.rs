//! Common types for stratus: records, the store capability, errors, and utilities

#![deny(missing_docs)]

pub mod error;
pub mod resources;
pub mod retry;
pub mod store;
pub mod telemetry;
pub mod wait;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Lifetime of a worker join token
pub const BOOTSTRAP_TOKEN_TTL: std::time::Duration = std::time::Duration::from_secs(30 * 60);

/// Tag key stratus puts on every cloud resource it creates for a cluster
pub const CLUSTER_TAG: &str = "stratus-cluster";

/// Tag key naming the node group of an instance
pub const NODE_GROUP_TAG: &str = "stratus-node-group";
