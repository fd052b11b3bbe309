//! Error types for stratus
//!
//! Errors are structured with fields to aid debugging in production. Each
//! variant carries the context an operator needs to act on it: the cluster,
//! the provider, the record kind, or the operation that timed out.
//!
//! The cluster's `status.reason` is the user-facing error surface, so the
//! `Display` output of every variant is written to read well there.

use std::time::Duration;

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for stratus operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error from a workload cluster's API server
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// Validation error for a spec, record, or message
    #[error("validation error for {cluster}: {message}")]
    Validation {
        /// Name of the cluster with invalid configuration
        cluster: String,
        /// Description of what's invalid
        message: String,
        /// The invalid field path (e.g., "spec.providerSpec.image")
        field: Option<String>,
    },

    /// Cloud provider error
    #[error("provider error [{provider}] for {cluster}: {message}")]
    Provider {
        /// Name of the cluster being provisioned
        cluster: String,
        /// Provider type (digitalocean, linode, aws, ...)
        provider: String,
        /// Description of what failed
        message: String,
        /// Whether this error is retryable
        retryable: bool,
    },

    /// A record that was expected to exist is missing from the store
    #[error("{kind} {name} not found")]
    NotFound {
        /// Record kind (operation, cluster, machine, ...)
        kind: String,
        /// Name or ID that was looked up
        name: String,
    },

    /// Store read or write failure
    #[error("store error [{context}]: {message}")]
    Store {
        /// Description of what failed
        message: String,
        /// Record kind or path involved
        context: String,
    },

    /// Queue transport failure
    #[error("queue error [{context}]: {message}")]
    Queue {
        /// Description of what failed
        message: String,
        /// Subject or consumer involved
        context: String,
    },

    /// A bounded wait ran out of time
    #[error("timed out after {waited:?} waiting for {operation}")]
    Timeout {
        /// What was being waited on
        operation: String,
        /// How long the wait lasted
        waited: Duration,
    },

    /// Startup script rendering failed
    #[error("template error: {message}")]
    Template {
        /// Description of what failed
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The record kind being serialized (if known)
        kind: Option<String>,
    },

    /// One or more independent teardown steps failed
    #[error("teardown of {cluster} failed: {}", failures.join("; "))]
    Teardown {
        /// Name of the cluster being torn down
        cluster: String,
        /// Every step failure, in the order the steps ran
        failures: Vec<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "consumer", "lifecycle")
        context: String,
    },
}

impl Error {
    /// Create a validation error with the given message
    ///
    /// For simple validation errors without cluster context.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            cluster: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with cluster context
    pub fn validation_for(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            cluster: cluster.into(),
            message: msg.into(),
            field: None,
        }
    }

    /// Create a validation error with cluster context and field path
    pub fn validation_for_field(
        cluster: impl Into<String>,
        field: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Validation {
            cluster: cluster.into(),
            message: msg.into(),
            field: Some(field.into()),
        }
    }

    /// Create a retryable provider error with full context
    pub fn provider_for(
        cluster: impl Into<String>,
        provider: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Provider {
            cluster: cluster.into(),
            provider: provider.into(),
            message: msg.into(),
            retryable: true,
        }
    }

    /// Create a non-retryable provider error (e.g., bad credentials, quota)
    pub fn provider_permanent(
        cluster: impl Into<String>,
        provider: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::Provider {
            cluster: cluster.into(),
            provider: provider.into(),
            message: msg.into(),
            retryable: false,
        }
    }

    /// Create a not-found error for a record kind
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a store error
    pub fn store(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Store {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Create a queue error
    pub fn queue(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Queue {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, waited: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            waited,
        }
    }

    /// Create a template error
    pub fn template(msg: impl Into<String>) -> Self {
        Self::Template {
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with record kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Returns true if this error is retryable
    ///
    /// Validation, serialization, and template errors need a human to change
    /// something before another attempt can succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { .. } => true,
            Error::Validation { .. } => false,
            Error::Provider { retryable, .. } => *retryable,
            Error::NotFound { .. } => true,
            Error::Store { .. } => true,
            Error::Queue { .. } => true,
            Error::Timeout { .. } => true,
            Error::Template { .. } => false,
            Error::Serialization { .. } => false,
            Error::Teardown { .. } => true,
            Error::Internal { .. } => true,
        }
    }

    /// Returns true if this is a not-found error
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }

    /// Get the cluster name associated with this error, if any
    pub fn cluster(&self) -> Option<&str> {
        match self {
            Error::Validation { cluster, .. }
            | Error::Provider { cluster, .. }
            | Error::Teardown { cluster, .. } => {
                if cluster == UNKNOWN_CONTEXT {
                    None
                } else {
                    Some(cluster)
                }
            }
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::serialization(e.to_string())
    }
}
