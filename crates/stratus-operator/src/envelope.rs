//! Queue message format
//!
//! One message per operation, published on the subject of its intent. The
//! payload is a JSON object carrying the operation ID; anything else in it is
//! ignored.

use serde::{Deserialize, Serialize};
use stratus_common::{Error, Result};

/// What an operation asks for
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum Intent {
    /// Provision a Pending cluster
    #[value(name = "create-cluster")]
    CreateCluster,
    /// Tear a cluster down
    #[value(name = "delete-cluster")]
    DeleteCluster,
    /// Re-run whatever the cluster's phase calls for
    #[value(name = "retry-cluster")]
    RetryCluster,
}

impl Intent {
    /// Every intent, in subscription order
    pub const ALL: [Intent; 3] = [
        Intent::CreateCluster,
        Intent::DeleteCluster,
        Intent::RetryCluster,
    ];

    /// Topic name
    pub fn topic(&self) -> &'static str {
        match self {
            Self::CreateCluster => "create-cluster",
            Self::DeleteCluster => "delete-cluster",
            Self::RetryCluster => "retry-cluster",
        }
    }

    /// Durable consumer group shared by every worker of this intent
    pub fn group(&self) -> &'static str {
        match self {
            Self::CreateCluster => "cluster-api-create-workers",
            Self::DeleteCluster => "cluster-api-delete-workers",
            Self::RetryCluster => "cluster-api-retry-workers",
        }
    }
}

impl std::fmt::Display for Intent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.topic())
    }
}

/// Payload of a queue message
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct Envelope {
    /// Operation to run; may be absent in malformed messages
    #[serde(default, alias = "OperationId", alias = "OperationID")]
    pub operation_id: String,
}

impl Envelope {
    /// Envelope for `operation_id`
    pub fn new(operation_id: impl Into<String>) -> Self {
        Self {
            operation_id: operation_id.into(),
        }
    }

    /// Parse a payload; structurally invalid JSON is a serialization error
    pub fn decode(payload: &[u8]) -> Result<Self> {
        serde_json::from_slice(payload).map_err(|e| Error::Serialization {
            message: format!("invalid envelope: {e}"),
            kind: Some("Envelope".to_string()),
        })
    }

    /// Serialize for publishing
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| Error::Serialization {
            message: e.to_string(),
            kind: Some("Envelope".to_string()),
        })
    }

    /// The operation ID, unless it is missing or blank
    pub fn operation_id(&self) -> Option<&str> {
        let id = self.operation_id.trim();
        (!id.is_empty()).then_some(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topics_and_groups() {
        assert_eq!(Intent::CreateCluster.topic(), "create-cluster");
        assert_eq!(Intent::DeleteCluster.group(), "cluster-api-delete-workers");
        assert_eq!(Intent::RetryCluster.to_string(), "retry-cluster");
    }

    #[test]
    fn test_decode_accepts_known_spellings() {
        let a = Envelope::decode(br#"{"OperationId":"op-1"}"#).unwrap();
        let b = Envelope::decode(br#"{"OperationID":"op-1"}"#).unwrap();
        let c = Envelope::decode(br#"{"operation_id":"op-1","extra":true}"#).unwrap();
        assert_eq!(a, b);
        assert_eq!(b, c);
        assert_eq!(a.operation_id(), Some("op-1"));
    }

    #[test]
    fn test_encode_uses_canonical_key() {
        let payload = Envelope::new("op-9").encode().unwrap();
        assert_eq!(payload, br#"{"operation_id":"op-9"}"#);
        let legacy = Envelope::decode(br#"{"OperationId":"op-9"}"#).unwrap();
        assert_eq!(legacy.encode().unwrap(), payload);
    }

    #[test]
    fn test_missing_id_is_not_a_parse_error() {
        let envelope = Envelope::decode(b"{}").unwrap();
        assert_eq!(envelope.operation_id(), None);
        let blank = Envelope::decode(br#"{"operation_id":"  "}"#).unwrap();
        assert_eq!(blank.operation_id(), None);
    }

    #[test]
    fn test_garbage_is_a_serialization_error() {
        let err = Envelope::decode(b"not json").unwrap_err();
        assert!(matches!(err, Error::Serialization { .. }));
        assert!(!err.is_retryable());
    }
}
