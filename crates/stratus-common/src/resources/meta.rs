//! Object metadata carried by every owned record

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identity and bookkeeping for a stored record
#[derive(Clone, Debug, Default, Deserialize, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Name, unique per owner and kind
    pub name: String,
    /// Stable identifier assigned at creation
    #[serde(default)]
    pub uid: String,
    /// Spec generation, bumped when the spec changes
    #[serde(default)]
    pub generation: i64,
    /// Store write counter, bumped on every write
    #[serde(default)]
    pub resource_version: u64,
    /// When the record was created
    #[serde(default)]
    pub creation_timestamp: Option<DateTime<Utc>>,
    /// Set when deletion has been requested
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deletion_timestamp: Option<DateTime<Utc>>,
    /// Free-form labels
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Finalizers that block record removal
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub finalizers: Vec<String>,
}

impl ObjectMeta {
    /// Metadata for a new record with a fresh UID
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            uid: uuid::Uuid::new_v4().to_string(),
            generation: 1,
            creation_timestamp: Some(Utc::now()),
            ..Default::default()
        }
    }

    /// Returns true if deletion has been requested
    pub fn is_deleting(&self) -> bool {
        self.deletion_timestamp.is_some()
    }

    /// Returns true if the finalizer is present
    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }

    /// Add a finalizer if absent
    pub fn add_finalizer(&mut self, finalizer: &str) {
        if !self.has_finalizer(finalizer) {
            self.finalizers.push(finalizer.to_string());
        }
    }

    /// Remove a finalizer if present
    pub fn remove_finalizer(&mut self, finalizer: &str) {
        self.finalizers.retain(|f| f != finalizer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_assigns_uid_and_timestamp() {
        let a = ObjectMeta::new("web");
        let b = ObjectMeta::new("web");
        assert_ne!(a.uid, b.uid);
        assert!(a.creation_timestamp.is_some());
        assert_eq!(a.generation, 1);
    }

    #[test]
    fn test_finalizers_are_idempotent() {
        let mut meta = ObjectMeta::new("m");
        meta.add_finalizer("machine.stratus.io");
        meta.add_finalizer("machine.stratus.io");
        assert_eq!(meta.finalizers.len(), 1);

        meta.remove_finalizer("machine.stratus.io");
        meta.remove_finalizer("machine.stratus.io");
        assert!(meta.finalizers.is_empty());
    }
}
