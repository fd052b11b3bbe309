//! In-memory store backend

use std::collections::BTreeMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

use super::records::{Backend, Kind, RecordKey, RecordStore};
use crate::Result;

/// Records kept in a process-local ordered map
#[derive(Default)]
pub struct MemoryBackend {
    records: RwLock<BTreeMap<RecordKey, Value>>,
}

/// A [`RecordStore`] over [`MemoryBackend`]
pub type MemoryStore = RecordStore<MemoryBackend>;

impl MemoryStore {
    /// An empty in-memory store
    pub fn in_memory() -> Self {
        RecordStore::new(MemoryBackend::default())
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn read(&self, key: &RecordKey) -> Result<Option<Value>> {
        Ok(self.records.read().get(key).cloned())
    }

    async fn write(&self, key: &RecordKey, value: &Value) -> Result<()> {
        self.records.write().insert(key.clone(), value.clone());
        Ok(())
    }

    async fn swap(&self, key: &RecordKey, expected: &Value, value: &Value) -> Result<bool> {
        let mut records = self.records.write();
        match records.get(key) {
            Some(current) if current == expected => {
                records.insert(key.clone(), value.clone());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn remove(&self, key: &RecordKey) -> Result<bool> {
        Ok(self.records.write().remove(key).is_some())
    }

    async fn list(&self, kind: Kind, owner: &str, parent: &str) -> Result<Vec<Value>> {
        Ok(self
            .records
            .read()
            .iter()
            .filter(|(k, _)| k.kind == kind && k.owner == owner && k.parent == parent)
            .map(|(_, v)| v.clone())
            .collect())
    }
}
