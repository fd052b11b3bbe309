//! File-backed store backend
//!
//! Each record is one JSON file at `<root>/<kind>/<owner>/<parent>/<name>.json`,
//! with `_` standing in for an empty owner or parent. Writes go to a
//! temporary file first and are renamed into place. Mutations within one
//! process are serialized so a swap's read and write cannot interleave with
//! another writer.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::Mutex;

use super::records::{Backend, Kind, RecordKey, RecordStore};
use crate::{Error, Result};

const EMPTY_SEGMENT: &str = "_";

/// Records stored as JSON files under a root directory
pub struct FileBackend {
    root: PathBuf,
    writes: Mutex<()>,
}

impl FileBackend {
    /// Use `root` as the store directory; it is created on first write
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            writes: Mutex::new(()),
        }
    }

    /// A [`RecordStore`] over files in `root`
    pub fn store(root: impl Into<PathBuf>) -> RecordStore<FileBackend> {
        RecordStore::new(Self::new(root))
    }

    fn dir(&self, kind: Kind, owner: &str, parent: &str) -> Result<PathBuf> {
        Ok(self
            .root
            .join(kind.as_str())
            .join(segment(owner)?)
            .join(segment(parent)?))
    }

    fn path(&self, key: &RecordKey) -> Result<PathBuf> {
        let name = segment(&key.name)?;
        Ok(self
            .dir(key.kind, &key.owner, &key.parent)?
            .join(format!("{name}.json")))
    }

    async fn write_file(&self, key: &RecordKey, value: &Value) -> Result<()> {
        let path = self.path(key)?;
        let dir = self.dir(key.kind, &key.owner, &key.parent)?;
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| io_error(&dir, e))?;

        let bytes = serde_json::to_vec_pretty(value)?;
        let tmp = path.with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| io_error(&tmp, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| io_error(&path, e))
    }
}

fn segment(value: &str) -> Result<&str> {
    if value.is_empty() {
        return Ok(EMPTY_SEGMENT);
    }
    if value == EMPTY_SEGMENT
        || value.starts_with('.')
        || value.contains(['/', '\\'])
        || value.contains('\0')
    {
        return Err(Error::validation(format!(
            "invalid record name for file store: {value:?}"
        )));
    }
    Ok(value)
}

fn io_error(path: &Path, e: std::io::Error) -> Error {
    Error::store(path.display().to_string(), e.to_string())
}

#[async_trait]
impl Backend for FileBackend {
    async fn read(&self, key: &RecordKey) -> Result<Option<Value>> {
        let path = self.path(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| Error::serialization_for_kind(key.kind.as_str(), e.to_string())),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error(&path, e)),
        }
    }

    async fn write(&self, key: &RecordKey, value: &Value) -> Result<()> {
        let _guard = self.writes.lock().await;
        self.write_file(key, value).await
    }

    async fn swap(&self, key: &RecordKey, expected: &Value, value: &Value) -> Result<bool> {
        let _guard = self.writes.lock().await;
        if self.read(key).await?.as_ref() != Some(expected) {
            return Ok(false);
        }
        self.write_file(key, value).await?;
        Ok(true)
    }

    async fn remove(&self, key: &RecordKey) -> Result<bool> {
        let path = self.path(key)?;
        let _guard = self.writes.lock().await;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(io_error(&path, e)),
        }
    }

    async fn list(&self, kind: Kind, owner: &str, parent: &str) -> Result<Vec<Value>> {
        let dir = self.dir(kind, owner, parent)?;
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(io_error(&dir, e)),
        };

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await.map_err(|e| io_error(&dir, e))? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) == Some("json") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut values = Vec::with_capacity(paths.len());
        for path in paths {
            let bytes = tokio::fs::read(&path)
                .await
                .map_err(|e| io_error(&path, e))?;
            values.push(
                serde_json::from_slice(&bytes)
                    .map_err(|e| Error::serialization_for_kind(kind.as_str(), e.to_string()))?,
            );
        }
        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{
        Cluster, ClusterPhase, ClusterSpec, Operation, OperationState, ProviderType,
    };
    use crate::store::{ResourceStore, Store};

    fn cluster(name: &str) -> Cluster {
        Cluster::new(
            name,
            ClusterSpec {
                provider: ProviderType::Hetzner,
                credential_name: "hcloud".into(),
                region: "nbg1".into(),
                kubernetes_version: "1.30.4".into(),
                ..Default::default()
            },
        )
    }

    /// Story: Records survive a process restart
    #[tokio::test]
    async fn story_records_persist_across_instances() {
        let dir = tempfile::tempdir().unwrap();

        let created = {
            let store = FileBackend::store(dir.path());
            let op = Operation::new("uid", "tenant");
            store.create_operation(&op).await.unwrap();
            let created = store.scoped("tenant").create_cluster(&cluster("prod")).await.unwrap();
            (op, created)
        };

        let reopened = FileBackend::store(dir.path());
        assert_eq!(reopened.get_operation(&created.0.id).await.unwrap(), created.0);
        let (owner, found) = reopened.find_cluster_by_id(created.1.id()).await.unwrap();
        assert_eq!(owner, "tenant");
        assert_eq!(found.name(), "prod");
    }

    #[tokio::test]
    async fn test_status_update_on_disk() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBackend::store(dir.path());
        let scope = store.scoped("t");
        let mut c = scope.create_cluster(&cluster("prod")).await.unwrap();

        c.status.phase = ClusterPhase::Failing;
        c.status.reason = Some("quota exceeded".into());
        scope.update_cluster_status(&c).await.unwrap();

        let loaded = scope.get_cluster("prod").await.unwrap();
        assert_eq!(loaded.status.phase, ClusterPhase::Failing);
        assert_eq!(loaded.status.reason.as_deref(), Some("quota exceeded"));
    }

    #[tokio::test]
    async fn test_claim_on_disk_is_exclusive() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(FileBackend::store(dir.path()));
        let op = Operation::new("uid", "tenant");
        store.create_operation(&op).await.unwrap();

        let claim = |store: std::sync::Arc<RecordStore<FileBackend>>| {
            let id = op.id.clone();
            async move {
                store
                    .claim_operation(&id, OperationState::Pending, OperationState::Running)
                    .await
                    .unwrap()
            }
        };
        let (a, b) = tokio::join!(claim(store.clone()), claim(store.clone()));
        assert_eq!(a.is_some() as u8 + b.is_some() as u8, 1);
        assert_eq!(
            store.get_operation(&op.id).await.unwrap().state,
            OperationState::Running
        );
    }

    #[tokio::test]
    async fn test_list_missing_directory_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBackend::store(dir.path());
        assert!(store.scoped("nobody").list_clusters().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_rejects_path_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileBackend::store(dir.path());
        let err = store.scoped("../etc").list_clusters().await.unwrap_err();
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_empty_segment_placeholder() {
        assert_eq!(segment("").unwrap(), EMPTY_SEGMENT);
        assert!(segment("_").is_err());
        assert!(segment("a/b").is_err());
        assert_eq!(segment("prod").unwrap(), "prod");
    }
}
