//! The legacy file-tree storage backend. Used only as the migration
//! source; new writes should go through
//! [`MultiSqliteBackend`](crate::storage::sqlite_backend::MultiSqliteBackend).

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::instrument;

use crate::error::{StorageError, StorageResult};
use crate::lock::LockRegistry;
use crate::storage::{StorageBackend, StorageKey};

/// A file-tree backend rooted at `{dataRoot}/{session|message|part}/…/*.json`,
/// one JSON file per record, guarded by a per-path advisory lock registry.
pub struct JsonBackend {
    root: PathBuf,
    locks: LockRegistry,
}

impl JsonBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            locks: LockRegistry::new(),
        }
    }

    fn path_for(&self, key: &StorageKey) -> PathBuf {
        let mut path = self.root.clone();
        for segment in key.segments() {
            path.push(segment);
        }
        path.set_extension("json");
        path
    }

    fn dir_for(&self, key: &StorageKey) -> PathBuf {
        let mut path = self.root.clone();
        for segment in key.segments() {
            path.push(segment);
        }
        path
    }
}

#[async_trait]
impl StorageBackend for JsonBackend {
    #[instrument(skip(self), fields(key = %key))]
    async fn read_raw(&self, key: &StorageKey) -> StorageResult<serde_json::Value> {
        let path = self.path_for(key);
        let _guard = self.locks.read(&path).await;
        let contents = tokio::fs::read(&path)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => StorageError::NotFound(key.as_string()),
                _ => StorageError::Io(e),
            })?;
        Ok(serde_json::from_slice(&contents)?)
    }

    #[instrument(skip(self, value), fields(key = %key))]
    async fn write_raw(&self, key: &StorageKey, value: serde_json::Value) -> StorageResult<()> {
        let path = self.path_for(key);
        let _guard = self.locks.write(&path).await;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let contents = serde_json::to_vec_pretty(&value)?;
        tokio::fs::write(&path, contents).await?;
        Ok(())
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn remove(&self, key: &StorageKey) -> StorageResult<()> {
        let path = self.path_for(key);
        let dir = self.dir_for(key);
        let _guard = self.locks.write(&path).await;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        self.locks.prune();
        Ok(())
    }

    #[instrument(skip(self), fields(prefix = %prefix))]
    async fn list(&self, prefix: &StorageKey) -> StorageResult<Vec<StorageKey>> {
        let dir = self.dir_for(prefix);
        let mut out = Vec::new();
        walk(&dir, prefix, &mut out).await?;
        out.sort();
        Ok(out)
    }
}

fn walk<'a>(
    dir: &'a PathBuf,
    prefix: &'a StorageKey,
    out: &'a mut Vec<StorageKey>,
) -> std::pin::Pin<Box<dyn std::future::Future<Output = StorageResult<()>> + Send + 'a>> {
    Box::pin(async move {
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                let segment = entry.file_name().to_string_lossy().to_string();
                let mut child_segments: Vec<String> = prefix.segments().to_vec();
                child_segments.push(segment);
                let child_key = StorageKey::new(child_segments)?;
                walk(&path, &child_key, out).await?;
            } else if path.extension().and_then(|e| e.to_str()) == Some("json") {
                let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
                let mut segments: Vec<String> = prefix.segments().to_vec();
                segments.push(stem.to_string());
                out.push(StorageKey::new(segments)?);
            }
        }
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let backend = JsonBackend::new(dir.path());
        let key = StorageKey::new(["session", "p1", "s1"]).unwrap();
        backend.write_raw(&key, json!({"id": "s1"})).await.unwrap();
        assert_eq!(backend.read_raw(&key).await.unwrap(), json!({"id": "s1"}));
    }

    #[tokio::test]
    async fn read_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let backend = JsonBackend::new(dir.path());
        let key = StorageKey::new(["session", "p1", "missing"]).unwrap();
        assert!(matches!(backend.read_raw(&key).await, Err(StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn list_finds_written_children() {
        let dir = tempfile::tempdir().unwrap();
        let backend = JsonBackend::new(dir.path());
        for id in ["s1", "s2"] {
            let key = StorageKey::new(["session", "p1", id]).unwrap();
            backend.write_raw(&key, json!({"id": id})).await.unwrap();
        }
        let keys = backend.list(&StorageKey::new(["session", "p1"]).unwrap()).await.unwrap();
        assert_eq!(keys.len(), 2);
    }

    #[tokio::test]
    async fn remove_deletes_file_and_children() {
        let dir = tempfile::tempdir().unwrap();
        let backend = JsonBackend::new(dir.path());
        let key = StorageKey::new(["session", "p1", "s1"]).unwrap();
        backend.write_raw(&key, json!({})).await.unwrap();
        backend.remove(&key).await.unwrap();
        assert!(matches!(backend.read_raw(&key).await, Err(StorageError::NotFound(_))));
    }
}
