//! One-shot upgrades between storage layouts.
//!
//! Migration 1 rewrites the legacy JSON file tree into the current
//! [`MultiSqliteBackend`](crate::storage::sqlite_backend::MultiSqliteBackend)
//! layout. Migration 2 extracts `summary.diffs` out of session records into
//! standalone `session_diff` records. Both run at most once per project,
//! gated by a sentinel file recording the highest applied version.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, instrument};

use crate::error::{StorageError, StorageResult};
use crate::storage::json_backend::JsonBackend;
use crate::storage::sqlite_backend::MultiSqliteBackend;
use crate::storage::{StorageBackend, StorageKey};

const CURRENT_VERSION: u32 = 2;
const SENTINEL_FILE: &str = "migration.json";

#[derive(Debug, Serialize, Deserialize, Default)]
struct Sentinel {
    version: u32,
}

/// Drives the legacy-layout-to-current-layout upgrade for one project.
pub struct Migrator {
    legacy_root: PathBuf,
    new_root: PathBuf,
    project_id: String,
}

impl Migrator {
    pub fn new(legacy_root: impl Into<PathBuf>, new_root: impl Into<PathBuf>, project_id: impl Into<String>) -> Self {
        Self {
            legacy_root: legacy_root.into(),
            new_root: new_root.into(),
            project_id: project_id.into(),
        }
    }

    fn sentinel_path(&self) -> PathBuf {
        self.new_root.join(SENTINEL_FILE)
    }

    async fn read_sentinel(&self) -> StorageResult<Sentinel> {
        match tokio::fs::read(self.sentinel_path()).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Sentinel::default()),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_sentinel(&self, sentinel: &Sentinel) -> StorageResult<()> {
        tokio::fs::create_dir_all(&self.new_root).await?;
        let bytes = serde_json::to_vec_pretty(sentinel)?;
        tokio::fs::write(self.sentinel_path(), bytes).await?;
        Ok(())
    }

    /// Apply every migration not yet reflected in the sentinel file.
    #[instrument(skip(self))]
    pub async fn migrate(&self) -> StorageResult<()> {
        let mut sentinel = self.read_sentinel().await?;
        if sentinel.version >= CURRENT_VERSION {
            info!(version = sentinel.version, "storage already up to date");
            return Ok(());
        }

        let backend = MultiSqliteBackend::connect(&self.new_root).await?;

        if sentinel.version < 1 {
            self.migrate_legacy_tree(&backend).await?;
            sentinel.version = 1;
            self.write_sentinel(&sentinel).await?;
        }

        if sentinel.version < 2 {
            self.extract_session_diffs(&backend).await?;
            sentinel.version = 2;
            self.write_sentinel(&sentinel).await?;
        }

        Ok(())
    }

    /// Migration 1: copy every `session`, `message`, and `part` record from
    /// the legacy JSON tree into the sqlite backend.
    async fn migrate_legacy_tree(&self, backend: &MultiSqliteBackend) -> StorageResult<()> {
        if !self.legacy_root.exists() {
            return Ok(());
        }
        let legacy = JsonBackend::new(&self.legacy_root);

        let sessions = legacy.list(&StorageKey::new(["session"])?).await.unwrap_or_default();
        for key in &sessions {
            let value = legacy.read_raw(key).await?;
            let session_id = key
                .segment(key.segments().len() - 1)
                .ok_or_else(|| StorageError::InvalidKey("malformed legacy session key".into()))?;
            let new_key = StorageKey::new(["session", self.project_id.as_str(), session_id])?;
            backend.write_raw(&new_key, value).await?;
        }

        let messages = legacy.list(&StorageKey::new(["message"])?).await.unwrap_or_default();
        for key in &messages {
            let value = legacy.read_raw(key).await?;
            backend.write_raw(key, value).await?;
        }

        let parts = legacy.list(&StorageKey::new(["part"])?).await.unwrap_or_default();
        for key in &parts {
            let value = legacy.read_raw(key).await?;
            backend.write_raw(key, value).await?;
        }

        info!(
            sessions = sessions.len(),
            messages = messages.len(),
            parts = parts.len(),
            "migrated legacy storage tree"
        );
        Ok(())
    }

    /// Migration 2: pull `summary.diffs` out of each session record into a
    /// standalone `session_diff/{sessionID}` record, replacing it with a
    /// compact `{additions, deletions}` pair in the session record.
    async fn extract_session_diffs(&self, backend: &MultiSqliteBackend) -> StorageResult<()> {
        let sessions = backend
            .list(&StorageKey::new(["session", self.project_id.as_str()])?)
            .await?;

        for key in sessions {
            let mut value = backend.read_raw(&key).await?;
            let Some(diffs) = value.get("summary").and_then(|s| s.get("diffs")).cloned() else {
                continue;
            };

            let session_id = key
                .segment(key.segments().len() - 1)
                .ok_or_else(|| StorageError::InvalidKey("malformed session key".into()))?;
            let diff_key = StorageKey::new(["session_diff", session_id])?;
            backend.write_raw(&diff_key, diffs.clone()).await?;

            let (additions, deletions) = summarize_diffs(&diffs);
            if let Some(summary) = value.get_mut("summary").and_then(|s| s.as_object_mut()) {
                summary.remove("diffs");
                summary.insert("additions".to_string(), json!(additions));
                summary.insert("deletions".to_string(), json!(deletions));
            }
            backend.write_raw(&key, value).await?;
        }
        Ok(())
    }
}

fn summarize_diffs(diffs: &serde_json::Value) -> (i64, i64) {
    let Some(entries) = diffs.as_array() else {
        return (0, 0);
    };
    entries.iter().fold((0, 0), |(add, del), entry| {
        let a = entry.get("additions").and_then(|v| v.as_i64()).unwrap_or(0);
        let d = entry.get("deletions").and_then(|v| v.as_i64()).unwrap_or(0);
        (add + a, del + d)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn migrates_legacy_sessions_and_gates_on_sentinel() {
        let legacy_dir = tempfile::tempdir().unwrap();
        let new_dir = tempfile::tempdir().unwrap();

        let legacy = JsonBackend::new(legacy_dir.path());
        let key = StorageKey::new(["session", "s1"]).unwrap();
        legacy
            .write_raw(&key, json!({"id": "s1", "summary": {"diffs": [{"additions": 3, "deletions": 1}]}}))
            .await
            .unwrap();

        let migrator = Migrator::new(legacy_dir.path(), new_dir.path(), "proj1");
        migrator.migrate().await.unwrap();

        let backend = MultiSqliteBackend::connect(new_dir.path()).await.unwrap();
        let migrated = backend
            .read_raw(&StorageKey::new(["session", "proj1", "s1"]).unwrap())
            .await
            .unwrap();
        assert_eq!(migrated["summary"]["additions"], json!(3));
        assert_eq!(migrated["summary"]["deletions"], json!(1));
        assert!(migrated["summary"]["diffs"].is_null());

        let diff = backend
            .read_raw(&StorageKey::new(["session_diff", "s1"]).unwrap())
            .await
            .unwrap();
        assert_eq!(diff, json!([{"additions": 3, "deletions": 1}]));

        // Second run is a no-op because the sentinel is already at CURRENT_VERSION.
        migrator.migrate().await.unwrap();
    }

    #[tokio::test]
    async fn missing_legacy_tree_is_not_an_error() {
        let new_dir = tempfile::tempdir().unwrap();
        let migrator = Migrator::new("/nonexistent/legacy/path", new_dir.path(), "proj1");
        migrator.migrate().await.unwrap();
    }
}
