//! The specified storage backend: one metadata SQLite database per project
//! plus one SQLite database per session, opened lazily and cached for the
//! life of the process.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex as SyncMutex;
use rusqlite::{Connection, OptionalExtension, params};
use tokio::sync::Mutex as AsyncMutex;
use tracing::instrument;

use crate::error::{StorageError, StorageResult};
use crate::storage::{StorageBackend, StorageKey};

const METADATA_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS sessions(
    session_id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL,
    data       TEXT NOT NULL,
    created_at INTEGER DEFAULT (unixepoch()),
    updated_at INTEGER DEFAULT (unixepoch())
);
CREATE INDEX IF NOT EXISTS idx_project_id ON sessions(project_id);
CREATE INDEX IF NOT EXISTS idx_updated_at ON sessions(updated_at DESC);

CREATE TABLE IF NOT EXISTS session_diffs(
    session_id TEXT PRIMARY KEY,
    data       TEXT NOT NULL,
    created_at INTEGER DEFAULT (unixepoch()),
    updated_at INTEGER DEFAULT (unixepoch())
);

CREATE TABLE IF NOT EXISTS projects(
    key        TEXT PRIMARY KEY,
    data       TEXT NOT NULL,
    created_at INTEGER DEFAULT (unixepoch()),
    updated_at INTEGER DEFAULT (unixepoch())
);
"#;

const SESSION_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS storage(
    key        TEXT PRIMARY KEY,
    type       TEXT NOT NULL,
    data       TEXT NOT NULL,
    created_at INTEGER DEFAULT (unixepoch()),
    updated_at INTEGER DEFAULT (unixepoch())
);
CREATE INDEX IF NOT EXISTS idx_type ON storage(type);
"#;

fn apply_pragmas(conn: &Connection) -> StorageResult<()> {
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
    Ok(())
}

/// One metadata database per project, one database per session.
pub struct MultiSqliteBackend {
    root: PathBuf,
    metadata: Arc<SyncMutex<Connection>>,
    /// Per-session DB handles, opened lazily and cached for the process
    /// lifetime. Guarded by an async mutex because opening a new session DB
    /// does blocking file I/O.
    sessions: AsyncMutex<HashMap<String, Arc<SyncMutex<Connection>>>>,
    /// In-memory `messageID -> sessionID` map. Not persisted: callers are
    /// expected to write a message before any of its parts in the same
    /// process, per the spec's routing contract.
    message_sessions: SyncMutex<HashMap<String, String>>,
}

impl MultiSqliteBackend {
    #[instrument(skip_all, fields(root = %root.as_ref().display()))]
    pub async fn connect(root: impl AsRef<Path>) -> StorageResult<Self> {
        let root = root.as_ref().to_path_buf();
        let metadata_path = root.join("sessions.db");
        let root_for_blocking = root.clone();
        let conn = tokio::task::spawn_blocking(move || -> StorageResult<Connection> {
            std::fs::create_dir_all(&root_for_blocking)?;
            let conn = Connection::open(root_for_blocking.join("sessions.db"))?;
            apply_pragmas(&conn)?;
            conn.execute_batch(METADATA_SCHEMA)?;
            Ok(conn)
        })
        .await
        .map_err(|e| StorageError::Database(e.to_string()))??;

        let _ = &metadata_path;
        Ok(Self {
            root,
            metadata: Arc::new(SyncMutex::new(conn)),
            sessions: AsyncMutex::new(HashMap::new()),
            message_sessions: SyncMutex::new(HashMap::new()),
        })
    }

    fn session_db_path(&self, session_id: &str) -> PathBuf {
        self.root.join("sessions").join(format!("{session_id}.db"))
    }

    async fn session_conn(&self, session_id: &str) -> StorageResult<Arc<SyncMutex<Connection>>> {
        let mut sessions = self.sessions.lock().await;
        if let Some(conn) = sessions.get(session_id) {
            return Ok(conn.clone());
        }
        let path = self.session_db_path(session_id);
        let conn = tokio::task::spawn_blocking(move || -> StorageResult<Connection> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let conn = Connection::open(path)?;
            apply_pragmas(&conn)?;
            conn.execute_batch(SESSION_SCHEMA)?;
            Ok(conn)
        })
        .await
        .map_err(|e| StorageError::Database(e.to_string()))??;
        let conn = Arc::new(SyncMutex::new(conn));
        sessions.insert(session_id.to_string(), conn.clone());
        Ok(conn)
    }

    fn resolve_session_for_message(&self, message_id: &str) -> StorageResult<String> {
        self.message_sessions
            .lock()
            .get(message_id)
            .cloned()
            .ok_or_else(|| StorageError::SessionUnknown(message_id.to_string()))
    }

    async fn run_metadata<F, R>(&self, f: F) -> StorageResult<R>
    where
        F: FnOnce(&Connection) -> StorageResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self.metadata.clone();
        tokio::task::spawn_blocking(move || f(&conn.lock()))
            .await
            .map_err(|e| StorageError::Database(e.to_string()))?
    }

    async fn run_session<F, R>(&self, session_id: &str, f: F) -> StorageResult<R>
    where
        F: FnOnce(&Connection) -> StorageResult<R> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self.session_conn(session_id).await?;
        tokio::task::spawn_blocking(move || f(&conn.lock()))
            .await
            .map_err(|e| StorageError::Database(e.to_string()))?
    }

    fn require_segment(key: &StorageKey, index: usize) -> StorageResult<String> {
        key.segment(index)
            .map(str::to_string)
            .ok_or_else(|| StorageError::InvalidKey(format!("key {key} missing segment {index}")))
    }
}

#[async_trait]
impl StorageBackend for MultiSqliteBackend {
    #[instrument(skip(self), fields(key = %key))]
    async fn read_raw(&self, key: &StorageKey) -> StorageResult<serde_json::Value> {
        match key.kind() {
            "session" => {
                let project_id = Self::require_segment(key, 1)?;
                let session_id = Self::require_segment(key, 2)?;
                self.run_metadata(move |conn| {
                    let data: Option<String> = conn
                        .query_row(
                            "SELECT data FROM sessions WHERE session_id = ?1 AND project_id = ?2",
                            params![session_id, project_id],
                            |row| row.get(0),
                        )
                        .optional()?;
                    let data = data.ok_or_else(|| StorageError::NotFound(key_not_found_msg("session")))?;
                    Ok(serde_json::from_str(&data)?)
                })
                .await
            }
            "session_diff" => {
                let session_id = Self::require_segment(key, 1)?;
                self.run_metadata(move |conn| {
                    let data: Option<String> = conn
                        .query_row(
                            "SELECT data FROM session_diffs WHERE session_id = ?1",
                            params![session_id],
                            |row| row.get(0),
                        )
                        .optional()?;
                    let data = data.ok_or_else(|| StorageError::NotFound(key_not_found_msg("session_diff")))?;
                    Ok(serde_json::from_str(&data)?)
                })
                .await
            }
            "project" => {
                let key_str = key.as_string();
                self.run_metadata(move |conn| {
                    let data: Option<String> = conn
                        .query_row(
                            "SELECT data FROM projects WHERE key = ?1",
                            params![key_str],
                            |row| row.get(0),
                        )
                        .optional()?;
                    let data = data.ok_or_else(|| StorageError::NotFound(key_not_found_msg("project")))?;
                    Ok(serde_json::from_str(&data)?)
                })
                .await
            }
            "message" => {
                let session_id = Self::require_segment(key, 1)?;
                let key_str = key.as_string();
                self.run_session(&session_id, move |conn| {
                    let data: Option<String> = conn
                        .query_row("SELECT data FROM storage WHERE key = ?1", params![key_str], |row| {
                            row.get(0)
                        })
                        .optional()?;
                    let data = data.ok_or_else(|| StorageError::NotFound(key_not_found_msg("message")))?;
                    Ok(serde_json::from_str(&data)?)
                })
                .await
            }
            "part" => {
                let message_id = Self::require_segment(key, 1)?;
                let session_id = self.resolve_session_for_message(&message_id)?;
                let key_str = key.as_string();
                self.run_session(&session_id, move |conn| {
                    let data: Option<String> = conn
                        .query_row("SELECT data FROM storage WHERE key = ?1", params![key_str], |row| {
                            row.get(0)
                        })
                        .optional()?;
                    let data = data.ok_or_else(|| StorageError::NotFound(key_not_found_msg("part")))?;
                    Ok(serde_json::from_str(&data)?)
                })
                .await
            }
            other => Err(StorageError::InvalidKey(format!("unknown key type: {other}"))),
        }
    }

    #[instrument(skip(self, value), fields(key = %key))]
    async fn write_raw(&self, key: &StorageKey, value: serde_json::Value) -> StorageResult<()> {
        let data = serde_json::to_string(&value)?;
        match key.kind() {
            "session" => {
                let project_id = Self::require_segment(key, 1)?;
                let session_id = Self::require_segment(key, 2)?;
                self.run_metadata(move |conn| {
                    conn.execute(
                        "INSERT INTO sessions(session_id, project_id, data) VALUES (?1, ?2, ?3)
                         ON CONFLICT(session_id) DO UPDATE SET data = excluded.data, updated_at = unixepoch()",
                        params![session_id, project_id, data],
                    )?;
                    Ok(())
                })
                .await
            }
            "session_diff" => {
                let session_id = Self::require_segment(key, 1)?;
                self.run_metadata(move |conn| {
                    conn.execute(
                        "INSERT INTO session_diffs(session_id, data) VALUES (?1, ?2)
                         ON CONFLICT(session_id) DO UPDATE SET data = excluded.data, updated_at = unixepoch()",
                        params![session_id, data],
                    )?;
                    Ok(())
                })
                .await
            }
            "project" => {
                let key_str = key.as_string();
                self.run_metadata(move |conn| {
                    conn.execute(
                        "INSERT INTO projects(key, data) VALUES (?1, ?2)
                         ON CONFLICT(key) DO UPDATE SET data = excluded.data, updated_at = unixepoch()",
                        params![key_str, data],
                    )?;
                    Ok(())
                })
                .await
            }
            "message" => {
                let session_id = Self::require_segment(key, 1)?;
                let message_id = Self::require_segment(key, 2)?;
                let key_str = key.as_string();
                self.run_session(&session_id, move |conn| {
                    conn.execute(
                        "INSERT INTO storage(key, type, data) VALUES (?1, 'message', ?2)
                         ON CONFLICT(key) DO UPDATE SET data = excluded.data, updated_at = unixepoch()",
                        params![key_str, data],
                    )?;
                    Ok(())
                })
                .await?;
                self.message_sessions.lock().insert(message_id, session_id);
                Ok(())
            }
            "part" => {
                let message_id = Self::require_segment(key, 1)?;
                let session_id = self.resolve_session_for_message(&message_id)?;
                let key_str = key.as_string();
                self.run_session(&session_id, move |conn| {
                    conn.execute(
                        "INSERT INTO storage(key, type, data) VALUES (?1, 'part', ?2)
                         ON CONFLICT(key) DO UPDATE SET data = excluded.data, updated_at = unixepoch()",
                        params![key_str, data],
                    )?;
                    Ok(())
                })
                .await
            }
            other => Err(StorageError::InvalidKey(format!("unknown key type: {other}"))),
        }
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn remove(&self, key: &StorageKey) -> StorageResult<()> {
        match key.kind() {
            "session" => {
                let session_id = Self::require_segment(key, 2)?;
                self.run_metadata({
                    let session_id = session_id.clone();
                    move |conn| {
                        conn.execute("DELETE FROM sessions WHERE session_id = ?1", params![session_id])?;
                        Ok(())
                    }
                })
                .await?;
                self.evict_session(&session_id).await?;
                Ok(())
            }
            "session_diff" => {
                let session_id = Self::require_segment(key, 1)?;
                self.run_metadata(move |conn| {
                    conn.execute("DELETE FROM session_diffs WHERE session_id = ?1", params![session_id])?;
                    Ok(())
                })
                .await
            }
            "project" => {
                let key_str = key.as_string();
                let like_pattern = format!("{key_str}/%");
                self.run_metadata(move |conn| {
                    conn.execute(
                        "DELETE FROM projects WHERE key = ?1 OR key LIKE ?2",
                        params![key_str, like_pattern],
                    )?;
                    Ok(())
                })
                .await
            }
            "message" => {
                let session_id = Self::require_segment(key, 1)?;
                let message_id = Self::require_segment(key, 2)?;
                let key_str = key.as_string();
                let like_pattern = format!("{key_str}/%");
                self.run_session(&session_id, move |conn| {
                    conn.execute(
                        "DELETE FROM storage WHERE key = ?1 OR key LIKE ?2",
                        params![key_str, like_pattern],
                    )?;
                    Ok(())
                })
                .await?;
                self.message_sessions.lock().remove(&message_id);
                Ok(())
            }
            "part" => {
                let message_id = Self::require_segment(key, 1)?;
                let session_id = self.resolve_session_for_message(&message_id)?;
                let key_str = key.as_string();
                let like_pattern = format!("{key_str}/%");
                self.run_session(&session_id, move |conn| {
                    conn.execute(
                        "DELETE FROM storage WHERE key = ?1 OR key LIKE ?2",
                        params![key_str, like_pattern],
                    )?;
                    Ok(())
                })
                .await
            }
            other => Err(StorageError::InvalidKey(format!("unknown key type: {other}"))),
        }
    }

    #[instrument(skip(self), fields(prefix = %prefix))]
    async fn list(&self, prefix: &StorageKey) -> StorageResult<Vec<StorageKey>> {
        match prefix.kind() {
            "session" => {
                let project_id = Self::require_segment(prefix, 1)?;
                self.run_metadata(move |conn| {
                    let mut stmt = conn.prepare(
                        "SELECT session_id FROM sessions WHERE project_id = ?1 ORDER BY updated_at DESC",
                    )?;
                    let rows = stmt
                        .query_map(params![project_id], |row| row.get::<_, String>(0))?
                        .collect::<Result<Vec<_>, _>>()?;
                    rows.into_iter()
                        .map(|session_id| StorageKey::new(["session", project_id.as_str(), session_id.as_str()]))
                        .collect::<StorageResult<Vec<_>>>()
                })
                .await
            }
            "session_diff" => {
                self.run_metadata(move |conn| {
                    let mut stmt = conn.prepare("SELECT session_id FROM session_diffs ORDER BY session_id")?;
                    let rows = stmt
                        .query_map([], |row| row.get::<_, String>(0))?
                        .collect::<Result<Vec<_>, _>>()?;
                    rows.into_iter()
                        .map(|session_id| StorageKey::new(["session_diff", session_id.as_str()]))
                        .collect::<StorageResult<Vec<_>>>()
                })
                .await
            }
            "project" => {
                let prefix_str = prefix.as_string();
                let pattern = format!("{prefix_str}/%");
                self.run_metadata(move |conn| {
                    let mut stmt =
                        conn.prepare("SELECT key FROM projects WHERE key = ?1 OR key LIKE ?2 ORDER BY key")?;
                    let rows = stmt
                        .query_map(params![prefix_str, pattern], |row| row.get::<_, String>(0))?
                        .collect::<Result<Vec<_>, _>>()?;
                    rows.into_iter().map(|k| StorageKey::parse(&k)).collect::<StorageResult<Vec<_>>>()
                })
                .await
            }
            "message" => {
                let session_id = Self::require_segment(prefix, 1)?;
                let pattern = format!("{}/%", prefix.as_string());
                self.run_session(&session_id, move |conn| {
                    let mut stmt = conn.prepare("SELECT key FROM storage WHERE key LIKE ?1 ORDER BY key")?;
                    let rows = stmt
                        .query_map(params![pattern], |row| row.get::<_, String>(0))?
                        .collect::<Result<Vec<_>, _>>()?;
                    rows.into_iter().map(|k| StorageKey::parse(&k)).collect::<StorageResult<Vec<_>>>()
                })
                .await
            }
            "part" => {
                let message_id = Self::require_segment(prefix, 1)?;
                let session_id = self.resolve_session_for_message(&message_id)?;
                let pattern = format!("{}/%", prefix.as_string());
                self.run_session(&session_id, move |conn| {
                    let mut stmt = conn.prepare("SELECT key FROM storage WHERE key LIKE ?1 ORDER BY key")?;
                    let rows = stmt
                        .query_map(params![pattern], |row| row.get::<_, String>(0))?
                        .collect::<Result<Vec<_>, _>>()?;
                    rows.into_iter().map(|k| StorageKey::parse(&k)).collect::<StorageResult<Vec<_>>>()
                })
                .await
            }
            other => Err(StorageError::InvalidKey(format!("unknown key type: {other}"))),
        }
    }
}

impl MultiSqliteBackend {
    /// Drop the cached connection for `session_id` and unlink its DB file
    /// and WAL/SHM sidecars.
    async fn evict_session(&self, session_id: &str) -> StorageResult<()> {
        {
            let mut sessions = self.sessions.lock().await;
            sessions.remove(session_id);
        }
        self.message_sessions.lock().retain(|_, sid| sid != session_id);

        let path = self.session_db_path(session_id);
        tokio::task::spawn_blocking(move || -> StorageResult<()> {
            for suffix in ["", "-wal", "-shm"] {
                let candidate = PathBuf::from(format!("{}{suffix}", path.display()));
                match std::fs::remove_file(&candidate) {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
            Ok(())
        })
        .await
        .map_err(|e| StorageError::Database(e.to_string()))??;
        Ok(())
    }
}

fn key_not_found_msg(kind: &str) -> String {
    format!("{kind} not found")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn backend() -> (MultiSqliteBackend, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let backend = MultiSqliteBackend::connect(dir.path()).await.unwrap();
        (backend, dir)
    }

    #[tokio::test]
    async fn write_then_read_session() {
        let (backend, _dir) = backend().await;
        let key = StorageKey::new(["session", "proj1", "s1"]).unwrap();
        backend.write_raw(&key, json!({"id": "s1"})).await.unwrap();
        let value = backend.read_raw(&key).await.unwrap();
        assert_eq!(value, json!({"id": "s1"}));
    }

    #[tokio::test]
    async fn read_missing_session_is_not_found() {
        let (backend, _dir) = backend().await;
        let key = StorageKey::new(["session", "proj1", "missing"]).unwrap();
        assert!(matches!(backend.read_raw(&key).await, Err(StorageError::NotFound(_))));
    }

    #[tokio::test]
    async fn list_sessions_by_project_ordered_by_recency() {
        let (backend, _dir) = backend().await;
        for id in ["s1", "s2"] {
            let key = StorageKey::new(["session", "proj1", id]).unwrap();
            backend.write_raw(&key, json!({"id": id})).await.unwrap();
        }
        let keys = backend.list(&StorageKey::new(["session", "proj1"]).unwrap()).await.unwrap();
        assert_eq!(keys.len(), 2);
    }

    #[tokio::test]
    async fn part_write_without_message_is_session_unknown() {
        let (backend, _dir) = backend().await;
        let key = StorageKey::new(["part", "mUnknown", "p0"]).unwrap();
        assert!(matches!(backend.write_raw(&key, json!({})).await, Err(StorageError::SessionUnknown(_))));
    }

    #[tokio::test]
    async fn message_then_part_routes_to_same_session() {
        let (backend, _dir) = backend().await;
        let message_key = StorageKey::new(["message", "sX", "mA"]).unwrap();
        backend.write_raw(&message_key, json!({"role": "user"})).await.unwrap();

        let part_key = StorageKey::new(["part", "mA", "p0"]).unwrap();
        backend.write_raw(&part_key, json!({"text": "hi"})).await.unwrap();

        let value = backend.read_raw(&part_key).await.unwrap();
        assert_eq!(value, json!({"text": "hi"}));
    }

    #[tokio::test]
    async fn removing_session_cascades_to_messages() {
        let (backend, _dir) = backend().await;
        let session_key = StorageKey::new(["session", "proj1", "sX"]).unwrap();
        backend.write_raw(&session_key, json!({"id": "sX"})).await.unwrap();

        let message_key = StorageKey::new(["message", "sX", "mA"]).unwrap();
        backend.write_raw(&message_key, json!({"role": "user"})).await.unwrap();

        backend.remove(&session_key).await.unwrap();

        let result = backend.read_raw(&message_key).await;
        assert!(matches!(result, Err(StorageError::NotFound(_))) || matches!(result, Err(StorageError::SessionUnknown(_))));
        assert!(!backend.session_db_path("sX").exists());
    }

    #[tokio::test]
    async fn remove_message_clears_parts() {
        let (backend, _dir) = backend().await;
        let message_key = StorageKey::new(["message", "sX", "mA"]).unwrap();
        backend.write_raw(&message_key, json!({})).await.unwrap();
        let part_key = StorageKey::new(["part", "mA", "p0"]).unwrap();
        backend.write_raw(&part_key, json!({})).await.unwrap();

        backend.remove(&message_key).await.unwrap();

        assert!(matches!(backend.read_raw(&part_key).await, Err(StorageError::SessionUnknown(_))));
    }
}
