//! Hierarchical key–value storage façade.
//!
//! A [`StorageKey`] is an ordered sequence of path segments; the first
//! segment names the record's type (`session`, `message`, `part`,
//! `session_diff`, `project`). The façade ([`Storage`]) exposes typed
//! read/write/update/remove/list over whatever [`StorageBackend`] it is
//! constructed with — the specified backend is [`sqlite_backend::MultiSqliteBackend`];
//! [`json_backend::JsonBackend`] is kept only as the legacy source format for
//! [`migrator::Migrator`].

pub mod json_backend;
pub mod migrator;
pub mod sqlite_backend;

use std::sync::Arc;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::instrument;

use crate::error::{StorageError, StorageResult};

/// An ordered, non-empty sequence of path segments. The string form joins
/// segments with `/`; the first segment is the record's type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorageKey {
    segments: Vec<String>,
}

impl StorageKey {
    pub fn new<I, S>(segments: I) -> StorageResult<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let segments: Vec<String> = segments.into_iter().map(Into::into).collect();
        if segments.is_empty() {
            return Err(StorageError::InvalidKey("key must have at least one segment".into()));
        }
        if segments.iter().any(|s| s.is_empty() || s.contains('/')) {
            return Err(StorageError::InvalidKey(format!(
                "segments must be non-empty and contain no '/': {:?}",
                segments
            )));
        }
        Ok(Self { segments })
    }

    pub fn parse(s: &str) -> StorageResult<Self> {
        Self::new(s.split('/'))
    }

    /// The first segment: the record's type.
    pub fn kind(&self) -> &str {
        &self.segments[0]
    }

    pub fn segment(&self, index: usize) -> Option<&str> {
        self.segments.get(index).map(String::as_str)
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    pub fn as_string(&self) -> String {
        self.segments.join("/")
    }

    /// True if `other` is this key or a descendant of it (`self/...`).
    pub fn contains(&self, other: &StorageKey) -> bool {
        let mine = self.as_string();
        let theirs = other.as_string();
        theirs == mine || theirs.starts_with(&format!("{mine}/"))
    }
}

impl std::fmt::Display for StorageKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_string())
    }
}

/// The backend contract: raw JSON values in, raw JSON values out. Typed
/// access is layered on top by [`Storage`].
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn read_raw(&self, key: &StorageKey) -> StorageResult<serde_json::Value>;
    async fn write_raw(&self, key: &StorageKey, value: serde_json::Value) -> StorageResult<()>;
    async fn remove(&self, key: &StorageKey) -> StorageResult<()>;
    async fn list(&self, prefix: &StorageKey) -> StorageResult<Vec<StorageKey>>;
}

/// The typed storage façade used by the rest of the application.
pub struct Storage {
    backend: Arc<dyn StorageBackend>,
}

impl Storage {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    #[instrument(skip(self))]
    pub async fn read<T: DeserializeOwned>(&self, key: &StorageKey) -> StorageResult<T> {
        let raw = self.backend.read_raw(key).await?;
        Ok(serde_json::from_value(raw)?)
    }

    #[instrument(skip(self, value))]
    pub async fn write<T: Serialize + Send + Sync>(
        &self,
        key: &StorageKey,
        value: &T,
    ) -> StorageResult<()> {
        let raw = serde_json::to_value(value)?;
        self.backend.write_raw(key, raw).await
    }

    /// Read-modify-write at the level of a single key. Not atomic across
    /// keys; the mutator runs against the deserialized value and the result
    /// is written back.
    #[instrument(skip(self, f))]
    pub async fn update<T, F>(&self, key: &StorageKey, f: F) -> StorageResult<T>
    where
        T: Serialize + DeserializeOwned + Send + Sync,
        F: FnOnce(&mut T) + Send,
    {
        let mut value: T = self.read(key).await?;
        f(&mut value);
        self.write(key, &value).await?;
        Ok(value)
    }

    #[instrument(skip(self))]
    pub async fn remove(&self, key: &StorageKey) -> StorageResult<()> {
        self.backend.remove(key).await
    }

    #[instrument(skip(self))]
    pub async fn list(&self, prefix: &StorageKey) -> StorageResult<Vec<StorageKey>> {
        self.backend.list(prefix).await
    }
}
