//! Crate-wide error taxonomy.

use thiserror::Error;

/// The single error currency returned from every public façade operation.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum CoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("scope disposed")]
    ScopeDisposed,

    #[error("session unknown: {0}")]
    SessionUnknown(String),

    #[error("json error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("config directory typo: found {found}, expected opencode.json")]
    ConfigDirectoryTypoError { found: String },

    #[error("invalid: {0}")]
    InvalidError(String),

    #[error("aborted")]
    Aborted,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Storage(StorageError),

    #[error(transparent)]
    Config(ConfigError),

    #[error(transparent)]
    Retry(RetryError),

    #[error(transparent)]
    Bus(BusError),
}

pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised by the storage façade and its backends.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("session unknown for key: {0}")]
    SessionUnknown(String),

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid storage key: {0}")]
    InvalidKey(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type StorageResult<T> = Result<T, StorageError>;

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::QueryReturnedNoRows => {
                StorageError::NotFound("query returned no rows".to_string())
            }
            other => StorageError::Database(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<StorageError> for CoreError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound(msg) => CoreError::NotFound(msg),
            StorageError::SessionUnknown(msg) => CoreError::SessionUnknown(msg),
            StorageError::Io(e) => CoreError::Io(e),
            other => CoreError::Storage(other),
        }
    }
}

/// Errors raised by the config façade.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("config directory typo: found {found}, expected opencode.json")]
    DirectoryTypo { found: String },

    #[error("invalid config: {0}")]
    Invalid(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

impl From<ConfigError> for CoreError {
    fn from(err: ConfigError) -> Self {
        match err {
            ConfigError::Json(e) => CoreError::JsonError(e),
            ConfigError::DirectoryTypo { found } => CoreError::ConfigDirectoryTypoError { found },
            ConfigError::Invalid(msg) => CoreError::InvalidError(msg),
            ConfigError::Io(e) => CoreError::Io(e),
        }
    }
}

/// Errors raised by the retry controller.
#[derive(Debug, Error)]
pub enum RetryError {
    #[error("aborted")]
    Aborted,
}

pub type RetryResult<T> = Result<T, RetryError>;

impl From<RetryError> for CoreError {
    fn from(err: RetryError) -> Self {
        match err {
            RetryError::Aborted => CoreError::Aborted,
        }
    }
}

/// Errors raised by the event bus.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("event schema validation failed: {0}")]
    SchemaInvalid(String),

    #[error("invalid schema document: {0}")]
    SchemaCompile(String),
}

pub type BusResult<T> = Result<T, BusError>;

impl From<BusError> for CoreError {
    fn from(err: BusError) -> Self {
        CoreError::InvalidError(err.to_string())
    }
}
