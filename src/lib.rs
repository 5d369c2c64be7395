//! # lwstore - Lightweight transactional blob storage
//!
//! A single-table, keyed binary-object store. Each row is a *descriptor*:
//! an id, the owning principal, two UTC timestamps and an opaque payload
//! capped at a fixed size.
//!
//! lwstore provides:
//! - A storage manager that runs every operation in its own connection and transaction
//! - Descriptors with an explicit prepared/dirty/released lifecycle
//! - SQL text selected once per dialect (`TOP 1` vs `LIMIT 1`)
//! - Typed, explicitly sized command parameters
//! - Lazy, forward-only enumeration with per-item cleanup
//! - A SQLite connection implementation and a small host container

pub mod command;
pub mod config;
pub mod connection;
pub mod descriptor;
pub mod dialect;
pub mod enumerable;
pub mod host;
pub mod manager;
pub mod storage;
pub mod ui;

// Re-exports for convenient access
pub use command::{Command, Param, Row, SqlType, Value};
pub use config::{HostConfig, StoreConfig};
pub use connection::{Connection, ConnectionFactory, IsolationLevel, RowStream, SqliteConnectionFactory};
pub use descriptor::{DataStream, Descriptor, DescriptorState};
pub use dialect::{Dialect, Statements};
pub use enumerable::{Enumeration, Lease, TableEnumerator};
pub use host::StorageHost;
pub use manager::{default_id, ManagerOptions, StorageManager};

pub use tokio_util::sync::CancellationToken;

/// Result type alias for lwstore operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for lwstore operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Descriptor could not be created: {id}")]
    DescriptorCreation { id: String },

    #[error("Update failed for descriptor {id}")]
    UpdateFailed {
        id: String,
        #[source]
        source: Option<Box<Error>>,
    },

    #[error("Remove failed for descriptor {id}")]
    RemoveFailed {
        id: String,
        #[source]
        source: Box<Error>,
    },

    #[error("Descriptor is in an undefined state: {0}")]
    UndefinedState(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Blocking task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create an invalid argument error
    pub fn invalid<S: Into<String>>(message: S) -> Self {
        Self::InvalidArgument(message.into())
    }

    /// Wrap a failure observed while updating `id`.
    ///
    /// Cancellation passes through untouched.
    pub fn update_failed(id: impl Into<String>, source: Error) -> Self {
        match source {
            Error::Cancelled => Error::Cancelled,
            other => Self::UpdateFailed {
                id: id.into(),
                source: Some(Box::new(other)),
            },
        }
    }

    /// Wrap a failure observed while removing `id`.
    pub fn remove_failed(id: impl Into<String>, source: Error) -> Self {
        match source {
            Error::Cancelled => Error::Cancelled,
            other => Self::RemoveFailed {
                id: id.into(),
                source: Box::new(other),
            },
        }
    }

    /// True when the error is the cancellation outcome rather than a fault
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }

    /// True for SQLite busy/locked conditions, the local analogue of a serialization conflict.
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::Storage(rusqlite::Error::SqliteFailure(e, _)) => matches!(
                e.code,
                rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
            ),
            Error::UpdateFailed { source: Some(inner), .. } => inner.is_conflict(),
            Error::RemoveFailed { source, .. } => source.is_conflict(),
            _ => false,
        }
    }
}
