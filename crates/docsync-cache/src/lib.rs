//! docsync Cache - per-root metadata persistence
//!
//! SQLite-based storage for:
//! - Mapped objects (the local/remote correlation of every synced entry)
//! - The change-log token of the last committed sync
//! - Selectively ignored remote subtrees
//! - Partial upload records for resumable transfers
//!
//! ## Architecture
//!
//! This crate implements the storage ports from `docsync-core`
//! ([`IMetaDataStorage`], [`ITransmissionStorage`] and
//! [`IIgnoredEntitiesStorage`]) on top of SQLite. Every sync root gets its
//! own database file and therefore its own [`DatabasePool`].
//!
//! [`IMetaDataStorage`]: docsync_core::ports::IMetaDataStorage
//! [`ITransmissionStorage`]: docsync_core::ports::ITransmissionStorage
//! [`IIgnoredEntitiesStorage`]: docsync_core::ports::IIgnoredEntitiesStorage
//!
//! ## Usage
//!
//! ```no_run
//! use std::path::{Path, PathBuf};
//! use docsync_cache::{DatabasePool, SqliteMetaDataStorage};
//! use docsync_core::domain::{PathMatcher, RemotePath, SyncPath};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let pool = DatabasePool::new(Path::new("/home/user/.local/share/docsync/docs.db")).await?;
//! let matcher = PathMatcher::new(
//!     SyncPath::new(PathBuf::from("/home/user/Docs"))?,
//!     RemotePath::new("/Sites/docs".to_string())?,
//! );
//! let storage = SqliteMetaDataStorage::new(pool.pool().clone(), matcher);
//! # Ok(())
//! # }
//! ```

pub mod ignored;
pub mod pool;
pub mod storage;

pub use ignored::SqliteIgnoredEntitiesStorage;
pub use pool::DatabasePool;
pub use storage::SqliteMetaDataStorage;

/// Errors that can occur during cache operations
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// Failed to establish a database connection
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// A database query failed
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Schema migration failed
    #[error("Migration failed: {0}")]
    MigrationFailed(String),

    /// A stored value could not be turned back into a domain type
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<sqlx::Error> for CacheError {
    fn from(e: sqlx::Error) -> Self {
        CacheError::QueryFailed(e.to_string())
    }
}

impl From<docsync_core::domain::DomainError> for CacheError {
    fn from(e: docsync_core::domain::DomainError) -> Self {
        CacheError::SerializationError(e.to_string())
    }
}
