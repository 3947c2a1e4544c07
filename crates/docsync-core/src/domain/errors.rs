//! Domain error types
//!
//! This module defines error types specific to domain operations:
//! identifier and path validation, invariant violations on mapped objects,
//! and path mapping failures.

use thiserror::Error;

/// Errors that can occur in domain operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Invalid local path format or content
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Invalid remote path format
    #[error("Invalid remote path: {0}")]
    InvalidRemotePath(String),

    /// Invalid remote object ID
    #[error("Invalid remote ID: {0}")]
    InvalidRemoteId(String),

    /// Invalid change token
    #[error("Invalid change token: {0}")]
    InvalidChangeToken(String),

    /// Invalid checksum or algorithm name
    #[error("Invalid checksum: {0}")]
    InvalidChecksum(String),

    /// ID parsing error
    #[error("Invalid ID format: {0}")]
    InvalidId(String),

    /// Generic validation failure
    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    /// Path is not within the configured sync root
    #[error("Path not within sync root: {0}")]
    PathNotInSyncRoot(String),
}
