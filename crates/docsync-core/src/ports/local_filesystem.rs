//! Local filesystem port (driven/secondary port)
//!
//! This module defines the interface for interacting with the local
//! filesystem: metadata and directory listing, streamed reads and atomic
//! streamed writes, timestamps, the read-only flag, and the extended
//! attribute that carries an entry's stable [`LocalGuid`].
//!
//! ## Design Notes
//!
//! - Returns a typed [`FsError`] so that callers can tell "path too long"
//!   (user interaction needed) and "not found" apart from other I/O errors.
//! - `entry` returns `Ok(None)` for missing paths instead of an error.
//! - Watching is not part of this port; the sync crate owns the watcher.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::domain::newtypes::{Checksum, LocalGuid};
use crate::ports::repository::ContentStream;

// ============================================================================
// LocalEntry struct
// ============================================================================

/// Snapshot of a local file or directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalEntry {
    pub path: PathBuf,
    pub is_directory: bool,
    /// The entry itself is a symbolic link (metadata is not followed)
    pub is_symlink: bool,
    /// Size in bytes (0 for directories)
    pub size: u64,
    /// Last modification time
    pub modified: Option<DateTime<Utc>>,
    pub read_only: bool,
}

impl LocalEntry {
    /// Last path component, if it is valid UTF-8
    pub fn name(&self) -> Option<&str> {
        self.path.file_name().and_then(|n| n.to_str())
    }
}

// ============================================================================
// FsError enum
// ============================================================================

/// Classified local filesystem failure
#[derive(Debug, Error)]
pub enum FsError {
    #[error("Path not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Permission denied: {}", .0.display())]
    PermissionDenied(PathBuf),

    /// OS path-length limit exceeded
    #[error("Path too long: {}", .0.display())]
    PathTooLong(PathBuf),

    /// Extended attributes are not supported by the filesystem
    #[error("Extended attributes not supported: {}", .0.display())]
    AttributeUnsupported(PathBuf),

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl FsError {
    /// Classifies an `io::Error` for `path`
    pub fn from_io(path: &Path, err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::NotFound => Self::NotFound(path.to_path_buf()),
            std::io::ErrorKind::PermissionDenied => Self::PermissionDenied(path.to_path_buf()),
            _ if err.raw_os_error() == Some(libc::ENAMETOOLONG) => {
                Self::PathTooLong(path.to_path_buf())
            }
            _ => Self::Io {
                path: path.to_path_buf(),
                source: err,
            },
        }
    }

    /// Returns true for `NotFound`
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }
}

// ============================================================================
// ILocalFileSystem trait
// ============================================================================

/// Port trait for local filesystem operations
#[async_trait::async_trait]
pub trait ILocalFileSystem: Send + Sync {
    /// Metadata of `path` without following symlinks, `None` if missing
    async fn entry(&self, path: &Path) -> Result<Option<LocalEntry>, FsError>;

    /// Direct children of a directory
    async fn read_dir(&self, path: &Path) -> Result<Vec<LocalEntry>, FsError>;

    /// Opens a file for streamed reading
    async fn open_read(&self, path: &Path) -> Result<ContentStream, FsError>;

    /// Writes `content` to `path` atomically
    ///
    /// The data goes to a temporary sibling file which is renamed over
    /// `path` only after the stream completed. If the stream fails (for
    /// example because a transfer was aborted), `path` is left untouched.
    /// Returns the number of bytes written.
    async fn write_atomic(&self, path: &Path, content: ContentStream) -> Result<u64, FsError>;

    /// Creates a directory (parents must exist)
    async fn create_directory(&self, path: &Path) -> Result<(), FsError>;

    async fn remove_file(&self, path: &Path) -> Result<(), FsError>;

    /// Removes a directory; with `recursive` unset it must be empty
    async fn remove_directory(&self, path: &Path, recursive: bool) -> Result<(), FsError>;

    /// Renames or moves an entry
    async fn rename(&self, from: &Path, to: &Path) -> Result<(), FsError>;

    /// Sets the last modification time
    async fn set_modified(&self, path: &Path, time: DateTime<Utc>) -> Result<(), FsError>;

    /// Sets or clears the read-only flag
    async fn set_read_only(&self, path: &Path, read_only: bool) -> Result<(), FsError>;

    /// Reads the stable GUID attribute, `None` if the entry has none
    async fn get_guid(&self, path: &Path) -> Result<Option<LocalGuid>, FsError>;

    /// Writes the stable GUID attribute
    async fn set_guid(&self, path: &Path, guid: LocalGuid) -> Result<(), FsError>;

    /// Computes the content checksum of a file
    async fn checksum(&self, path: &Path) -> Result<Checksum, FsError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_io_classification() {
        let p = Path::new("/x");
        let err = FsError::from_io(p, std::io::Error::from(std::io::ErrorKind::NotFound));
        assert!(err.is_not_found());

        let err = FsError::from_io(
            p,
            std::io::Error::from(std::io::ErrorKind::PermissionDenied),
        );
        assert!(matches!(err, FsError::PermissionDenied(_)));

        let err = FsError::from_io(p, std::io::Error::from_raw_os_error(libc::ENAMETOOLONG));
        assert!(matches!(err, FsError::PathTooLong(_)));
    }
}
