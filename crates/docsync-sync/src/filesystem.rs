//! Local filesystem adapter (secondary/driven adapter)
//!
//! Implements [`ILocalFileSystem`] using `tokio::fs` for async file operations.
//!
//! ## Design Decisions
//!
//! - **Atomic writes**: Content is streamed into a hidden temporary sibling
//!   and renamed over the target once the stream completed. A failing
//!   stream (for example an aborted download) leaves the target untouched.
//! - **GUID attribute**: The stable [`LocalGuid`] lives in the
//!   `user.docsync.guid` extended attribute, which moves along with the
//!   entry on rename.
//! - **SHA-256**: Checksums are streamed through `sha2` in fixed-size blocks.

use std::ffi::CString;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use docsync_core::domain::newtypes::{Checksum, LocalGuid};
use docsync_core::ports::{ContentStream, FsError, ILocalFileSystem, LocalEntry};
use filetime::FileTime;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, instrument, warn};

/// Extended attribute carrying an entry's GUID
pub const GUID_XATTR: &str = "user.docsync.guid";

const CHECKSUM_BLOCK_SIZE: usize = 64 * 1024;

// ============================================================================
// LocalFileSystemAdapter struct
// ============================================================================

/// Adapter that bridges the [`ILocalFileSystem`] port to the real filesystem.
///
/// This is a zero-sized struct because all operations derive their context
/// from their path arguments.
#[derive(Debug, Clone, Default)]
pub struct LocalFileSystemAdapter;

impl LocalFileSystemAdapter {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

/// Hidden sibling that receives the content while `target` is written
///
/// Writes to one target are serialized by the event queue, so the name does
/// not need to be unique per write.
pub fn staging_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!(".{name}.docsync.part"))
}

fn entry_from_metadata(path: &Path, metadata: &std::fs::Metadata) -> LocalEntry {
    let is_symlink = metadata.file_type().is_symlink();
    let is_directory = metadata.is_dir();
    LocalEntry {
        path: path.to_path_buf(),
        is_directory,
        is_symlink,
        size: if is_directory { 0 } else { metadata.len() },
        modified: metadata.modified().ok().map(DateTime::<Utc>::from),
        read_only: metadata.permissions().readonly(),
    }
}

fn c_path(path: &Path) -> Result<CString, FsError> {
    CString::new(path.as_os_str().as_bytes()).map_err(|e| FsError::Io {
        path: path.to_path_buf(),
        source: io::Error::new(io::ErrorKind::InvalidInput, e),
    })
}

fn xattr_error(path: &Path, err: io::Error) -> FsError {
    match err.raw_os_error() {
        Some(code) if code == libc::ENOTSUP || code == libc::EOPNOTSUPP => {
            FsError::AttributeUnsupported(path.to_path_buf())
        }
        _ => FsError::from_io(path, err),
    }
}

#[cfg(target_os = "linux")]
fn read_guid_attribute(path: &Path) -> Result<Option<Vec<u8>>, FsError> {
    let c_path = c_path(path)?;
    let c_name = CString::new(GUID_XATTR).map_err(|e| FsError::Io {
        path: path.to_path_buf(),
        source: io::Error::new(io::ErrorKind::InvalidInput, e),
    })?;
    let mut buf = [0u8; 128];
    // SAFETY: both strings are NUL-terminated and `buf` outlives the call.
    let len = unsafe {
        libc::getxattr(
            c_path.as_ptr(),
            c_name.as_ptr(),
            buf.as_mut_ptr().cast(),
            buf.len(),
        )
    };
    if len < 0 {
        let err = io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ENODATA) {
            return Ok(None);
        }
        return Err(xattr_error(path, err));
    }
    Ok(Some(buf[..len as usize].to_vec()))
}

#[cfg(target_os = "linux")]
fn write_guid_attribute(path: &Path, value: &[u8]) -> Result<(), FsError> {
    let c_path = c_path(path)?;
    let c_name = CString::new(GUID_XATTR).map_err(|e| FsError::Io {
        path: path.to_path_buf(),
        source: io::Error::new(io::ErrorKind::InvalidInput, e),
    })?;
    // SAFETY: both strings are NUL-terminated and `value` outlives the call.
    let rc = unsafe {
        libc::setxattr(
            c_path.as_ptr(),
            c_name.as_ptr(),
            value.as_ptr().cast(),
            value.len(),
            0,
        )
    };
    if rc < 0 {
        return Err(xattr_error(path, io::Error::last_os_error()));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn read_guid_attribute(path: &Path) -> Result<Option<Vec<u8>>, FsError> {
    Err(FsError::AttributeUnsupported(path.to_path_buf()))
}

#[cfg(not(target_os = "linux"))]
fn write_guid_attribute(path: &Path, _value: &[u8]) -> Result<(), FsError> {
    Err(FsError::AttributeUnsupported(path.to_path_buf()))
}

fn join_error(path: &Path, err: tokio::task::JoinError) -> FsError {
    FsError::Io {
        path: path.to_path_buf(),
        source: io::Error::new(io::ErrorKind::Other, err),
    }
}

// ============================================================================
// ILocalFileSystem implementation
// ============================================================================

#[async_trait::async_trait]
impl ILocalFileSystem for LocalFileSystemAdapter {
    #[instrument(skip(self), fields(path = %path.display()))]
    async fn entry(&self, path: &Path) -> Result<Option<LocalEntry>, FsError> {
        match tokio::fs::symlink_metadata(path).await {
            Ok(metadata) => Ok(Some(entry_from_metadata(path, &metadata))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                debug!("path not found");
                Ok(None)
            }
            Err(e) => Err(FsError::from_io(path, e)),
        }
    }

    #[instrument(skip(self), fields(path = %path.display()))]
    async fn read_dir(&self, path: &Path) -> Result<Vec<LocalEntry>, FsError> {
        let mut dir = tokio::fs::read_dir(path)
            .await
            .map_err(|e| FsError::from_io(path, e))?;
        let mut entries = Vec::new();
        while let Some(child) = dir
            .next_entry()
            .await
            .map_err(|e| FsError::from_io(path, e))?
        {
            let child_path = child.path();
            match tokio::fs::symlink_metadata(&child_path).await {
                Ok(metadata) => entries.push(entry_from_metadata(&child_path, &metadata)),
                // Vanished between listing and stat
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(FsError::from_io(&child_path, e)),
            }
        }
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        debug!(count = entries.len(), "directory listed");
        Ok(entries)
    }

    #[instrument(skip(self), fields(path = %path.display()))]
    async fn open_read(&self, path: &Path) -> Result<ContentStream, FsError> {
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| FsError::from_io(path, e))?;
        Ok(Box::new(file))
    }

    #[instrument(skip(self, content), fields(path = %path.display()))]
    async fn write_atomic(&self, path: &Path, mut content: ContentStream) -> Result<u64, FsError> {
        let tmp_path = staging_path(path);
        debug!(tmp = %tmp_path.display(), "writing to temporary file");

        let result = async {
            let mut file = tokio::fs::File::create(&tmp_path)
                .await
                .map_err(|e| FsError::from_io(&tmp_path, e))?;
            let written = tokio::io::copy(&mut content, &mut file)
                .await
                .map_err(|e| FsError::from_io(path, e))?;
            file.flush().await.map_err(|e| FsError::from_io(&tmp_path, e))?;
            file.sync_all()
                .await
                .map_err(|e| FsError::from_io(&tmp_path, e))?;
            Ok::<u64, FsError>(written)
        }
        .await;

        let written = match result {
            Ok(written) => written,
            Err(err) => {
                if let Err(e) = tokio::fs::remove_file(&tmp_path).await {
                    if e.kind() != io::ErrorKind::NotFound {
                        warn!(tmp = %tmp_path.display(), error = %e, "Failed to remove temporary file");
                    }
                }
                return Err(err);
            }
        };

        tokio::fs::rename(&tmp_path, path)
            .await
            .map_err(|e| FsError::from_io(path, e))?;
        debug!(bytes = written, "write complete");
        Ok(written)
    }

    #[instrument(skip(self), fields(path = %path.display()))]
    async fn create_directory(&self, path: &Path) -> Result<(), FsError> {
        tokio::fs::create_dir(path)
            .await
            .map_err(|e| FsError::from_io(path, e))
    }

    #[instrument(skip(self), fields(path = %path.display()))]
    async fn remove_file(&self, path: &Path) -> Result<(), FsError> {
        tokio::fs::remove_file(path)
            .await
            .map_err(|e| FsError::from_io(path, e))
    }

    #[instrument(skip(self), fields(path = %path.display()))]
    async fn remove_directory(&self, path: &Path, recursive: bool) -> Result<(), FsError> {
        let result = if recursive {
            tokio::fs::remove_dir_all(path).await
        } else {
            tokio::fs::remove_dir(path).await
        };
        result.map_err(|e| FsError::from_io(path, e))
    }

    #[instrument(skip(self), fields(from = %from.display(), to = %to.display()))]
    async fn rename(&self, from: &Path, to: &Path) -> Result<(), FsError> {
        tokio::fs::rename(from, to)
            .await
            .map_err(|e| FsError::from_io(from, e))
    }

    #[instrument(skip(self), fields(path = %path.display()))]
    async fn set_modified(&self, path: &Path, time: DateTime<Utc>) -> Result<(), FsError> {
        let owned = path.to_path_buf();
        let mtime = FileTime::from_unix_time(time.timestamp(), time.timestamp_subsec_nanos());
        tokio::task::spawn_blocking(move || filetime::set_file_mtime(&owned, mtime))
            .await
            .map_err(|e| join_error(path, e))?
            .map_err(|e| FsError::from_io(path, e))
    }

    #[instrument(skip(self), fields(path = %path.display()))]
    async fn set_read_only(&self, path: &Path, read_only: bool) -> Result<(), FsError> {
        let metadata = tokio::fs::metadata(path)
            .await
            .map_err(|e| FsError::from_io(path, e))?;
        let mut permissions = metadata.permissions();
        let mode = permissions.mode();
        let new_mode = if read_only {
            mode & !0o222
        } else {
            mode | 0o200
        };
        if new_mode == mode {
            return Ok(());
        }
        permissions.set_mode(new_mode);
        tokio::fs::set_permissions(path, permissions)
            .await
            .map_err(|e| FsError::from_io(path, e))
    }

    #[instrument(skip(self), fields(path = %path.display()))]
    async fn get_guid(&self, path: &Path) -> Result<Option<LocalGuid>, FsError> {
        let owned = path.to_path_buf();
        let raw = tokio::task::spawn_blocking(move || read_guid_attribute(&owned))
            .await
            .map_err(|e| join_error(path, e))??;
        match raw {
            None => Ok(None),
            Some(bytes) => match LocalGuid::from_xattr_bytes(&bytes) {
                Ok(guid) => Ok(Some(guid)),
                Err(e) => {
                    warn!(error = %e, "Ignoring malformed GUID attribute");
                    Ok(None)
                }
            },
        }
    }

    #[instrument(skip(self), fields(path = %path.display(), guid = %guid))]
    async fn set_guid(&self, path: &Path, guid: LocalGuid) -> Result<(), FsError> {
        let owned = path.to_path_buf();
        let value = guid.to_string();
        tokio::task::spawn_blocking(move || write_guid_attribute(&owned, value.as_bytes()))
            .await
            .map_err(|e| join_error(path, e))?
    }

    #[instrument(skip(self), fields(path = %path.display()))]
    async fn checksum(&self, path: &Path) -> Result<Checksum, FsError> {
        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(|e| FsError::from_io(path, e))?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; CHECKSUM_BLOCK_SIZE];
        loop {
            let read = file
                .read(&mut buf)
                .await
                .map_err(|e| FsError::from_io(path, e))?;
            if read == 0 {
                break;
            }
            hasher.update(&buf[..read]);
        }
        let checksum = Checksum::sha256(hasher.finalize().to_vec()).map_err(|e| FsError::Io {
            path: path.to_path_buf(),
            source: io::Error::new(io::ErrorKind::InvalidData, e.to_string()),
        })?;
        debug!(checksum = %checksum, "checksum computed");
        Ok(checksum)
    }
}
