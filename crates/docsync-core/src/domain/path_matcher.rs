//! Bijective mapping between local paths and remote paths of one sync root
//!
//! A sync root pairs a local directory with a remote folder. Every entry
//! below the local root corresponds to exactly one remote path below the
//! remote root, segment by segment:
//!
//! ```text
//! /home/user/Docs/reports/q1.odt  <->  /Sites/team/reports/q1.odt
//! ```

use std::path::{Component, Path, PathBuf};

use super::errors::DomainError;
use super::newtypes::{RemotePath, SyncPath};

/// Maps paths between the local and the remote root of one sync root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathMatcher {
    local_root: SyncPath,
    remote_root: RemotePath,
}

impl PathMatcher {
    pub fn new(local_root: SyncPath, remote_root: RemotePath) -> Self {
        Self {
            local_root,
            remote_root,
        }
    }

    pub fn local_root(&self) -> &SyncPath {
        &self.local_root
    }

    pub fn remote_root(&self) -> &RemotePath {
        &self.remote_root
    }

    /// Returns true if `local` is the local root itself
    pub fn is_local_root(&self, local: &Path) -> bool {
        local == self.local_root.as_path()
    }

    /// Returns true if `remote` lies in (or is) the remote root
    pub fn can_create_local_path(&self, remote: &RemotePath) -> bool {
        remote.strip_prefix(&self.remote_root).is_some()
    }

    /// Returns true if `local` lies in (or is) the local root
    pub fn can_create_remote_path(&self, local: &Path) -> bool {
        self.relative_local_path(local).is_ok()
    }

    /// Local path corresponding to a remote path
    ///
    /// # Errors
    ///
    /// Returns `DomainError::PathNotInSyncRoot` if `remote` is outside the remote root
    pub fn create_local_path(&self, remote: &RemotePath) -> Result<SyncPath, DomainError> {
        let segments = remote.strip_prefix(&self.remote_root).ok_or_else(|| {
            DomainError::PathNotInSyncRoot(format!(
                "{remote} is not within remote root {}",
                self.remote_root
            ))
        })?;

        segments
            .into_iter()
            .try_fold(self.local_root.clone(), |path, segment| path.join(segment))
    }

    /// Remote path corresponding to a local path
    ///
    /// # Errors
    ///
    /// Returns an error if `local` is outside the local root or contains
    /// components that are not valid UTF-8
    pub fn create_remote_path(&self, local: &Path) -> Result<RemotePath, DomainError> {
        let relative = self.relative_local_path(local)?;

        relative
            .components()
            .try_fold(self.remote_root.clone(), |path, component| {
                let segment = component.as_os_str().to_str().ok_or_else(|| {
                    DomainError::InvalidPath(format!(
                        "Path component is not valid UTF-8: {}",
                        local.display()
                    ))
                })?;
                path.join(segment)
            })
    }

    /// Path of `local` relative to the local root (empty for the root itself)
    ///
    /// # Errors
    ///
    /// Returns `DomainError::PathNotInSyncRoot` if `local` is outside the local root
    pub fn relative_local_path(&self, local: &Path) -> Result<PathBuf, DomainError> {
        let sync_path = SyncPath::new(local.to_path_buf())?;
        let relative = sync_path.relative_to(&self.local_root)?;

        if relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(DomainError::InvalidPath(format!(
                "Unexpected component in {}",
                local.display()
            )));
        }

        Ok(relative)
    }
}
