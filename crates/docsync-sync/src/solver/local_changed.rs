//! Local-only change: push the local state to the repository

use std::path::Path;

use docsync_core::domain::{MappedObject, RemoteObject};
use tracing::{debug, info, instrument};

use super::{defer_recoverable, SolveRequest, SyncContext};
use crate::transmission::TransmissionType;
use crate::{SyncError, SyncResult};

#[instrument(skip_all, fields(path = ?request.path()))]
pub async fn solve(ctx: &SyncContext, request: SolveRequest) -> SyncResult<()> {
    let mut mapped = request.require_mapping()?.clone();
    let remote = request.require_remote()?.clone();

    if remote.change_token.as_ref() != mapped.last_change_token() {
        return Err(SyncError::StaleChangeToken {
            remote_id: mapped.remote_id().clone(),
        });
    }

    let Some(remote) = push_content(ctx, &request, &mut mapped, remote).await? else {
        return Ok(());
    };
    let path = request.require_local()?.path.clone();
    finish(ctx, &path, &mut mapped, remote).await
}

/// Uploads the local file when its content differs from the last synchronized state
///
/// Returns `None` when a recoverable repository error deferred the upload;
/// the mapping must not be saved in that case.
pub(crate) async fn push_content(
    ctx: &SyncContext,
    request: &SolveRequest,
    mapped: &mut MappedObject,
    remote: RemoteObject,
) -> SyncResult<Option<RemoteObject>> {
    if mapped.is_folder() {
        return Ok(Some(remote));
    }
    let local = request.require_local()?;

    let size_differs = mapped.content_size() != Some(local.size);
    let checksum = if size_differs {
        None
    } else if local.modified != mapped.last_local_write_time() || mapped.last_checksum().is_none() {
        Some(request.local_checksum(ctx).await?)
    } else {
        debug!("Content untouched");
        return Ok(Some(remote));
    };

    let content_changed =
        size_differs || checksum.as_ref().is_some_and(|c| Some(c) != mapped.last_checksum());
    if !content_changed {
        debug!("Only the modification date changed");
        mapped.set_checksum(checksum)?;
        return Ok(Some(remote));
    }

    let uploaded = ctx
        .upload(&remote.id, local, TransmissionType::UploadModifiedFile)
        .await;
    let Some((updated, checksum)) = defer_recoverable(uploaded, "Upload")? else {
        return Ok(None);
    };
    info!(size = local.size, "Uploaded modified content");

    mapped.set_checksum(Some(checksum))?;
    mapped.set_content_size(local.size as i64);
    mapped.set_remote_write_time(updated.last_modified);
    Ok(Some(updated))
}

/// Aligns read-only flag and dates, then commits the mapping
pub(crate) async fn finish(
    ctx: &SyncContext,
    path: &Path,
    mapped: &mut MappedObject,
    remote: RemoteObject,
) -> SyncResult<()> {
    ctx.sync_read_only(path, &remote).await?;
    let local_modified = ctx.local_modified(path).await?;
    let remote = ctx.sync_dates(path, local_modified, remote).await?;
    if let Some(entry) = ctx.fs.entry(path).await? {
        if entry.is_directory {
            mapped.set_content_size(docsync_core::domain::UNKNOWN_CONTENT_SIZE);
        } else {
            mapped.set_content_size(entry.size as i64);
        }
    }
    ctx.commit(mapped, path, &remote).await
}
