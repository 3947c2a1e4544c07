//! Removal on one or both sides

use std::future::Future;
use std::pin::Pin;

use docsync_core::domain::MappedObject;
use docsync_core::ports::{LocalEntry, RepositoryError};
use tracing::{debug, info, instrument, warn};

use super::{SolveRequest, SyncContext};
use crate::SyncResult;

/// Local object gone: delete it on the server
#[instrument(skip_all, fields(path = ?request.path()))]
pub async fn local_removed(ctx: &SyncContext, request: SolveRequest) -> SyncResult<()> {
    let mapped = request.require_mapping()?;
    let id = mapped.remote_id();

    let result = if mapped.is_folder() {
        ctx.repository.delete_tree(id).await
    } else {
        ctx.repository.delete_object(id).await
    };
    match result {
        Ok(()) => info!(id = %id, "Deleted remote object"),
        Err(RepositoryError::ObjectNotFound(_)) => debug!(id = %id, "Remote object already gone"),
        Err(RepositoryError::PermissionDenied(reason)) => {
            // Forgetting the mapping lets the next crawl download it again.
            warn!(id = %id, reason = %reason, "Not allowed to delete remote object");
        }
        Err(e) => return Err(e.into()),
    }

    ctx.storage.remove_object(id).await?;
    Ok(())
}

/// Remote object gone: delete the synchronized local copy
///
/// Local content that was never synchronized, or changed since, is kept.
#[instrument(skip_all, fields(path = ?request.path()))]
pub async fn remote_removed(ctx: &SyncContext, request: SolveRequest) -> SyncResult<()> {
    let mapped = request.require_mapping()?;
    if let Some(local) = &request.local {
        let removed = remove_synced(ctx, local, mapped).await?;
        if !removed {
            info!(path = %local.path.display(), "Kept local content that is not on the server");
        }
    }
    ctx.storage.remove_object(mapped.remote_id()).await?;
    Ok(())
}

#[instrument(skip_all, fields(path = ?request.path()))]
pub async fn both_removed(ctx: &SyncContext, request: SolveRequest) -> SyncResult<()> {
    let mapped = request.require_mapping()?;
    debug!(id = %mapped.remote_id(), "Removed on both sides");
    ctx.storage.remove_object(mapped.remote_id()).await?;
    Ok(())
}

/// Deletes a local entry if everything in it is synchronized and unchanged
///
/// Returns whether the entry is gone.
fn remove_synced<'a>(
    ctx: &'a SyncContext,
    entry: &'a LocalEntry,
    mapped: &'a MappedObject,
) -> Pin<Box<dyn Future<Output = SyncResult<bool>> + Send + 'a>> {
    Box::pin(async move {
        if !entry.is_directory {
            if !is_unchanged_file(ctx, entry, mapped).await? {
                return Ok(false);
            }
            ctx.fs.remove_file(&entry.path).await?;
            debug!(path = %entry.path.display(), "Deleted local file");
            return Ok(true);
        }

        let mut kept = false;
        for child in ctx.fs.read_dir(&entry.path).await? {
            let gone = match ctx.storage.get_object_by_local_path(&child.path).await? {
                Some(child_mapped) if child_mapped.is_folder() == child.is_directory => {
                    remove_synced(ctx, &child, &child_mapped).await?
                }
                _ => false,
            };
            kept |= !gone;
        }
        if kept {
            return Ok(false);
        }
        ctx.fs.remove_directory(&entry.path, false).await?;
        debug!(path = %entry.path.display(), "Deleted local folder");
        Ok(true)
    })
}

async fn is_unchanged_file(
    ctx: &SyncContext,
    entry: &LocalEntry,
    mapped: &MappedObject,
) -> SyncResult<bool> {
    if mapped.content_size().is_some_and(|size| size != entry.size) {
        return Ok(false);
    }
    if entry.modified.is_some() && entry.modified == mapped.last_local_write_time() {
        return Ok(true);
    }
    match mapped.last_checksum() {
        Some(stored) => Ok(&ctx.fs.checksum(&entry.path).await? == stored),
        None => Ok(false),
    }
}
