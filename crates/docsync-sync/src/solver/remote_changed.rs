//! Remote-only change: pull the remote state to the local side

use std::path::Path;

use docsync_core::domain::{MappedObject, RemoteObject};
use tracing::{info, instrument, warn};

use super::{SolveRequest, SyncContext};
use crate::transmission::TransmissionType;
use crate::SyncResult;

#[instrument(skip_all, fields(path = ?request.path()))]
pub async fn solve(ctx: &SyncContext, request: SolveRequest) -> SyncResult<()> {
    let mut mapped = request.require_mapping()?.clone();
    let remote = request.require_remote()?.clone();
    let path = request.require_local()?.path.clone();

    if request.remote_content.is_changed() || content_hash_differs(&mapped, &remote) {
        pull_content(ctx, &path, &mut mapped, &remote).await?;
    }
    finish(ctx, &path, &mut mapped, &remote).await
}

fn content_hash_differs(mapped: &MappedObject, remote: &RemoteObject) -> bool {
    match (&remote.content_hash, mapped.last_checksum()) {
        (Some(remote_hash), Some(stored)) => remote_hash != stored,
        _ => false,
    }
}

/// Replaces the local file with the remote content
pub(crate) async fn pull_content(
    ctx: &SyncContext,
    path: &Path,
    mapped: &mut MappedObject,
    remote: &RemoteObject,
) -> SyncResult<()> {
    if !remote.is_document() {
        return Ok(());
    }
    let was_read_only = ctx.fs.entry(path).await?.is_some_and(|e| e.read_only);
    if was_read_only {
        ctx.fs.set_read_only(path, false).await?;
    }
    let downloaded = ctx
        .download(remote, path, TransmissionType::DownloadModifiedFile)
        .await;
    let (checksum, written) = match downloaded {
        Ok(done) => done,
        Err(e) => {
            if was_read_only {
                if let Err(restore) = ctx.fs.set_read_only(path, true).await {
                    warn!(error = %restore, "Failed to restore read-only flag");
                }
            }
            return Err(e);
        }
    };
    info!(size = written, "Downloaded modified content");
    ctx.tag_local(path, mapped).await?;
    mapped.set_checksum(Some(checksum))?;
    mapped.set_content_size(written as i64);
    Ok(())
}

/// Takes over remote dates and flags, then commits the mapping
pub(crate) async fn finish(
    ctx: &SyncContext,
    path: &Path,
    mapped: &mut MappedObject,
    remote: &RemoteObject,
) -> SyncResult<()> {
    if let Some(modified) = remote.last_modified {
        ctx.fs.set_modified(path, modified).await?;
    }
    ctx.sync_read_only(path, remote).await?;
    ctx.commit(mapped, path, remote).await
}
