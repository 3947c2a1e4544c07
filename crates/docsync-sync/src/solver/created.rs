//! Creation on one or both sides

use std::path::Path;

use docsync_core::domain::{
    newtypes::{Checksum, LocalGuid},
    ConflictKind, MappedObject, ObjectType,
};
use docsync_core::ports::FsError;
use tracing::{debug, info, instrument, warn};

use super::{defer_recoverable, local_changed, remote_changed, SolveRequest, SyncContext};
use crate::transmission::TransmissionType;
use crate::{SyncError, SyncResult};

/// GUID already attached to a local entry, unless another mapping owns it
///
/// Copies of a synchronized file carry the GUID of the original; those get
/// a fresh one.
async fn adopt_guid(ctx: &SyncContext, path: &Path) -> SyncResult<Option<LocalGuid>> {
    let guid = match ctx.fs.get_guid(path).await {
        Ok(guid) => guid,
        Err(FsError::AttributeUnsupported(_)) => None,
        Err(e) => return Err(e.into()),
    };
    let Some(guid) = guid else {
        return Ok(None);
    };
    if ctx.storage.get_object_by_guid(&guid).await?.is_some() {
        debug!(guid = %guid, "GUID belongs to another object, generating a new one");
        return Ok(None);
    }
    Ok(Some(guid))
}

#[instrument(skip_all, fields(path = ?request.path()))]
pub async fn local_created(ctx: &SyncContext, request: SolveRequest) -> SyncResult<()> {
    let local = request.require_local()?.clone();
    if let Some(stale) = &request.mapped {
        debug!(id = %stale.remote_id(), "Dropping mapping of removed remote object");
        ctx.storage.remove_object(stale.remote_id()).await?;
    }

    let parent = ctx.parent_mapping(&local.path).await?;
    let name = local
        .name()
        .ok_or_else(|| SyncError::MissingMapping(local.path.display().to_string()))?
        .to_string();

    let created = if local.is_directory {
        ctx.repository.create_folder(parent.remote_id(), &name).await
    } else {
        ctx.repository.create_document(parent.remote_id(), &name).await
    };
    let Some(mut remote) = defer_recoverable(created.map_err(SyncError::from), "Creation")? else {
        return Ok(());
    };

    let mut mapped = MappedObject::new(
        &name,
        remote.id.clone(),
        ObjectType::from_is_directory(local.is_directory),
        Some(parent.remote_id().clone()),
        remote.change_token.clone(),
    )?;
    if let Some(guid) = adopt_guid(ctx, &local.path).await? {
        mapped = mapped.with_guid(guid);
    }

    if !local.is_directory {
        let uploaded = ctx
            .upload(&remote.id, &local, TransmissionType::UploadNewFile)
            .await;
        match defer_recoverable(uploaded, "Upload")? {
            Some((updated, checksum)) => {
                mapped.set_checksum(Some(checksum))?;
                mapped.set_content_size(local.size as i64);
                remote = updated;
            }
            None => {
                // Keep the empty document mapped; the next pass sees a local change.
                ctx.tag_local(&local.path, &mapped).await?;
                return ctx.save(&mapped).await;
            }
        }
    }

    info!(id = %remote.id, "Created remote object");
    ctx.tag_local(&local.path, &mapped).await?;
    local_changed::finish(ctx, &local.path, &mut mapped, remote).await
}

#[instrument(skip_all, fields(id = ?request.remote.as_ref().map(|r| r.id.to_string())))]
pub async fn remote_created(ctx: &SyncContext, request: SolveRequest) -> SyncResult<()> {
    let remote = request.require_remote()?.clone();
    if let Some(stale) = &request.mapped {
        debug!(id = %stale.remote_id(), "Replacing mapping of removed local object");
        ctx.storage.remove_object(stale.remote_id()).await?;
    }

    let parent_id = remote
        .parent_id
        .clone()
        .ok_or_else(|| SyncError::MissingMapping(remote.id.to_string()))?;
    let path = ctx.parent_local_path(&parent_id).await?.join(&remote.name);

    let mut mapped = MappedObject::new(
        &remote.name,
        remote.id.clone(),
        remote.object_type,
        Some(parent_id),
        remote.change_token.clone(),
    )?;

    if remote.is_folder() {
        ctx.fs.create_directory(&path).await?;
    } else {
        let (checksum, written) = ctx
            .download(&remote, &path, TransmissionType::DownloadNewFile)
            .await?;
        mapped.set_checksum(Some(checksum))?;
        mapped.set_content_size(written as i64);
    }

    info!(path = %path.display(), "Created local object");
    ctx.tag_local(&path, &mapped).await?;
    remote_changed::finish(ctx, &path, &mut mapped, &remote).await
}

#[instrument(skip_all, fields(path = ?request.path()))]
pub async fn both_created(ctx: &SyncContext, request: SolveRequest) -> SyncResult<()> {
    let local = request.require_local()?.clone();
    let remote = request.require_remote()?.clone();

    if local.is_directory != remote.is_folder() {
        ctx.surface_conflict(ConflictKind::BothCreatedDiffering, Some(&local.path));
        return Ok(());
    }

    let mut checksum = None;
    if !local.is_directory {
        let local_checksum = request.local_checksum(ctx).await?;
        if !same_content(ctx, &local_checksum, local.size, &remote).await? {
            ctx.surface_conflict(ConflictKind::BothCreatedDiffering, Some(&local.path));
            return Ok(());
        }
        checksum = Some(local_checksum);
    }

    let parent_id = remote
        .parent_id
        .clone()
        .ok_or_else(|| SyncError::MissingMapping(remote.id.to_string()))?;
    let mut mapped = MappedObject::new(
        &remote.name,
        remote.id.clone(),
        remote.object_type,
        Some(parent_id),
        remote.change_token.clone(),
    )?;
    if let Some(guid) = adopt_guid(ctx, &local.path).await? {
        mapped = mapped.with_guid(guid);
    }
    mapped.set_checksum(checksum)?;

    info!(id = %remote.id, "Mapped object created on both sides");
    ctx.tag_local(&local.path, &mapped).await?;
    local_changed::finish(ctx, &local.path, &mut mapped, remote).await
}

async fn same_content(
    ctx: &SyncContext,
    local: &Checksum,
    local_size: u64,
    remote: &docsync_core::domain::RemoteObject,
) -> SyncResult<bool> {
    if remote.content_length.is_some_and(|len| len != local_size) {
        return Ok(false);
    }
    if let Some(hash) = &remote.content_hash {
        if hash.algorithm() == local.algorithm() {
            return Ok(hash == local);
        }
    }
    if !remote.has_content_stream {
        return Ok(local_size == 0);
    }
    match ctx.remote_checksum(&remote.id).await {
        Ok(remote_checksum) => Ok(&remote_checksum == local),
        Err(e) => {
            warn!(error = %e, "Could not hash remote content");
            Err(e)
        }
    }
}
