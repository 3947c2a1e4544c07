//! Moves and renames
//!
//! The move is replayed on the side that did not move. The change token is
//! only advanced when nothing but the location changed, so content changes
//! are still detected on the following pass.

use docsync_core::domain::{MappedObject, MovedSide, RemoteObject};
use docsync_core::ports::ObjectProperties;
use tracing::{debug, info, instrument};

use super::{SolveRequest, SyncContext};
use crate::{SyncError, SyncResult};

#[instrument(skip_all, fields(path = ?request.path(), side = ?side))]
pub async fn solve(ctx: &SyncContext, request: SolveRequest, side: MovedSide) -> SyncResult<()> {
    let mut mapped = request.require_mapping()?.clone();
    let remote = request.require_remote()?.clone();
    match side {
        MovedSide::Local => move_remote(ctx, &request, &mut mapped, remote).await?,
        MovedSide::Remote => move_local(ctx, &request, &mut mapped, &remote).await?,
        MovedSide::Both => {
            debug!("Both sides moved to the same place");
            adopt_remote_location(&request, &mut mapped, &remote)?;
        }
    }
    ctx.save(&mapped).await
}

async fn move_remote(
    ctx: &SyncContext,
    request: &SolveRequest,
    mapped: &mut MappedObject,
    mut remote: RemoteObject,
) -> SyncResult<()> {
    let local = request.require_local()?;
    let name = local
        .name()
        .ok_or_else(|| SyncError::MissingMapping(local.path.display().to_string()))?
        .to_string();
    let parent = ctx.parent_mapping(&local.path).await?;
    let untouched = remote.change_token.as_ref() == mapped.last_change_token();

    if Some(parent.remote_id()) != remote.parent_id.as_ref() {
        let source = remote
            .parent_id
            .clone()
            .ok_or_else(|| SyncError::MissingMapping(remote.id.to_string()))?;
        remote = ctx
            .repository
            .move_object(&remote.id, &source, parent.remote_id())
            .await?;
    }
    if remote.name != name {
        remote = ctx
            .repository
            .update_properties(&remote.id, &ObjectProperties::rename(&name))
            .await?;
    }
    info!(id = %remote.id, to = %local.path.display(), "Moved remote object");

    mapped.set_parent_id(parent.remote_id().clone())?;
    mapped.set_name(name)?;
    if untouched {
        mapped.set_change_token(remote.change_token.clone());
        mapped.set_remote_write_time(remote.last_modified);
    }
    Ok(())
}

async fn move_local(
    ctx: &SyncContext,
    request: &SolveRequest,
    mapped: &mut MappedObject,
    remote: &RemoteObject,
) -> SyncResult<()> {
    let local = request.require_local()?;
    let target = match &request.remote_target_path {
        Some(target) => target.clone(),
        None => {
            let parent_id = remote
                .parent_id
                .as_ref()
                .ok_or_else(|| SyncError::MissingMapping(remote.id.to_string()))?;
            ctx.parent_local_path(parent_id).await?.join(&remote.name)
        }
    };

    ctx.fs.rename(&local.path, &target).await?;
    info!(from = %local.path.display(), to = %target.display(), "Moved local object");
    adopt_remote_location(request, mapped, remote)
}

fn adopt_remote_location(
    request: &SolveRequest,
    mapped: &mut MappedObject,
    remote: &RemoteObject,
) -> SyncResult<()> {
    let parent_id = remote
        .parent_id
        .clone()
        .ok_or_else(|| SyncError::MissingMapping(remote.id.to_string()))?;
    mapped.set_parent_id(parent_id)?;
    mapped.set_name(remote.name.clone())?;

    let content_untouched = !request.remote_content.is_changed()
        && match (&remote.content_hash, mapped.last_checksum()) {
            (Some(hash), Some(stored)) => hash == stored,
            _ => true,
        };
    if content_untouched {
        mapped.set_change_token(remote.change_token.clone());
        mapped.set_remote_write_time(remote.last_modified);
    }
    Ok(())
}
