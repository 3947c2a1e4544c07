//! Both sides changed: upload through a private working copy
//!
//! Only a pure local content change goes through check-out / check-in.
//! Everything else falls back to [`reconcile`](super::reconcile).

use docsync_core::domain::Reconciliation;
use tracing::{info, instrument, warn};

use super::{defer_recoverable, local_changed, reconcile, SolveRequest, SyncContext};
use crate::transmission::TransmissionType;
use crate::SyncResult;

#[instrument(skip_all, fields(path = ?request.path(), reconciliation = ?reconciliation))]
pub async fn solve(
    ctx: &SyncContext,
    request: SolveRequest,
    reconciliation: Reconciliation,
) -> SyncResult<()> {
    let mapped = request.require_mapping()?;
    if !mapped.is_file()
        || request.remote_content.is_changed()
        || reconciliation != Reconciliation::UploadLocal
    {
        return reconcile::solve(ctx, request, reconciliation).await;
    }

    let mut mapped = mapped.clone();
    let local = request.require_local()?.clone();
    let remote = request.require_remote()?.clone();

    let pwc_id = ctx.repository.check_out(&remote.id).await?;
    let uploaded = ctx
        .upload(&pwc_id, &local, TransmissionType::UploadModifiedFile)
        .await;
    let checksum = match uploaded {
        Ok((_, checksum)) => checksum,
        Err(e) => {
            if let Err(cancel) = ctx.repository.cancel_check_out(&pwc_id).await {
                warn!(pwc = %pwc_id, error = %cancel, "Failed to cancel check-out");
            }
            return defer_recoverable::<()>(Err(e), "Check-in").map(|_| ());
        }
    };

    let checked_in = ctx.repository.check_in(&pwc_id).await?;
    info!(id = %checked_in.id, "Checked in new version");

    if &checked_in.id != mapped.remote_id() {
        ctx.transmission_storage
            .remove_transmission(mapped.remote_id())
            .await?;
        ctx.storage
            .rekey_object(mapped.remote_id(), &checked_in.id)
            .await?;
        mapped.set_remote_id(checked_in.id.clone());
    }

    mapped.set_checksum(Some(checksum))?;
    mapped.set_content_size(local.size as i64);
    mapped.set_remote_write_time(checked_in.last_modified);
    local_changed::finish(ctx, &local.path, &mut mapped, checked_in).await
}
