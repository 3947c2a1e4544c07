//! Both sides changed: reconcile without a private working copy

use docsync_core::domain::Reconciliation;
use tracing::{debug, instrument};

use super::{local_changed, remote_changed, SolveRequest, SyncContext};
use crate::SyncResult;

#[instrument(skip_all, fields(path = ?request.path(), reconciliation = ?reconciliation))]
pub async fn solve(
    ctx: &SyncContext,
    request: SolveRequest,
    reconciliation: Reconciliation,
) -> SyncResult<()> {
    let mut mapped = request.require_mapping()?.clone();
    let remote = request.require_remote()?.clone();
    let path = request.require_local()?.path.clone();

    if mapped.is_folder() {
        return local_changed::finish(ctx, &path, &mut mapped, remote).await;
    }

    match reconciliation {
        Reconciliation::DatesOnly | Reconciliation::Converged => {
            if reconciliation == Reconciliation::Converged {
                debug!("Both sides hold the same content");
                mapped.set_checksum(Some(request.local_checksum(ctx).await?))?;
            }
            local_changed::finish(ctx, &path, &mut mapped, remote).await
        }
        Reconciliation::UploadLocal => {
            let Some(remote) =
                local_changed::push_content(ctx, &request, &mut mapped, remote).await?
            else {
                return Ok(());
            };
            local_changed::finish(ctx, &path, &mut mapped, remote).await
        }
        Reconciliation::DownloadRemote => {
            remote_changed::pull_content(ctx, &path, &mut mapped, &remote).await?;
            remote_changed::finish(ctx, &path, &mut mapped, &remote).await
        }
    }
}
