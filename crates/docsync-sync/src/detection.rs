//! Situation detection
//!
//! [`detect`] is a pure function: it classifies one object's combined
//! local, remote and stored state into a [`Situation`]. Everything that
//! needs I/O (reading the local entry, fetching the remote object, hashing
//! content) happens in the [`mechanism`](crate::mechanism) before it builds
//! the [`Observation`].

use std::path::Path;

use docsync_core::domain::{
    ConflictKind, ContentChange, MappedObject, MovedSide, Reconciliation, RemoteObject, Situation,
};
use docsync_core::ports::LocalEntry;

/// What is known about the contents on both sides when both changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ContentEvidence {
    /// No comparable checksums are available
    #[default]
    Unknown,
    Identical,
    Different,
}

/// Everything the detector looks at for one object
#[derive(Debug, Clone, Copy, Default)]
pub struct Observation<'a> {
    /// Stored mapping, if the object was synchronized before
    pub mapped: Option<&'a MappedObject>,
    /// Local path derived from the stored mapping
    pub stored_local_path: Option<&'a Path>,
    /// Current local entry, `None` if it does not exist
    pub local: Option<&'a LocalEntry>,
    /// Current remote object, `None` if it does not exist
    pub remote: Option<&'a RemoteObject>,
    /// Local path the current remote location maps to
    pub remote_target_path: Option<&'a Path>,
    pub local_content: ContentChange,
    pub remote_content: ContentChange,
    pub evidence: ContentEvidence,
}

/// Classifies an observation
pub fn detect(observation: &Observation<'_>) -> Situation {
    let Some(mapped) = observation.mapped else {
        return match (observation.local, observation.remote) {
            (Some(_), Some(_)) => Situation::BothCreated,
            (Some(_), None) => Situation::LocalOnlyCreated,
            (None, Some(_)) => Situation::RemoteOnlyCreated,
            (None, None) => Situation::NoChange,
        };
    };

    match (observation.local, observation.remote) {
        (None, None) => Situation::BothRemoved,
        (None, Some(remote)) => {
            if remote_changed(mapped, remote) {
                Situation::RemoteOnlyCreated
            } else {
                Situation::LocalOnlyRemoved
            }
        }
        (Some(local), None) => {
            if mapped.is_file() && local_content_changed(observation, mapped, local) {
                Situation::LocalOnlyCreated
            } else {
                Situation::RemoteOnlyRemoved
            }
        }
        (Some(local), Some(remote)) => detect_both_present(observation, mapped, local, remote),
    }
}

fn detect_both_present(
    observation: &Observation<'_>,
    mapped: &MappedObject,
    local: &LocalEntry,
    remote: &RemoteObject,
) -> Situation {
    let local_moved = observation
        .stored_local_path
        .is_some_and(|stored| stored != local.path);
    let remote_moved = remote.name != mapped.name() || remote.parent_id.as_ref() != mapped.parent_id();

    match (local_moved, remote_moved) {
        (true, true) => {
            return if observation.remote_target_path == Some(local.path.as_path()) {
                Situation::Moved(MovedSide::Both)
            } else {
                Situation::UnresolvedConflict(ConflictKind::BothMovedApart)
            };
        }
        (true, false) => return Situation::Moved(MovedSide::Local),
        (false, true) => return Situation::Moved(MovedSide::Remote),
        (false, false) => {}
    }

    let local_changed = mapped.is_file() && local_content_changed(observation, mapped, local);
    let remote_changed = remote_changed(mapped, remote);

    match (local_changed, remote_changed) {
        (true, true) => reconcile(observation, local, remote),
        (true, false) => Situation::LocalOnlyChanged,
        (false, true) => Situation::RemoteOnlyChanged,
        (false, false) => Situation::NoChange,
    }
}

fn reconcile(observation: &Observation<'_>, local: &LocalEntry, remote: &RemoteObject) -> Situation {
    let reconciliation = match (
        observation.local_content.is_changed(),
        observation.remote_content.is_changed(),
    ) {
        (true, true) => match observation.evidence {
            ContentEvidence::Identical => Reconciliation::Converged,
            ContentEvidence::Different => {
                return Situation::UnresolvedConflict(ConflictKind::ContentDiverged)
            }
            ContentEvidence::Unknown => match (local.modified, remote.last_modified) {
                (Some(l), Some(r)) if l > r => Reconciliation::UploadLocal,
                (Some(l), Some(r)) if r > l => Reconciliation::DownloadRemote,
                _ => Reconciliation::DatesOnly,
            },
        },
        (true, false) => Reconciliation::UploadLocal,
        (false, true) => Reconciliation::DownloadRemote,
        (false, false) => Reconciliation::DatesOnly,
    };
    Situation::BothChanged(reconciliation)
}

/// The remote object changed since the last synchronization
fn remote_changed(mapped: &MappedObject, remote: &RemoteObject) -> bool {
    remote.change_token.as_ref() != mapped.last_change_token()
}

/// The local file changed since the last synchronization
fn local_content_changed(
    observation: &Observation<'_>,
    mapped: &MappedObject,
    local: &LocalEntry,
) -> bool {
    observation.local_content.is_changed()
        || local.modified != mapped.last_local_write_time()
        || mapped.content_size().is_some_and(|size| size != local.size)
}
