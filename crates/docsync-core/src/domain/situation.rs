//! Synchronization situations
//!
//! A `Situation` is the classification of one (local, remote) change pair
//! against the stored mapping. The set is closed: every pending event is
//! classified into exactly one variant, and every variant is dispatched to
//! exactly one solver strategy.

use std::fmt;

use serde::{Deserialize, Serialize};

/// How a "both sides changed" situation is reconciled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Reconciliation {
    /// No content changed; only timestamps and tokens need syncing
    DatesOnly,
    /// Both sides changed content to byte-identical results
    Converged,
    /// Local content wins and is uploaded
    UploadLocal,
    /// Remote content wins and is downloaded
    DownloadRemote,
}

/// Which side(s) moved or renamed an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovedSide {
    Local,
    Remote,
    /// Both sides moved the entry to the same place
    Both,
}

/// Why a situation cannot be resolved automatically
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictKind {
    /// Both sides changed content and the results differ
    ContentDiverged,
    /// An entry was created on both sides with different content
    BothCreatedDiffering,
    /// Both sides moved the entry to different places
    BothMovedApart,
}

impl ConflictKind {
    /// User-facing explanation
    pub fn description(&self) -> &'static str {
        match self {
            Self::ContentDiverged => {
                "The file was changed locally and on the server, and the versions differ"
            }
            Self::BothCreatedDiffering => {
                "A file with the same name was created locally and on the server"
            }
            Self::BothMovedApart => "The entry was moved locally and on the server to different places",
        }
    }
}

/// Classification result driving dispatch to one solver
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Situation {
    NoChange,
    LocalOnlyCreated,
    RemoteOnlyCreated,
    /// Created on both sides; the solver maps identical entries and
    /// surfaces a conflict otherwise
    BothCreated,
    LocalOnlyChanged,
    RemoteOnlyChanged,
    BothChanged(Reconciliation),
    LocalOnlyRemoved,
    RemoteOnlyRemoved,
    BothRemoved,
    Moved(MovedSide),
    /// Surfaced to the user, never auto-resolved
    UnresolvedConflict(ConflictKind),
}

impl Situation {
    /// Stable name for logs and tests
    pub fn name(&self) -> &'static str {
        match self {
            Self::NoChange => "no_change",
            Self::LocalOnlyCreated => "local_only_created",
            Self::RemoteOnlyCreated => "remote_only_created",
            Self::BothCreated => "both_created",
            Self::LocalOnlyChanged => "local_only_changed",
            Self::RemoteOnlyChanged => "remote_only_changed",
            Self::BothChanged(_) => "both_changed",
            Self::LocalOnlyRemoved => "local_only_removed",
            Self::RemoteOnlyRemoved => "remote_only_removed",
            Self::BothRemoved => "both_removed",
            Self::Moved(_) => "moved",
            Self::UnresolvedConflict(_) => "unresolved_conflict",
        }
    }

    /// Returns true for situations that require user interaction
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::UnresolvedConflict(_))
    }
}

impl fmt::Display for Situation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BothChanged(r) => write!(f, "both_changed({r:?})"),
            Self::Moved(side) => write!(f, "moved({side:?})"),
            Self::UnresolvedConflict(kind) => write!(f, "unresolved_conflict({kind:?})"),
            other => f.write_str(other.name()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_includes_qualifier() {
        assert_eq!(
            Situation::BothChanged(Reconciliation::DatesOnly).to_string(),
            "both_changed(DatesOnly)"
        );
        assert_eq!(Situation::NoChange.to_string(), "no_change");
    }

    #[test]
    fn test_is_conflict() {
        assert!(Situation::UnresolvedConflict(ConflictKind::ContentDiverged).is_conflict());
        assert!(!Situation::BothCreated.is_conflict());
    }
}
