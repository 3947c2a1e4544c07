//! Selective-ignore entries
//!
//! The user can exclude a remote subtree from synchronization. The entry
//! records both the remote object id (so remote events can be matched) and
//! the local path it maps to (so local events can be matched).

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::newtypes::RemoteId;

/// A remote folder or document excluded from synchronization
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IgnoredEntity {
    pub object_id: RemoteId,
    pub local_path: PathBuf,
}

impl IgnoredEntity {
    pub fn new(object_id: RemoteId, local_path: impl Into<PathBuf>) -> Self {
        Self {
            object_id,
            local_path: local_path.into(),
        }
    }
}

/// Result of an ignore lookup
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IgnoredState {
    #[default]
    NotIgnored,
    /// The entry itself is marked ignored
    Ignored,
    /// An ancestor is marked ignored
    Inherited,
}

impl IgnoredState {
    /// Returns true for `Ignored` and `Inherited`
    pub fn is_ignored(&self) -> bool {
        !matches!(self, Self::NotIgnored)
    }
}

impl fmt::Display for IgnoredState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NotIgnored => "NOT_IGNORED",
            Self::Ignored => "IGNORED",
            Self::Inherited => "INHERITED",
        })
    }
}
