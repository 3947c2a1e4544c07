//! Domain entities and business logic
//!
//! This module contains the core domain types for docsync:
//! - Newtypes for identifiers, tokens, checksums and validated paths
//! - The persisted `MappedObject` record and live `RemoteObject` snapshots
//! - Domain events flowing through the per-root queue
//! - The closed set of synchronization situations
//! - Local/remote path mapping and selective-ignore entries
//! - Domain-specific error types

pub mod errors;
pub mod event;
pub mod ignored;
pub mod mapped_object;
pub mod newtypes;
pub mod path_matcher;
pub mod remote_object;
pub mod situation;

// Re-export commonly used types
pub use errors::DomainError;
pub use event::{
    ChangeType, ContentChange, ContentChangeEvent, EventSource, FileOrFolderEvent, FsChangeKind,
    FsEvent, FsMovedEvent, LocalHandle, MetaDataChange, RemoteHandle, StartNextSync, SyncEvent,
};
pub use ignored::{IgnoredEntity, IgnoredState};
pub use mapped_object::{MappedObject, ObjectType, UNKNOWN_CONTENT_SIZE};
pub use newtypes::*;
pub use path_matcher::PathMatcher;
pub use remote_object::RemoteObject;
pub use situation::{ConflictKind, MovedSide, Reconciliation, Situation};
