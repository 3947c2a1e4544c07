//! Port definitions (hexagonal architecture interfaces)
//!
//! This module defines the port traits that form the boundaries of the
//! hexagonal architecture. Ports are interfaces that the sync engine
//! depends on, but whose implementations live in adapter crates.
//!
//! ## Ports Overview
//!
//! - [`IRepository`] - Remote content repository (objects, content, change log)
//! - [`IMetaDataStorage`] - Persistent mapping of synchronized objects
//! - [`ITransmissionStorage`] - Partial upload bookkeeping
//! - [`IIgnoredEntitiesStorage`] - Selective-ignore entries
//! - [`ILocalFileSystem`] - Local filesystem operations

pub mod ignored_storage;
pub mod local_filesystem;
pub mod metadata_storage;
pub mod repository;

pub use ignored_storage::IIgnoredEntitiesStorage;
pub use local_filesystem::{FsError, ILocalFileSystem, LocalEntry};
pub use metadata_storage::{IMetaDataStorage, ITransmissionStorage, TransmissionRecord};
pub use repository::{
    ChangeLogEntry, ChangeLogPage, ContentStream, IRepository, ObjectProperties,
    RepositoryCapabilities, RepositoryError,
};
