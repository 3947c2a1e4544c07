//! docsync Core - Domain model and port definitions
//!
//! This crate contains the hexagonal architecture core with:
//! - **Domain entities** - `MappedObject`, `SyncEvent`, `Situation`, `IgnoredEntity`
//! - **Path mapping** - `PathMatcher`, the bijection between local and remote roots
//! - **Port definitions** - Traits for adapters: `IRepository`, `IMetaDataStorage`,
//!   `ILocalFileSystem`, `IIgnoredEntitiesStorage`
//! - **Configuration** - YAML configuration with validation
//!
//! # Architecture
//!
//! The domain module contains pure data and classification types with no I/O.
//! Ports define trait interfaces that adapter crates implement; the sync
//! engine only talks to the outside world through them.

pub mod config;
pub mod domain;
pub mod ports;
