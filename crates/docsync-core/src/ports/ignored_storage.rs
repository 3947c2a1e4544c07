//! Selective-ignore storage port
//!
//! Persists the user's ignored remote subtrees for one sync root, keyed by
//! remote object id.

use crate::domain::newtypes::RemoteId;
use crate::domain::IgnoredEntity;

/// Port trait for the ignored-entities table
#[async_trait::async_trait]
pub trait IIgnoredEntitiesStorage: Send + Sync {
    /// Adds or replaces an entry
    async fn add(&self, entity: &IgnoredEntity) -> anyhow::Result<()>;

    /// Removes the entry for `object_id`, if any
    async fn remove(&self, object_id: &RemoteId) -> anyhow::Result<()>;

    /// All entries
    async fn all(&self) -> anyhow::Result<Vec<IgnoredEntity>>;
}
