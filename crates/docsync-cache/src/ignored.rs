//! SQLite implementation of the ignored-entities port

use std::path::PathBuf;

use sqlx::{Row, SqlitePool};

use docsync_core::domain::{newtypes::RemoteId, IgnoredEntity};
use docsync_core::ports::IIgnoredEntitiesStorage;

use crate::CacheError;

/// Selective-ignore entries of one sync root
pub struct SqliteIgnoredEntitiesStorage {
    pool: SqlitePool,
}

impl SqliteIgnoredEntitiesStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl IIgnoredEntitiesStorage for SqliteIgnoredEntitiesStorage {
    async fn add(&self, entity: &IgnoredEntity) -> anyhow::Result<()> {
        sqlx::query("INSERT OR REPLACE INTO ignored_entities (object_id, local_path) VALUES (?, ?)")
            .bind(entity.object_id.as_str())
            .bind(entity.local_path.to_string_lossy().into_owned())
            .execute(&self.pool)
            .await?;

        tracing::debug!(
            object_id = %entity.object_id,
            path = %entity.local_path.display(),
            "Added ignored entity"
        );
        Ok(())
    }

    async fn remove(&self, object_id: &RemoteId) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM ignored_entities WHERE object_id = ?")
            .bind(object_id.as_str())
            .execute(&self.pool)
            .await?;

        tracing::debug!(object_id = %object_id, "Removed ignored entity");
        Ok(())
    }

    async fn all(&self) -> anyhow::Result<Vec<IgnoredEntity>> {
        let rows = sqlx::query("SELECT object_id, local_path FROM ignored_entities")
            .fetch_all(&self.pool)
            .await?;

        let mut entities = Vec::with_capacity(rows.len());
        for row in &rows {
            let object_id = RemoteId::new(row.get("object_id")).map_err(CacheError::from)?;
            let local_path: String = row.get("local_path");
            entities.push(IgnoredEntity::new(object_id, PathBuf::from(local_path)));
        }
        Ok(entities)
    }
}
