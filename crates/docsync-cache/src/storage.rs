//! SQLite implementation of the metadata and transmission storage ports
//!
//! ## Type Mapping
//!
//! | Domain Type     | SQL Type | Strategy                                        |
//! |-----------------|----------|-------------------------------------------------|
//! | RemoteId        | TEXT     | `.as_str()` / `RemoteId::new()`                 |
//! | LocalGuid       | TEXT     | UUID string via `.to_string()` / `FromStr`      |
//! | ChangeToken     | TEXT     | `.as_str()` / `ChangeToken::new()`              |
//! | Checksum        | 2 x TEXT | algorithm + lowercase hex digest                |
//! | ObjectType      | TEXT     | `.name()` / `ObjectType::from_name()`           |
//! | DateTime<Utc>   | TEXT     | RFC 3339 via `to_rfc3339()` / `parse_from_rfc3339()` |
//!
//! Local paths are derived, never stored: the names along an object's
//! parent chain are joined onto the root's local path.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};

use docsync_core::domain::{
    newtypes::{ChangeToken, Checksum, LocalGuid, RemoteId, RemotePath},
    MappedObject, ObjectType, PathMatcher,
};
use docsync_core::ports::{IMetaDataStorage, ITransmissionStorage, TransmissionRecord};

use crate::CacheError;

/// Parent chains longer than this are treated as cycles
const MAX_TREE_DEPTH: usize = 4096;

/// SQLite-backed storage for the mapped objects of one sync root
pub struct SqliteMetaDataStorage {
    pool: SqlitePool,
    matcher: PathMatcher,
}

impl SqliteMetaDataStorage {
    pub fn new(pool: SqlitePool, matcher: PathMatcher) -> Self {
        Self { pool, matcher }
    }

    /// The mapping of the sync root folder, if it was stored already
    pub async fn root_object(&self) -> anyhow::Result<Option<MappedObject>> {
        let row = sqlx::query("SELECT * FROM mapped_objects WHERE parent_id IS NULL LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(ref r) => Ok(Some(mapped_object_from_row(r)?)),
            None => Ok(None),
        }
    }

    async fn get_child_by_name(
        &self,
        parent_id: &RemoteId,
        name: &str,
    ) -> anyhow::Result<Option<MappedObject>> {
        let row = sqlx::query("SELECT * FROM mapped_objects WHERE parent_id = ? AND name = ?")
            .bind(parent_id.as_str())
            .bind(name)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(ref r) => Ok(Some(mapped_object_from_row(r)?)),
            None => Ok(None),
        }
    }

    /// Names from just below the root down to `object` (empty for the root)
    ///
    /// Returns `None` if a parent is missing or the chain does not terminate.
    async fn name_chain(&self, object: &MappedObject) -> anyhow::Result<Option<Vec<String>>> {
        let mut names = Vec::new();
        let mut current = object.clone();

        while let Some(parent_id) = current.parent_id().cloned() {
            if names.len() >= MAX_TREE_DEPTH {
                return Ok(None);
            }
            names.push(current.name().to_string());
            match self.get_object_by_remote_id(&parent_id).await? {
                Some(parent) => current = parent,
                None => return Ok(None),
            }
        }

        names.reverse();
        Ok(Some(names))
    }
}

// ============================================================================
// Helper functions for type conversion
// ============================================================================

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, CacheError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            CacheError::SerializationError(format!("Failed to parse datetime '{}': {}", s, e))
        })
}

fn parse_optional_datetime(s: Option<String>) -> Result<Option<DateTime<Utc>>, CacheError> {
    match s {
        Some(ref val) if !val.is_empty() => parse_datetime(val).map(Some),
        _ => Ok(None),
    }
}

fn parse_optional_remote_id(s: Option<String>) -> Result<Option<RemoteId>, CacheError> {
    s.map(RemoteId::new).transpose().map_err(CacheError::from)
}

// ============================================================================
// Row mapping functions
// ============================================================================

/// Rebuilds a MappedObject through its validating constructor and setters
fn mapped_object_from_row(row: &SqliteRow) -> Result<MappedObject, CacheError> {
    let remote_id = RemoteId::new(row.get("remote_id"))?;
    let guid_str: String = row.get("guid");
    let guid: LocalGuid = guid_str.parse()?;
    let parent_id = parse_optional_remote_id(row.get("parent_id"))?;
    let object_type_str: String = row.get("object_type");
    let object_type = ObjectType::from_name(&object_type_str).ok_or_else(|| {
        CacheError::SerializationError(format!("Unknown object type: {}", object_type_str))
    })?;
    let name: String = row.get("name");
    let change_token = row
        .get::<Option<String>, _>("last_change_token")
        .map(ChangeToken::new)
        .transpose()?;
    let checksum = match (
        row.get::<Option<String>, _>("checksum_algorithm"),
        row.get::<Option<String>, _>("checksum_digest"),
    ) {
        (Some(algorithm), Some(digest)) => Some(Checksum::from_hex(algorithm, &digest)?),
        _ => None,
    };

    let mut object = MappedObject::new(name, remote_id, object_type, parent_id, change_token)?
        .with_guid(guid);
    object.set_remote_write_time(parse_optional_datetime(row.get("last_remote_write_time"))?);
    object.set_local_write_time(parse_optional_datetime(row.get("last_local_write_time"))?);
    object.set_checksum(checksum)?;
    object.set_content_size(row.get("last_content_size"));
    object.set_description(row.get("description"));
    object.set_read_only(row.get("read_only"));

    Ok(object)
}

fn transmission_from_row(row: &SqliteRow) -> Result<TransmissionRecord, CacheError> {
    let local_path: String = row.get("local_path");
    let position: i64 = row.get("position");
    let length: i64 = row.get("length");
    let updated_at: String = row.get("updated_at");

    Ok(TransmissionRecord {
        remote_id: RemoteId::new(row.get("remote_id"))?,
        local_path: PathBuf::from(local_path),
        position: position.max(0) as u64,
        length: length.max(0) as u64,
        local_modified: parse_optional_datetime(row.get("local_modified"))?,
        updated_at: parse_datetime(&updated_at)?,
    })
}

// ============================================================================
// IMetaDataStorage implementation
// ============================================================================

#[async_trait::async_trait]
impl IMetaDataStorage for SqliteMetaDataStorage {
    fn matcher(&self) -> &PathMatcher {
        &self.matcher
    }

    async fn get_object_by_remote_id(
        &self,
        id: &RemoteId,
    ) -> anyhow::Result<Option<MappedObject>> {
        let row = sqlx::query("SELECT * FROM mapped_objects WHERE remote_id = ?")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(ref r) => Ok(Some(mapped_object_from_row(r)?)),
            None => Ok(None),
        }
    }

    async fn get_object_by_guid(&self, guid: &LocalGuid) -> anyhow::Result<Option<MappedObject>> {
        let row = sqlx::query("SELECT * FROM mapped_objects WHERE guid = ?")
            .bind(guid.to_string())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(ref r) => Ok(Some(mapped_object_from_row(r)?)),
            None => Ok(None),
        }
    }

    async fn get_object_by_local_path(
        &self,
        path: &Path,
    ) -> anyhow::Result<Option<MappedObject>> {
        let Ok(relative) = self.matcher.relative_local_path(path) else {
            return Ok(None);
        };
        let Some(mut current) = self.root_object().await? else {
            return Ok(None);
        };

        for component in relative.components() {
            let Some(name) = component.as_os_str().to_str() else {
                return Ok(None);
            };
            match self.get_child_by_name(current.remote_id(), name).await? {
                Some(child) => current = child,
                None => return Ok(None),
            }
        }

        Ok(Some(current))
    }

    async fn get_children(&self, parent_id: &RemoteId) -> anyhow::Result<Vec<MappedObject>> {
        let rows = sqlx::query("SELECT * FROM mapped_objects WHERE parent_id = ? ORDER BY name")
            .bind(parent_id.as_str())
            .fetch_all(&self.pool)
            .await?;

        let mut children = Vec::with_capacity(rows.len());
        for row in &rows {
            children.push(mapped_object_from_row(row)?);
        }
        Ok(children)
    }

    async fn save_mapped_object(&self, object: &MappedObject) -> anyhow::Result<()> {
        let checksum = object.last_checksum();

        sqlx::query(
            "INSERT OR REPLACE INTO mapped_objects \
             (remote_id, guid, parent_id, object_type, name, last_change_token, \
              last_remote_write_time, last_local_write_time, checksum_algorithm, \
              checksum_digest, last_content_size, description, read_only) \
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(object.remote_id().as_str())
        .bind(object.guid().to_string())
        .bind(object.parent_id().map(|p| p.as_str()))
        .bind(object.object_type().name())
        .bind(object.name())
        .bind(object.last_change_token().map(|t| t.as_str()))
        .bind(object.last_remote_write_time().map(|dt| dt.to_rfc3339()))
        .bind(object.last_local_write_time().map(|dt| dt.to_rfc3339()))
        .bind(checksum.map(|c| c.algorithm()))
        .bind(checksum.map(|c| c.to_hex()))
        .bind(object.last_content_size())
        .bind(object.description())
        .bind(object.read_only())
        .execute(&self.pool)
        .await?;

        tracing::trace!(remote_id = %object.remote_id(), name = object.name(), "Saved mapped object");
        Ok(())
    }

    async fn remove_object(&self, id: &RemoteId) -> anyhow::Result<()> {
        let result = sqlx::query(
            "WITH RECURSIVE subtree(id) AS ( \
                 SELECT ? \
                 UNION \
                 SELECT m.remote_id FROM mapped_objects m JOIN subtree s ON m.parent_id = s.id \
             ) \
             DELETE FROM mapped_objects WHERE remote_id IN (SELECT id FROM subtree)",
        )
        .bind(id.as_str())
        .execute(&self.pool)
        .await?;

        tracing::trace!(
            remote_id = %id,
            removed = result.rows_affected(),
            "Removed mapped object subtree"
        );
        Ok(())
    }

    async fn rekey_object(&self, old_id: &RemoteId, new_id: &RemoteId) -> anyhow::Result<()> {
        if old_id == new_id {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query("UPDATE mapped_objects SET remote_id = ? WHERE remote_id = ?")
            .bind(new_id.as_str())
            .bind(old_id.as_str())
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if updated == 0 {
            anyhow::bail!("No mapped object with remote id {old_id}");
        }
        sqlx::query("UPDATE mapped_objects SET parent_id = ? WHERE parent_id = ?")
            .bind(new_id.as_str())
            .bind(old_id.as_str())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        tracing::trace!(old = %old_id, new = %new_id, "Re-keyed mapped object");
        Ok(())
    }

    async fn get_local_path(&self, object: &MappedObject) -> anyhow::Result<Option<PathBuf>> {
        let Some(names) = self.name_chain(object).await? else {
            return Ok(None);
        };

        let mut path = self.matcher.local_root().clone();
        for name in &names {
            path = path.join(name)?;
        }
        Ok(Some(path.into_path_buf()))
    }

    async fn get_remote_path(&self, object: &MappedObject) -> anyhow::Result<Option<RemotePath>> {
        let Some(names) = self.name_chain(object).await? else {
            return Ok(None);
        };

        let mut path = self.matcher.remote_root().clone();
        for name in &names {
            path = path.join(name)?;
        }
        Ok(Some(path))
    }

    async fn change_log_token(&self) -> anyhow::Result<Option<ChangeToken>> {
        let token: Option<Option<String>> =
            sqlx::query_scalar("SELECT token FROM change_log WHERE id = 1")
                .fetch_optional(&self.pool)
                .await?;

        Ok(token.flatten().map(ChangeToken::new).transpose()?)
    }

    async fn set_change_log_token(&self, token: Option<&ChangeToken>) -> anyhow::Result<()> {
        sqlx::query("INSERT OR REPLACE INTO change_log (id, token) VALUES (1, ?)")
            .bind(token.map(|t| t.as_str()))
            .execute(&self.pool)
            .await?;

        tracing::debug!(token = ?token.map(|t| t.as_str()), "Stored change log token");
        Ok(())
    }

    async fn all_mapped_objects(&self) -> anyhow::Result<Vec<MappedObject>> {
        let rows = sqlx::query("SELECT * FROM mapped_objects ORDER BY remote_id")
            .fetch_all(&self.pool)
            .await?;

        let mut objects = Vec::with_capacity(rows.len());
        for row in &rows {
            objects.push(mapped_object_from_row(row)?);
        }
        Ok(objects)
    }

    async fn validate_object_structure(&self) -> anyhow::Result<Vec<String>> {
        let objects = self.all_mapped_objects().await?;
        let by_id: HashMap<&RemoteId, &MappedObject> =
            objects.iter().map(|o| (o.remote_id(), o)).collect();
        let mut problems = Vec::new();

        let roots = objects.iter().filter(|o| o.is_root()).count();
        if !objects.is_empty() && roots != 1 {
            problems.push(format!("Expected exactly one root mapping, found {roots}"));
        }

        let mut siblings: HashSet<(&RemoteId, &str)> = HashSet::new();
        for object in &objects {
            if object.is_folder() && object.last_checksum().is_some() {
                problems.push(format!("Folder {} carries a checksum", object.remote_id()));
            }

            let Some(parent_id) = object.parent_id() else {
                continue;
            };
            match by_id.get(parent_id) {
                None => problems.push(format!(
                    "Object {} references missing parent {parent_id}",
                    object.remote_id()
                )),
                Some(parent) if !parent.is_folder() => problems.push(format!(
                    "Object {} has non-folder parent {parent_id}",
                    object.remote_id()
                )),
                Some(_) => {}
            }
            if !siblings.insert((parent_id, object.name())) {
                problems.push(format!(
                    "Duplicate name '{}' below {parent_id}",
                    object.name()
                ));
            }

            // every chain has to end at a root
            let mut current: &MappedObject = object;
            let mut depth = 0;
            while let Some(next) = current.parent_id().and_then(|p| by_id.get(p).copied()) {
                depth += 1;
                if depth > objects.len() {
                    problems.push(format!(
                        "Object {} is part of a parent cycle",
                        object.remote_id()
                    ));
                    break;
                }
                current = next;
            }
        }

        Ok(problems)
    }
}

// ============================================================================
// ITransmissionStorage implementation
// ============================================================================

#[async_trait::async_trait]
impl ITransmissionStorage for SqliteMetaDataStorage {
    async fn save_transmission(&self, record: &TransmissionRecord) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT OR REPLACE INTO transmissions \
             (remote_id, local_path, position, length, local_modified, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(record.remote_id.as_str())
        .bind(record.local_path.to_string_lossy().into_owned())
        .bind(record.position as i64)
        .bind(record.length as i64)
        .bind(record.local_modified.map(|dt| dt.to_rfc3339()))
        .bind(record.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        tracing::trace!(
            remote_id = %record.remote_id,
            position = record.position,
            length = record.length,
            "Saved transmission record"
        );
        Ok(())
    }

    async fn get_transmission(
        &self,
        remote_id: &RemoteId,
    ) -> anyhow::Result<Option<TransmissionRecord>> {
        let row = sqlx::query("SELECT * FROM transmissions WHERE remote_id = ?")
            .bind(remote_id.as_str())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(ref r) => Ok(Some(transmission_from_row(r)?)),
            None => Ok(None),
        }
    }

    async fn remove_transmission(&self, remote_id: &RemoteId) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM transmissions WHERE remote_id = ?")
            .bind(remote_id.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
