//! Untracked state: entity rows stored outside the change graph.
//!
//! Untracked rows are never part of a change set, never synced and never
//! diffed. Reads see them between the transaction overlay and the cache.

use rusqlite::{params, Connection};
use serde_json::Value;

use crate::error::Result;
use crate::types::{EntityKey, VersionId};

#[derive(Debug, Clone, PartialEq)]
pub struct UntrackedRow {
    pub key: EntityKey,
    pub version_id: VersionId,
    pub schema_version: String,
    pub plugin_key: String,
    pub snapshot_content: Value,
    pub created_at: String,
    pub updated_at: String,
}

/// Rows of one version and schema.
pub fn rows(conn: &Connection, schema_key: &str, version: &VersionId) -> Result<Vec<UntrackedRow>> {
    let mut stmt = conn.prepare_cached(
        "SELECT entity_id, file_id, schema_version, plugin_key, snapshot_content, created_at, updated_at
         FROM lix_untracked_state
         WHERE schema_key = ? AND version_id = ? AND snapshot_content IS NOT NULL
         ORDER BY file_id, entity_id",
    )?;
    let raw = stmt
        .query_map(params![schema_key, version.as_str()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    raw.into_iter()
        .map(
            |(entity_id, file_id, schema_version, plugin_key, content, created_at, updated_at)| {
                Ok(UntrackedRow {
                    key: EntityKey::new(entity_id, schema_key, file_id),
                    version_id: version.clone(),
                    schema_version,
                    plugin_key,
                    snapshot_content: serde_json::from_str(&content)?,
                    created_at,
                    updated_at,
                })
            },
        )
        .collect()
}

/// True if any of `versions` has untracked rows for `schema_key`.
pub fn has_rows(conn: &Connection, schema_key: &str, versions: &[VersionId]) -> Result<bool> {
    let mut stmt = conn.prepare_cached(
        "SELECT EXISTS(SELECT 1 FROM lix_untracked_state WHERE schema_key = ? AND version_id = ?)",
    )?;
    for version in versions {
        let found: bool = stmt.query_row(params![schema_key, version.as_str()], |row| row.get(0))?;
        if found {
            return Ok(true);
        }
    }
    Ok(false)
}

/// Schema keys with untracked rows.
pub fn schema_keys(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT DISTINCT schema_key FROM lix_untracked_state")?;
    let keys = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(keys)
}

/// Inserts or replaces a row, keeping the original `created_at`.
pub fn upsert(
    conn: &Connection,
    version: &VersionId,
    key: &EntityKey,
    schema_version: &str,
    plugin_key: &str,
    content: &Value,
    now: &str,
) -> Result<()> {
    conn.execute(
        "INSERT INTO lix_untracked_state
            (entity_id, schema_key, file_id, version_id, schema_version, plugin_key,
             snapshot_content, created_at, updated_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT(entity_id, schema_key, file_id, version_id) DO UPDATE SET
            schema_version = excluded.schema_version,
            plugin_key = excluded.plugin_key,
            snapshot_content = excluded.snapshot_content,
            updated_at = excluded.updated_at",
        params![
            key.entity_id,
            key.schema_key,
            key.file_id,
            version.as_str(),
            schema_version,
            plugin_key,
            serde_json::to_string(content)?,
            now,
            now,
        ],
    )?;
    Ok(())
}

/// Deletes a row. Returns true if one existed.
pub fn delete(conn: &Connection, version: &VersionId, key: &EntityKey) -> Result<bool> {
    let n = conn.execute(
        "DELETE FROM lix_untracked_state
         WHERE entity_id = ? AND schema_key = ? AND file_id = ? AND version_id = ?",
        params![key.entity_id, key.schema_key, key.file_id, version.as_str()],
    )?;
    Ok(n > 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Database;
    use serde_json::json;

    #[test]
    fn test_upsert_read_delete() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.connection();
        let main = VersionId::new("main");
        let key = EntityKey::new("theme", "lix_key_value", "lix");

        upsert(conn, &main, &key, "1.0", "p", &json!({"key": "theme", "value": "dark"}), "t1").unwrap();
        upsert(conn, &main, &key, "1.0", "p", &json!({"key": "theme", "value": "light"}), "t2").unwrap();

        let found = rows(conn, "lix_key_value", &main).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].snapshot_content["value"], "light");
        assert_eq!(found[0].created_at, "t1");
        assert_eq!(found[0].updated_at, "t2");
        assert!(has_rows(conn, "lix_key_value", &[VersionId::global(), main.clone()]).unwrap());
        assert_eq!(schema_keys(conn).unwrap(), vec!["lix_key_value".to_string()]);

        assert!(delete(conn, &main, &key).unwrap());
        assert!(!has_rows(conn, "lix_key_value", &[main]).unwrap());
    }
}
