//! # Snapshot Store
//!
//! Content-addressed storage for entity payloads. A snapshot id is the hex
//! SHA-256 of the content's canonical JSON (object keys sorted, no
//! whitespace), so identical content written twice is stored once. Deletions
//! point at the fixed `no-content` tombstone.
//!
//! ```text
//!   put({"b":1,"a":2}) ──► canonical '{"a":2,"b":1}' ──► sha256 ──► id
//!   put(None)          ──► "no-content"
//! ```
//!
//! Reads go through a bounded LRU cache. Snapshots are immutable, so the cache
//! never needs invalidation except after garbage collection.

use std::num::NonZeroUsize;

use lru::LruCache;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::types::SnapshotId;

/// Default number of decoded snapshots kept in memory.
pub const DEFAULT_SNAPSHOT_CACHE_CAPACITY: usize = 1024;

/// Returns the canonical JSON encoding of `content`.
///
/// `serde_json::Map` is ordered by key, so serializing is already canonical.
pub fn canonical_json(content: &Value) -> Result<String> {
    Ok(serde_json::to_string(content)?)
}

/// Computes the content address of `content` (`None` = tombstone).
pub fn snapshot_id(content: Option<&Value>) -> Result<SnapshotId> {
    match content {
        None | Some(Value::Null) => Ok(SnapshotId::no_content()),
        Some(value) => {
            let digest = Sha256::digest(canonical_json(value)?.as_bytes());
            Ok(SnapshotId::new(hex::encode(digest)))
        }
    }
}

/// Stores and loads snapshots from `lix_snapshot`.
pub struct SnapshotStore {
    cache: LruCache<SnapshotId, Value>,
}

impl SnapshotStore {
    /// Creates a store with an LRU of `capacity` entries (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            cache: LruCache::new(capacity),
        }
    }

    /// Stores content and returns its id. Storing existing content is a no-op.
    pub fn put(&mut self, conn: &Connection, content: Option<&Value>) -> Result<SnapshotId> {
        let id = snapshot_id(content)?;
        let encoded = match content {
            None | Some(Value::Null) => None,
            Some(value) => Some(canonical_json(value)?),
        };
        conn.execute(
            "INSERT OR IGNORE INTO lix_snapshot (id, content) VALUES (?, ?)",
            params![id.as_str(), encoded],
        )?;
        Ok(id)
    }

    /// Loads snapshot content. The tombstone loads as `None`.
    ///
    /// # Errors
    ///
    /// `GraphInconsistency` if a change references a snapshot that does not
    /// exist.
    pub fn get(&mut self, conn: &Connection, id: &SnapshotId) -> Result<Option<Value>> {
        if id.is_no_content() {
            return Ok(None);
        }
        if let Some(value) = self.cache.get(id) {
            return Ok(Some(value.clone()));
        }

        let row: Option<Option<String>> = conn
            .query_row(
                "SELECT content FROM lix_snapshot WHERE id = ?",
                [id.as_str()],
                |row| row.get(0),
            )
            .optional()?;

        match row {
            None => Err(Error::GraphInconsistency(format!(
                "snapshot '{id}' is referenced but missing"
            ))),
            Some(None) => Ok(None),
            Some(Some(text)) => {
                let value: Value = serde_json::from_str(&text)?;
                self.cache.put(id.clone(), value.clone());
                Ok(Some(value))
            }
        }
    }

    /// Deletes every snapshot no change references. Returns the number removed.
    pub fn collect_garbage(&mut self, conn: &Connection) -> Result<usize> {
        let removed = conn.execute(
            "DELETE FROM lix_snapshot
             WHERE id != 'no-content'
               AND id NOT IN (SELECT snapshot_id FROM lix_change)",
            [],
        )?;
        self.cache.clear();
        tracing::info!(removed, "snapshot garbage collected");
        Ok(removed)
    }

    /// Number of decoded snapshots currently cached.
    pub fn cached(&self) -> usize {
        self.cache.len()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Database;
    use serde_json::json;

    #[test]
    fn test_snapshot_id_is_key_order_independent() {
        let a: Value = serde_json::from_str(r#"{"b":1,"a":{"y":2,"x":3}}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a":{"x":3,"y":2},"b":1}"#).unwrap();
        assert_eq!(snapshot_id(Some(&a)).unwrap(), snapshot_id(Some(&b)).unwrap());
        assert_eq!(snapshot_id(Some(&a)).unwrap().as_str().len(), 64);
        assert_eq!(canonical_json(&a).unwrap(), r#"{"a":{"x":3,"y":2},"b":1}"#);
    }

    #[test]
    fn test_tombstone_id() {
        assert!(snapshot_id(None).unwrap().is_no_content());
        assert!(snapshot_id(Some(&Value::Null)).unwrap().is_no_content());
    }

    #[test]
    fn test_put_get_dedup() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.connection();
        let mut store = SnapshotStore::new(4);

        let content = json!({ "key": "a", "value": 1 });
        let id = store.put(conn, Some(&content)).unwrap();
        let again = store.put(conn, Some(&content)).unwrap();
        assert_eq!(id, again);

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM lix_snapshot", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);

        assert_eq!(store.get(conn, &id).unwrap(), Some(content));
        assert_eq!(store.cached(), 1);
        assert_eq!(store.get(conn, &SnapshotId::no_content()).unwrap(), None);
    }

    #[test]
    fn test_missing_snapshot_is_graph_inconsistency() {
        let db = Database::open_in_memory().unwrap();
        let mut store = SnapshotStore::new(4);
        let err = store
            .get(db.connection(), &SnapshotId::new("deadbeef"))
            .unwrap_err();
        assert!(matches!(err, Error::GraphInconsistency(_)));
    }

    #[test]
    fn test_collect_garbage_keeps_referenced() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.connection();
        let mut store = SnapshotStore::new(4);

        let kept = store.put(conn, Some(&json!({ "v": 1 }))).unwrap();
        store.put(conn, Some(&json!({ "v": 2 }))).unwrap();
        conn.execute(
            "INSERT INTO lix_change VALUES ('c1', 'e', 's', '1.0', 'f', 'p', ?, 't')",
            [kept.as_str()],
        )
        .unwrap();

        assert_eq!(store.collect_garbage(conn).unwrap(), 1);
        assert!(store.get(conn, &kept).unwrap().is_some());
    }
}
