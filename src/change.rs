//! # Change Graph Storage
//!
//! Changes are immutable observations of one entity. Edges connect a change to
//! the changes it supersedes, always within one entity:
//!
//! ```text
//!   entity "a"   c1 ──► c2 ──► c4        (c3 and c4 are sibling leaves
//!                        └───► c3         until a later change resolves them)
//! ```
//!
//! Locally created objects go through a [`WriteContext`], which also journals
//! them into the sync log. Objects arriving from a peer are inserted with the
//! raw `insert_*` functions and keep their original journal entry.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::sequence::Sequencer;
use crate::snapshot::SnapshotStore;
use crate::sync::SyncRecord;
use crate::types::{
    Change, ChangeEdge, ChangeId, ChangeSet, ChangeSetElement, ChangeSetId, EntityKey, SnapshotId,
};

// =============================================================================
// Write Context
// =============================================================================

/// Everything needed to create and journal graph objects.
pub struct WriteContext<'a> {
    pub conn: &'a Connection,
    pub seq: &'a Sequencer,
    /// Random id of the engine instance; the sync log is keyed by it.
    pub session_id: &'a str,
}

impl<'a> WriteContext<'a> {
    pub fn new(conn: &'a Connection, seq: &'a Sequencer, session_id: &'a str) -> Self {
        Self {
            conn,
            seq,
            session_id,
        }
    }

    /// Appends a record to the sync log under this session.
    pub fn journal(&self, record: &SyncRecord) -> Result<()> {
        let next: i64 = self.conn.query_row(
            "SELECT COALESCE(MAX(session_seq), 0) + 1 FROM lix_sync_log WHERE session_id = ?",
            [self.session_id],
            |row| row.get(0),
        )?;
        self.conn.execute(
            "INSERT INTO lix_sync_log (session_id, session_seq, payload) VALUES (?, ?, ?)",
            params![self.session_id, next, serde_json::to_string(record)?],
        )?;
        Ok(())
    }

    /// Creates a change for `key` with `content` (`None` deletes the entity)
    /// and wires edges from every change in `parents`.
    ///
    /// Passing all current leaves as parents is what resolves a conflict.
    pub fn record_change(
        &self,
        snapshots: &mut SnapshotStore,
        key: &EntityKey,
        schema_version: &str,
        plugin_key: &str,
        content: Option<&Value>,
        parents: &[ChangeId],
    ) -> Result<Change> {
        let snapshot_id = snapshots.put(self.conn, content)?;
        if !snapshot_id.is_no_content() {
            self.journal(&SyncRecord::Snapshot {
                id: snapshot_id.clone(),
                content: content.cloned(),
            })?;
        }

        let change = Change {
            id: ChangeId::new(self.seq.uuid()),
            entity_id: key.entity_id.clone(),
            schema_key: key.schema_key.clone(),
            schema_version: schema_version.to_string(),
            file_id: key.file_id.clone(),
            plugin_key: plugin_key.to_string(),
            snapshot_id,
            created_at: self.seq.timestamp(),
        };
        insert_change(self.conn, &change)?;
        self.journal(&SyncRecord::Change(change.clone()))?;

        for parent in parents {
            let edge = ChangeEdge {
                parent_id: parent.clone(),
                child_id: change.id.clone(),
            };
            insert_change_edge(self.conn, &edge)?;
            self.journal(&SyncRecord::ChangeEdge(edge))?;
        }

        Ok(change)
    }

    /// Groups `changes` into a new change set.
    pub fn create_change_set(&self, changes: &[Change]) -> Result<ChangeSet> {
        let id = ChangeSetId::new(self.seq.uuid());
        let change_set = ChangeSet {
            elements: changes
                .iter()
                .map(|c| ChangeSetElement {
                    change_set_id: id.clone(),
                    change_id: c.id.clone(),
                    entity_id: c.entity_id.clone(),
                    schema_key: c.schema_key.clone(),
                    file_id: c.file_id.clone(),
                })
                .collect(),
            id,
            created_at: self.seq.timestamp(),
        };
        insert_change_set(self.conn, &change_set)?;
        self.journal(&SyncRecord::ChangeSet(change_set.clone()))?;
        Ok(change_set)
    }
}

// =============================================================================
// Raw Inserts
// =============================================================================

/// Inserts a change. Re-inserting an identical change is a no-op.
///
/// # Errors
///
/// `GraphInconsistency` if a different change already holds the id.
pub(crate) fn insert_change(conn: &Connection, change: &Change) -> Result<()> {
    if let Some(existing) = load_change(conn, &change.id)? {
        if &existing != change {
            return Err(Error::GraphInconsistency(format!(
                "change '{}' already exists with different content",
                change.id
            )));
        }
        return Ok(());
    }
    conn.execute(
        "INSERT INTO lix_change
            (id, entity_id, schema_key, schema_version, file_id, plugin_key, snapshot_id, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            change.id.as_str(),
            change.entity_id,
            change.schema_key,
            change.schema_version,
            change.file_id,
            change.plugin_key,
            change.snapshot_id.as_str(),
            change.created_at,
        ],
    )?;
    Ok(())
}

/// Inserts an edge after checking both ends exist and share one entity.
///
/// # Errors
///
/// `GraphInconsistency` for a missing endpoint, a self-edge, or an edge across
/// entities.
pub(crate) fn insert_change_edge(conn: &Connection, edge: &ChangeEdge) -> Result<()> {
    if edge.parent_id == edge.child_id {
        return Err(Error::GraphInconsistency(format!(
            "change '{}' cannot be its own parent",
            edge.parent_id
        )));
    }
    let parent = load_change(conn, &edge.parent_id)?.ok_or_else(|| {
        Error::GraphInconsistency(format!("edge parent '{}' does not exist", edge.parent_id))
    })?;
    let child = load_change(conn, &edge.child_id)?.ok_or_else(|| {
        Error::GraphInconsistency(format!("edge child '{}' does not exist", edge.child_id))
    })?;
    if parent.key() != child.key() {
        return Err(Error::GraphInconsistency(format!(
            "edge '{}' -> '{}' links different entities ({} and {})",
            parent.id,
            child.id,
            parent.key(),
            child.key()
        )));
    }

    conn.execute(
        "INSERT OR IGNORE INTO lix_change_edge (parent_id, child_id) VALUES (?, ?)",
        params![edge.parent_id.as_str(), edge.child_id.as_str()],
    )?;
    Ok(())
}

/// Inserts a change set with its elements.
///
/// # Errors
///
/// `GraphInconsistency` if a change set with the same id but other members
/// already exists.
pub(crate) fn insert_change_set(conn: &Connection, change_set: &ChangeSet) -> Result<()> {
    if let Some(existing) = load_change_set(conn, &change_set.id)? {
        let mut incoming = change_set.elements.clone();
        incoming.sort_by(|a, b| a.change_id.cmp(&b.change_id));
        if existing.created_at != change_set.created_at || existing.elements != incoming {
            return Err(Error::GraphInconsistency(format!(
                "change set '{}' already exists with different members",
                change_set.id
            )));
        }
        return Ok(());
    }
    conn.execute(
        "INSERT INTO lix_change_set (id, created_at) VALUES (?, ?)",
        params![change_set.id.as_str(), change_set.created_at],
    )?;
    let mut stmt = conn.prepare_cached(
        "INSERT OR IGNORE INTO lix_change_set_element
            (change_set_id, change_id, entity_id, schema_key, file_id)
         VALUES (?, ?, ?, ?, ?)",
    )?;
    for element in &change_set.elements {
        stmt.execute(params![
            element.change_set_id.as_str(),
            element.change_id.as_str(),
            element.entity_id,
            element.schema_key,
            element.file_id,
        ])?;
    }
    Ok(())
}

// =============================================================================
// Reads
// =============================================================================

const CHANGE_COLUMNS: &str =
    "id, entity_id, schema_key, schema_version, file_id, plugin_key, snapshot_id, created_at";

pub(crate) fn change_from_row(row: &Row<'_>) -> rusqlite::Result<Change> {
    Ok(Change {
        id: ChangeId::new(row.get::<_, String>(0)?),
        entity_id: row.get(1)?,
        schema_key: row.get(2)?,
        schema_version: row.get(3)?,
        file_id: row.get(4)?,
        plugin_key: row.get(5)?,
        snapshot_id: SnapshotId::new(row.get::<_, String>(6)?),
        created_at: row.get(7)?,
    })
}

/// Loads one change.
pub fn load_change(conn: &Connection, id: &ChangeId) -> Result<Option<Change>> {
    Ok(conn
        .query_row(
            &format!("SELECT {CHANGE_COLUMNS} FROM lix_change WHERE id = ?"),
            [id.as_str()],
            change_from_row,
        )
        .optional()?)
}

/// Lists every change ordered by `(created_at, id)`.
pub fn list_changes(conn: &Connection) -> Result<Vec<Change>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {CHANGE_COLUMNS} FROM lix_change ORDER BY created_at, id"
    ))?;
    let rows = stmt
        .query_map([], change_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Lists every change edge.
pub fn list_change_edges(conn: &Connection) -> Result<Vec<ChangeEdge>> {
    let mut stmt =
        conn.prepare("SELECT parent_id, child_id FROM lix_change_edge ORDER BY parent_id, child_id")?;
    let rows = stmt
        .query_map([], |row| {
            Ok(ChangeEdge {
                parent_id: ChangeId::new(row.get::<_, String>(0)?),
                child_id: ChangeId::new(row.get::<_, String>(1)?),
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Loads one change set with its elements.
pub fn load_change_set(conn: &Connection, id: &ChangeSetId) -> Result<Option<ChangeSet>> {
    let created_at: Option<String> = conn
        .query_row(
            "SELECT created_at FROM lix_change_set WHERE id = ?",
            [id.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    let Some(created_at) = created_at else {
        return Ok(None);
    };

    let mut stmt = conn.prepare_cached(
        "SELECT change_id, entity_id, schema_key, file_id
         FROM lix_change_set_element WHERE change_set_id = ? ORDER BY change_id",
    )?;
    let elements = stmt
        .query_map([id.as_str()], |row| {
            Ok(ChangeSetElement {
                change_set_id: id.clone(),
                change_id: ChangeId::new(row.get::<_, String>(0)?),
                entity_id: row.get(1)?,
                schema_key: row.get(2)?,
                file_id: row.get(3)?,
            })
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(Some(ChangeSet {
        id: id.clone(),
        created_at,
        elements,
    }))
}

/// Lists every change set.
pub fn list_change_sets(conn: &Connection) -> Result<Vec<ChangeSet>> {
    let mut stmt = conn.prepare("SELECT id FROM lix_change_set ORDER BY created_at, id")?;
    let ids = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let mut sets = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(set) = load_change_set(conn, &ChangeSetId::new(id))? {
            sets.push(set);
        }
    }
    Ok(sets)
}

// =============================================================================
// Tests
// =============================================================================
