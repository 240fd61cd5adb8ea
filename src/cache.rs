//! # State Cache
//!
//! Materialized "current state per version", one physical table per schema:
//!
//! ```text
//!   lix_cache_table                      lix_state_cache_<key>_<xxh3>
//!   ┌────────────┬──────────────┐        ┌───────────────────────────────────┐
//!   │ schema_key │ table_name   │───────►│ entity_id, file_id, version_id PK │
//!   └────────────┴──────────────┘        │ snapshot_content, change_id, ...  │
//!                                        │ inherited_from_version_id         │
//!   lix_cache_stale                      │ is_tombstone                      │
//!   ┌────────────┬──────────────┐        └───────────────────────────────────┘
//!   │ schema_key │ version_id   │  ('*' = every version)
//!   └────────────┴──────────────┘
//! ```
//!
//! Rows are derived data. Writers never touch them directly: commits flag the
//! touched schemas stale, and the next read repopulates the schema from leaf
//! resolution in one batch. A schema without a registered table counts as
//! stale.
//!
//! ## Row Kinds
//!
//! - **own**: the version's own leaf (`inherited_from_version_id IS NULL`),
//!   including own tombstones (`is_tombstone = 1`)
//! - **inherited**: a live row of an ancestor version that the version does
//!   not shadow (`inherited_from_version_id = ancestor`)

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::time::Instant;

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde_json::Value;
use xxhash_rust::xxh3::xxh3_64;

use crate::error::Result;
use crate::graph::GraphIndex;
use crate::snapshot::SnapshotStore;
use crate::types::{ChangeId, CommitId, EntityKey, VersionId};
use crate::version::{inheritance_chain, version_map};

const ALL_VERSIONS: &str = "*";

/// What a [`StateCache::mark_stale`] call covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StaleScope {
    All,
    Schema(String),
    Version(VersionId),
    SchemaVersion(String, VersionId),
}

/// One physical cache row.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheRow {
    pub entity_id: String,
    pub schema_key: String,
    pub schema_version: String,
    pub file_id: String,
    pub version_id: VersionId,
    pub plugin_key: String,
    pub snapshot_content: Option<Value>,
    pub change_id: ChangeId,
    pub commit_id: CommitId,
    pub inherited_from_version_id: Option<VersionId>,
    pub is_tombstone: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl CacheRow {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(&self.entity_id, &self.schema_key, &self.file_id)
    }
}

/// Physical table name for a schema key.
///
/// The readable prefix is sanitized; the xxh3 suffix keeps distinct keys that
/// sanitize identically apart.
pub fn table_name(schema_key: &str) -> String {
    let readable: String = schema_key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .take(32)
        .collect();
    format!(
        "lix_state_cache_{readable}_{:08x}",
        xxh3_64(schema_key.as_bytes()) as u32
    )
}

/// Stateless handle over the cache tables.
pub struct StateCache;

impl StateCache {
    /// Returns the registered table for `schema_key`, if any.
    pub fn registered_table(conn: &Connection, schema_key: &str) -> Result<Option<String>> {
        Ok(conn
            .query_row(
                "SELECT table_name FROM lix_cache_table WHERE schema_key = ?",
                [schema_key],
                |row| row.get(0),
            )
            .optional()?)
    }

    fn ensure_table(conn: &Connection, schema_key: &str) -> Result<String> {
        if let Some(table) = Self::registered_table(conn, schema_key)? {
            return Ok(table);
        }
        let table = table_name(schema_key);
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                entity_id                 TEXT NOT NULL,
                file_id                   TEXT NOT NULL,
                version_id                TEXT NOT NULL,
                schema_key                TEXT NOT NULL,
                schema_version            TEXT NOT NULL,
                plugin_key                TEXT NOT NULL,
                snapshot_content          TEXT,
                change_id                 TEXT NOT NULL,
                commit_id                 TEXT NOT NULL,
                inherited_from_version_id TEXT,
                is_tombstone              INTEGER NOT NULL DEFAULT 0,
                created_at                TEXT NOT NULL,
                updated_at                TEXT NOT NULL,
                PRIMARY KEY (entity_id, file_id, version_id)
            );
            CREATE INDEX IF NOT EXISTS {table}_version ON {table}(version_id);"
        ))?;
        conn.execute(
            "INSERT INTO lix_cache_table (schema_key, table_name) VALUES (?, ?)",
            params![schema_key, table],
        )?;
        Ok(table)
    }

    /// Every schema key that has changes or a cache table.
    pub fn known_schema_keys(conn: &Connection) -> Result<BTreeSet<String>> {
        let mut stmt = conn.prepare(
            "SELECT schema_key FROM lix_cache_table
             UNION SELECT DISTINCT schema_key FROM lix_change",
        )?;
        let keys = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<BTreeSet<_>, _>>()?;
        Ok(keys)
    }

    /// Flags cache rows stale. Rows themselves are kept until repopulated.
    pub fn mark_stale(conn: &Connection, scope: &StaleScope) -> Result<()> {
        let flags: Vec<(String, String)> = match scope {
            StaleScope::All => Self::known_schema_keys(conn)?
                .into_iter()
                .map(|k| (k, ALL_VERSIONS.to_string()))
                .collect(),
            StaleScope::Schema(key) => vec![(key.clone(), ALL_VERSIONS.to_string())],
            StaleScope::Version(version) => Self::known_schema_keys(conn)?
                .into_iter()
                .map(|k| (k, version.to_string()))
                .collect(),
            StaleScope::SchemaVersion(key, version) => vec![(key.clone(), version.to_string())],
        };
        let mut stmt = conn.prepare_cached(
            "INSERT OR IGNORE INTO lix_cache_stale (schema_key, version_id) VALUES (?, ?)",
        )?;
        for (key, version) in &flags {
            stmt.execute(params![key, version])?;
        }
        tracing::debug!(?scope, flags = flags.len(), "cache marked stale");
        Ok(())
    }

    /// True when reads of `(schema_key, version)` must repopulate first.
    pub fn is_stale(conn: &Connection, schema_key: &str, version: &VersionId) -> Result<bool> {
        if Self::registered_table(conn, schema_key)?.is_none() {
            return Ok(true);
        }
        Ok(conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM lix_cache_stale
                           WHERE schema_key = ? AND version_id IN (?, '*'))",
            params![schema_key, version.as_str()],
            |row| row.get(0),
        )?)
    }

    /// Rebuilds every version's rows for `schema_key` and clears its flags.
    ///
    /// Runs inside one savepoint; idempotent. Returns the number of rows
    /// written.
    pub fn populate(
        conn: &Connection,
        graph: &GraphIndex,
        snapshots: &mut SnapshotStore,
        schema_key: &str,
        max_depth: usize,
    ) -> Result<usize> {
        let started = Instant::now();
        conn.execute_batch("SAVEPOINT lix_cache_populate")?;
        match Self::populate_inner(conn, graph, snapshots, schema_key, max_depth) {
            Ok(written) => {
                conn.execute_batch("RELEASE lix_cache_populate")?;
                tracing::debug!(
                    schema_key,
                    rows = written,
                    elapsed_us = started.elapsed().as_micros() as u64,
                    "cache populated"
                );
                Ok(written)
            }
            Err(e) => {
                let _ = conn.execute_batch(
                    "ROLLBACK TO lix_cache_populate; RELEASE lix_cache_populate",
                );
                Err(e)
            }
        }
    }

    fn populate_inner(
        conn: &Connection,
        graph: &GraphIndex,
        snapshots: &mut SnapshotStore,
        schema_key: &str,
        max_depth: usize,
    ) -> Result<usize> {
        let table = Self::ensure_table(conn, schema_key)?;
        let versions = version_map(conn)?;

        // Own rows per version.
        let mut own: BTreeMap<VersionId, Vec<CacheRow>> = BTreeMap::new();
        for version in versions.values() {
            let leaves = graph.resolve_leaves(std::slice::from_ref(&version.commit_id))?;
            let mut rows = Vec::new();
            for (key, res) in leaves.into_iter().filter(|(k, _)| k.schema_key == schema_key) {
                let content = snapshots.get(conn, &res.change.snapshot_id)?;
                rows.push(CacheRow {
                    entity_id: key.entity_id,
                    schema_key: key.schema_key,
                    schema_version: res.change.schema_version.clone(),
                    file_id: key.file_id,
                    version_id: version.id.clone(),
                    plugin_key: res.change.plugin_key.clone(),
                    is_tombstone: content.is_none(),
                    snapshot_content: content,
                    change_id: res.change.id.clone(),
                    commit_id: res.commit_id.clone(),
                    inherited_from_version_id: None,
                    created_at: res.first_created_at.clone(),
                    updated_at: res.change.created_at.clone(),
                });
            }
            own.insert(version.id.clone(), rows);
        }

        conn.execute(&format!("DELETE FROM {table}"), [])?;
        let mut insert = conn.prepare(&format!(
            "INSERT INTO {table} (entity_id, file_id, version_id, schema_key, schema_version,
                plugin_key, snapshot_content, change_id, commit_id, inherited_from_version_id,
                is_tombstone, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)"
        ))?;
        let mut written = 0;

        for version_id in own.keys() {
            let chain = inheritance_chain(&versions, version_id, max_depth)?;
            let mut seen: HashSet<(String, String)> = HashSet::new();
            for (depth, level) in chain.iter().enumerate() {
                let Some(rows) = own.get(level) else { continue };
                for row in rows {
                    if !seen.insert((row.entity_id.clone(), row.file_id.clone())) {
                        continue;
                    }
                    // Ancestor tombstones shadow deeper levels but are not copied.
                    if depth > 0 && row.is_tombstone {
                        continue;
                    }
                    let content = row
                        .snapshot_content
                        .as_ref()
                        .map(serde_json::to_string)
                        .transpose()?;
                    insert.execute(params![
                        row.entity_id,
                        row.file_id,
                        version_id.as_str(),
                        row.schema_key,
                        row.schema_version,
                        row.plugin_key,
                        content,
                        row.change_id.as_str(),
                        row.commit_id.as_str(),
                        (depth > 0).then(|| level.as_str()),
                        row.is_tombstone,
                        row.created_at,
                        row.updated_at,
                    ])?;
                    written += 1;
                }
            }
        }

        conn.execute(
            "DELETE FROM lix_cache_stale WHERE schema_key = ?",
            [schema_key],
        )?;
        Ok(written)
    }

    /// Reads the rows of one version: own, own tombstones and inherited.
    pub fn rows_for_version(
        conn: &Connection,
        schema_key: &str,
        version: &VersionId,
    ) -> Result<Vec<CacheRow>> {
        Self::select(conn, schema_key, "version_id = ?", version)
    }

    /// Reads only the version's own rows (including tombstones).
    pub fn own_rows(conn: &Connection, schema_key: &str, version: &VersionId) -> Result<Vec<CacheRow>> {
        Self::select(
            conn,
            schema_key,
            "version_id = ? AND inherited_from_version_id IS NULL",
            version,
        )
    }

    fn select(
        conn: &Connection,
        schema_key: &str,
        predicate: &str,
        version: &VersionId,
    ) -> Result<Vec<CacheRow>> {
        let Some(table) = Self::registered_table(conn, schema_key)? else {
            return Ok(Vec::new());
        };
        let mut stmt = conn.prepare(&format!(
            "SELECT entity_id, schema_key, schema_version, file_id, version_id, plugin_key,
                    snapshot_content, change_id, commit_id, inherited_from_version_id,
                    is_tombstone, created_at, updated_at
             FROM {table} WHERE {predicate} ORDER BY file_id, entity_id"
        ))?;
        let raw = stmt
            .query_map([version.as_str()], raw_row)?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        raw.into_iter().map(RawRow::decode).collect()
    }
}

struct RawRow {
    row: CacheRow,
    content: Option<String>,
}

impl RawRow {
    fn decode(self) -> Result<CacheRow> {
        let mut row = self.row;
        row.snapshot_content = match self.content {
            Some(text) => Some(serde_json::from_str::<Value>(&text)?),
            None => None,
        };
        Ok(row)
    }
}

fn raw_row(row: &Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        content: row.get(6)?,
        row: CacheRow {
            entity_id: row.get(0)?,
            schema_key: row.get(1)?,
            schema_version: row.get(2)?,
            file_id: row.get(3)?,
            version_id: VersionId::new(row.get::<_, String>(4)?),
            plugin_key: row.get(5)?,
            snapshot_content: None,
            change_id: ChangeId::new(row.get::<_, String>(7)?),
            commit_id: CommitId::new(row.get::<_, String>(8)?),
            inherited_from_version_id: row.get::<_, Option<String>>(9)?.map(VersionId::new),
            is_tombstone: row.get(10)?,
            created_at: row.get(11)?,
            updated_at: row.get(12)?,
        },
    })
}

// =============================================================================
// Tests
// =============================================================================
