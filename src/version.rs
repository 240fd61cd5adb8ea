//! # Version Manager
//!
//! Versions are named, mutable pointers into the commit graph. Exactly one is
//! active. Every version except `global` inherits from another version:
//! entities the version has no own row for show through from the chain
//! `[V, parent, ..., global]`.
//!
//! ## Moving a Version
//!
//! ```text
//!   FastForward:  head ──► ... ──► target      ok (head is an ancestor)
//!                 head ──► x   ╳   target      FastForwardRequired
//!   Force:        head := target               explicit merge path
//! ```
//!
//! The active version is switched with a compare-and-swap on the singleton
//! `lix_active_version` row, so a caller acting on a stale read fails with
//! `ActiveVersionChanged` instead of silently switching from the wrong place.

use std::collections::{HashMap, HashSet};

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::change::WriteContext;
use crate::error::{Error, Result};
use crate::graph::GraphIndex;
use crate::sync::SyncRecord;
use crate::types::{CommitId, Version, VersionId};

/// Default bound on inheritance chain length.
pub const DEFAULT_MAX_INHERITANCE_DEPTH: usize = 64;

/// How [`advance_version`] treats a target that is not a descendant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AdvanceMode {
    /// Refuse unless the current head is an ancestor of the target.
    #[default]
    FastForward,
    /// Move unconditionally.
    Force,
}

// =============================================================================
// Reads
// =============================================================================

fn version_from_row(row: &Row<'_>, active: Option<&str>) -> rusqlite::Result<Version> {
    let id: String = row.get(0)?;
    Ok(Version {
        is_active: active == Some(id.as_str()),
        id: VersionId::new(id),
        name: row.get(1)?,
        commit_id: CommitId::new(row.get::<_, String>(2)?),
        inherits_from_version_id: row.get::<_, Option<String>>(3)?.map(VersionId::new),
    })
}

fn active_raw(conn: &Connection) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT version_id FROM lix_active_version WHERE id = 1",
            [],
            |row| row.get(0),
        )
        .optional()?)
}

/// Returns the active version id.
pub fn active_version_id(conn: &Connection) -> Result<VersionId> {
    active_raw(conn)?
        .map(VersionId::new)
        .ok_or_else(|| Error::Schema("store has no active version".to_string()))
}

/// Loads one version.
pub fn load_version(conn: &Connection, id: &VersionId) -> Result<Version> {
    let active = active_raw(conn)?;
    conn.query_row(
        "SELECT id, name, commit_id, inherits_from_version_id FROM lix_version WHERE id = ?",
        [id.as_str()],
        |row| version_from_row(row, active.as_deref()),
    )
    .optional()?
    .ok_or_else(|| Error::not_found("version", id.as_str()))
}

/// Finds a version by name.
pub fn find_version_by_name(conn: &Connection, name: &str) -> Result<Option<Version>> {
    let active = active_raw(conn)?;
    Ok(conn
        .query_row(
            "SELECT id, name, commit_id, inherits_from_version_id FROM lix_version WHERE name = ?",
            [name],
            |row| version_from_row(row, active.as_deref()),
        )
        .optional()?)
}

/// Lists every version ordered by name.
pub fn list_versions(conn: &Connection) -> Result<Vec<Version>> {
    let active = active_raw(conn)?;
    let mut stmt = conn.prepare(
        "SELECT id, name, commit_id, inherits_from_version_id FROM lix_version ORDER BY name",
    )?;
    let rows = stmt
        .query_map([], |row| version_from_row(row, active.as_deref()))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Loads every version keyed by id.
pub fn version_map(conn: &Connection) -> Result<HashMap<VersionId, Version>> {
    Ok(list_versions(conn)?
        .into_iter()
        .map(|v| (v.id.clone(), v))
        .collect())
}

/// Returns `[id, parent, ..., root]`.
///
/// # Errors
///
/// `GraphInconsistency` on a cycle, a missing parent, or a chain longer than
/// `max_depth`; `NotFound` if `id` does not exist.
pub fn inheritance_chain(
    versions: &HashMap<VersionId, Version>,
    id: &VersionId,
    max_depth: usize,
) -> Result<Vec<VersionId>> {
    let mut chain = Vec::new();
    let mut seen = HashSet::new();
    let mut current = versions
        .get(id)
        .ok_or_else(|| Error::not_found("version", id.as_str()))?;

    loop {
        if !seen.insert(current.id.clone()) {
            return Err(Error::GraphInconsistency(format!(
                "inheritance of version '{id}' loops through '{}'",
                current.id
            )));
        }
        chain.push(current.id.clone());
        if chain.len() > max_depth {
            return Err(Error::GraphInconsistency(format!(
                "inheritance of version '{id}' exceeds {max_depth} levels"
            )));
        }
        match &current.inherits_from_version_id {
            None => return Ok(chain),
            Some(parent) => {
                current = versions.get(parent).ok_or_else(|| {
                    Error::GraphInconsistency(format!(
                        "version '{}' inherits from missing version '{parent}'",
                        current.id
                    ))
                })?;
            }
        }
    }
}

// =============================================================================
// Writes
// =============================================================================

/// Inserts or replaces a version row without journaling.
pub(crate) fn upsert_version(conn: &Connection, version: &Version) -> Result<()> {
    conn.execute(
        "INSERT INTO lix_version (id, name, commit_id, inherits_from_version_id)
         VALUES (?, ?, ?, ?)
         ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            commit_id = excluded.commit_id,
            inherits_from_version_id = excluded.inherits_from_version_id",
        params![
            version.id.as_str(),
            version.name,
            version.commit_id.as_str(),
            version.inherits_from_version_id.as_ref().map(VersionId::as_str),
        ],
    )?;
    Ok(())
}

impl WriteContext<'_> {
    /// Creates a version.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if the name is taken; `NotFound` if the parent does
    /// not exist; `GraphInconsistency` if the head commit does not exist.
    pub fn create_version(
        &self,
        id: VersionId,
        name: &str,
        commit_id: &CommitId,
        inherits_from: Option<&VersionId>,
    ) -> Result<Version> {
        if find_version_by_name(self.conn, name)?.is_some() {
            return Err(Error::InvalidArgument(format!(
                "a version named '{name}' already exists"
            )));
        }
        if let Some(parent) = inherits_from {
            load_version(self.conn, parent)?;
        }
        if !crate::commit::commit_exists(self.conn, commit_id)? {
            return Err(Error::GraphInconsistency(format!(
                "version head '{commit_id}' does not exist"
            )));
        }

        let version = Version {
            id,
            name: name.to_string(),
            commit_id: commit_id.clone(),
            inherits_from_version_id: inherits_from.cloned(),
            is_active: false,
        };
        upsert_version(self.conn, &version)?;
        self.journal(&SyncRecord::Version(version.clone()))?;
        tracing::info!(version_id = %version.id, name, "version created");
        Ok(version)
    }

    /// Moves a version pointer.
    pub fn advance_version(
        &self,
        graph: &GraphIndex,
        version_id: &VersionId,
        target: &CommitId,
        mode: AdvanceMode,
    ) -> Result<Version> {
        let mut version = load_version(self.conn, version_id)?;
        if &version.commit_id == target {
            return Ok(version);
        }
        if !graph.has_commit(target) {
            return Err(Error::not_found("commit", target.as_str()));
        }
        if mode == AdvanceMode::FastForward && !graph.is_ancestor(&version.commit_id, target)? {
            return Err(Error::FastForwardRequired {
                version_id: version_id.to_string(),
                head: version.commit_id.to_string(),
                target: target.to_string(),
            });
        }

        tracing::debug!(
            version_id = %version_id,
            from = %version.commit_id,
            to = %target,
            ?mode,
            "version advanced"
        );
        version.commit_id = target.clone();
        upsert_version(self.conn, &version)?;
        self.journal(&SyncRecord::Version(version.clone()))?;
        Ok(version)
    }

    /// Points a version at a commit the caller just built on its head.
    pub(crate) fn set_version_head(&self, version_id: &VersionId, commit_id: &CommitId) -> Result<Version> {
        let mut version = load_version(self.conn, version_id)?;
        version.commit_id = commit_id.clone();
        upsert_version(self.conn, &version)?;
        self.journal(&SyncRecord::Version(version.clone()))?;
        Ok(version)
    }
}

/// Compare-and-swap of the active version. Returns the previous active id,
/// `None` on a store that has none yet.
///
/// `expected = None` skips the comparison.
pub fn switch_active(
    conn: &Connection,
    expected: Option<&VersionId>,
    next: &VersionId,
) -> Result<Option<VersionId>> {
    let current = active_raw(conn)?.map(VersionId::new);
    if let Some(expected) = expected {
        if Some(expected) != current.as_ref() {
            return Err(Error::ActiveVersionChanged {
                expected: expected.to_string(),
                actual: current.map(VersionId::into_string).unwrap_or_default(),
            });
        }
    }
    load_version(conn, next)?;
    conn.execute(
        "INSERT INTO lix_active_version (id, version_id) VALUES (1, ?)
         ON CONFLICT(id) DO UPDATE SET version_id = excluded.version_id",
        [next.as_str()],
    )?;
    Ok(current)
}

/// Deletes a version.
///
/// # Errors
///
/// `InvalidArgument` for `global`, the active version, and versions another
/// version inherits from.
pub fn delete_version(conn: &Connection, id: &VersionId) -> Result<()> {
    if id.is_global() {
        return Err(Error::InvalidArgument(
            "the global version cannot be deleted".to_string(),
        ));
    }
    if active_version_id(conn)? == *id {
        return Err(Error::InvalidArgument(format!(
            "version '{id}' is active and cannot be deleted"
        )));
    }
    load_version(conn, id)?;
    let heir: Option<String> = conn
        .query_row(
            "SELECT id FROM lix_version WHERE inherits_from_version_id = ? LIMIT 1",
            [id.as_str()],
            |row| row.get(0),
        )
        .optional()?;
    if let Some(heir) = heir {
        return Err(Error::InvalidArgument(format!(
            "version '{heir}' inherits from '{id}'"
        )));
    }

    conn.execute("DELETE FROM lix_version WHERE id = ?", [id.as_str()])?;
    conn.execute(
        "DELETE FROM lix_untracked_state WHERE version_id = ?",
        [id.as_str()],
    )?;
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Database;
    use crate::sequence::Sequencer;

    fn setup() -> (Database, Sequencer) {
        (Database::open_in_memory().unwrap(), Sequencer::new(true, 0))
    }

    fn root(ctx: &WriteContext<'_>) -> CommitId {
        let set = ctx.create_change_set(&[]).unwrap();
        ctx.create_commit(&set.id, &[]).unwrap().id
    }

    #[test]
    fn test_create_and_chain() {
        let (db, seq) = setup();
        let ctx = WriteContext::new(db.connection(), &seq, "s");
        let head = root(&ctx);

        ctx.create_version(VersionId::global(), "global", &head, None)
            .unwrap();
        ctx.create_version(VersionId::new("main"), "main", &head, Some(&VersionId::global()))
            .unwrap();
        ctx.create_version(VersionId::new("feature"), "feature", &head, Some(&VersionId::new("main")))
            .unwrap();

        let versions = version_map(db.connection()).unwrap();
        let chain = inheritance_chain(&versions, &VersionId::new("feature"), 64).unwrap();
        assert_eq!(
            chain,
            vec![
                VersionId::new("feature"),
                VersionId::new("main"),
                VersionId::global()
            ]
        );
        assert!(matches!(
            inheritance_chain(&versions, &VersionId::new("feature"), 2),
            Err(Error::GraphInconsistency(_))
        ));

        let err = ctx
            .create_version(VersionId::new("x"), "main", &head, None)
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_inheritance_cycle_detected() {
        let (db, seq) = setup();
        let ctx = WriteContext::new(db.connection(), &seq, "s");
        let head = root(&ctx);
        ctx.create_version(VersionId::new("a"), "a", &head, None).unwrap();
        ctx.create_version(VersionId::new("b"), "b", &head, Some(&VersionId::new("a")))
            .unwrap();
        db.connection()
            .execute(
                "UPDATE lix_version SET inherits_from_version_id = 'b' WHERE id = 'a'",
                [],
            )
            .unwrap();

        let versions = version_map(db.connection()).unwrap();
        assert!(matches!(
            inheritance_chain(&versions, &VersionId::new("a"), 64),
            Err(Error::GraphInconsistency(_))
        ));
    }

    #[test]
    fn test_fast_forward_refusal_and_force() {
        let (db, seq) = setup();
        let ctx = WriteContext::new(db.connection(), &seq, "s");
        let c0 = root(&ctx);
        let set = ctx.create_change_set(&[]).unwrap();
        let c1 = ctx.create_commit(&set.id, &[c0.clone()]).unwrap().id;
        let c2 = ctx.create_commit(&set.id, &[c0.clone()]).unwrap().id;
        ctx.create_version(VersionId::new("main"), "main", &c0, None)
            .unwrap();

        let graph = GraphIndex::load(db.connection()).unwrap();
        let main = VersionId::new("main");
        ctx.advance_version(&graph, &main, &c1, AdvanceMode::FastForward)
            .unwrap();

        let err = ctx
            .advance_version(&graph, &main, &c2, AdvanceMode::FastForward)
            .unwrap_err();
        assert!(matches!(err, Error::FastForwardRequired { .. }));
        assert_eq!(load_version(db.connection(), &main).unwrap().commit_id, c1);

        ctx.advance_version(&graph, &main, &c2, AdvanceMode::Force)
            .unwrap();
        assert_eq!(load_version(db.connection(), &main).unwrap().commit_id, c2);
    }

    #[test]
    fn test_switch_active_cas_and_delete_rules() {
        let (db, seq) = setup();
        let conn = db.connection();
        let ctx = WriteContext::new(conn, &seq, "s");
        let head = root(&ctx);
        ctx.create_version(VersionId::global(), "global", &head, None)
            .unwrap();
        ctx.create_version(VersionId::new("main"), "main", &head, Some(&VersionId::global()))
            .unwrap();
        ctx.create_version(VersionId::new("b"), "b", &head, Some(&VersionId::global()))
            .unwrap();

        switch_active(conn, None, &VersionId::new("main")).unwrap();
        let err = switch_active(conn, Some(&VersionId::new("b")), &VersionId::new("b")).unwrap_err();
        assert!(matches!(err, Error::ActiveVersionChanged { .. }));
        let prev = switch_active(conn, Some(&VersionId::new("main")), &VersionId::new("b")).unwrap();
        assert_eq!(prev, Some(VersionId::new("main")));
        assert!(load_version(conn, &VersionId::new("b")).unwrap().is_active);

        assert!(delete_version(conn, &VersionId::global()).is_err());
        assert!(delete_version(conn, &VersionId::new("b")).is_err());
        delete_version(conn, &VersionId::new("main")).unwrap();
        assert!(matches!(
            load_version(conn, &VersionId::new("main")),
            Err(Error::NotFound { .. })
        ));
    }
}
