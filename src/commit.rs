//! # Commit Graph Storage
//!
//! A commit points at one change set and at zero or more parent commits. The
//! root commit has no parents; merge commits have two. Parent order is kept
//! in `lix_commit_edge.position`.

use rusqlite::{params, Connection, OptionalExtension};

use crate::change::WriteContext;
use crate::error::{Error, Result};
use crate::sync::SyncRecord;
use crate::types::{ChangeSetId, Commit, CommitId};

impl WriteContext<'_> {
    /// Creates a commit over `change_set_id` with the given parents.
    ///
    /// # Errors
    ///
    /// `GraphInconsistency` if the change set or a parent does not exist.
    pub fn create_commit(&self, change_set_id: &ChangeSetId, parents: &[CommitId]) -> Result<Commit> {
        let commit = Commit {
            id: CommitId::new(self.seq.uuid()),
            change_set_id: change_set_id.clone(),
            parent_commit_ids: parents.to_vec(),
            created_at: self.seq.timestamp(),
        };
        insert_commit(self.conn, &commit)?;
        self.journal(&SyncRecord::Commit(commit.clone()))?;
        tracing::debug!(
            commit_id = %commit.id,
            parents = commit.parent_commit_ids.len(),
            "commit created"
        );
        Ok(commit)
    }
}

/// Inserts a commit and its parent edges after checking references.
///
/// Re-inserting an identical commit is a no-op; a different commit under an
/// existing id is a `GraphInconsistency`.
pub(crate) fn insert_commit(conn: &Connection, commit: &Commit) -> Result<()> {
    if let Some(existing) = load_commit(conn, &commit.id)? {
        if &existing != commit {
            return Err(Error::GraphInconsistency(format!(
                "commit '{}' already exists with different content",
                commit.id
            )));
        }
        return Ok(());
    }
    let has_set: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM lix_change_set WHERE id = ?)",
        [commit.change_set_id.as_str()],
        |row| row.get(0),
    )?;
    if !has_set {
        return Err(Error::GraphInconsistency(format!(
            "commit '{}' references missing change set '{}'",
            commit.id, commit.change_set_id
        )));
    }
    for parent in &commit.parent_commit_ids {
        if parent == &commit.id || !commit_exists(conn, parent)? {
            return Err(Error::GraphInconsistency(format!(
                "commit '{}' references missing parent '{}'",
                commit.id, parent
            )));
        }
    }

    conn.execute(
        "INSERT INTO lix_commit (id, change_set_id, created_at) VALUES (?, ?, ?)",
        params![
            commit.id.as_str(),
            commit.change_set_id.as_str(),
            commit.created_at
        ],
    )?;
    for (position, parent) in commit.parent_commit_ids.iter().enumerate() {
        conn.execute(
            "INSERT OR IGNORE INTO lix_commit_edge (parent_id, child_id, position) VALUES (?, ?, ?)",
            params![parent.as_str(), commit.id.as_str(), position as i64],
        )?;
    }
    Ok(())
}

pub fn commit_exists(conn: &Connection, id: &CommitId) -> Result<bool> {
    Ok(conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM lix_commit WHERE id = ?)",
        [id.as_str()],
        |row| row.get(0),
    )?)
}

/// Loads a commit with its parents in order.
pub fn load_commit(conn: &Connection, id: &CommitId) -> Result<Option<Commit>> {
    let row: Option<(String, String)> = conn
        .query_row(
            "SELECT change_set_id, created_at FROM lix_commit WHERE id = ?",
            [id.as_str()],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let Some((change_set_id, created_at)) = row else {
        return Ok(None);
    };

    let mut stmt = conn.prepare_cached(
        "SELECT parent_id FROM lix_commit_edge WHERE child_id = ? ORDER BY position",
    )?;
    let parents = stmt
        .query_map([id.as_str()], |row| Ok(CommitId::new(row.get::<_, String>(0)?)))?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(Some(Commit {
        id: id.clone(),
        change_set_id: ChangeSetId::new(change_set_id),
        parent_commit_ids: parents,
        created_at,
    }))
}

/// Lists every commit ordered by `(created_at, id)`.
pub fn list_commits(conn: &Connection) -> Result<Vec<Commit>> {
    let mut stmt = conn.prepare("SELECT id FROM lix_commit ORDER BY created_at, id")?;
    let ids = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    let mut commits = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(commit) = load_commit(conn, &CommitId::new(id))? {
            commits.push(commit);
        }
    }
    Ok(commits)
}

/// Lists every `(parent, child)` commit edge.
pub fn list_commit_edges(conn: &Connection) -> Result<Vec<(CommitId, CommitId)>> {
    let mut stmt = conn.prepare(
        "SELECT parent_id, child_id FROM lix_commit_edge ORDER BY child_id, position",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                CommitId::new(row.get::<_, String>(0)?),
                CommitId::new(row.get::<_, String>(1)?),
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

// =============================================================================
// Tests
// =============================================================================
