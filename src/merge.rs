//! # Merging, Proposals and Conflict Resolution
//!
//! ```text
//!   merge_version(source S, target T)
//!
//!     S ancestor of T      nothing to do
//!     T ancestor of S      fast-forward T to S
//!     otherwise            merge commit, parents [T.head, S.head]
//!                            change set = one resolution change per conflict
//! ```
//!
//! A resolution change takes its content from the preferred side and lists
//! every competing leaf as a parent, so it becomes the single leaf of the
//! entity in the merge commit.
//!
//! Proposals package the symmetric difference of two versions as a change set
//! and are accepted by merging source into target.
//!
//! All functions expect the caller to hold the SQLite transaction and to mark
//! the state cache stale afterwards.

use std::collections::BTreeSet;

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::change::WriteContext;
use crate::error::{Error, Result};
use crate::graph::GraphIndex;
use crate::snapshot::SnapshotStore;
use crate::types::{
    Change, ChangeConflict, ChangeId, ChangeProposal, ChangeSetId, Commit, CommitId, EntityKey,
    ProposalId, ProposalStatus, VersionId,
};
use crate::version::load_version;

/// How divergent leaves are settled by a merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MergeStrategy {
    /// Fail with `ChangeConflict` if any entity conflicts.
    #[default]
    Strict,
    /// The source version's leaf wins.
    PreferSource,
    /// The target version's leaf wins.
    PreferTarget,
}

/// Result of [`merge_version`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeOutcome {
    /// Target head after the merge.
    pub commit_id: CommitId,
    pub fast_forward: bool,
    /// Conflicts settled by resolution changes.
    pub resolved: Vec<ChangeConflict>,
}

/// Merges `source` into `target`.
///
/// # Errors
///
/// `ChangeConflict` under [`MergeStrategy::Strict`] when leaves diverge.
pub fn merge_version(
    ctx: &WriteContext<'_>,
    snapshots: &mut SnapshotStore,
    source_id: &VersionId,
    target_id: &VersionId,
    strategy: MergeStrategy,
) -> Result<MergeOutcome> {
    if source_id == target_id {
        return Err(Error::InvalidArgument(format!(
            "cannot merge version '{source_id}' into itself"
        )));
    }
    let graph = GraphIndex::load(ctx.conn)?;
    let source = load_version(ctx.conn, source_id)?;
    let target = load_version(ctx.conn, target_id)?;

    if graph.is_ancestor(&source.commit_id, &target.commit_id)? {
        return Ok(MergeOutcome {
            commit_id: target.commit_id,
            fast_forward: false,
            resolved: Vec::new(),
        });
    }
    if graph.is_ancestor(&target.commit_id, &source.commit_id)? {
        ctx.set_version_head(target_id, &source.commit_id)?;
        tracing::info!(source = %source_id, target = %target_id, "merge fast-forwarded");
        return Ok(MergeOutcome {
            commit_id: source.commit_id,
            fast_forward: true,
            resolved: Vec::new(),
        });
    }

    let heads = [target.commit_id.clone(), source.commit_id.clone()];
    let conflicts = graph.conflicts(&heads)?;
    if strategy == MergeStrategy::Strict && !conflicts.is_empty() {
        return Err(Error::ChangeConflict { conflicts });
    }

    let preferred = match strategy {
        MergeStrategy::PreferTarget => &target.commit_id,
        _ => &source.commit_id,
    };
    let preferred_leaves = graph.leaf_changes_of(preferred)?;
    let mut resolutions = Vec::with_capacity(conflicts.len());
    for conflict in &conflicts {
        let winner = match preferred_leaves.get(&conflict.key) {
            Some(change) => change.clone(),
            None => last_leaf(&graph, conflict)?,
        };
        resolutions.push(resolve_with(ctx, snapshots, &conflict.key, &winner, &conflict.leaves)?);
    }

    let change_set = ctx.create_change_set(&resolutions)?;
    let commit = ctx.create_commit(&change_set.id, &heads)?;
    ctx.set_version_head(target_id, &commit.id)?;
    tracing::info!(
        source = %source_id,
        target = %target_id,
        commit_id = %commit.id,
        resolved = conflicts.len(),
        "versions merged"
    );
    Ok(MergeOutcome {
        commit_id: commit.id,
        fast_forward: false,
        resolved: conflicts,
    })
}

fn last_leaf(graph: &GraphIndex, conflict: &ChangeConflict) -> Result<Change> {
    conflict
        .leaves
        .last()
        .and_then(|id| graph.change(id))
        .cloned()
        .ok_or_else(|| Error::GraphInconsistency(format!("entity {} has no leaf change", conflict.key)))
}

/// Records `winner`'s content as a new change whose parents are `leaves`.
fn resolve_with(
    ctx: &WriteContext<'_>,
    snapshots: &mut SnapshotStore,
    key: &EntityKey,
    winner: &Change,
    leaves: &[ChangeId],
) -> Result<Change> {
    let content = snapshots.get(ctx.conn, &winner.snapshot_id)?;
    ctx.record_change(
        snapshots,
        key,
        &winner.schema_version,
        &winner.plugin_key,
        content.as_ref(),
        leaves,
    )
}

/// Settles a conflict in `version` by choosing one of its leaves.
///
/// # Errors
///
/// `NotFound` if the entity is not reachable; `InvalidArgument` if `chosen` is
/// not one of its current leaves.
pub fn resolve_conflict(
    ctx: &WriteContext<'_>,
    snapshots: &mut SnapshotStore,
    version_id: &VersionId,
    key: &EntityKey,
    chosen: &ChangeId,
) -> Result<Commit> {
    let graph = GraphIndex::load(ctx.conn)?;
    let version = load_version(ctx.conn, version_id)?;
    let resolved = graph.resolve_leaves(std::slice::from_ref(&version.commit_id))?;
    let res = resolved
        .get(key)
        .ok_or_else(|| Error::not_found("entity", key.to_string()))?;
    if !res.leaves.contains(chosen) {
        return Err(Error::InvalidArgument(format!(
            "change '{chosen}' is not a leaf of {key}"
        )));
    }
    let winner = graph
        .change(chosen)
        .cloned()
        .ok_or_else(|| Error::not_found("change", chosen.as_str()))?;

    let change = resolve_with(ctx, snapshots, key, &winner, &res.leaves)?;
    let change_set = ctx.create_change_set(&[change])?;
    let commit = ctx.create_commit(&change_set.id, std::slice::from_ref(&version.commit_id))?;
    ctx.set_version_head(version_id, &commit.id)?;
    tracing::info!(version_id = %version_id, entity = %key, chosen = %chosen, "conflict resolved");
    Ok(commit)
}

// =============================================================================
// Change Proposals
// =============================================================================

/// Packages the changes reachable from exactly one of the two versions.
pub fn create_proposal(
    ctx: &WriteContext<'_>,
    source_id: &VersionId,
    target_id: &VersionId,
) -> Result<ChangeProposal> {
    if source_id == target_id {
        return Err(Error::InvalidArgument(
            "a proposal needs two different versions".to_string(),
        ));
    }
    let graph = GraphIndex::load(ctx.conn)?;
    let source = load_version(ctx.conn, source_id)?;
    let target = load_version(ctx.conn, target_id)?;

    let from_source: BTreeSet<ChangeId> = graph
        .reachable_changes(std::slice::from_ref(&source.commit_id))?
        .into_keys()
        .collect();
    let from_target: BTreeSet<ChangeId> = graph
        .reachable_changes(std::slice::from_ref(&target.commit_id))?
        .into_keys()
        .collect();
    let mut changes: Vec<Change> = from_source
        .symmetric_difference(&from_target)
        .filter_map(|id| graph.change(id).cloned())
        .collect();
    changes.sort_by(|a, b| (&a.created_at, &a.id).cmp(&(&b.created_at, &b.id)));

    let change_set = ctx.create_change_set(&changes)?;
    let proposal = ChangeProposal {
        id: ProposalId::new(ctx.seq.uuid()),
        source_version_id: source_id.clone(),
        target_version_id: target_id.clone(),
        change_set_id: change_set.id,
        status: ProposalStatus::Open,
        created_at: ctx.seq.timestamp(),
    };
    ctx.conn.execute(
        "INSERT INTO lix_change_proposal
            (id, source_version_id, target_version_id, change_set_id, status, created_at)
         VALUES (?, ?, ?, ?, ?, ?)",
        params![
            proposal.id.as_str(),
            proposal.source_version_id.as_str(),
            proposal.target_version_id.as_str(),
            proposal.change_set_id.as_str(),
            proposal.status.as_str(),
            proposal.created_at,
        ],
    )?;
    tracing::info!(
        proposal_id = %proposal.id,
        source = %source_id,
        target = %target_id,
        changes = changes.len(),
        "change proposal created"
    );
    Ok(proposal)
}

/// Merges the proposal's source into its target and marks it accepted.
pub fn accept_proposal(
    ctx: &WriteContext<'_>,
    snapshots: &mut SnapshotStore,
    id: &ProposalId,
    strategy: MergeStrategy,
) -> Result<MergeOutcome> {
    let proposal = open_proposal(ctx.conn, id)?;
    let outcome = merge_version(
        ctx,
        snapshots,
        &proposal.source_version_id,
        &proposal.target_version_id,
        strategy,
    )?;
    set_status(ctx.conn, id, ProposalStatus::Accepted)?;
    Ok(outcome)
}

/// Marks an open proposal rejected.
pub fn reject_proposal(conn: &Connection, id: &ProposalId) -> Result<()> {
    open_proposal(conn, id)?;
    set_status(conn, id, ProposalStatus::Rejected)
}

fn open_proposal(conn: &Connection, id: &ProposalId) -> Result<ChangeProposal> {
    let proposal = load_proposal(conn, id)?;
    if proposal.status != ProposalStatus::Open {
        return Err(Error::InvalidArgument(format!(
            "proposal '{id}' is already {}",
            proposal.status
        )));
    }
    Ok(proposal)
}

fn set_status(conn: &Connection, id: &ProposalId, status: ProposalStatus) -> Result<()> {
    conn.execute(
        "UPDATE lix_change_proposal SET status = ? WHERE id = ?",
        params![status.as_str(), id.as_str()],
    )?;
    tracing::debug!(proposal_id = %id, %status, "proposal status changed");
    Ok(())
}

const PROPOSAL_COLUMNS: &str =
    "id, source_version_id, target_version_id, change_set_id, status, created_at";

fn proposal_from_row(row: &Row<'_>) -> rusqlite::Result<(ChangeProposal, String)> {
    let status: String = row.get(4)?;
    Ok((
        ChangeProposal {
            id: ProposalId::new(row.get::<_, String>(0)?),
            source_version_id: VersionId::new(row.get::<_, String>(1)?),
            target_version_id: VersionId::new(row.get::<_, String>(2)?),
            change_set_id: ChangeSetId::new(row.get::<_, String>(3)?),
            status: ProposalStatus::Open,
            created_at: row.get(5)?,
        },
        status,
    ))
}

fn decode_status((mut proposal, status): (ChangeProposal, String)) -> Result<ChangeProposal> {
    proposal.status = ProposalStatus::parse(&status).ok_or_else(|| {
        Error::Schema(format!("proposal '{}' has unknown status '{status}'", proposal.id))
    })?;
    Ok(proposal)
}

pub fn load_proposal(conn: &Connection, id: &ProposalId) -> Result<ChangeProposal> {
    let raw = conn
        .query_row(
            &format!("SELECT {PROPOSAL_COLUMNS} FROM lix_change_proposal WHERE id = ?"),
            [id.as_str()],
            proposal_from_row,
        )
        .optional()?
        .ok_or_else(|| Error::not_found("change proposal", id.as_str()))?;
    decode_status(raw)
}

pub fn list_proposals(conn: &Connection) -> Result<Vec<ChangeProposal>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {PROPOSAL_COLUMNS} FROM lix_change_proposal ORDER BY created_at, id"
    ))?;
    let raw = stmt
        .query_map([], proposal_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    raw.into_iter().map(decode_status).collect()
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Database;
    use crate::sequence::Sequencer;
    use serde_json::json;

    struct Fixture {
        db: Database,
        seq: Sequencer,
        snapshots: SnapshotStore,
    }

    impl Fixture {
        /// `main` and `feature` both start at a commit holding a = 1.
        fn new() -> Self {
            let db = Database::open_in_memory().unwrap();
            let seq = Sequencer::new(true, 0);
            let mut snapshots = SnapshotStore::new(16);
            {
                let ctx = WriteContext::new(db.connection(), &seq, "s");
                let a = kv(&ctx, &mut snapshots, "a", 1, &[]);
                let set = ctx.create_change_set(&[a]).unwrap();
                let base = ctx.create_commit(&set.id, &[]).unwrap();
                ctx.create_version(VersionId::global(), "global", &base.id, None).unwrap();
                ctx.create_version(VersionId::new("main"), "main", &base.id, Some(&VersionId::global()))
                    .unwrap();
                ctx.create_version(
                    VersionId::new("feature"),
                    "feature",
                    &base.id,
                    Some(&VersionId::global()),
                )
                .unwrap();
            }
            Self { db, seq, snapshots }
        }

        fn ctx(&self) -> WriteContext<'_> {
            WriteContext::new(self.db.connection(), &self.seq, "s")
        }

        /// Commits a = `value` on top of `version`.
        fn write_a(&mut self, version: &str, value: i64) -> CommitId {
            let ctx = WriteContext::new(self.db.connection(), &self.seq, "s");
            let graph = GraphIndex::load(ctx.conn).unwrap();
            let head = load_version(ctx.conn, &VersionId::new(version)).unwrap().commit_id;
            let leaves = graph.resolve_leaves(std::slice::from_ref(&head)).unwrap();
            let parents = leaves[&key("a")].leaves.clone();
            let change = kv(&ctx, &mut self.snapshots, "a", value, &parents);
            let set = ctx.create_change_set(&[change]).unwrap();
            let commit = ctx.create_commit(&set.id, &[head]).unwrap();
            ctx.set_version_head(&VersionId::new(version), &commit.id).unwrap();
            commit.id
        }

        fn value_of_a(&mut self, version: &str) -> serde_json::Value {
            let graph = GraphIndex::load(self.db.connection()).unwrap();
            let head = load_version(self.db.connection(), &VersionId::new(version))
                .unwrap()
                .commit_id;
            let change = graph.leaf_changes_of(&head).unwrap()[&key("a")].clone();
            self.snapshots
                .get(self.db.connection(), &change.snapshot_id)
                .unwrap()
                .unwrap()["value"]
                .clone()
        }
    }

    fn key(entity: &str) -> EntityKey {
        EntityKey::new(entity, "lix_key_value", "lix")
    }

    fn kv(ctx: &WriteContext<'_>, snapshots: &mut SnapshotStore, k: &str, v: i64, parents: &[ChangeId]) -> Change {
        ctx.record_change(
            snapshots,
            &key(k),
            "1.0",
            "lix_own_entity",
            Some(&json!({ "key": k, "value": v })),
            parents,
        )
        .unwrap()
    }

    #[test]
    fn test_fast_forward_merge() {
        let mut f = Fixture::new();
        let head = f.write_a("feature", 2);
        let outcome = {
            let ctx = f.ctx();
            let mut snapshots = SnapshotStore::new(4);
            merge_version(
                &ctx,
                &mut snapshots,
                &VersionId::new("feature"),
                &VersionId::new("main"),
                MergeStrategy::Strict,
            )
            .unwrap()
        };
        assert!(outcome.fast_forward);
        assert_eq!(outcome.commit_id, head);
        assert_eq!(f.value_of_a("main"), json!(2));
    }

    #[test]
    fn test_divergent_merge_strategies() {
        let mut f = Fixture::new();
        f.write_a("feature", 2);
        f.write_a("main", 3);

        let main = VersionId::new("main");
        let feature = VersionId::new("feature");
        let err = {
            let ctx = WriteContext::new(f.db.connection(), &f.seq, "s");
            merge_version(&ctx, &mut f.snapshots, &feature, &main, MergeStrategy::Strict).unwrap_err()
        };
        assert!(matches!(err, Error::ChangeConflict { ref conflicts } if conflicts.len() == 1));

        let outcome = {
            let ctx = WriteContext::new(f.db.connection(), &f.seq, "s");
            merge_version(&ctx, &mut f.snapshots, &feature, &main, MergeStrategy::PreferSource).unwrap()
        };
        assert!(!outcome.fast_forward);
        assert_eq!(outcome.resolved.len(), 1);
        assert_eq!(f.value_of_a("main"), json!(2));

        let graph = GraphIndex::load(f.db.connection()).unwrap();
        assert!(graph.conflicts(&[outcome.commit_id]).unwrap().is_empty());
    }

    #[test]
    fn test_resolve_conflict_requires_a_leaf() {
        let mut f = Fixture::new();
        f.write_a("feature", 2);
        f.write_a("main", 3);
        let main = VersionId::new("main");
        let feature_head = load_version(f.db.connection(), &VersionId::new("feature"))
            .unwrap()
            .commit_id;
        let main_head = load_version(f.db.connection(), &main).unwrap().commit_id;

        // Join both heads without resolving.
        let conflict = {
            let ctx = WriteContext::new(f.db.connection(), &f.seq, "s");
            let empty = ctx.create_change_set(&[]).unwrap();
            let joined = ctx.create_commit(&empty.id, &[main_head, feature_head]).unwrap();
            ctx.set_version_head(&main, &joined.id).unwrap();
            GraphIndex::load(ctx.conn).unwrap().conflicts(&[joined.id]).unwrap()
        };
        assert_eq!(conflict.len(), 1);

        let ctx = WriteContext::new(f.db.connection(), &f.seq, "s");
        let err = resolve_conflict(&ctx, &mut f.snapshots, &main, &key("a"), &ChangeId::new("nope"))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        let chosen = conflict[0].leaves[0].clone();
        let commit = resolve_conflict(&ctx, &mut f.snapshots, &main, &key("a"), &chosen).unwrap();
        let graph = GraphIndex::load(ctx.conn).unwrap();
        assert!(graph.conflicts(&[commit.id]).unwrap().is_empty());
    }

    #[test]
    fn test_proposal_lifecycle() {
        let mut f = Fixture::new();
        f.write_a("feature", 2);
        let main = VersionId::new("main");
        let feature = VersionId::new("feature");

        let ctx = WriteContext::new(f.db.connection(), &f.seq, "s");
        let proposal = create_proposal(&ctx, &feature, &main).unwrap();
        assert_eq!(proposal.status, ProposalStatus::Open);
        let set = crate::change::load_change_set(ctx.conn, &proposal.change_set_id)
            .unwrap()
            .unwrap();
        assert_eq!(set.elements.len(), 1);

        let outcome = accept_proposal(&ctx, &mut f.snapshots, &proposal.id, MergeStrategy::Strict).unwrap();
        assert!(outcome.fast_forward);
        assert_eq!(
            load_proposal(ctx.conn, &proposal.id).unwrap().status,
            ProposalStatus::Accepted
        );
        assert!(matches!(
            reject_proposal(ctx.conn, &proposal.id),
            Err(Error::InvalidArgument(_))
        ));
        assert_eq!(list_proposals(ctx.conn).unwrap().len(), 1);
    }
}
