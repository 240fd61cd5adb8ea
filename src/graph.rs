//! # Graph Index and Leaf Resolution
//!
//! An in-memory view of the commit and change graphs, loaded in one pass, on
//! which every traversal runs as an explicit worklist.
//!
//! ## Leaf Resolution
//!
//! ```text
//!   head ──► commit ancestry (BFS over parents)
//!        ──► reachable changes (union of ancestry change sets)
//!        ──► per entity: changes with no reachable child   = leaves
//!        ──► greatest (created_at, id) among leaves        = winner
//! ```
//!
//! A change is a leaf only relative to a head: a descendant that exists in the
//! store but is not reachable from the head does not hide it. Two leaves with
//! different snapshots are a conflict; the winner is still deterministic.
//!
//! ## Reuse
//!
//! [`GraphCache`] hands out the same index until one of the graph tables
//! grows. Graph rows are only ever appended, so the highest rowid of each
//! table identifies its contents; a rolled-back write can reuse rowids, so
//! the engine drops the cache whenever a transaction rolls back.
//!
//! ## Cycle Detection
//!
//! Both graphs are append-only DAGs, but data arriving through sync is not
//! trusted. Ancestry and per-entity change sets are topologically sorted
//! (Kahn's algorithm); anything left over is a cycle and fails with
//! `GraphInconsistency`.

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use rusqlite::Connection;

use crate::change::change_from_row;
use crate::error::{Error, Result};
use crate::types::{Change, ChangeConflict, ChangeId, ChangeSetId, CommitId, EntityKey};

/// One resolved entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafResolution {
    /// The authoritative change.
    pub change: Change,
    /// Commit (nearest to the heads) whose change set holds `change`.
    pub commit_id: CommitId,
    /// Every leaf for the entity, sorted by `(created_at, id)` ascending.
    pub leaves: Vec<ChangeId>,
    /// `created_at` of the earliest reachable change of the entity.
    pub first_created_at: String,
}

impl LeafResolution {
    pub fn is_tombstone(&self) -> bool {
        self.change.is_tombstone()
    }
}

#[derive(Debug, Clone)]
struct CommitNode {
    change_set_id: ChangeSetId,
    parents: Vec<CommitId>,
}

// =============================================================================
// Graph Cache
// =============================================================================

/// Highest rowid of every table the index is built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct GraphStamp([i64; 6]);

impl GraphStamp {
    fn read(conn: &Connection) -> Result<Self> {
        let mut stmt = conn.prepare_cached(
            "SELECT
                (SELECT COALESCE(MAX(rowid), 0) FROM lix_commit),
                (SELECT COALESCE(MAX(rowid), 0) FROM lix_commit_edge),
                (SELECT COALESCE(MAX(rowid), 0) FROM lix_change_set),
                (SELECT COALESCE(MAX(rowid), 0) FROM lix_change_set_element),
                (SELECT COALESCE(MAX(rowid), 0) FROM lix_change),
                (SELECT COALESCE(MAX(rowid), 0) FROM lix_change_edge)",
        )?;
        let stamp = stmt.query_row([], |row| {
            Ok([
                row.get(0)?,
                row.get(1)?,
                row.get(2)?,
                row.get(3)?,
                row.get(4)?,
                row.get(5)?,
            ])
        })?;
        Ok(Self(stamp))
    }
}

/// The last loaded [`GraphIndex`], reused while the graph tables are unchanged.
#[derive(Debug, Default)]
pub struct GraphCache {
    cached: RefCell<Option<(GraphStamp, Arc<GraphIndex>)>>,
}

impl GraphCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// The index for the current contents of `conn`, loading it if the
    /// graph grew since the last call.
    pub fn get(&self, conn: &Connection) -> Result<Arc<GraphIndex>> {
        let stamp = GraphStamp::read(conn)?;
        if let Some((cached, index)) = self.cached.borrow().as_ref() {
            if *cached == stamp {
                return Ok(Arc::clone(index));
            }
        }
        let index = Arc::new(GraphIndex::load(conn)?);
        *self.cached.borrow_mut() = Some((stamp, Arc::clone(&index)));
        tracing::trace!("graph index reloaded");
        Ok(index)
    }

    pub fn invalidate(&self) {
        self.cached.borrow_mut().take();
    }
}

// =============================================================================
// Graph Index
// =============================================================================

/// Snapshot of both graphs.
#[derive(Debug, Default)]
pub struct GraphIndex {
    commits: HashMap<CommitId, CommitNode>,
    change_sets: HashMap<ChangeSetId, Vec<ChangeId>>,
    changes: HashMap<ChangeId, Change>,
    children: HashMap<ChangeId, Vec<ChangeId>>,
}

impl GraphIndex {
    /// Loads the whole graph from the store.
    pub fn load(conn: &Connection) -> Result<Self> {
        let mut index = Self::default();

        let mut stmt = conn.prepare("SELECT id, change_set_id FROM lix_commit")?;
        let commits = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for commit in commits {
            let (id, change_set_id) = commit?;
            index.commits.insert(
                CommitId::new(id),
                CommitNode {
                    change_set_id: ChangeSetId::new(change_set_id),
                    parents: Vec::new(),
                },
            );
        }

        let mut stmt = conn
            .prepare("SELECT parent_id, child_id FROM lix_commit_edge ORDER BY child_id, position")?;
        let edges = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for edge in edges {
            let (parent, child) = edge?;
            if let Some(node) = index.commits.get_mut(&CommitId::new(child)) {
                node.parents.push(CommitId::new(parent));
            }
        }

        let mut stmt = conn.prepare("SELECT id FROM lix_change_set")?;
        for id in stmt.query_map([], |row| row.get::<_, String>(0))? {
            index.change_sets.insert(ChangeSetId::new(id?), Vec::new());
        }
        let mut stmt =
            conn.prepare("SELECT change_set_id, change_id FROM lix_change_set_element")?;
        let elements = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for element in elements {
            let (set, change) = element?;
            index
                .change_sets
                .entry(ChangeSetId::new(set))
                .or_default()
                .push(ChangeId::new(change));
        }

        let mut stmt = conn.prepare(
            "SELECT id, entity_id, schema_key, schema_version, file_id, plugin_key, snapshot_id, created_at
             FROM lix_change",
        )?;
        for change in stmt.query_map([], change_from_row)? {
            let change = change?;
            index.changes.insert(change.id.clone(), change);
        }

        let mut stmt = conn.prepare("SELECT parent_id, child_id FROM lix_change_edge")?;
        let edges = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        for edge in edges {
            let (parent, child) = edge?;
            index
                .children
                .entry(ChangeId::new(parent))
                .or_default()
                .push(ChangeId::new(child));
        }

        Ok(index)
    }

    pub fn change(&self, id: &ChangeId) -> Option<&Change> {
        self.changes.get(id)
    }

    pub fn has_commit(&self, id: &CommitId) -> bool {
        self.commits.contains_key(id)
    }

    /// Returns `head` and all its ancestors in BFS order (head first).
    ///
    /// # Errors
    ///
    /// `GraphInconsistency` if a commit is missing or the ancestry has a cycle.
    pub fn commit_ancestry(&self, head: &CommitId) -> Result<Vec<CommitId>> {
        self.ancestry_of(std::slice::from_ref(head))
    }

    fn ancestry_of(&self, heads: &[CommitId]) -> Result<Vec<CommitId>> {
        let mut order = Vec::new();
        let mut visited = HashSet::new();
        let mut queue: VecDeque<CommitId> = heads.iter().cloned().collect();

        while let Some(id) = queue.pop_front() {
            if !visited.insert(id.clone()) {
                continue;
            }
            let node = self.commits.get(&id).ok_or_else(|| {
                Error::GraphInconsistency(format!("commit '{id}' is referenced but missing"))
            })?;
            queue.extend(node.parents.iter().cloned());
            order.push(id);
        }

        self.check_commit_cycles(&visited)?;
        Ok(order)
    }

    fn check_commit_cycles(&self, reachable: &HashSet<CommitId>) -> Result<()> {
        // Kahn over child -> parent edges restricted to the reachable set.
        let mut indegree: HashMap<&CommitId, usize> = reachable.iter().map(|id| (id, 0)).collect();
        for id in reachable {
            if let Some(node) = self.commits.get(id) {
                for parent in &node.parents {
                    if let Some(d) = indegree.get_mut(parent) {
                        *d += 1;
                    }
                }
            }
        }
        let mut queue: VecDeque<&CommitId> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut seen = 0;
        while let Some(id) = queue.pop_front() {
            seen += 1;
            if let Some(node) = self.commits.get(id) {
                for parent in &node.parents {
                    if let Some(d) = indegree.get_mut(parent) {
                        *d -= 1;
                        if *d == 0 {
                            queue.push_back(parent);
                        }
                    }
                }
            }
        }
        if seen != reachable.len() {
            return Err(Error::GraphInconsistency(
                "commit graph contains a cycle".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns true if `ancestor` is `descendant` or one of its ancestors.
    pub fn is_ancestor(&self, ancestor: &CommitId, descendant: &CommitId) -> Result<bool> {
        Ok(self.commit_ancestry(descendant)?.contains(ancestor))
    }

    /// Returns the nearest common ancestor of two commits, if any.
    pub fn merge_base(&self, a: &CommitId, b: &CommitId) -> Result<Option<CommitId>> {
        let of_a: HashSet<CommitId> = self.commit_ancestry(a)?.into_iter().collect();
        Ok(self
            .commit_ancestry(b)?
            .into_iter()
            .find(|id| of_a.contains(id)))
    }

    /// Maps every change reachable from `heads` to the nearest commit holding it.
    pub fn reachable_changes(&self, heads: &[CommitId]) -> Result<HashMap<ChangeId, CommitId>> {
        let mut reachable = HashMap::new();
        for commit_id in self.ancestry_of(heads)? {
            let node = &self.commits[&commit_id];
            let members = self.change_sets.get(&node.change_set_id).ok_or_else(|| {
                Error::GraphInconsistency(format!(
                    "commit '{commit_id}' references missing change set '{}'",
                    node.change_set_id
                ))
            })?;
            for change_id in members {
                if !self.changes.contains_key(change_id) {
                    return Err(Error::GraphInconsistency(format!(
                        "change set '{}' references missing change '{change_id}'",
                        node.change_set_id
                    )));
                }
                reachable
                    .entry(change_id.clone())
                    .or_insert_with(|| commit_id.clone());
            }
        }
        Ok(reachable)
    }

    /// Resolves the authoritative change of every entity reachable from `heads`.
    pub fn resolve_leaves(&self, heads: &[CommitId]) -> Result<BTreeMap<EntityKey, LeafResolution>> {
        let reachable = self.reachable_changes(heads)?;

        let mut by_entity: BTreeMap<EntityKey, Vec<&Change>> = BTreeMap::new();
        for change_id in reachable.keys() {
            let change = &self.changes[change_id];
            by_entity.entry(change.key()).or_default().push(change);
        }

        let mut resolved = BTreeMap::new();
        for (key, changes) in by_entity {
            let members: HashSet<&ChangeId> = changes.iter().map(|c| &c.id).collect();
            self.check_change_cycles(&key, &members)?;

            let mut leaves: Vec<&Change> = changes
                .iter()
                .copied()
                .filter(|c| {
                    self.children
                        .get(&c.id)
                        .map_or(true, |kids| !kids.iter().any(|k| members.contains(k)))
                })
                .collect();
            leaves.sort_by(|a, b| (&a.created_at, &a.id).cmp(&(&b.created_at, &b.id)));

            let winner = *leaves.last().ok_or_else(|| {
                Error::GraphInconsistency(format!("entity {key} has no leaf change"))
            })?;
            let first_created_at = changes
                .iter()
                .map(|c| c.created_at.as_str())
                .min()
                .unwrap_or(winner.created_at.as_str())
                .to_string();

            resolved.insert(
                key,
                LeafResolution {
                    change: winner.clone(),
                    commit_id: reachable[&winner.id].clone(),
                    leaves: leaves.iter().map(|c| c.id.clone()).collect(),
                    first_created_at,
                },
            );
        }
        Ok(resolved)
    }

    fn check_change_cycles(&self, key: &EntityKey, members: &HashSet<&ChangeId>) -> Result<()> {
        let mut indegree: HashMap<&ChangeId, usize> = members.iter().map(|id| (*id, 0)).collect();
        for id in members {
            for kid in self.children.get(*id).into_iter().flatten() {
                if let Some(d) = indegree.get_mut(kid) {
                    *d += 1;
                }
            }
        }
        let mut queue: VecDeque<&ChangeId> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut seen = 0;
        while let Some(id) = queue.pop_front() {
            seen += 1;
            for kid in self.children.get(id).into_iter().flatten() {
                if let Some(d) = indegree.get_mut(kid) {
                    *d -= 1;
                    if *d == 0 {
                        queue.push_back(kid);
                    }
                }
            }
        }
        if seen != members.len() {
            return Err(Error::GraphInconsistency(format!(
                "change edges of entity {key} contain a cycle"
            )));
        }
        Ok(())
    }

    /// The authoritative change per entity for one head.
    pub fn leaf_changes_of(&self, head: &CommitId) -> Result<BTreeMap<EntityKey, Change>> {
        Ok(self
            .resolve_leaves(std::slice::from_ref(head))?
            .into_iter()
            .map(|(key, res)| (key, res.change))
            .collect())
    }

    /// Entities whose leaves from `heads` disagree on content.
    pub fn conflicts(&self, heads: &[CommitId]) -> Result<Vec<ChangeConflict>> {
        Ok(self
            .resolve_leaves(heads)?
            .into_iter()
            .filter(|(_, res)| self.leaves_disagree(&res.leaves))
            .map(|(key, res)| ChangeConflict {
                key,
                leaves: res.leaves,
            })
            .collect())
    }

    /// True when leaves point at more than one distinct snapshot.
    pub fn leaves_disagree(&self, leaves: &[ChangeId]) -> bool {
        let snapshots: HashSet<_> = leaves
            .iter()
            .filter_map(|id| self.changes.get(id))
            .map(|c| &c.snapshot_id)
            .collect();
        snapshots.len() > 1
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::change::WriteContext;
    use crate::schema::Database;
    use crate::sequence::Sequencer;
    use crate::snapshot::SnapshotStore;
    use serde_json::json;

    struct Fixture {
        db: Database,
        seq: Sequencer,
        snapshots: SnapshotStore,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                db: Database::open_in_memory().unwrap(),
                seq: Sequencer::new(true, 0),
                snapshots: SnapshotStore::new(16),
            }
        }

        fn change(&mut self, entity: &str, value: i64, parents: &[ChangeId]) -> Change {
            let ctx = WriteContext::new(self.db.connection(), &self.seq, "s");
            ctx.record_change(
                &mut self.snapshots,
                &EntityKey::new(entity, "lix_key_value", "lix"),
                "1.0",
                "p",
                Some(&json!({ "key": entity, "value": value })),
                parents,
            )
            .unwrap()
        }

        fn commit(&self, changes: &[Change], parents: &[CommitId]) -> CommitId {
            let ctx = WriteContext::new(self.db.connection(), &self.seq, "s");
            let set = ctx.create_change_set(changes).unwrap();
            ctx.create_commit(&set.id, parents).unwrap().id
        }

        fn graph(&self) -> GraphIndex {
            GraphIndex::load(self.db.connection()).unwrap()
        }
    }

    #[test]
    fn test_graph_cache_reloads_only_when_the_graph_grows() {
        let mut f = Fixture::new();
        let c1 = f.change("a", 1, &[]);
        let k1 = f.commit(&[c1.clone()], &[]);
        let cache = GraphCache::new();
        let conn = f.db.connection();

        let first = cache.get(conn).unwrap();
        assert!(Arc::ptr_eq(&first, &cache.get(conn).unwrap()));

        let c2 = f.change("a", 2, &[c1.id.clone()]);
        let k2 = f.commit(&[c2.clone()], &[k1]);
        let conn = f.db.connection();
        let second = cache.get(conn).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert!(second.has_commit(&k2));
        assert_eq!(second.leaf_changes_of(&k2).unwrap().values().next().unwrap().id, c2.id);

        cache.invalidate();
        assert!(!Arc::ptr_eq(&second, &cache.get(conn).unwrap()));
    }

    #[test]
    fn test_linear_history_resolves_to_latest() {
        let mut f = Fixture::new();
        let c1 = f.change("a", 1, &[]);
        let k1 = f.commit(&[c1.clone()], &[]);
        let c2 = f.change("a", 2, &[c1.id.clone()]);
        let k2 = f.commit(&[c2.clone()], &[k1.clone()]);

        let graph = f.graph();
        let leaves = graph.resolve_leaves(&[k2.clone()]).unwrap();
        let res = &leaves[&EntityKey::new("a", "lix_key_value", "lix")];
        assert_eq!(res.change.id, c2.id);
        assert_eq!(res.commit_id, k2);
        assert_eq!(res.leaves, vec![c2.id]);
        assert_eq!(res.first_created_at, c1.created_at);

        // The older head still sees the older change.
        let old = graph.leaf_changes_of(&k1).unwrap();
        assert_eq!(old.values().next().unwrap().id, c1.id);
        assert!(graph.is_ancestor(&k1, &k2).unwrap());
        assert!(!graph.is_ancestor(&k2, &k1).unwrap());
    }

    #[test]
    fn test_siblings_tie_break_and_conflict() {
        let mut f = Fixture::new();
        let base = f.change("a", 0, &[]);
        let root = f.commit(&[base.clone()], &[]);
        let left = f.change("a", 1, &[base.id.clone()]);
        let k_left = f.commit(&[left.clone()], &[root.clone()]);
        let right = f.change("a", 2, &[base.id.clone()]);
        let k_right = f.commit(&[right.clone()], &[root.clone()]);
        let merge = f.commit(&[], &[k_left, k_right]);

        let graph = f.graph();
        let leaves = graph.resolve_leaves(&[merge.clone()]).unwrap();
        let res = leaves.values().next().unwrap();
        // right was created later, so it wins
        assert_eq!(res.change.id, right.id);
        assert_eq!(res.leaves, vec![left.id.clone(), right.id.clone()]);

        let conflicts = graph.conflicts(&[merge.clone()]).unwrap();
        assert_eq!(conflicts.len(), 1);

        // Resolution idempotence: resolving twice gives the same answer.
        assert_eq!(graph.resolve_leaves(&[merge]).unwrap(), leaves);
    }

    #[test]
    fn test_identical_siblings_are_not_conflicts() {
        let mut f = Fixture::new();
        let base = f.change("a", 0, &[]);
        let root = f.commit(&[base.clone()], &[]);
        let left = f.change("a", 1, &[base.id.clone()]);
        let right = f.change("a", 1, &[base.id.clone()]);
        let k = f.commit(&[left, right], &[root]);

        let graph = f.graph();
        assert!(graph.conflicts(&[k]).unwrap().is_empty());
    }

    #[test]
    fn test_unreachable_descendant_does_not_hide_leaf() {
        let mut f = Fixture::new();
        let c1 = f.change("a", 1, &[]);
        let k1 = f.commit(&[c1.clone()], &[]);
        let c2 = f.change("a", 2, &[c1.id.clone()]);
        f.commit(&[c2], &[k1.clone()]);

        let leaves = f.graph().leaf_changes_of(&k1).unwrap();
        assert_eq!(leaves.values().next().unwrap().id, c1.id);
    }

    #[test]
    fn test_change_cycle_is_graph_inconsistency() {
        let mut f = Fixture::new();
        let c1 = f.change("a", 1, &[]);
        let c2 = f.change("a", 2, &[c1.id.clone()]);
        f.db.connection()
            .execute(
                "INSERT INTO lix_change_edge (parent_id, child_id) VALUES (?, ?)",
                [c2.id.as_str(), c1.id.as_str()],
            )
            .unwrap();
        let k = f.commit(&[c1, c2], &[]);

        let err = f.graph().resolve_leaves(&[k]).unwrap_err();
        assert!(matches!(err, Error::GraphInconsistency(_)));
    }

    #[test]
    fn test_missing_commit_and_commit_cycle() {
        let f = Fixture::new();
        let graph = f.graph();
        assert!(matches!(
            graph.commit_ancestry(&CommitId::new("ghost")),
            Err(Error::GraphInconsistency(_))
        ));

        let a = f.commit(&[], &[]);
        let b = f.commit(&[], &[a.clone()]);
        f.db.connection()
            .execute(
                "INSERT INTO lix_commit_edge (parent_id, child_id, position) VALUES (?, ?, 0)",
                [b.as_str(), a.as_str()],
            )
            .unwrap();
        assert!(matches!(
            f.graph().commit_ancestry(&b),
            Err(Error::GraphInconsistency(_))
        ));
    }

    #[test]
    fn test_merge_base() {
        let f = Fixture::new();
        let root = f.commit(&[], &[]);
        let left = f.commit(&[], &[root.clone()]);
        let right = f.commit(&[], &[root.clone()]);
        let graph = f.graph();
        assert_eq!(graph.merge_base(&left, &right).unwrap(), Some(root));
    }
}
