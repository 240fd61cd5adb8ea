//! # Sync and Diff
//!
//! Two concerns share this module because both compare histories:
//!
//! - **diff**: per-entity comparison of the leaf sets of two commits
//! - **replication**: a journal of every locally created graph object,
//!   exchanged between stores by vector clock
//!
//! ## Journal and Vector Clock
//!
//! ```text
//!   lix_sync_log
//!   ┌────────────┬─────────────┬─────────────────────────┐
//!   │ session_id │ session_seq │ payload (SyncRecord)    │
//!   ├────────────┼─────────────┼─────────────────────────┤
//!   │ 7f3a...    │ 1           │ {"type":"snapshot",...} │
//!   │ 7f3a...    │ 2           │ {"type":"change",...}   │
//!   │ c019...    │ 1           │ {"type":"commit",...}   │
//!   └────────────┴─────────────┴─────────────────────────┘
//!
//!   vector clock = { session_id -> max(session_seq) }
//! ```
//!
//! Each engine instance journals under a fresh random session id, so
//! `(session_id, session_seq)` is globally unique and entries are never
//! rewritten. "Newer than a clock" is therefore a simple per-session compare.
//!
//! ## Applying Remote Entries
//!
//! Immutable objects (snapshots, changes, change sets, edges, commits) are
//! inserted idempotently. Version pointers are reconciled:
//!
//! ```text
//!   local == remote            nothing
//!   local ancestor of remote   fast-forward to remote
//!   remote ancestor of local   keep local
//!   diverged                   merge commit [local, remote], conflicts reported
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::time::Duration;

use async_trait::async_trait;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::api::Lix;
use crate::cache::{StaleScope, StateCache};
use crate::change::{insert_change, insert_change_edge, insert_change_set, WriteContext};
use crate::commit::{commit_exists, insert_commit};
use crate::error::{Error, Result, SyncErrorCode};
use crate::graph::GraphIndex;
use crate::query::{QueryOutput, Statement};
use crate::registry::SchemaDefinition;
use crate::snapshot::SnapshotStore;
use crate::types::{
    Change, ChangeConflict, ChangeEdge, ChangeSet, Commit, CommitId, DiffStatus, EntityDiff,
    SnapshotId, Version, VersionId,
};
use crate::version::{upsert_version, version_map};

// =============================================================================
// Records
// =============================================================================

/// One journaled graph object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum SyncRecord {
    Schema(SchemaDefinition),
    Snapshot { id: SnapshotId, content: Option<Value> },
    Change(Change),
    ChangeEdge(ChangeEdge),
    ChangeSet(ChangeSet),
    Commit(Commit),
    Version(Version),
}

/// A journal row as exchanged on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub session_id: String,
    pub session_seq: u64,
    pub record: SyncRecord,
}

/// Highest journal sequence seen per session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VectorClock(pub BTreeMap<String, u64>);

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Highest sequence seen for `session`, 0 if none.
    pub fn get(&self, session: &str) -> u64 {
        self.0.get(session).copied().unwrap_or(0)
    }

    /// Returns true if `entry` is not covered by this clock.
    pub fn is_newer(&self, session: &str, seq: u64) -> bool {
        seq > self.get(session)
    }

    /// Returns true if every session of `self` is at or below `other`.
    pub fn is_behind_or_equal(&self, other: &VectorClock) -> bool {
        self.0.iter().all(|(session, seq)| *seq <= other.get(session))
    }
}

/// Reads the clock of the local journal.
pub fn local_clock(conn: &Connection) -> Result<VectorClock> {
    let mut stmt = conn
        .prepare("SELECT session_id, MAX(session_seq) FROM lix_sync_log GROUP BY session_id")?;
    let clock = stmt
        .query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?.max(0) as u64))
        })?
        .collect::<std::result::Result<BTreeMap<_, _>, _>>()?;
    Ok(VectorClock(clock))
}

/// Journal entries not covered by `clock`, ordered by session and sequence.
pub fn entries_after(conn: &Connection, clock: &VectorClock) -> Result<Vec<LogEntry>> {
    let mut stmt = conn.prepare(
        "SELECT session_id, session_seq, payload FROM lix_sync_log ORDER BY session_id, session_seq",
    )?;
    let rows = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?.max(0) as u64,
                row.get::<_, String>(2)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    rows.into_iter()
        .filter(|(session, seq, _)| clock.is_newer(session, *seq))
        .map(|(session_id, session_seq, payload)| {
            Ok(LogEntry {
                session_id,
                session_seq,
                record: serde_json::from_str(&payload)?,
            })
        })
        .collect()
}

// =============================================================================
// Diff
// =============================================================================

/// Compares the leaf snapshots reachable from two commits.
///
/// Entities that are absent or deleted on both sides are omitted; everything
/// else is reported, including unchanged entities. Sorted by entity key.
pub fn diff(
    conn: &Connection,
    graph: &GraphIndex,
    snapshots: &mut SnapshotStore,
    before: &CommitId,
    after: &CommitId,
) -> Result<Vec<EntityDiff>> {
    let old = graph.leaf_changes_of(before)?;
    let new = graph.leaf_changes_of(after)?;
    let keys: BTreeSet<_> = old.keys().chain(new.keys()).cloned().collect();

    let mut out = Vec::new();
    for key in keys {
        let b = old.get(&key).filter(|c| !c.is_tombstone());
        let a = new.get(&key).filter(|c| !c.is_tombstone());
        let status = match (b, a) {
            (None, None) => continue,
            (None, Some(_)) => DiffStatus::Added,
            (Some(_), None) => DiffStatus::Removed,
            (Some(b), Some(a)) if b.snapshot_id == a.snapshot_id => DiffStatus::Unchanged,
            (Some(_), Some(_)) => DiffStatus::Modified,
        };
        let before_content = match b {
            Some(c) => snapshots.get(conn, &c.snapshot_id)?,
            None => None,
        };
        let after_content = match a {
            Some(c) => snapshots.get(conn, &c.snapshot_id)?,
            None => None,
        };
        out.push(EntityDiff {
            key,
            status,
            before: before_content,
            after: after_content,
            before_change_id: b.map(|c| c.id.clone()),
            after_change_id: a.map(|c| c.id.clone()),
        });
    }
    Ok(out)
}

// =============================================================================
// Apply
// =============================================================================

/// Outcome of applying remote entries.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    /// Journal entries that were new to this store.
    pub applied: usize,
    /// Versions whose head moved.
    pub advanced: Vec<VersionId>,
    /// Entities left with competing leaves by a divergence merge.
    pub conflicts: Vec<ChangeConflict>,
}

/// Applies remote journal entries. The caller owns the SQLite transaction.
pub(crate) fn apply_entries(
    ctx: &WriteContext<'_>,
    snapshots: &mut SnapshotStore,
    entries: &[LogEntry],
) -> Result<SyncReport> {
    let conn = ctx.conn;
    let mut report = SyncReport::default();

    {
        let mut log = conn.prepare_cached(
            "INSERT OR IGNORE INTO lix_sync_log (session_id, session_seq, payload) VALUES (?, ?, ?)",
        )?;
        for entry in entries {
            report.applied += log.execute(params![
                entry.session_id,
                entry.session_seq as i64,
                serde_json::to_string(&entry.record)?,
            ])?;
        }
    }

    let records: Vec<&SyncRecord> = entries.iter().map(|e| &e.record).collect();

    for record in &records {
        match record {
            SyncRecord::Schema(definition) => {
                conn.execute(
                    "INSERT OR IGNORE INTO lix_stored_schema (key, version, definition) VALUES (?, ?, ?)",
                    params![
                        definition.key,
                        definition.version,
                        serde_json::to_string(definition)?
                    ],
                )?;
            }
            SyncRecord::Snapshot { id, content } => {
                let stored = snapshots.put(conn, content.as_ref())?;
                if &stored != id {
                    return Err(Error::GraphInconsistency(format!(
                        "snapshot '{id}' does not match its content"
                    )));
                }
            }
            _ => {}
        }
    }
    for record in &records {
        match record {
            SyncRecord::Change(change) => insert_change(conn, change)?,
            SyncRecord::ChangeSet(set) => insert_change_set(conn, set)?,
            _ => {}
        }
    }
    for record in &records {
        if let SyncRecord::ChangeEdge(edge) = record {
            insert_change_edge(conn, edge)?;
        }
    }
    insert_commits_in_order(
        conn,
        records
            .iter()
            .filter_map(|r| match r {
                SyncRecord::Commit(c) => Some(c),
                _ => None,
            })
            .collect(),
    )?;

    let incoming: Vec<&Version> = records
        .iter()
        .filter_map(|r| match r {
            SyncRecord::Version(v) => Some(v),
            _ => None,
        })
        .collect();
    if !incoming.is_empty() {
        let graph = GraphIndex::load(conn)?;
        reconcile_versions(ctx, &graph, &incoming, &mut report)?;
    }

    StateCache::mark_stale(conn, &StaleScope::All)?;
    tracing::info!(
        applied = report.applied,
        advanced = report.advanced.len(),
        conflicts = report.conflicts.len(),
        "sync entries applied"
    );
    Ok(report)
}

/// Inserts commits so that parents always land before children.
fn insert_commits_in_order(conn: &Connection, mut pending: Vec<&Commit>) -> Result<()> {
    while !pending.is_empty() {
        let before = pending.len();
        let mut blocked = Vec::new();
        for commit in pending {
            let mut ready = true;
            for parent in &commit.parent_commit_ids {
                if !commit_exists(conn, parent)? {
                    ready = false;
                    break;
                }
            }
            if ready {
                insert_commit(conn, commit)?;
            } else {
                blocked.push(commit);
            }
        }
        if blocked.len() == before {
            return Err(Error::GraphInconsistency(format!(
                "{} incoming commits reference missing parents",
                blocked.len()
            )));
        }
        pending = blocked;
    }
    Ok(())
}

fn reconcile_versions(
    ctx: &WriteContext<'_>,
    graph: &GraphIndex,
    incoming: &[&Version],
    report: &mut SyncReport,
) -> Result<()> {
    // Per version, the incoming heads no other incoming head descends from.
    let mut order: Vec<VersionId> = Vec::new();
    let mut heads: HashMap<VersionId, Vec<&Version>> = HashMap::new();
    for version in incoming {
        if !heads.contains_key(&version.id) {
            order.push(version.id.clone());
        }
        heads.entry(version.id.clone()).or_default().push(version);
    }

    for id in order {
        let candidates = &heads[&id];
        let mut tips: Vec<&Version> = Vec::new();
        let mut seen_commits = HashSet::new();
        for candidate in candidates.iter().rev() {
            if !seen_commits.insert(candidate.commit_id.clone()) {
                continue;
            }
            let mut superseded = false;
            for other in candidates.iter() {
                if other.commit_id != candidate.commit_id
                    && graph.is_ancestor(&candidate.commit_id, &other.commit_id)?
                {
                    superseded = true;
                    break;
                }
            }
            if !superseded {
                tips.push(candidate);
            }
        }
        for tip in tips {
            reconcile_one(ctx, graph, tip, report)?;
        }
    }
    Ok(())
}

fn reconcile_one(
    ctx: &WriteContext<'_>,
    graph: &GraphIndex,
    remote: &Version,
    report: &mut SyncReport,
) -> Result<()> {
    let conn = ctx.conn;
    let versions = version_map(conn)?;

    let Some(local) = versions.get(&remote.id) else {
        let mut created = remote.clone();
        created.is_active = false;
        if versions.values().any(|v| v.name == created.name) {
            let id = created.id.as_str();
            let start = id.char_indices().rev().nth(7).map_or(0, |(i, _)| i);
            created.name = format!("{}-{}", created.name, &id[start..]);
        }
        upsert_version(conn, &created)?;
        report.advanced.push(created.id.clone());
        return Ok(());
    };

    if graph.is_ancestor(&remote.commit_id, &local.commit_id)? {
        return Ok(());
    }
    let mut updated = local.clone();
    if graph.is_ancestor(&local.commit_id, &remote.commit_id)? {
        updated.commit_id = remote.commit_id.clone();
        upsert_version(conn, &updated)?;
        report.advanced.push(updated.id.clone());
        return Ok(());
    }

    let heads = [local.commit_id.clone(), remote.commit_id.clone()];
    report.conflicts.extend(graph.conflicts(&heads)?);
    let empty = ctx.create_change_set(&[])?;
    let merge = ctx.create_commit(&empty.id, &heads)?;
    updated.commit_id = merge.id.clone();
    upsert_version(conn, &updated)?;
    ctx.journal(&SyncRecord::Version(updated.clone()))?;
    tracing::warn!(
        version_id = %updated.id,
        local = %local.commit_id,
        remote = %remote.commit_id,
        merge = %merge.id,
        "diverged version merged during sync"
    );
    report.advanced.push(updated.id);
    Ok(())
}

// =============================================================================
// Wire Protocol
// =============================================================================

pub const ROUTE_QUERY: &str = "/query";
pub const ROUTE_PULL: &str = "/pull-v1";
pub const ROUTE_PUSH: &str = "/push-v1";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequest {
    pub store_id: String,
    pub vector_clock: VectorClock,
    /// Only return the remote clock.
    #[serde(default)]
    pub clock_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullResponse {
    pub vector_clock: VectorClock,
    pub data: Vec<LogEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushRequest {
    pub store_id: String,
    pub vector_clock: VectorClock,
    pub data: Vec<LogEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushResponse {
    pub vector_clock: VectorClock,
    pub report: SyncReport,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryRequest {
    pub store_id: String,
    pub statement: Statement,
}

/// Error body of a failed route.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteError {
    pub code: SyncErrorCode,
    pub message: String,
}

impl From<RemoteError> for Error {
    fn from(e: RemoteError) -> Self {
        Error::Remote {
            code: e.code,
            message: e.message,
        }
    }
}

/// Moves JSON bodies to a sync server.
///
/// Implementations only provide [`request`](SyncTransport::request); the typed
/// calls are built on top of it.
#[async_trait]
pub trait SyncTransport: Send + Sync {
    async fn request(&self, route: &str, body: Value) -> Result<Value>;

    async fn pull(&self, request: PullRequest) -> Result<PullResponse> {
        let body = self.request(ROUTE_PULL, serde_json::to_value(request)?).await?;
        Ok(serde_json::from_value(body)?)
    }

    async fn push(&self, request: PushRequest) -> Result<PushResponse> {
        let body = self.request(ROUTE_PUSH, serde_json::to_value(request)?).await?;
        Ok(serde_json::from_value(body)?)
    }

    async fn query(&self, request: QueryRequest) -> Result<QueryOutput> {
        let body = self.request(ROUTE_QUERY, serde_json::to_value(request)?).await?;
        Ok(serde_json::from_value(body)?)
    }
}

// =============================================================================
// Server
// =============================================================================

/// Hosts stores by id and answers the sync routes.
#[derive(Default)]
pub struct SyncServer {
    stores: RwLock<HashMap<String, Lix>>,
}

impl SyncServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hosts an open store under its store id.
    pub async fn host(&self, lix: Lix) -> Result<String> {
        let store_id = lix.store_id().await?;
        self.stores.write().await.insert(store_id.clone(), lix);
        tracing::info!(store_id = %store_id, "store hosted");
        Ok(store_id)
    }

    /// Opens a store from an uploaded blob and hosts it.
    pub async fn host_blob(&self, blob: Vec<u8>) -> std::result::Result<String, RemoteError> {
        let lix = Lix::open_blob(blob, Default::default())
            .await
            .map_err(|e| remote(SyncErrorCode::InvalidStoreFile, e))?;
        self.host(lix)
            .await
            .map_err(|e| remote(SyncErrorCode::InvalidStoreFile, e))
    }

    pub async fn store_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.stores.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Dispatches one route.
    pub async fn handle(&self, route: &str, body: Value) -> std::result::Result<Value, RemoteError> {
        match route {
            ROUTE_PULL => {
                let request: PullRequest = parse(body, SyncErrorCode::FailedToFetchData)?;
                let lix = self.store(&request.store_id).await?;
                let response = Self::pull(&lix, request)
                    .await
                    .map_err(|e| remote(SyncErrorCode::FailedToFetchData, e))?;
                encode(response)
            }
            ROUTE_PUSH => {
                let request: PushRequest = parse(body, SyncErrorCode::FailedToFetchData)?;
                let lix = self.store(&request.store_id).await?;
                let report = lix
                    .apply_sync_entries(request.data)
                    .await
                    .map_err(|e| remote(SyncErrorCode::FailedToFetchData, e))?;
                let vector_clock = lix
                    .vector_clock()
                    .await
                    .map_err(|e| remote(SyncErrorCode::FailedToFetchData, e))?;
                encode(PushResponse {
                    vector_clock,
                    report,
                })
            }
            ROUTE_QUERY => {
                let request: QueryRequest = parse(body, SyncErrorCode::InvalidQuery)?;
                let lix = self.store(&request.store_id).await?;
                let output = lix
                    .execute(request.statement)
                    .await
                    .map_err(|e| remote(SyncErrorCode::InvalidQuery, e))?;
                encode(output)
            }
            other => Err(RemoteError {
                code: SyncErrorCode::InvalidQuery,
                message: format!("unknown route '{other}'"),
            }),
        }
    }

    async fn pull(lix: &Lix, request: PullRequest) -> Result<PullResponse> {
        let vector_clock = lix.vector_clock().await?;
        let data = if request.clock_only {
            Vec::new()
        } else {
            lix.sync_entries_after(request.vector_clock).await?
        };
        tracing::debug!(entries = data.len(), "pull served");
        Ok(PullResponse { vector_clock, data })
    }

    async fn store(&self, store_id: &str) -> std::result::Result<Lix, RemoteError> {
        self.stores
            .read()
            .await
            .get(store_id)
            .cloned()
            .ok_or_else(|| RemoteError {
                code: SyncErrorCode::InvalidStoreFile,
                message: format!("store '{store_id}' is not hosted"),
            })
    }
}

fn remote(code: SyncErrorCode, error: Error) -> RemoteError {
    RemoteError {
        code,
        message: error.to_string(),
    }
}

fn parse<T: serde::de::DeserializeOwned>(
    body: Value,
    code: SyncErrorCode,
) -> std::result::Result<T, RemoteError> {
    serde_json::from_value(body).map_err(|e| RemoteError {
        code,
        message: format!("malformed request body: {e}"),
    })
}

fn encode<T: Serialize>(value: T) -> std::result::Result<Value, RemoteError> {
    serde_json::to_value(value).map_err(|e| RemoteError {
        code: SyncErrorCode::FailedToFetchData,
        message: e.to_string(),
    })
}

/// A transport that calls a [`SyncServer`] in the same process.
///
/// Bodies still round-trip through JSON text, so the wire format is exercised.
/// `latency` delays every call, which lets tests provoke timeouts.
#[derive(Clone)]
pub struct InProcessTransport {
    server: std::sync::Arc<SyncServer>,
    latency: Option<Duration>,
}

impl InProcessTransport {
    pub fn new(server: std::sync::Arc<SyncServer>) -> Self {
        Self {
            server,
            latency: None,
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }
}

#[async_trait]
impl SyncTransport for InProcessTransport {
    async fn request(&self, route: &str, body: Value) -> Result<Value> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        let wire = serde_json::to_string(&body)?;
        let body: Value = serde_json::from_str(&wire)?;
        match self.server.handle(route, body).await {
            Ok(response) => Ok(serde_json::from_str(&serde_json::to_string(&response)?)?),
            Err(e) => Err(e.into()),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
