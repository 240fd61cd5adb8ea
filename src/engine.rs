//! # Engine
//!
//! The synchronous core. One [`Engine`] owns the SQLite connection of a store
//! together with everything derived from it (schema registry, snapshot LRU,
//! sequencer, plugins) and runs on the worker thread; the async
//! [`Lix`](crate::Lix) handle only ships closures to it.
//!
//! ## Transactions
//!
//! ```text
//!   begin() ──► Transaction { overlay, active }
//!                  │ execute / write_file / set_key_value   (staged)
//!                  ▼
//!               commit()
//!                  │ BEGIN IMMEDIATE
//!                  │ per version with staged writes:
//!                  │   tracked rows  ──► changes (parents = current leaves)
//!                  │                 ──► change set ──► commit [head]
//!                  │                 ──► version head moves
//!                  │   untracked rows ──► lix_untracked_state
//!                  │ mark touched schemas stale, persist sequencer
//!                  │ COMMIT (ROLLBACK on any error)
//!                  ▼
//!               broadcast CommitNotification per advanced version
//! ```
//!
//! A staged write whose content equals the version's own single leaf is
//! elided, as is a delete of an entity that is not visible anywhere in the
//! inheritance chain.
//!
//! ## Fresh Stores
//!
//! An empty store is bootstrapped with an empty root commit, the `global`
//! version and a `main` version inheriting from it, which becomes active.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::cache::{StaleScope, StateCache};
use crate::change::{self, WriteContext};
use crate::commit;
use crate::config::LixConfig;
use crate::error::{Error, Result};
use crate::file::{self, FileDescriptor, MaterializedFile};
use crate::graph::{GraphCache, GraphIndex, LeafResolution};
use crate::merge::{self, MergeOutcome, MergeStrategy};
use crate::overlay::{OverlayEntry, TransactionOverlay};
use crate::plugin::{Plugin, PluginRegistry};
use crate::query::{self, InsertRow, QueryEnv, QueryOutput, QueryPlan, StateFilter, Statement, View};
use crate::registry::{
    SchemaDefinition, SchemaRegistry, ENTITY_LABEL_SCHEMA, KEY_VALUE_SCHEMA, LABEL_SCHEMA,
};
use crate::schema::Database;
use crate::sequence::{self, Sequencer};
use crate::snapshot::{snapshot_id, SnapshotStore};
use crate::subscription::{CommitNotification, CommitSubscription, SubscriptionManager};
use crate::sync::{self, LogEntry, SyncRecord, SyncReport, VectorClock};
use crate::types::{
    Change, ChangeConflict, ChangeEdge, ChangeId, ChangeProposal, ChangeSet, Commit, CommitId,
    EntityDiff, EntityKey, ProposalId, StateRow, Version, VersionId, GLOBAL_VERSION_ID, LIX_FILE_ID,
    MAIN_VERSION_NAME,
};
use crate::untracked;
use crate::version::{self, active_version_id, inheritance_chain, load_version, version_map, AdvanceMode};

/// Key-value entity (in `global`) holding `{"enabled": bool}`.
pub const DETERMINISTIC_MODE_KEY: &str = "lix_deterministic_mode";

/// Name of the label [`Engine::create_checkpoint`] attaches.
pub const CHECKPOINT_LABEL: &str = "checkpoint";

/// `schema_key` used when labeling a commit.
pub const COMMIT_SCHEMA_KEY: &str = "lix_commit";

// =============================================================================
// Operation Types
// =============================================================================

/// Options for [`Engine::create_version`]. Everything defaults sensibly.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateVersionOptions {
    /// Generated by the sequencer when absent.
    pub name: Option<String>,
    /// Version whose head is copied. Defaults to the active version.
    pub from: Option<VersionId>,
    /// Defaults to `global`.
    pub inherits_from: Option<VersionId>,
}

impl CreateVersionOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            ..Self::default()
        }
    }

    pub fn from(mut self, version: impl Into<VersionId>) -> Self {
        self.from = Some(version.into());
        self
    }

    pub fn inherits_from(mut self, version: impl Into<VersionId>) -> Self {
        self.inherits_from = Some(version.into());
        self
    }
}

/// Result of switching the active version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchOutcome {
    pub previous: Option<VersionId>,
    /// Files whose entities differ between the two versions.
    pub files: Vec<MaterializedFile>,
}

/// A `lix_label` entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub id: String,
    pub name: String,
}

// =============================================================================
// Transaction
// =============================================================================

/// Staged writes against one engine. Dropping without [`commit`](Self::commit)
/// discards them.
pub struct Transaction<'e> {
    engine: &'e mut Engine,
    overlay: TransactionOverlay,
    active: VersionId,
}

impl Transaction<'_> {
    fn env(&mut self) -> QueryEnv<'_> {
        QueryEnv {
            conn: self.engine.db.connection(),
            snapshots: &mut self.engine.snapshots,
            graphs: &self.engine.graphs,
            registry: &mut self.engine.registry,
            seq: &self.engine.seq,
            overlay: &mut self.overlay,
            active_version: &self.active,
            max_depth: self.engine.config.max_inheritance_depth,
        }
    }

    /// The version `state` addresses in this transaction.
    pub fn active_version(&self) -> &VersionId {
        &self.active
    }

    pub fn execute(&mut self, statement: &Statement) -> Result<QueryOutput> {
        self.env().execute(statement)
    }

    pub fn explain(&mut self, statement: &Statement) -> Result<QueryPlan> {
        self.env().explain(statement)
    }

    /// Rows of any version, including this transaction's staged writes.
    pub fn read(&mut self, version: &VersionId, filter: &StateFilter) -> Result<Vec<StateRow>> {
        self.env().read(version, filter)
    }

    /// A fresh id from the engine's sequencer.
    pub fn new_id(&self) -> String {
        self.engine.seq.uuid()
    }

    pub fn write_file(&mut self, path: &str, data: &[u8]) -> Result<usize> {
        let plugins = self.engine.plugins.clone();
        file::write_file(&mut self.env(), &plugins, path, data)
    }

    pub fn read_file(&mut self, path: &str) -> Result<Option<Vec<u8>>> {
        let plugins = self.engine.plugins.clone();
        let active = self.active.clone();
        file::read_file(&mut self.env(), &plugins, &active, path)
    }

    pub fn delete_file(&mut self, path: &str) -> Result<usize> {
        file::delete_file(&mut self.env(), path)
    }

    pub fn list_files(&mut self) -> Result<Vec<FileDescriptor>> {
        let active = self.active.clone();
        file::list_files(&mut self.env(), &active)
    }

    /// Stages `key = value` in the active version.
    pub fn set_key_value(&mut self, key: &str, value: Value) -> Result<()> {
        self.execute(&Statement::insert(
            View::State,
            None,
            vec![InsertRow::new(KEY_VALUE_SCHEMA, json!({ "key": key, "value": value }))],
        ))?;
        Ok(())
    }

    /// Stages `key = value` in `version`.
    pub fn set_key_value_in(&mut self, version: &VersionId, key: &str, value: Value) -> Result<()> {
        self.execute(&Statement::insert(
            View::StateAll,
            Some(version.clone()),
            vec![InsertRow::new(KEY_VALUE_SCHEMA, json!({ "key": key, "value": value }))],
        ))?;
        Ok(())
    }

    pub fn get_key_value(&mut self, key: &str) -> Result<Option<Value>> {
        let active = self.active.clone();
        self.get_key_value_in(&active, key)
    }

    pub fn get_key_value_in(&mut self, version: &VersionId, key: &str) -> Result<Option<Value>> {
        let rows = self.read(version, &StateFilter::schema(KEY_VALUE_SCHEMA).entity(key))?;
        Ok(rows
            .into_iter()
            .next()
            .and_then(|row| row.snapshot_content.get("value").cloned()))
    }

    /// Number of staged writes.
    pub fn staged(&self) -> usize {
        self.overlay.len()
    }

    /// Turns the staged writes into commits.
    pub fn commit(self) -> Result<Vec<CommitNotification>> {
        let Transaction {
            engine,
            mut overlay,
            ..
        } = self;
        engine.commit_overlay(&mut overlay)
    }

    /// Discards the staged writes.
    pub fn rollback(self) {
        persist_high_water(self.engine.db.connection(), &self.engine.seq);
        tracing::debug!(staged = self.overlay.len(), "transaction rolled back");
    }
}

// =============================================================================
// Engine
// =============================================================================

/// Owner of one open store.
pub struct Engine {
    db: Database,
    registry: SchemaRegistry,
    snapshots: SnapshotStore,
    graphs: GraphCache,
    seq: Sequencer,
    session_id: String,
    config: LixConfig,
    plugins: PluginRegistry,
    subscriptions: SubscriptionManager,
}

impl Engine {
    /// Wraps an initialized database, bootstrapping a fresh store.
    pub fn new(db: Database, config: LixConfig) -> Result<Self> {
        let seq = Sequencer::load(db.connection(), config.deterministic)?;
        let mut engine = Self {
            db,
            registry: SchemaRegistry::new(),
            snapshots: SnapshotStore::new(config.snapshot_cache_capacity),
            graphs: GraphCache::new(),
            seq,
            session_id: uuid::Uuid::new_v4().to_string(),
            subscriptions: SubscriptionManager::new(config.broadcast_capacity),
            plugins: PluginRegistry::new(),
            config,
        };
        if version::list_versions(engine.db.connection())?.is_empty() {
            engine.bootstrap()?;
        }
        engine.refresh_deterministic()?;
        tracing::info!(
            session_id = %engine.session_id,
            deterministic = engine.seq.is_deterministic(),
            "engine opened"
        );
        Ok(engine)
    }

    fn bootstrap(&mut self) -> Result<()> {
        let Engine {
            db, seq, session_id, graphs, ..
        } = self;
        let conn = db.connection();
        let main = in_transaction(conn, seq, graphs, || {
            let ctx = WriteContext::new(conn, seq, session_id);
            let empty = ctx.create_change_set(&[])?;
            let root = ctx.create_commit(&empty.id, &[])?;
            ctx.create_version(VersionId::global(), GLOBAL_VERSION_ID, &root.id, None)?;
            let main = ctx.create_version(
                VersionId::new(seq.uuid()),
                MAIN_VERSION_NAME,
                &root.id,
                Some(&VersionId::global()),
            )?;
            version::switch_active(conn, None, &main.id)?;
            seq.persist(conn)?;
            Ok(main)
        })?;
        tracing::info!(main = %main.id, "fresh store bootstrapped");

        if self.config.deterministic {
            self.transaction(|tx| {
                tx.set_key_value_in(
                    &VersionId::global(),
                    DETERMINISTIC_MODE_KEY,
                    json!({ "enabled": true }),
                )
            })?;
        }
        Ok(())
    }

    /// Deterministic if configured at open or enabled by the stored flag.
    fn refresh_deterministic(&mut self) -> Result<()> {
        let stored = self
            .key_value_in(&VersionId::global(), DETERMINISTIC_MODE_KEY)?
            .and_then(|v| v.get("enabled").and_then(Value::as_bool))
            .unwrap_or(false);
        self.apply_mode(stored)
    }

    /// Sets the effective mode from the stored flag. Entering deterministic
    /// mode lifts the counter past every stored timestamp.
    fn apply_mode(&self, stored: bool) -> Result<()> {
        let enabled = self.config.deterministic || stored;
        self.seq.set_deterministic(enabled);
        if enabled {
            let conn = self.db.connection();
            if let Some(latest) = sequence::latest_timestamp_millis(conn)? {
                if self.seq.raise_to(latest + 1) {
                    self.seq.persist(conn)?;
                    tracing::debug!(counter = self.seq.current(), "sequence lifted past stored timestamps");
                }
            }
        }
        Ok(())
    }

    pub fn is_deterministic(&self) -> bool {
        self.seq.is_deterministic()
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn store_id(&self) -> Result<String> {
        self.db.store_id()
    }

    pub fn connection(&self) -> &Connection {
        self.db.connection()
    }

    fn ctx(&self) -> WriteContext<'_> {
        WriteContext::new(self.db.connection(), &self.seq, &self.session_id)
    }

    /// Runs `f` against a read-only query environment.
    fn with_env<T>(&mut self, f: impl FnOnce(&mut QueryEnv<'_>) -> Result<T>) -> Result<T> {
        let active = active_version_id(self.db.connection())?;
        let mut overlay = TransactionOverlay::new();
        let mut env = QueryEnv {
            conn: self.db.connection(),
            snapshots: &mut self.snapshots,
            graphs: &self.graphs,
            registry: &mut self.registry,
            seq: &self.seq,
            overlay: &mut overlay,
            active_version: &active,
            max_depth: self.config.max_inheritance_depth,
        };
        f(&mut env)
    }

    // =========================================================================
    // Transactions and Queries
    // =========================================================================

    pub fn begin(&mut self) -> Result<Transaction<'_>> {
        let active = active_version_id(self.db.connection())?;
        Ok(Transaction {
            engine: self,
            overlay: TransactionOverlay::new(),
            active,
        })
    }

    /// Runs `f` in a transaction, committing on `Ok` and discarding on `Err`.
    pub fn transaction<T>(&mut self, f: impl FnOnce(&mut Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut tx = self.begin()?;
        match f(&mut tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(e) => {
                tx.rollback();
                Err(e)
            }
        }
    }

    /// Executes one statement in its own transaction.
    pub fn execute(&mut self, statement: &Statement) -> Result<QueryOutput> {
        self.transaction(|tx| tx.execute(statement))
    }

    pub fn explain(&mut self, statement: &Statement) -> Result<QueryPlan> {
        self.with_env(|env| env.explain(statement))
    }

    /// Tracked state of `version` resolved straight from the graph.
    pub fn resolve_direct(&mut self, version: &VersionId, schema_key: &str) -> Result<Vec<StateRow>> {
        let graph = self.graphs.get(self.db.connection())?;
        query::resolve_direct(
            self.db.connection(),
            &graph,
            &mut self.snapshots,
            version,
            schema_key,
            self.config.max_inheritance_depth,
        )
    }

    fn commit_overlay(&mut self, overlay: &mut TransactionOverlay) -> Result<Vec<CommitNotification>> {
        if overlay.is_empty() {
            return Ok(Vec::new());
        }
        let grouped = overlay.drain();
        let staged: HashSet<(&VersionId, &EntityKey)> = grouped
            .iter()
            .flat_map(|(version, entries)| entries.iter().map(move |e| (version, &e.key)))
            .collect();
        let flag = grouped.get(&VersionId::global()).and_then(|entries| {
            entries
                .iter()
                .find(|e| {
                    !e.untracked
                        && e.key.schema_key == KEY_VALUE_SCHEMA
                        && e.key.entity_id == DETERMINISTIC_MODE_KEY
                })
                .map(|e| {
                    e.content
                        .as_ref()
                        .and_then(|c| c.pointer("/value/enabled"))
                        .and_then(Value::as_bool)
                        .unwrap_or(false)
                })
        });

        let Engine {
            db,
            snapshots,
            seq,
            session_id,
            config,
            graphs,
            ..
        } = self;
        let conn = db.connection();
        let max_depth = config.max_inheritance_depth;
        let notifications = in_transaction(conn, seq, graphs, || {
            let ctx = WriteContext::new(conn, seq, session_id);
            let graph = graphs.get(conn)?;
            let versions = version_map(conn)?;
            let mut leaves = LeafCache::default();
            let mut notifications = Vec::new();

            for (version_id, entries) in &grouped {
                let version = versions
                    .get(version_id)
                    .ok_or_else(|| Error::not_found("version", version_id.as_str()))?;
                let chain = inheritance_chain(&versions, version_id, max_depth)?;

                let mut changes: Vec<Change> = Vec::new();
                for entry in entries {
                    if entry.untracked {
                        match &entry.content {
                            Some(content) => untracked::upsert(
                                conn,
                                version_id,
                                &entry.key,
                                &entry.schema_version,
                                &entry.plugin_key,
                                content,
                                &entry.staged_at,
                            )?,
                            None => {
                                untracked::delete(conn, version_id, &entry.key)?;
                            }
                        }
                        continue;
                    }

                    // A tracked write supersedes an own untracked row.
                    untracked::delete(conn, version_id, &entry.key)?;
                    let own = leaves.of(&graph, &version.commit_id)?.get(&entry.key).cloned();
                    // Committed ancestor leaves are stale while an ancestor level
                    // stages the same entity.
                    let ancestor_staged = own.is_none()
                        && chain
                            .iter()
                            .skip(1)
                            .any(|level| staged.contains(&(level, &entry.key)));
                    if !ancestor_staged
                        && is_redundant(conn, &graph, &versions, &chain, &mut leaves, own.as_ref(), entry)?
                    {
                        continue;
                    }
                    let parents = own.map(|res| res.leaves).unwrap_or_default();
                    let change = ctx.record_change(
                        snapshots,
                        &entry.key,
                        &entry.schema_version,
                        &entry.plugin_key,
                        entry.content.as_ref(),
                        &parents,
                    )?;
                    changes.push(change);
                }
                if changes.is_empty() {
                    continue;
                }

                let schema_keys: BTreeSet<String> =
                    changes.iter().map(|c| c.schema_key.clone()).collect();
                let change_set = ctx.create_change_set(&changes)?;
                let commit =
                    ctx.create_commit(&change_set.id, std::slice::from_ref(&version.commit_id))?;
                ctx.set_version_head(version_id, &commit.id)?;
                for schema_key in &schema_keys {
                    StateCache::mark_stale(conn, &StaleScope::Schema(schema_key.clone()))?;
                }
                tracing::info!(
                    version_id = %version_id,
                    commit_id = %commit.id,
                    changes = changes.len(),
                    "transaction committed"
                );
                notifications.push(CommitNotification {
                    version_id: version_id.clone(),
                    commit_id: commit.id,
                    schema_keys: schema_keys.into_iter().collect(),
                });
            }
            seq.persist(conn)?;
            Ok(notifications)
        })?;

        if let Some(enabled) = flag {
            if let Err(e) = self.apply_mode(enabled) {
                tracing::warn!(error = %e, "failed to lift the sequence counter");
            }
        }
        self.subscriptions.broadcast(notifications.clone());
        Ok(notifications)
    }

    fn notify_heads(&self, versions: &[VersionId]) -> Result<()> {
        let mut notifications = Vec::with_capacity(versions.len());
        for id in versions {
            let version = load_version(self.db.connection(), id)?;
            notifications.push(CommitNotification {
                version_id: version.id,
                commit_id: version.commit_id,
                schema_keys: Vec::new(),
            });
        }
        self.subscriptions.broadcast(notifications);
        Ok(())
    }

    // =========================================================================
    // Schemas and Plugins
    // =========================================================================

    /// Registers (or re-registers) a schema and journals new definitions.
    pub fn register_schema(&mut self, definition: SchemaDefinition) -> Result<()> {
        let Engine {
            db,
            registry,
            seq,
            session_id,
            graphs,
            ..
        } = self;
        let conn = db.connection();
        in_transaction(conn, seq, graphs, || {
            let known: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM lix_stored_schema WHERE key = ? AND version = ?)",
                [&definition.key, &definition.version],
                |row| row.get(0),
            )?;
            registry.register(conn, definition.clone())?;
            if !known {
                WriteContext::new(conn, seq, session_id).journal(&SyncRecord::Schema(definition))?;
            }
            Ok(())
        })
    }

    pub fn schemas(&self) -> Result<Vec<SchemaDefinition>> {
        self.registry.list(self.db.connection())
    }

    /// Registers a plugin together with the schemas it emits.
    pub fn register_plugin(&mut self, plugin: Arc<dyn Plugin>) -> Result<()> {
        if self.plugins.get(plugin.key()).is_ok() {
            return Err(Error::InvalidArgument(format!(
                "plugin '{}' is already registered",
                plugin.key()
            )));
        }
        for definition in plugin.schemas() {
            self.register_schema(definition)?;
        }
        self.plugins.register(plugin)
    }

    pub fn plugin_keys(&self) -> Vec<String> {
        self.plugins.keys()
    }

    // =========================================================================
    // Versions
    // =========================================================================

    pub fn active_version(&self) -> Result<Version> {
        let id = active_version_id(self.db.connection())?;
        load_version(self.db.connection(), &id)
    }

    pub fn versions(&self) -> Result<Vec<Version>> {
        version::list_versions(self.db.connection())
    }

    pub fn version(&self, id: &VersionId) -> Result<Version> {
        load_version(self.db.connection(), id)
    }

    pub fn create_version(&mut self, options: CreateVersionOptions) -> Result<Version> {
        let conn = self.db.connection();
        let from = match options.from {
            Some(id) => id,
            None => active_version_id(conn)?,
        };
        let head = load_version(conn, &from)?.commit_id;
        let inherits = options.inherits_from.unwrap_or_else(VersionId::global);
        let name = options.name.unwrap_or_else(|| self.seq.human_name());
        let id = VersionId::new(self.seq.uuid());

        let ctx = self.ctx();
        let (seq, graphs) = (&self.seq, &self.graphs);
        in_transaction(conn, seq, graphs, || {
            let created = ctx.create_version(id.clone(), &name, &head, Some(&inherits))?;
            StateCache::mark_stale(conn, &StaleScope::Version(created.id.clone()))?;
            self.seq.persist(conn)?;
            Ok(created)
        })
    }

    /// Compare-and-swap of the active version. `expected = None` skips the
    /// comparison.
    pub fn switch_active_version(
        &mut self,
        next: &VersionId,
        expected: Option<&VersionId>,
    ) -> Result<SwitchOutcome> {
        let current = active_version_id(self.db.connection())?;
        if let Some(expected) = expected {
            if expected != &current {
                return Err(Error::ActiveVersionChanged {
                    expected: expected.to_string(),
                    actual: current.to_string(),
                });
            }
        }
        load_version(self.db.connection(), next)?;

        // Files first: a failing plugin must leave the pointer where it was.
        let files = if &current != next {
            let plugins = self.plugins.clone();
            self.with_env(|env| file::changed_files(env, &plugins, &current, next))?
        } else {
            Vec::new()
        };
        let previous = version::switch_active(self.db.connection(), Some(&current), next)?;
        tracing::info!(
            from = previous.as_ref().map(VersionId::as_str),
            to = %next,
            files = files.len(),
            "active version switched"
        );
        Ok(SwitchOutcome { previous, files })
    }

    pub fn delete_version(&mut self, id: &VersionId) -> Result<()> {
        let conn = self.db.connection();
        let (seq, graphs) = (&self.seq, &self.graphs);
        in_transaction(conn, seq, graphs, || {
            version::delete_version(conn, id)?;
            StateCache::mark_stale(conn, &StaleScope::All)
        })?;
        tracing::info!(version_id = %id, "version deleted");
        Ok(())
    }

    pub fn advance_version(&mut self, id: &VersionId, target: &CommitId, mode: AdvanceMode) -> Result<Version> {
        let conn = self.db.connection();
        let ctx = self.ctx();
        let (seq, graphs) = (&self.seq, &self.graphs);
        let version = in_transaction(conn, seq, graphs, || {
            let graph = graphs.get(conn)?;
            let version = ctx.advance_version(&graph, id, target, mode)?;
            StateCache::mark_stale(conn, &StaleScope::All)?;
            Ok(version)
        })?;
        self.notify_heads(std::slice::from_ref(id))?;
        Ok(version)
    }

    pub fn merge_version(
        &mut self,
        source: &VersionId,
        target: &VersionId,
        strategy: MergeStrategy,
    ) -> Result<MergeOutcome> {
        let Engine {
            db,
            snapshots,
            seq,
            session_id,
            graphs,
            ..
        } = self;
        let conn = db.connection();
        let outcome = in_transaction(conn, seq, graphs, || {
            let ctx = WriteContext::new(conn, seq, session_id);
            let outcome = merge::merge_version(&ctx, snapshots, source, target, strategy)?;
            StateCache::mark_stale(conn, &StaleScope::All)?;
            seq.persist(conn)?;
            Ok(outcome)
        })?;
        self.notify_heads(std::slice::from_ref(target))?;
        Ok(outcome)
    }

    // =========================================================================
    // Conflicts, Proposals, Checkpoints
    // =========================================================================

    /// Entities of `version` with competing leaves.
    pub fn conflicts(&self, version: &VersionId) -> Result<Vec<ChangeConflict>> {
        let head = load_version(self.db.connection(), version)?.commit_id;
        self.graphs.get(self.db.connection())?.conflicts(&[head])
    }

    pub fn resolve_conflict(&mut self, version: &VersionId, key: &EntityKey, chosen: &ChangeId) -> Result<Commit> {
        let Engine {
            db,
            snapshots,
            seq,
            session_id,
            graphs,
            ..
        } = self;
        let conn = db.connection();
        let commit = in_transaction(conn, seq, graphs, || {
            let ctx = WriteContext::new(conn, seq, session_id);
            let commit = merge::resolve_conflict(&ctx, snapshots, version, key, chosen)?;
            StateCache::mark_stale(conn, &StaleScope::Schema(key.schema_key.clone()))?;
            seq.persist(conn)?;
            Ok(commit)
        })?;
        self.notify_heads(std::slice::from_ref(version))?;
        Ok(commit)
    }

    pub fn create_proposal(&mut self, source: &VersionId, target: &VersionId) -> Result<ChangeProposal> {
        let conn = self.db.connection();
        let ctx = self.ctx();
        let (seq, graphs) = (&self.seq, &self.graphs);
        in_transaction(conn, seq, graphs, || {
            let proposal = merge::create_proposal(&ctx, source, target)?;
            self.seq.persist(conn)?;
            Ok(proposal)
        })
    }

    pub fn accept_proposal(&mut self, id: &ProposalId, strategy: MergeStrategy) -> Result<MergeOutcome> {
        let target = merge::load_proposal(self.db.connection(), id)?.target_version_id;
        let Engine {
            db,
            snapshots,
            seq,
            session_id,
            graphs,
            ..
        } = self;
        let conn = db.connection();
        let outcome = in_transaction(conn, seq, graphs, || {
            let ctx = WriteContext::new(conn, seq, session_id);
            let outcome = merge::accept_proposal(&ctx, snapshots, id, strategy)?;
            StateCache::mark_stale(conn, &StaleScope::All)?;
            seq.persist(conn)?;
            Ok(outcome)
        })?;
        self.notify_heads(std::slice::from_ref(&target))?;
        Ok(outcome)
    }

    pub fn reject_proposal(&mut self, id: &ProposalId) -> Result<()> {
        merge::reject_proposal(self.db.connection(), id)
    }

    pub fn proposals(&self) -> Result<Vec<ChangeProposal>> {
        merge::list_proposals(self.db.connection())
    }

    /// Labels the active version's head commit as a checkpoint and returns it.
    pub fn create_checkpoint(&mut self) -> Result<CommitId> {
        let head = self.active_version()?.commit_id;
        let commit_id = head.clone();
        self.transaction(move |tx| {
            let global = VersionId::global();
            let existing = tx.read(
                &global,
                &StateFilter::schema(LABEL_SCHEMA).content_eq("name", json!(CHECKPOINT_LABEL)),
            )?;
            let label_id = match existing
                .first()
                .and_then(|row| row.snapshot_content.get("id"))
                .and_then(Value::as_str)
            {
                Some(id) => id.to_string(),
                None => {
                    let id = tx.new_id();
                    tx.execute(&Statement::insert(
                        View::StateAll,
                        Some(global.clone()),
                        vec![InsertRow::new(
                            LABEL_SCHEMA,
                            json!({ "id": id, "name": CHECKPOINT_LABEL }),
                        )],
                    ))?;
                    id
                }
            };
            tx.execute(&Statement::insert(
                View::StateAll,
                Some(global),
                vec![InsertRow::new(
                    ENTITY_LABEL_SCHEMA,
                    json!({
                        "entity_id": commit_id.as_str(),
                        "schema_key": COMMIT_SCHEMA_KEY,
                        "file_id": LIX_FILE_ID,
                        "label_id": label_id,
                    }),
                )],
            ))?;
            Ok(())
        })?;
        tracing::info!(commit_id = %head, "checkpoint created");
        Ok(head)
    }

    /// Labels defined in `global`.
    pub fn labels(&mut self) -> Result<Vec<Label>> {
        let rows = self.with_env(|env| env.read(&VersionId::global(), &StateFilter::schema(LABEL_SCHEMA)))?;
        Ok(rows
            .iter()
            .filter_map(|row| {
                Some(Label {
                    id: row.snapshot_content.get("id")?.as_str()?.to_string(),
                    name: row.snapshot_content.get("name")?.as_str()?.to_string(),
                })
            })
            .collect())
    }

    /// Commits labeled as checkpoints.
    pub fn checkpoints(&mut self) -> Result<Vec<CommitId>> {
        let Some(label) = self.labels()?.into_iter().find(|l| l.name == CHECKPOINT_LABEL) else {
            return Ok(Vec::new());
        };
        let filter = StateFilter::schema(ENTITY_LABEL_SCHEMA)
            .content_eq("label_id", json!(label.id))
            .content_eq("schema_key", json!(COMMIT_SCHEMA_KEY));
        let rows = self.with_env(|env| env.read(&VersionId::global(), &filter))?;
        Ok(rows
            .iter()
            .filter_map(|row| row.snapshot_content.get("entity_id")?.as_str().map(CommitId::new))
            .collect())
    }

    // =========================================================================
    // Files and Key-Values
    // =========================================================================

    pub fn read_file(&mut self, version: &VersionId, path: &str) -> Result<Option<Vec<u8>>> {
        let plugins = self.plugins.clone();
        self.with_env(|env| file::read_file(env, &plugins, version, path))
    }

    pub fn list_files(&mut self, version: &VersionId) -> Result<Vec<FileDescriptor>> {
        self.with_env(|env| file::list_files(env, version))
    }

    pub fn key_value_in(&mut self, version: &VersionId, key: &str) -> Result<Option<Value>> {
        let rows = self.with_env(|env| env.read(version, &StateFilter::schema(KEY_VALUE_SCHEMA).entity(key)))?;
        Ok(rows
            .into_iter()
            .next()
            .and_then(|row| row.snapshot_content.get("value").cloned()))
    }

    /// Every key-value visible in `version`.
    pub fn key_values(&mut self, version: &VersionId) -> Result<BTreeMap<String, Value>> {
        let rows = self.with_env(|env| env.read(version, &StateFilter::schema(KEY_VALUE_SCHEMA)))?;
        Ok(rows
            .into_iter()
            .map(|row| {
                let value = row.snapshot_content.get("value").cloned().unwrap_or(Value::Null);
                (row.entity_id, value)
            })
            .collect())
    }

    // =========================================================================
    // Administrative Reads
    // =========================================================================

    pub fn commits(&self) -> Result<Vec<Commit>> {
        commit::list_commits(self.db.connection())
    }

    pub fn commit_edges(&self) -> Result<Vec<(CommitId, CommitId)>> {
        commit::list_commit_edges(self.db.connection())
    }

    pub fn changes(&self) -> Result<Vec<Change>> {
        change::list_changes(self.db.connection())
    }

    pub fn change_edges(&self) -> Result<Vec<ChangeEdge>> {
        change::list_change_edges(self.db.connection())
    }

    pub fn change_sets(&self) -> Result<Vec<ChangeSet>> {
        change::list_change_sets(self.db.connection())
    }

    /// Per-entity comparison of two commits.
    pub fn diff(&mut self, before: &CommitId, after: &CommitId) -> Result<Vec<EntityDiff>> {
        let graph = self.graphs.get(self.db.connection())?;
        sync::diff(self.db.connection(), &graph, &mut self.snapshots, before, after)
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    pub fn collect_garbage(&mut self) -> Result<usize> {
        self.snapshots.collect_garbage(self.db.connection())
    }

    pub fn export_blob(&self) -> Result<Vec<u8>> {
        self.db.export_blob()
    }

    /// Rebuilds the cache rows of one schema.
    pub fn populate(&mut self, schema_key: &str) -> Result<usize> {
        let graph = self.graphs.get(self.db.connection())?;
        StateCache::populate(
            self.db.connection(),
            &graph,
            &mut self.snapshots,
            schema_key,
            self.config.max_inheritance_depth,
        )
    }

    pub fn mark_stale(&self, scope: &StaleScope) -> Result<()> {
        StateCache::mark_stale(self.db.connection(), scope)
    }

    pub fn subscribe(&self, version: Option<VersionId>) -> CommitSubscription {
        self.subscriptions.subscribe(version)
    }

    // =========================================================================
    // Sync
    // =========================================================================

    pub fn vector_clock(&self) -> Result<VectorClock> {
        sync::local_clock(self.db.connection())
    }

    pub fn sync_entries_after(&self, clock: &VectorClock) -> Result<Vec<LogEntry>> {
        sync::entries_after(self.db.connection(), clock)
    }

    /// Applies entries from a peer in one SQLite transaction.
    pub fn apply_sync_entries(&mut self, entries: &[LogEntry]) -> Result<SyncReport> {
        let Engine {
            db,
            snapshots,
            seq,
            session_id,
            graphs,
            ..
        } = self;
        let conn = db.connection();
        let report = in_transaction(conn, seq, graphs, || {
            let ctx = WriteContext::new(conn, seq, session_id);
            let report = sync::apply_entries(&ctx, snapshots, entries)?;
            seq.persist(conn)?;
            Ok(report)
        })?;
        self.refresh_deterministic()?;
        self.notify_heads(&report.advanced)?;
        Ok(report)
    }
}

// =============================================================================
// Commit Helpers
// =============================================================================

/// Runs `f` between `BEGIN IMMEDIATE` and `COMMIT`, rolling back on error.
///
/// A rollback can hand reused rowids to different graph rows, so the cached
/// graph index is dropped with it. The sequence counter is written again
/// outside the rolled-back transaction.
fn in_transaction<T>(
    conn: &Connection,
    seq: &Sequencer,
    graphs: &GraphCache,
    f: impl FnOnce() -> Result<T>,
) -> Result<T> {
    conn.execute_batch("BEGIN IMMEDIATE")?;
    let result = f().and_then(|value| {
        conn.execute_batch("COMMIT")?;
        Ok(value)
    });
    if result.is_err() {
        let _ = conn.execute_batch("ROLLBACK");
        graphs.invalidate();
        persist_high_water(conn, seq);
    }
    result
}

/// Best-effort write of the counter after discarded work consumed values.
fn persist_high_water(conn: &Connection, seq: &Sequencer) {
    if let Err(e) = seq.persist(conn) {
        tracing::warn!(error = %e, "failed to persist the sequence counter");
    }
}

/// Leaf resolutions per head, computed on first use.
#[derive(Default)]
struct LeafCache {
    by_head: HashMap<CommitId, BTreeMap<EntityKey, LeafResolution>>,
}

impl LeafCache {
    fn of(&mut self, graph: &GraphIndex, head: &CommitId) -> Result<&BTreeMap<EntityKey, LeafResolution>> {
        if !self.by_head.contains_key(head) {
            let resolved = graph.resolve_leaves(std::slice::from_ref(head))?;
            self.by_head.insert(head.clone(), resolved);
        }
        self.by_head
            .get(head)
            .ok_or_else(|| Error::GraphInconsistency(format!("commit '{head}' did not resolve")))
    }
}

/// True when recording `entry` would not change what the version shows.
///
/// Only committed state is consulted, so callers must not ask while an
/// ancestor level has staged writes for the same entity.
fn is_redundant(
    conn: &Connection,
    graph: &GraphIndex,
    versions: &HashMap<VersionId, Version>,
    chain: &[VersionId],
    leaves: &mut LeafCache,
    own: Option<&LeafResolution>,
    entry: &OverlayEntry,
) -> Result<bool> {
    if let Some(res) = own {
        if res.leaves.len() > 1 {
            return Ok(false);
        }
        let same_content = res.change.snapshot_id == snapshot_id(entry.content.as_ref())?;
        return Ok(match entry.content {
            None => same_content,
            Some(_) => {
                same_content
                    && res.change.schema_version == entry.schema_version
                    && res.change.plugin_key == entry.plugin_key
            }
        });
    }
    if entry.content.is_some() {
        return Ok(false);
    }

    // A delete without an own row only matters if an ancestor shows the entity.
    for level in chain.iter().skip(1) {
        let head = &versions[level].commit_id;
        if let Some(res) = leaves.of(graph, head)?.get(&entry.key) {
            return Ok(res.is_tombstone());
        }
        let shown = untracked::rows(conn, &entry.key.schema_key, level)?
            .iter()
            .any(|row| row.key == entry.key);
        if shown {
            return Ok(false);
        }
    }
    Ok(true)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn engine(deterministic: bool) -> Engine {
        let db = Database::open_in_memory().unwrap();
        Engine::new(db, LixConfig::default().deterministic(deterministic)).unwrap()
    }

    fn kv_rows(engine: &mut Engine) -> Vec<(String, Value)> {
        engine
            .execute(&Statement::select(View::State, StateFilter::schema(KEY_VALUE_SCHEMA)))
            .unwrap()
            .rows
            .into_iter()
            .map(|r| (r.entity_id, r.snapshot_content["value"].clone()))
            .collect()
    }

    #[test]
    fn test_bootstrap_creates_global_and_active_main() {
        let engine = engine(false);
        let versions = engine.versions().unwrap();
        assert_eq!(versions.len(), 2);
        let active = engine.active_version().unwrap();
        assert_eq!(active.name, MAIN_VERSION_NAME);
        assert_eq!(active.inherits_from_version_id, Some(VersionId::global()));
        assert!(!engine.is_deterministic());
    }

    #[test]
    fn test_commit_creates_one_commit_per_version() {
        let mut engine = engine(true);
        let before = engine.commits().unwrap().len();
        let notes = {
            let mut tx = engine.begin().unwrap();
            tx.set_key_value("a", json!(1)).unwrap();
            tx.set_key_value("b", json!(2)).unwrap();
            tx.set_key_value_in(&VersionId::global(), "shared", json!(true)).unwrap();
            tx.commit().unwrap()
        };
        assert_eq!(notes.len(), 2);
        assert_eq!(engine.commits().unwrap().len(), before + 2);
        assert_eq!(
            kv_rows(&mut engine),
            vec![
                ("a".to_string(), json!(1)),
                ("b".to_string(), json!(2)),
                (DETERMINISTIC_MODE_KEY.to_string(), json!({"enabled": true})),
                ("shared".to_string(), json!(true)),
            ]
        );
    }

    #[test]
    fn test_identical_write_is_elided() {
        let mut engine = engine(true);
        engine.transaction(|tx| tx.set_key_value("a", json!(1))).unwrap();
        let commits = engine.commits().unwrap().len();
        let notes = {
            let mut tx = engine.begin().unwrap();
            tx.set_key_value("a", json!(1)).unwrap();
            tx.commit().unwrap()
        };
        assert!(notes.is_empty());
        assert_eq!(engine.commits().unwrap().len(), commits);

        // Deleting something that never existed is elided too.
        let out = engine
            .execute(&Statement::delete(
                View::State,
                StateFilter::schema(KEY_VALUE_SCHEMA).entity("ghost"),
            ))
            .unwrap();
        assert_eq!(out.affected, 0);
        assert_eq!(engine.commits().unwrap().len(), commits);
    }

    #[test]
    fn test_failed_transaction_leaves_no_trace() {
        let mut engine = engine(true);
        let commits = engine.commits().unwrap().len();
        let err = engine
            .transaction(|tx| {
                tx.set_key_value("a", json!(1))?;
                tx.execute(&Statement::insert(
                    View::State,
                    None,
                    vec![InsertRow::new("unknown_schema", json!({"x": 1}))],
                ))
            })
            .unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
        assert_eq!(engine.commits().unwrap().len(), commits);
        assert!(kv_rows(&mut engine).iter().all(|(k, _)| k != "a"));
    }

    #[test]
    fn test_untracked_rows_bypass_the_graph() {
        let mut engine = engine(true);
        let changes = engine.changes().unwrap().len();
        engine
            .execute(&Statement::insert(
                View::State,
                None,
                vec![InsertRow::new(KEY_VALUE_SCHEMA, json!({"key": "ui", "value": "dark"}))
                    .untracked(true)],
            ))
            .unwrap();
        assert_eq!(engine.changes().unwrap().len(), changes);
        let rows = engine
            .execute(&Statement::select(
                View::State,
                StateFilter::schema(KEY_VALUE_SCHEMA).entity("ui"),
            ))
            .unwrap()
            .rows;
        assert_eq!(rows.len(), 1);
        assert!(rows[0].untracked);
        assert_eq!(rows[0].change_id, None);
    }

    #[test]
    fn test_create_switch_and_delete_version() {
        let mut engine = engine(true);
        let main = engine.active_version().unwrap();
        let feature = engine
            .create_version(CreateVersionOptions::named("feature"))
            .unwrap();
        assert_eq!(feature.commit_id, main.commit_id);

        let outcome = engine.switch_active_version(&feature.id, Some(&main.id)).unwrap();
        assert_eq!(outcome.previous, Some(main.id.clone()));
        assert!(matches!(
            engine.switch_active_version(&main.id, Some(&main.id)),
            Err(Error::ActiveVersionChanged { .. })
        ));
        assert!(matches!(
            engine.delete_version(&feature.id),
            Err(Error::InvalidArgument(_))
        ));
        engine.switch_active_version(&main.id, None).unwrap();
        engine.delete_version(&feature.id).unwrap();
        assert_eq!(engine.versions().unwrap().len(), 2);
    }

    #[test]
    fn test_checkpoint_labels_active_head() {
        let mut engine = engine(true);
        engine.transaction(|tx| tx.set_key_value("a", json!(1))).unwrap();
        let head = engine.create_checkpoint().unwrap();
        assert_eq!(engine.checkpoints().unwrap(), vec![head]);
        let labels = engine.labels().unwrap();
        assert_eq!(labels.len(), 1);
        assert_eq!(labels[0].name, CHECKPOINT_LABEL);
    }

    #[test]
    fn test_rollback_drops_the_cached_graph() {
        let engine = engine(true);
        let conn = engine.db.connection();
        let ctx = engine.ctx();
        let result: Result<()> = in_transaction(conn, &engine.seq, &engine.graphs, || {
            let set = ctx.create_change_set(&[])?;
            let commit = ctx.create_commit(&set.id, &[])?;
            assert!(engine.graphs.get(conn)?.has_commit(&commit.id));
            Err(Error::InvalidArgument(commit.id.to_string()))
        });
        let Err(Error::InvalidArgument(discarded)) = result else {
            panic!("expected the transaction to roll back");
        };

        // The replacement rows land on the rowids the discarded ones used.
        let set = ctx.create_change_set(&[]).unwrap();
        let replacement = ctx.create_commit(&set.id, &[]).unwrap();
        let graph = engine.graphs.get(conn).unwrap();
        assert!(graph.has_commit(&replacement.id));
        assert!(!graph.has_commit(&CommitId::new(discarded)));
    }

    #[test]
    fn test_discarded_work_does_not_reissue_ids() {
        let mut engine = engine(true);
        let err = engine
            .transaction(|tx| {
                let id = tx.new_id();
                Err::<(), _>(Error::InvalidArgument(id))
            })
            .unwrap_err();
        let Error::InvalidArgument(issued) = err else {
            panic!("expected the transaction error back");
        };

        let resumed = Sequencer::load(engine.connection(), true).unwrap();
        assert_eq!(resumed.current(), engine.seq.current());
        assert_ne!(resumed.uuid(), issued);
    }

    #[test]
    fn test_enabling_the_flag_later_lifts_the_counter() {
        let mut engine = engine(false);
        engine.transaction(|tx| tx.set_key_value("k", json!(1))).unwrap();
        let before = sequence::latest_timestamp_millis(engine.connection())
            .unwrap()
            .unwrap();

        engine
            .transaction(|tx| {
                tx.set_key_value_in(&VersionId::global(), DETERMINISTIC_MODE_KEY, json!({ "enabled": true }))
            })
            .unwrap();
        assert!(engine.is_deterministic());
        assert!(engine.seq.current() > before);
    }
}
