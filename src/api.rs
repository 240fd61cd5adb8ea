//! # Async API
//!
//! [`Lix`] is the handle applications hold. It is `Clone`, `Send` and `Sync`;
//! every clone talks to the same engine thread.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      Tokio Runtime                          │
//! │                                                             │
//! │   task ─┐                                                   │
//! │   task ─┼── Lix::call(closure) ── mpsc ──┐                  │
//! │   task ─┘                                │                  │
//! └──────────────────────────────────────────┼──────────────────┘
//!                                            ▼
//!                              ┌──────────────────────────┐
//!                              │   lix-engine thread      │
//!                              │   Engine (owns SQLite)   │
//!                              └──────────────────────────┘
//! ```
//!
//! ## SQLite Is `!Sync`
//!
//! A `rusqlite::Connection` cannot be shared between threads, so the engine is
//! owned by one thread and every operation is shipped to it. Operations are
//! therefore totally ordered per store.
//!
//! ## Sync
//!
//! [`Lix::pull`], [`Lix::push`] and [`Lix::sync`] run on the calling task and
//! only enter the engine for the local halves (reading the clock, collecting
//! or applying journal entries). Each transport call is bounded by
//! `LixConfig::sync_timeout`.
//!
//! # Example
//!
//! ```rust,ignore
//! use lix_engine::{Lix, LixConfig};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> lix_engine::Result<()> {
//!     let lix = Lix::open("project.lix", LixConfig::default()).await?;
//!     lix.transaction(|tx| tx.set_key_value("theme", json!("dark"))).await?;
//!     assert_eq!(lix.get_key_value("theme").await?, Some(json!("dark")));
//!     Ok(())
//! }
//! ```

use std::collections::BTreeMap;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::StaleScope;
use crate::config::LixConfig;
use crate::engine::{CreateVersionOptions, Engine, Label, SwitchOutcome, Transaction};
use crate::error::{Error, Result};
use crate::file::FileDescriptor;
use crate::merge::{MergeOutcome, MergeStrategy};
use crate::plugin::Plugin;
use crate::query::{QueryOutput, QueryPlan, Statement};
use crate::registry::SchemaDefinition;
use crate::schema::Database;
use crate::subscription::CommitSubscription;
use crate::sync::{LogEntry, PullRequest, PushRequest, SyncReport, SyncTransport, VectorClock};
use crate::types::{
    Change, ChangeConflict, ChangeEdge, ChangeId, ChangeProposal, ChangeSet, Commit, CommitId,
    EntityDiff, EntityKey, ProposalId, StateRow, Version, VersionId,
};
use crate::version::AdvanceMode;
use crate::worker::{spawn_worker, WorkerHandle};

/// Reports of both directions of [`Lix::sync`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncOutcome {
    pub pulled: SyncReport,
    pub pushed: SyncReport,
}

/// Async handle to one open store.
#[derive(Clone)]
pub struct Lix {
    worker: WorkerHandle,
    sync_timeout: Duration,
}

impl Lix {
    // =========================================================================
    // Opening
    // =========================================================================

    /// Opens (or creates) a store file.
    ///
    /// # Errors
    ///
    /// `Sqlite` if the file cannot be opened, `Schema` if it is not a store.
    pub async fn open(path: impl AsRef<Path>, config: LixConfig) -> Result<Self> {
        let db = Database::open(path)?;
        Self::start(db, config)
    }

    /// Opens a fresh store that lives in memory.
    pub async fn open_in_memory(config: LixConfig) -> Result<Self> {
        let db = Database::open_in_memory()?;
        Self::start(db, config)
    }

    /// Opens an in-memory store from the bytes of an exported store.
    pub async fn open_blob(blob: Vec<u8>, config: LixConfig) -> Result<Self> {
        let db = Database::open_blob(&blob)?;
        Self::start(db, config)
    }

    fn start(db: Database, config: LixConfig) -> Result<Self> {
        let sync_timeout = config.sync_timeout;
        let channel_size = config.channel_size;
        let engine = Engine::new(db, config)?;
        let worker = spawn_worker(engine, channel_size)?;
        Ok(Self {
            worker,
            sync_timeout,
        })
    }

    /// True once the engine thread has stopped.
    pub fn is_closed(&self) -> bool {
        self.worker.is_closed()
    }

    async fn call<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Engine) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.worker.call(f).await
    }

    // =========================================================================
    // Transactions and Queries
    // =========================================================================

    /// Runs `f` in one transaction on the engine thread. Staged writes are
    /// committed if `f` returns `Ok` and discarded otherwise.
    pub async fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Transaction<'_>) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.call(move |engine| engine.transaction(f)).await
    }

    /// Executes a statement in its own transaction.
    pub async fn execute(&self, statement: Statement) -> Result<QueryOutput> {
        self.call(move |engine| engine.execute(&statement)).await
    }

    pub async fn explain(&self, statement: Statement) -> Result<QueryPlan> {
        self.call(move |engine| engine.explain(&statement)).await
    }

    /// Tracked rows of one schema resolved from the graph, bypassing the cache.
    pub async fn resolve_direct(&self, version: VersionId, schema_key: impl Into<String>) -> Result<Vec<StateRow>> {
        let schema_key = schema_key.into();
        self.call(move |engine| engine.resolve_direct(&version, &schema_key))
            .await
    }

    // =========================================================================
    // Schemas and Plugins
    // =========================================================================

    pub async fn register_schema(&self, definition: SchemaDefinition) -> Result<()> {
        self.call(move |engine| engine.register_schema(definition)).await
    }

    /// Parses and registers a JSON schema document.
    pub async fn register_schema_json(&self, doc: Value) -> Result<()> {
        let definition = SchemaDefinition::from_json(&doc)?;
        self.register_schema(definition).await
    }

    pub async fn schemas(&self) -> Result<Vec<SchemaDefinition>> {
        self.call(|engine| engine.schemas()).await
    }

    pub async fn register_plugin(&self, plugin: Arc<dyn Plugin>) -> Result<()> {
        self.call(move |engine| engine.register_plugin(plugin)).await
    }

    // =========================================================================
    // Versions
    // =========================================================================

    pub async fn active_version(&self) -> Result<Version> {
        self.call(|engine| engine.active_version()).await
    }

    pub async fn versions(&self) -> Result<Vec<Version>> {
        self.call(|engine| engine.versions()).await
    }

    pub async fn version(&self, id: VersionId) -> Result<Version> {
        self.call(move |engine| engine.version(&id)).await
    }

    pub async fn create_version(&self, options: CreateVersionOptions) -> Result<Version> {
        self.call(move |engine| engine.create_version(options)).await
    }

    /// Makes `next` active if the active version is still `expected`.
    ///
    /// # Errors
    ///
    /// `ActiveVersionChanged` when another caller switched first.
    pub async fn switch_active_version(
        &self,
        next: VersionId,
        expected: Option<VersionId>,
    ) -> Result<SwitchOutcome> {
        self.call(move |engine| engine.switch_active_version(&next, expected.as_ref()))
            .await
    }

    pub async fn delete_version(&self, id: VersionId) -> Result<()> {
        self.call(move |engine| engine.delete_version(&id)).await
    }

    pub async fn advance_version(&self, id: VersionId, target: CommitId, mode: AdvanceMode) -> Result<Version> {
        self.call(move |engine| engine.advance_version(&id, &target, mode))
            .await
    }

    pub async fn merge_version(
        &self,
        source: VersionId,
        target: VersionId,
        strategy: MergeStrategy,
    ) -> Result<MergeOutcome> {
        self.call(move |engine| engine.merge_version(&source, &target, strategy))
            .await
    }

    // =========================================================================
    // Conflicts, Proposals, Checkpoints
    // =========================================================================

    pub async fn conflicts(&self, version: VersionId) -> Result<Vec<ChangeConflict>> {
        self.call(move |engine| engine.conflicts(&version)).await
    }

    pub async fn resolve_conflict(&self, version: VersionId, key: EntityKey, chosen: ChangeId) -> Result<Commit> {
        self.call(move |engine| engine.resolve_conflict(&version, &key, &chosen))
            .await
    }

    pub async fn create_proposal(&self, source: VersionId, target: VersionId) -> Result<ChangeProposal> {
        self.call(move |engine| engine.create_proposal(&source, &target))
            .await
    }

    pub async fn accept_proposal(&self, id: ProposalId, strategy: MergeStrategy) -> Result<MergeOutcome> {
        self.call(move |engine| engine.accept_proposal(&id, strategy)).await
    }

    pub async fn reject_proposal(&self, id: ProposalId) -> Result<()> {
        self.call(move |engine| engine.reject_proposal(&id)).await
    }

    pub async fn proposals(&self) -> Result<Vec<ChangeProposal>> {
        self.call(|engine| engine.proposals()).await
    }

    pub async fn create_checkpoint(&self) -> Result<CommitId> {
        self.call(|engine| engine.create_checkpoint()).await
    }

    pub async fn checkpoints(&self) -> Result<Vec<CommitId>> {
        self.call(|engine| engine.checkpoints()).await
    }

    pub async fn labels(&self) -> Result<Vec<Label>> {
        self.call(|engine| engine.labels()).await
    }

    // =========================================================================
    // Files and Key-Values
    // =========================================================================

    /// Writes a file into the active version. Returns the entity writes staged.
    pub async fn write_file(&self, path: impl Into<String>, data: Vec<u8>) -> Result<usize> {
        let path = path.into();
        self.transaction(move |tx| tx.write_file(&path, &data)).await
    }

    /// Reads a file from the active version.
    pub async fn read_file(&self, path: impl Into<String>) -> Result<Option<Vec<u8>>> {
        let path = path.into();
        self.call(move |engine| {
            let active = engine.active_version()?.id;
            engine.read_file(&active, &path)
        })
        .await
    }

    pub async fn read_file_in(&self, version: VersionId, path: impl Into<String>) -> Result<Option<Vec<u8>>> {
        let path = path.into();
        self.call(move |engine| engine.read_file(&version, &path)).await
    }

    pub async fn delete_file(&self, path: impl Into<String>) -> Result<usize> {
        let path = path.into();
        self.transaction(move |tx| tx.delete_file(&path)).await
    }

    pub async fn list_files(&self, version: VersionId) -> Result<Vec<FileDescriptor>> {
        self.call(move |engine| engine.list_files(&version)).await
    }

    /// Sets a key-value in the active version.
    pub async fn set_key_value(&self, key: impl Into<String>, value: Value) -> Result<()> {
        let key = key.into();
        self.transaction(move |tx| tx.set_key_value(&key, value)).await
    }

    /// Reads a key-value from the active version.
    pub async fn get_key_value(&self, key: impl Into<String>) -> Result<Option<Value>> {
        let key = key.into();
        self.call(move |engine| {
            let active = engine.active_version()?.id;
            engine.key_value_in(&active, &key)
        })
        .await
    }

    pub async fn key_values(&self, version: VersionId) -> Result<BTreeMap<String, Value>> {
        self.call(move |engine| engine.key_values(&version)).await
    }

    pub async fn is_deterministic(&self) -> Result<bool> {
        self.call(|engine| Ok(engine.is_deterministic())).await
    }

    // =========================================================================
    // Administrative Reads
    // =========================================================================

    pub async fn commits(&self) -> Result<Vec<Commit>> {
        self.call(|engine| engine.commits()).await
    }

    pub async fn commit_edges(&self) -> Result<Vec<(CommitId, CommitId)>> {
        self.call(|engine| engine.commit_edges()).await
    }

    pub async fn changes(&self) -> Result<Vec<Change>> {
        self.call(|engine| engine.changes()).await
    }

    pub async fn change_edges(&self) -> Result<Vec<ChangeEdge>> {
        self.call(|engine| engine.change_edges()).await
    }

    pub async fn change_sets(&self) -> Result<Vec<ChangeSet>> {
        self.call(|engine| engine.change_sets()).await
    }

    pub async fn diff(&self, before: CommitId, after: CommitId) -> Result<Vec<EntityDiff>> {
        self.call(move |engine| engine.diff(&before, &after)).await
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Deletes snapshots no change references. Returns how many were removed.
    pub async fn collect_garbage(&self) -> Result<usize> {
        self.call(|engine| engine.collect_garbage()).await
    }

    /// Serializes the whole store.
    pub async fn export_blob(&self) -> Result<Vec<u8>> {
        self.call(|engine| engine.export_blob()).await
    }

    pub async fn populate(&self, schema_key: impl Into<String>) -> Result<usize> {
        let schema_key = schema_key.into();
        self.call(move |engine| engine.populate(&schema_key)).await
    }

    pub async fn mark_stale(&self, scope: StaleScope) -> Result<()> {
        self.call(move |engine| engine.mark_stale(&scope)).await
    }

    /// Commit notifications, optionally for one version only.
    pub async fn subscribe(&self, version: Option<VersionId>) -> Result<CommitSubscription> {
        self.call(move |engine| Ok(engine.subscribe(version))).await
    }

    // =========================================================================
    // Sync
    // =========================================================================

    pub async fn store_id(&self) -> Result<String> {
        self.call(|engine| engine.store_id()).await
    }

    pub async fn vector_clock(&self) -> Result<VectorClock> {
        self.call(|engine| engine.vector_clock()).await
    }

    pub async fn sync_entries_after(&self, clock: VectorClock) -> Result<Vec<LogEntry>> {
        self.call(move |engine| engine.sync_entries_after(&clock)).await
    }

    pub async fn apply_sync_entries(&self, entries: Vec<LogEntry>) -> Result<SyncReport> {
        self.call(move |engine| engine.apply_sync_entries(&entries)).await
    }

    /// Fetches and applies the remote entries this store has not seen.
    ///
    /// # Errors
    ///
    /// `SyncTransport` when the transport fails or exceeds the sync timeout;
    /// `Remote` when the server rejects the request.
    pub async fn pull<T: SyncTransport + ?Sized>(&self, transport: &T, store_id: &str) -> Result<SyncReport> {
        let vector_clock = self.vector_clock().await?;
        let response = self
            .bounded(
                "pull",
                transport.pull(PullRequest {
                    store_id: store_id.to_string(),
                    vector_clock,
                    clock_only: false,
                }),
            )
            .await?;
        let received = response.data.len();
        let report = self.apply_sync_entries(response.data).await?;
        tracing::info!(
            store_id,
            received,
            applied = report.applied,
            conflicts = report.conflicts.len(),
            "pull finished"
        );
        Ok(report)
    }

    /// Sends the local entries the remote has not seen.
    pub async fn push<T: SyncTransport + ?Sized>(&self, transport: &T, store_id: &str) -> Result<SyncReport> {
        let remote = self
            .bounded(
                "push",
                transport.pull(PullRequest {
                    store_id: store_id.to_string(),
                    vector_clock: VectorClock::new(),
                    clock_only: true,
                }),
            )
            .await?;
        let data = self.sync_entries_after(remote.vector_clock).await?;
        if data.is_empty() {
            tracing::debug!(store_id, "nothing to push");
            return Ok(SyncReport::default());
        }
        let sent = data.len();
        let vector_clock = self.vector_clock().await?;
        let response = self
            .bounded(
                "push",
                transport.push(PushRequest {
                    store_id: store_id.to_string(),
                    vector_clock,
                    data,
                }),
            )
            .await?;
        tracing::info!(store_id, sent, applied = response.report.applied, "push finished");
        Ok(response.report)
    }

    /// Pull followed by push.
    pub async fn sync<T: SyncTransport + ?Sized>(&self, transport: &T, store_id: &str) -> Result<SyncOutcome> {
        let pulled = self.pull(transport, store_id).await?;
        let pushed = self.push(transport, store_id).await?;
        Ok(SyncOutcome { pulled, pushed })
    }

    async fn bounded<R>(&self, operation: &str, call: impl Future<Output = Result<R>>) -> Result<R> {
        match tokio::time::timeout(self.sync_timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(operation, timeout_ms = self.sync_timeout.as_millis() as u64, "sync timed out");
                Err(Error::SyncTransport(format!(
                    "{operation} timed out after {:?}",
                    self.sync_timeout
                )))
            }
        }
    }
}

