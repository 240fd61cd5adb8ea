//! # Lix Engine - Versioned Entity State
//!
//! A store of schema-validated JSON entities with full history, built on
//! SQLite. It provides:
//!
//! - **Change graph**: every write is an immutable change linked to the change
//!   it supersedes
//! - **Commits and versions**: named, branchable pointers into a commit DAG
//!   with inheritance between versions
//! - **Materialized state**: a per-schema cache answering "what does version V
//!   show?" without walking the graph
//! - **Transactions**: staged writes that become one commit per version
//! - **Sync**: journal exchange between stores with vector clocks
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Async API Layer                          │
//! │          (Lix: transaction, execute, versions, sync)            │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │ boxed jobs over mpsc
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                      Engine Worker Thread                       │
//! │                                                                 │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────────┐ │
//! │  │ Query Layer │  │ Transaction │  │  Plugins / Files        │ │
//! │  │ state views │  │   Overlay   │  │  Merge / Proposals      │ │
//! │  └─────────────┘  └─────────────┘  └─────────────────────────┘ │
//! │  ┌─────────────┐  ┌─────────────┐  ┌─────────────────────────┐ │
//! │  │ State Cache │  │ Graph Index │  │  Snapshots / Registry   │ │
//! │  └─────────────┘  └─────────────┘  └─────────────────────────┘ │
//! └─────────────────────────────┬───────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                         SQLite                                  │
//! │                   (durable storage)                             │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Invariants
//!
//! 1. **Append-only history**: changes, snapshots, change sets and commits are
//!    never modified once written
//! 2. **Content addressing**: a snapshot id is the SHA-256 of its canonical JSON
//! 3. **Cache equivalence**: a fresh cache row always equals what a direct
//!    graph walk would produce
//! 4. **One commit per version per transaction**
//! 5. **Deterministic mode**: identical operations on identical stores yield
//!    identical ids and timestamps
//!
//! ## Module Organization
//!
//! - [`error`]: Error enum shared by every layer
//! - [`schema`]: SQLite DDL and database initialization
//! - [`types`]: Ids and graph records
//! - [`registry`]: Entity schemas and validation
//! - [`snapshot`], [`change`], [`commit`], [`version`], [`graph`]: the change graph
//! - [`cache`], [`untracked`], [`overlay`], [`query`]: materialized state
//! - [`engine`], [`worker`], [`api`]: transactions and the async handle
//! - [`plugin`], [`file`]: file formats mapped onto entities
//! - [`merge`]: merges, conflicts and change proposals
//! - [`sync`]: journal exchange between stores

// =============================================================================
// Module Declarations
// =============================================================================

/// Error types for engine operations.
pub mod error;

/// SQLite schema definitions and database initialization.
pub mod schema;

/// Id newtypes and graph records.
pub mod types;

/// Runtime configuration.
pub mod config;

/// Id, timestamp and name generation, with a deterministic mode.
pub mod sequence;

/// Schema definitions, validation and entity id derivation.
pub mod registry;

/// Content-addressed snapshot storage.
pub mod snapshot;

/// Changes, change edges and change sets.
pub mod change;

/// Commits and the commit DAG.
pub mod commit;

/// Version pointers, inheritance and the active version.
pub mod version;

/// In-memory index over both graphs: ancestry and leaf resolution.
pub mod graph;

/// Per-schema materialized state.
pub mod cache;

/// State that bypasses the change graph.
pub mod untracked;

/// Staged writes of an open transaction.
pub mod overlay;

/// Statements over the `state` views.
pub mod query;

/// The synchronous engine and its transactions.
pub mod engine;

/// The thread the engine lives on.
pub mod worker;

/// Async API. The main entry point is [`Lix`](api::Lix).
pub mod api;

/// File format plugins.
pub mod plugin;

/// Files stored as plugin entities.
pub mod file;

/// Version merges, conflict resolution and change proposals.
pub mod merge;

/// Journal exchange between stores.
pub mod sync;

/// Commit notifications.
pub mod subscription;

// =============================================================================
// Re-exports
// =============================================================================

pub use api::{Lix, SyncOutcome};
pub use cache::StaleScope;
pub use config::LixConfig;
pub use engine::{CreateVersionOptions, Engine, Label, SwitchOutcome, Transaction};
pub use error::{Error, Result};
pub use file::{FileDescriptor, MaterializedFile};
pub use merge::{MergeOutcome, MergeStrategy};
pub use plugin::{DetectedChange, Plugin, PluginRegistry};
pub use query::{Assignment, InsertRow, QueryOutput, QueryPlan, StateFilter, Statement, View};
pub use registry::SchemaDefinition;
pub use schema::Database;
pub use subscription::{CommitNotification, CommitSubscription};
pub use sync::{InProcessTransport, SyncReport, SyncServer, SyncTransport};
pub use version::AdvanceMode;

pub use types::{
    Change, ChangeConflict, ChangeId, ChangeProposal, ChangeSet, ChangeSetId, Commit, CommitId,
    DiffStatus, EntityDiff, EntityKey, ProposalId, ProposalStatus, SnapshotId, StateRow, Version,
    VersionId,
};
