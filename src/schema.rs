//! # SQLite Schema for lix-engine
//!
//! This module defines the physical tables behind the change graph and handles
//! initialization. Everything a store knows lives in one SQLite file.
//!
//! ## Table Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                           Schema Overview                               │
//! ├─────────────────────────────────────────────────────────────────────────┤
//! │                                                                         │
//! │  lix_snapshot        lix_change               lix_change_edge           │
//! │  ┌──────────┐        ┌─────────────────┐      ┌─────────────────┐       │
//! │  │ id (PK)  │◄───────│ snapshot_id     │◄─────│ parent_id       │       │
//! │  │ content  │        │ id (PK)         │◄─────│ child_id        │       │
//! │  └──────────┘        │ entity/schema/  │      └─────────────────┘       │
//! │                      │ file            │                                │
//! │                      └────────▲────────┘                                │
//! │                               │                                         │
//! │  lix_commit          lix_change_set_element   lix_commit_edge           │
//! │  ┌──────────────┐    ┌─────────────────┐      ┌─────────────────┐       │
//! │  │ id (PK)      │    │ change_set_id   │      │ parent_id       │       │
//! │  │ change_set_id├───►│ change_id ──────┘      │ child_id        │       │
//! │  └──────▲───────┘    └─────────────────┘      │ position        │       │
//! │         │                                     └─────────────────┘       │
//! │  lix_version         lix_active_version                                 │
//! │  ┌──────────────┐    ┌─────────────────┐                                │
//! │  │ id (PK)      │◄───│ version_id      │   (singleton row)              │
//! │  │ commit_id    │    └─────────────────┘                                │
//! │  │ inherits_from│                                                       │
//! │  └──────────────┘                                                       │
//! │                                                                         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Per-schema state cache tables (`lix_state_cache_*`) are created lazily by
//! [`StateCache`](crate::cache::StateCache) and recorded in `lix_cache_table`.
//!
//! ## Design Decisions
//!
//! ### Why store commit parents in an edge table?
//!
//! Merge commits have several parents, and ancestry walks need both
//! directions. `position` preserves first-parent order.
//!
//! ### Why a sync log?
//!
//! Every graph object created locally is journaled under
//! `(session_id, session_seq)`. Replication then reduces to "send every entry
//! above the peer's vector clock", without scanning the graph tables.

use std::path::Path;
use std::time::Duration;

use rusqlite::backup::Backup;
use rusqlite::{Connection, OptionalExtension};

use crate::{Error, Result};

// =============================================================================
// Schema Version
// =============================================================================

/// Current layout version. Increment when making breaking layout changes.
///
/// # Migration Strategy
///
/// There are no migrations: a mismatching store is refused with
/// [`Error::Schema`].
const SCHEMA_VERSION: i32 = 1;

// =============================================================================
// DDL Statements
// =============================================================================

/// Store-wide key/value metadata (`schema_version`, `store_id`).
const CREATE_METADATA: &str = r#"
CREATE TABLE IF NOT EXISTS lix_metadata (
    key   TEXT PRIMARY KEY,
    value TEXT NOT NULL
)
"#;

/// Registered entity schemas, one row per `(key, version)`.
///
/// `definition` is the canonical JSON of the parsed definition, so an
/// identical re-registration compares equal byte for byte.
const CREATE_STORED_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS lix_stored_schema (
    key        TEXT NOT NULL,
    version    TEXT NOT NULL,
    definition TEXT NOT NULL,
    PRIMARY KEY (key, version)
)
"#;

/// Content-addressed snapshots. `content` is NULL only for `no-content`.
const CREATE_SNAPSHOT: &str = r#"
CREATE TABLE IF NOT EXISTS lix_snapshot (
    id      TEXT PRIMARY KEY,
    content TEXT
)
"#;

/// Immutable changes.
///
/// # Indexes
///
/// - `lix_change_entity` on `(schema_key, entity_id, file_id)`: conflict and
///   history lookups for one entity
const CREATE_CHANGE: &str = r#"
CREATE TABLE IF NOT EXISTS lix_change (
    id             TEXT PRIMARY KEY,
    entity_id      TEXT NOT NULL,
    schema_key     TEXT NOT NULL,
    schema_version TEXT NOT NULL,
    file_id        TEXT NOT NULL,
    plugin_key     TEXT NOT NULL,
    snapshot_id    TEXT NOT NULL,
    created_at     TEXT NOT NULL
)
"#;

const CREATE_CHANGE_ENTITY_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS lix_change_entity
ON lix_change(schema_key, entity_id, file_id)
"#;

/// Parent/child relation between changes of one entity.
const CREATE_CHANGE_EDGE: &str = r#"
CREATE TABLE IF NOT EXISTS lix_change_edge (
    parent_id TEXT NOT NULL,
    child_id  TEXT NOT NULL,
    PRIMARY KEY (parent_id, child_id)
)
"#;

const CREATE_CHANGE_EDGE_CHILD_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS lix_change_edge_child
ON lix_change_edge(child_id)
"#;

const CREATE_CHANGE_SET: &str = r#"
CREATE TABLE IF NOT EXISTS lix_change_set (
    id         TEXT PRIMARY KEY,
    created_at TEXT NOT NULL
)
"#;

/// Change set membership. Entity columns are denormalized so a change set can
/// be grouped per entity without joining `lix_change`.
const CREATE_CHANGE_SET_ELEMENT: &str = r#"
CREATE TABLE IF NOT EXISTS lix_change_set_element (
    change_set_id TEXT NOT NULL,
    change_id     TEXT NOT NULL,
    entity_id     TEXT NOT NULL,
    schema_key    TEXT NOT NULL,
    file_id       TEXT NOT NULL,
    PRIMARY KEY (change_set_id, change_id)
)
"#;

const CREATE_COMMIT: &str = r#"
CREATE TABLE IF NOT EXISTS lix_commit (
    id            TEXT PRIMARY KEY,
    change_set_id TEXT NOT NULL,
    created_at    TEXT NOT NULL
)
"#;

/// Commit parents. `position` is the index in `parent_commit_ids`.
const CREATE_COMMIT_EDGE: &str = r#"
CREATE TABLE IF NOT EXISTS lix_commit_edge (
    parent_id TEXT NOT NULL,
    child_id  TEXT NOT NULL,
    position  INTEGER NOT NULL,
    PRIMARY KEY (parent_id, child_id)
)
"#;

const CREATE_COMMIT_EDGE_CHILD_INDEX: &str = r#"
CREATE INDEX IF NOT EXISTS lix_commit_edge_child
ON lix_commit_edge(child_id, position)
"#;

/// Versions. The only mutable graph objects.
const CREATE_VERSION: &str = r#"
CREATE TABLE IF NOT EXISTS lix_version (
    id                       TEXT PRIMARY KEY,
    name                     TEXT NOT NULL UNIQUE,
    commit_id                TEXT NOT NULL,
    inherits_from_version_id TEXT
)
"#;

/// Singleton row holding the active version.
const CREATE_ACTIVE_VERSION: &str = r#"
CREATE TABLE IF NOT EXISTS lix_active_version (
    id         INTEGER PRIMARY KEY CHECK (id = 1),
    version_id TEXT NOT NULL
)
"#;

const CREATE_CHANGE_PROPOSAL: &str = r#"
CREATE TABLE IF NOT EXISTS lix_change_proposal (
    id                TEXT PRIMARY KEY,
    source_version_id TEXT NOT NULL,
    target_version_id TEXT NOT NULL,
    change_set_id     TEXT NOT NULL,
    status            TEXT NOT NULL,
    created_at        TEXT NOT NULL
)
"#;

/// State that lives outside the change graph. Never synced, never diffed.
const CREATE_UNTRACKED_STATE: &str = r#"
CREATE TABLE IF NOT EXISTS lix_untracked_state (
    entity_id        TEXT NOT NULL,
    schema_key       TEXT NOT NULL,
    file_id          TEXT NOT NULL,
    version_id       TEXT NOT NULL,
    schema_version   TEXT NOT NULL,
    plugin_key       TEXT NOT NULL,
    snapshot_content TEXT,
    created_at       TEXT NOT NULL,
    updated_at       TEXT NOT NULL,
    PRIMARY KEY (entity_id, schema_key, file_id, version_id)
)
"#;

/// Staleness flags for the state cache. `version_id = '*'` covers every
/// version of the schema.
const CREATE_CACHE_STALE: &str = r#"
CREATE TABLE IF NOT EXISTS lix_cache_stale (
    schema_key TEXT NOT NULL,
    version_id TEXT NOT NULL,
    PRIMARY KEY (schema_key, version_id)
)
"#;

/// Physical cache table registered for each schema key.
const CREATE_CACHE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS lix_cache_table (
    schema_key TEXT PRIMARY KEY,
    table_name TEXT NOT NULL UNIQUE
)
"#;

/// Persisted deterministic sequence counter (singleton row).
const CREATE_SEQUENCE: &str = r#"
CREATE TABLE IF NOT EXISTS lix_sequence (
    id    INTEGER PRIMARY KEY CHECK (id = 1),
    value INTEGER NOT NULL
)
"#;

/// Replication journal. `payload` is a JSON-encoded sync record.
const CREATE_SYNC_LOG: &str = r#"
CREATE TABLE IF NOT EXISTS lix_sync_log (
    session_id  TEXT NOT NULL,
    session_seq INTEGER NOT NULL,
    payload     TEXT NOT NULL,
    PRIMARY KEY (session_id, session_seq)
)
"#;

const TABLES: &[&str] = &[
    CREATE_METADATA,
    CREATE_STORED_SCHEMA,
    CREATE_SNAPSHOT,
    CREATE_CHANGE,
    CREATE_CHANGE_ENTITY_INDEX,
    CREATE_CHANGE_EDGE,
    CREATE_CHANGE_EDGE_CHILD_INDEX,
    CREATE_CHANGE_SET,
    CREATE_CHANGE_SET_ELEMENT,
    CREATE_COMMIT,
    CREATE_COMMIT_EDGE,
    CREATE_COMMIT_EDGE_CHILD_INDEX,
    CREATE_VERSION,
    CREATE_ACTIVE_VERSION,
    CREATE_CHANGE_PROPOSAL,
    CREATE_UNTRACKED_STATE,
    CREATE_CACHE_STALE,
    CREATE_CACHE_TABLE,
    CREATE_SEQUENCE,
    CREATE_SYNC_LOG,
];

// =============================================================================
// Database Wrapper
// =============================================================================

/// A SQLite connection with the lix layout applied.
///
/// # Rust Pattern: Newtype Wrapper
///
/// Wrapping `Connection` keeps layout setup in one place: a `Database` is
/// always initialized and version-checked, a bare `Connection` may not be.
#[derive(Debug)]
pub struct Database {
    conn: Connection,
}

impl Database {
    /// Opens a store file, creating and initializing it if necessary.
    ///
    /// # Errors
    ///
    /// - `Error::Sqlite` if the file can't be opened or created
    /// - `Error::Schema` if the layout version doesn't match
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Creates an in-memory store.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    /// Loads a store from bytes previously produced by [`Database::export_blob`].
    ///
    /// The bytes are written to a temporary file and copied into an in-memory
    /// database with SQLite's online backup API.
    pub fn open_blob(bytes: &[u8]) -> Result<Self> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("import.lix");
        std::fs::write(&path, bytes)?;

        let source = Connection::open(&path)?;
        let mut conn = Connection::open_in_memory()?;
        {
            let backup = Backup::new(&source, &mut conn)?;
            backup.run_to_completion(256, Duration::ZERO, None)?;
        }
        drop(source);

        Self::from_connection(conn)
    }

    /// Wraps an existing connection, applying the layout.
    pub fn from_connection(conn: Connection) -> Result<Self> {
        let mut db = Self { conn };
        db.initialize()?;
        Ok(db)
    }

    /// Creates tables, sets pragmas and verifies the layout version.
    fn initialize(&mut self) -> Result<()> {
        // WAL: readers never block the writer thread.
        self.conn.execute_batch("PRAGMA journal_mode = WAL")?;
        self.conn.execute_batch("PRAGMA synchronous = NORMAL")?;

        for ddl in TABLES {
            self.conn.execute_batch(ddl)?;
        }

        self.verify_or_set_version()?;
        self.ensure_store_id()?;
        Ok(())
    }

    fn verify_or_set_version(&mut self) -> Result<()> {
        let existing = read_metadata(&self.conn, "schema_version")?;

        match existing {
            None => {
                self.conn.execute(
                    "INSERT INTO lix_metadata (key, value) VALUES ('schema_version', ?)",
                    [SCHEMA_VERSION.to_string()],
                )?;
            }
            Some(v) if v == SCHEMA_VERSION.to_string() => {}
            Some(v) => {
                return Err(Error::Schema(format!(
                    "layout version mismatch: store has version {v}, this engine requires {SCHEMA_VERSION}"
                )));
            }
        }

        Ok(())
    }

    fn ensure_store_id(&mut self) -> Result<()> {
        if read_metadata(&self.conn, "store_id")?.is_none() {
            self.conn.execute(
                "INSERT INTO lix_metadata (key, value) VALUES ('store_id', ?)",
                [uuid::Uuid::new_v4().to_string()],
            )?;
        }
        Ok(())
    }

    /// Returns the random id assigned to this store at creation.
    pub fn store_id(&self) -> Result<String> {
        read_metadata(&self.conn, "store_id")?
            .ok_or_else(|| Error::Schema("store has no store_id".to_string()))
    }

    /// Serializes the whole store into one SQLite file image.
    pub fn export_blob(&self) -> Result<Vec<u8>> {
        export_blob(&self.conn)
    }

    /// Returns a reference to the underlying connection.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    /// Consumes the wrapper, returning the connection.
    pub fn into_connection(self) -> Connection {
        self.conn
    }
}

/// Reads one `lix_metadata` value.
pub(crate) fn read_metadata(conn: &Connection, key: &str) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT value FROM lix_metadata WHERE key = ?",
            [key],
            |row| row.get(0),
        )
        .optional()?)
}

/// `VACUUM INTO` a temp file and read it back.
pub(crate) fn export_blob(conn: &Connection) -> Result<Vec<u8>> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("export.lix");
    let target = path
        .to_str()
        .ok_or_else(|| Error::InvalidArgument("temporary path is not valid UTF-8".to_string()))?;
    conn.execute_batch(&format!("VACUUM INTO '{}'", target.replace('\'', "''")))?;
    Ok(std::fs::read(&path)?)
}

// =============================================================================
// Tests
// =============================================================================
