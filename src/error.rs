//! # Error Handling for lix-engine
//!
//! A single error enum ([`Error`]) covers every failure mode of the engine.
//! Callers match on the variant to decide whether to retry, resolve, or abort.
//!
//! ## Error Categories
//!
//! | Category    | Variants                                            | Typical Response              |
//! |-------------|-----------------------------------------------------|-------------------------------|
//! | Integrity   | `SchemaValidation`, `GraphInconsistency`            | Abort the transaction         |
//! | Rewrite     | `UnsupportedOperation`                              | Fix the statement             |
//! | Plugins     | `PluginMissing`, `PluginDoesNotImplementFunction`   | Register / extend the plugin  |
//! | Versioning  | `FastForwardRequired`, `ChangeConflict`, `ActiveVersionChanged` | Merge, resolve, re-read |
//! | Sync        | `SyncTransport`, `Remote`                           | Retry later, local is intact  |
//! | Runtime     | `EngineClosed`, `SubscriptionLagged`                | Reopen / resubscribe          |
//! | Internal    | `Sqlite`, `Json`, `Io`, `Schema`                    | Log and investigate           |
//!
//! Integrity errors are never recovered silently: the change history is
//! append-only, so proceeding past one would corrupt it. Sync errors are the
//! only recoverable class (see [`Error::is_recoverable`]).

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::ChangeConflict;

// =============================================================================
// Sync Error Codes
// =============================================================================

/// Structured error codes returned by the sync surface.
///
/// These travel over the wire, so their string form is part of the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncErrorCode {
    /// The addressed store does not exist or could not be opened.
    #[serde(rename = "INVALID_STORE_FILE")]
    InvalidStoreFile,
    /// The request body could not be decoded or rewritten.
    #[serde(rename = "INVALID_QUERY")]
    InvalidQuery,
    /// The store failed while reading or applying data.
    #[serde(rename = "FAILED_TO_FETCH_DATA")]
    FailedToFetchData,
}

impl SyncErrorCode {
    /// Returns the wire representation of this code.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncErrorCode::InvalidStoreFile => "INVALID_STORE_FILE",
            SyncErrorCode::InvalidQuery => "INVALID_QUERY",
            SyncErrorCode::FailedToFetchData => "FAILED_TO_FETCH_DATA",
        }
    }
}

impl fmt::Display for SyncErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Error Type
// =============================================================================

/// All errors that can occur in lix-engine operations.
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Integrity Errors (abort the transaction)
    // =========================================================================

    /// Snapshot content does not match its schema, or the schema itself is
    /// malformed.
    ///
    /// # When This Happens
    ///
    /// - A write carries a field of the wrong JSON type
    /// - A required or primary-key field is missing
    /// - A referenced `(key, version)` is re-registered with a different shape
    #[error("schema validation failed for '{schema_key}': {message}")]
    SchemaValidation {
        /// The schema the content was validated against
        schema_key: String,
        /// What was wrong
        message: String,
    },

    /// The change or commit graph cannot be resolved.
    ///
    /// # When This Happens
    ///
    /// - A cycle in change edges or commit parents
    /// - A commit references a change set, change or parent that is missing
    /// - An edge links changes of two different entities
    /// - A version inheritance chain loops or exceeds the depth limit
    #[error("graph inconsistency: {0}")]
    GraphInconsistency(String),

    // =========================================================================
    // Rewrite Errors
    // =========================================================================

    /// The query preprocessor refuses to rewrite the statement.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    // =========================================================================
    // Plugin Errors
    // =========================================================================

    /// No registered plugin handles the given key or path.
    #[error("no plugin registered for '{key}'")]
    PluginMissing {
        /// The plugin key or file path that was looked up
        key: String,
    },

    /// The plugin exists but lacks the requested capability.
    #[error("plugin '{plugin_key}' does not implement {function}")]
    PluginDoesNotImplementFunction {
        /// The plugin that was asked
        plugin_key: String,
        /// The missing function (`detect_changes` or `apply_changes`)
        function: &'static str,
    },

    // =========================================================================
    // Versioning Errors
    // =========================================================================

    /// A version pointer was asked to move to a commit that does not descend
    /// from its current head.
    ///
    /// # Recovery
    ///
    /// Merge the two histories (`merge_version`) or advance with
    /// [`AdvanceMode::Force`](crate::version::AdvanceMode::Force).
    #[error("version '{version_id}' cannot fast-forward from '{head}' to '{target}'")]
    FastForwardRequired {
        /// The version being advanced
        version_id: String,
        /// Its current head commit
        head: String,
        /// The requested commit
        target: String,
    },

    /// Concurrent writes left sibling leaves that must be resolved explicitly.
    #[error("unresolved change conflict on {}", count_entities(.conflicts))]
    ChangeConflict {
        /// Every conflicting entity with its competing leaves
        conflicts: Vec<ChangeConflict>,
    },

    /// The active version changed between read and compare-and-swap.
    #[error("active version changed: expected '{expected}', found '{actual}'")]
    ActiveVersionChanged {
        /// The version the caller believed was active
        expected: String,
        /// The version that is actually active
        actual: String,
    },

    // =========================================================================
    // Sync Errors (recoverable, local store untouched)
    // =========================================================================

    /// Network or transport failure during pull/push, including timeouts.
    #[error("sync transport error: {0}")]
    SyncTransport(String),

    /// The remote answered with a structured error.
    #[error("remote error {code}: {message}")]
    Remote {
        /// Structured error code
        code: SyncErrorCode,
        /// Human-readable message from the remote
        message: String,
    },

    // =========================================================================
    // Lookup and Argument Errors
    // =========================================================================

    /// A referenced object does not exist.
    #[error("{kind} '{id}' not found")]
    NotFound {
        /// What kind of object (version, commit, schema, ...)
        kind: &'static str,
        /// The id or name that was looked up
        id: String,
    },

    /// The caller passed an argument the engine cannot act on.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The engine worker has shut down.
    #[error("engine has shut down")]
    EngineClosed,

    /// A commit subscriber fell behind and missed notifications.
    #[error("subscription lagged, missed {0} notifications")]
    SubscriptionLagged(u64),

    // =========================================================================
    // Internal Errors (investigate and fix)
    // =========================================================================

    /// SQLite operation failed.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// JSON encoding or decoding failed.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// File system operation failed (export/import of the store blob).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Storage layout mismatch or corruption detected.
    #[error("schema error: {0}")]
    Schema(String),
}

impl Error {
    /// Shorthand for a [`Error::SchemaValidation`].
    pub fn validation(schema_key: impl Into<String>, message: impl Into<String>) -> Self {
        Error::SchemaValidation {
            schema_key: schema_key.into(),
            message: message.into(),
        }
    }

    /// Shorthand for a [`Error::NotFound`].
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind,
            id: id.into(),
        }
    }

    /// Returns true when the failure left local state untouched and the
    /// operation may simply be retried.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::SyncTransport(_) | Error::Remote { .. })
    }
}

fn count_entities(conflicts: &[ChangeConflict]) -> String {
    match conflicts.len() {
        1 => "1 entity".to_string(),
        n => format!("{n} entities"),
    }
}

// =============================================================================
// Result Type Alias
// =============================================================================

/// A `Result` type alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Tests
// =============================================================================
