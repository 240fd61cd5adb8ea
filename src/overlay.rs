//! # Transaction Overlay
//!
//! Uncommitted writes of one transaction, keyed by `(version, entity)`. Reads
//! inside the transaction consult the overlay before anything else, which
//! gives read-your-writes. A later write to the same key replaces the earlier
//! one, so the overlay always holds the last write in program order.
//!
//! ## Staged vs Committed
//!
//! ```text
//!   ┌─────────────────────┐   commit    ┌────────────────────────────┐
//!   │ TransactionOverlay  │ ──────────► │ changes, change set, commit│
//!   │ (staged, in memory) │             │ untracked rows             │
//!   └─────────────────────┘             └────────────────────────────┘
//!              │ rollback / drop
//!              ▼
//!          discarded
//! ```

use std::collections::{BTreeMap, BTreeSet};

use serde_json::Value;

use crate::types::{EntityKey, VersionId};

/// One staged write.
#[derive(Debug, Clone, PartialEq)]
pub struct OverlayEntry {
    pub version_id: VersionId,
    pub key: EntityKey,
    pub schema_version: String,
    pub plugin_key: String,
    /// `None` deletes the entity.
    pub content: Option<Value>,
    /// Untracked writes bypass the change graph.
    pub untracked: bool,
    /// Sequencer timestamp taken when the write was staged.
    pub staged_at: String,
}

/// Staged writes of a transaction.
#[derive(Debug, Default)]
pub struct TransactionOverlay {
    entries: BTreeMap<(VersionId, EntityKey), OverlayEntry>,
}

impl TransactionOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stages a write, replacing any earlier write to the same key.
    pub fn put(&mut self, entry: OverlayEntry) {
        self.entries
            .insert((entry.version_id.clone(), entry.key.clone()), entry);
    }

    pub fn get(&self, version: &VersionId, key: &EntityKey) -> Option<&OverlayEntry> {
        self.entries.get(&(version.clone(), key.clone()))
    }

    /// Staged writes of one version and schema, in key order.
    pub fn entries_for<'a>(
        &'a self,
        version: &'a VersionId,
        schema_key: &'a str,
    ) -> impl Iterator<Item = &'a OverlayEntry> + 'a {
        self.entries
            .iter()
            .filter(move |((v, k), _)| v == version && k.schema_key == schema_key)
            .map(|(_, entry)| entry)
    }

    /// True if any of `versions` has staged writes for `schema_key`.
    pub fn touches(&self, versions: &[VersionId], schema_key: &str) -> bool {
        self.entries
            .keys()
            .any(|(v, k)| k.schema_key == schema_key && versions.contains(v))
    }

    /// Versions with staged writes, sorted.
    pub fn versions(&self) -> BTreeSet<VersionId> {
        self.entries.keys().map(|(v, _)| v.clone()).collect()
    }

    /// Schema keys with staged writes, sorted.
    pub fn schema_keys(&self) -> BTreeSet<String> {
        self.entries
            .keys()
            .map(|(_, k)| k.schema_key.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Removes and returns every entry, grouped by version in key order.
    pub fn drain(&mut self) -> BTreeMap<VersionId, Vec<OverlayEntry>> {
        let mut grouped: BTreeMap<VersionId, Vec<OverlayEntry>> = BTreeMap::new();
        for ((version, _), entry) in std::mem::take(&mut self.entries) {
            grouped.entry(version).or_default().push(entry);
        }
        grouped
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

// =============================================================================
// Tests
// =============================================================================
