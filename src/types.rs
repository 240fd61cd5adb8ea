//! # Domain Types for lix-engine
//!
//! Core types of the change-tracking model: changes, change edges, change
//! sets, commits, versions, and the logical state rows the query layer
//! returns.
//!
//! ## Design Philosophy: Newtypes for Ids
//!
//! Every graph object has its own id newtype so a [`CommitId`] can never be
//! passed where a [`ChangeId`] is expected. All of them are thin wrappers
//! around `String` because ids are generated by the
//! [`Sequencer`](crate::sequence::Sequencer) (UUIDv7 or deterministic) and
//! stored as TEXT in SQLite.
//!
//! ## Invariants
//!
//! - [`Change`]s are immutable once created and reference exactly one snapshot
//! - [`ChangeEdge`]s only connect changes of the same [`EntityKey`]
//! - [`Commit`]s are immutable; only [`Version`] pointers move

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// =============================================================================
// Well-Known Identifiers
// =============================================================================

/// Id of the version whose entities are visible from every other version.
pub const GLOBAL_VERSION_ID: &str = "global";

/// Name of the version created (and activated) for a fresh store.
pub const MAIN_VERSION_NAME: &str = "main";

/// Snapshot id of the tombstone marker (`null` content).
pub const NO_CONTENT_SNAPSHOT_ID: &str = "no-content";

/// `file_id` for entities that do not belong to a user file.
pub const LIX_FILE_ID: &str = "lix";

/// `plugin_key` for entities owned by the engine itself.
pub const LIX_OWN_PLUGIN_KEY: &str = "lix_own_entity";

// =============================================================================
// Id Newtypes
// =============================================================================

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Wraps a raw id.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Returns the id as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consumes the id and returns the inner string.
            pub fn into_string(self) -> String {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self::new(s)
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&$name> for $name {
            fn from(id: &$name) -> Self {
                id.clone()
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Identifies one [`Change`].
    ChangeId
);
string_id!(
    /// Identifies one [`Commit`].
    CommitId
);
string_id!(
    /// Identifies one [`Version`] (branch).
    VersionId
);
string_id!(
    /// Content address of a snapshot (hex SHA-256, or `no-content`).
    SnapshotId
);
string_id!(
    /// Identifies one change set.
    ChangeSetId
);
string_id!(
    /// Identifies one [`ChangeProposal`].
    ProposalId
);

impl VersionId {
    /// The `global` version id.
    pub fn global() -> Self {
        Self::new(GLOBAL_VERSION_ID)
    }

    /// Returns true for the `global` version.
    pub fn is_global(&self) -> bool {
        self.0 == GLOBAL_VERSION_ID
    }
}

impl SnapshotId {
    /// The tombstone snapshot id.
    pub fn no_content() -> Self {
        Self::new(NO_CONTENT_SNAPSHOT_ID)
    }

    /// Returns true for the tombstone snapshot.
    pub fn is_no_content(&self) -> bool {
        self.0 == NO_CONTENT_SNAPSHOT_ID
    }
}

// =============================================================================
// Entity Identity
// =============================================================================

/// The identity of an entity across its whole history.
///
/// An entity is addressed by its id *within* a schema and a file: two files
/// may both contain an entity `"title"` of schema `"markdown_heading"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    /// Entity id, unique within `(schema_key, file_id)`.
    pub entity_id: String,
    /// Schema the entity conforms to.
    pub schema_key: String,
    /// File the entity belongs to (`"lix"` for engine-owned entities).
    pub file_id: String,
}

impl EntityKey {
    /// Creates a new entity key.
    pub fn new(
        entity_id: impl Into<String>,
        schema_key: impl Into<String>,
        file_id: impl Into<String>,
    ) -> Self {
        Self {
            entity_id: entity_id.into(),
            schema_key: schema_key.into(),
            file_id: file_id.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.schema_key, self.file_id, self.entity_id)
    }
}

// =============================================================================
// Change Graph
// =============================================================================

/// One observed mutation of one entity. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Change {
    pub id: ChangeId,
    pub entity_id: String,
    pub schema_key: String,
    pub schema_version: String,
    pub file_id: String,
    pub plugin_key: String,
    pub snapshot_id: SnapshotId,
    pub created_at: String,
}

impl Change {
    /// Returns the entity this change belongs to.
    pub fn key(&self) -> EntityKey {
        EntityKey::new(&self.entity_id, &self.schema_key, &self.file_id)
    }

    /// Returns true if this change deletes its entity.
    pub fn is_tombstone(&self) -> bool {
        self.snapshot_id.is_no_content()
    }
}

/// Ancestor/descendant relation between two changes of the same entity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChangeEdge {
    pub parent_id: ChangeId,
    pub child_id: ChangeId,
}

/// Membership row of a change set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSetElement {
    pub change_set_id: ChangeSetId,
    pub change_id: ChangeId,
    pub entity_id: String,
    pub schema_key: String,
    pub file_id: String,
}

/// A named immutable grouping of changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeSet {
    pub id: ChangeSetId,
    pub created_at: String,
    pub elements: Vec<ChangeSetElement>,
}

/// Two or more competing leaf changes for one entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeConflict {
    pub key: EntityKey,
    /// Leaf change ids, sorted by `(created_at, id)` ascending.
    pub leaves: Vec<ChangeId>,
}

// =============================================================================
// Commits and Versions
// =============================================================================

/// The unit of history. Merge commits have more than one parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub id: CommitId,
    pub change_set_id: ChangeSetId,
    /// Parent commits in the order they were given (first parent first).
    pub parent_commit_ids: Vec<CommitId>,
    pub created_at: String,
}

/// A named, mutable pointer into the commit graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Version {
    pub id: VersionId,
    pub name: String,
    /// Head commit.
    pub commit_id: CommitId,
    /// Version whose state shows through where this version has no own row.
    /// `None` only for `global`.
    pub inherits_from_version_id: Option<VersionId>,
    pub is_active: bool,
}

// =============================================================================
// Logical State Rows
// =============================================================================

/// One row of the logical `state` / `state_all` views.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateRow {
    pub entity_id: String,
    pub schema_key: String,
    pub schema_version: String,
    pub file_id: String,
    pub plugin_key: String,
    pub snapshot_content: Value,
    pub version_id: VersionId,
    /// Set when the row shows through from an ancestor version.
    pub inherited_from_version_id: Option<VersionId>,
    /// `None` for rows that only exist in the transaction overlay or in
    /// untracked state.
    pub change_id: Option<ChangeId>,
    pub commit_id: Option<CommitId>,
    pub untracked: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl StateRow {
    /// Returns the entity key of this row.
    pub fn key(&self) -> EntityKey {
        EntityKey::new(&self.entity_id, &self.schema_key, &self.file_id)
    }
}

// =============================================================================
// Proposals and Diffs
// =============================================================================

/// Lifecycle of a [`ChangeProposal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProposalStatus {
    Open,
    Accepted,
    Rejected,
}

impl ProposalStatus {
    /// Returns the stored representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProposalStatus::Open => "open",
            ProposalStatus::Accepted => "accepted",
            ProposalStatus::Rejected => "rejected",
        }
    }

    /// Parses the stored representation.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "open" => Some(ProposalStatus::Open),
            "accepted" => Some(ProposalStatus::Accepted),
            "rejected" => Some(ProposalStatus::Rejected),
            _ => None,
        }
    }
}

impl fmt::Display for ProposalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A packaged symmetric difference between two versions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeProposal {
    pub id: ProposalId,
    pub source_version_id: VersionId,
    pub target_version_id: VersionId,
    pub change_set_id: ChangeSetId,
    pub status: ProposalStatus,
    pub created_at: String,
}

/// Per-entity outcome of comparing two commits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiffStatus {
    Added,
    Modified,
    Removed,
    Unchanged,
}

/// One entry of a commit diff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDiff {
    pub key: EntityKey,
    pub status: DiffStatus,
    pub before: Option<Value>,
    pub after: Option<Value>,
    pub before_change_id: Option<ChangeId>,
    pub after_change_id: Option<ChangeId>,
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_id_newtypes_are_distinct_and_transparent() {
        let change = ChangeId::new("c-1");
        let commit = CommitId::from("c-1");
        assert_eq!(change.as_str(), commit.as_str());
        assert_eq!(serde_json::to_string(&change).unwrap(), "\"c-1\"");
    }

    #[test]
    fn test_well_known_ids() {
        assert!(VersionId::global().is_global());
        assert!(!VersionId::new("main").is_global());
        assert!(SnapshotId::no_content().is_no_content());
    }

    #[test]
    fn test_change_key_and_tombstone() {
        let change = Change {
            id: ChangeId::new("c"),
            entity_id: "e".to_string(),
            schema_key: "s".to_string(),
            schema_version: "1.0".to_string(),
            file_id: "f".to_string(),
            plugin_key: "p".to_string(),
            snapshot_id: SnapshotId::no_content(),
            created_at: "t".to_string(),
        };
        assert_eq!(change.key(), EntityKey::new("e", "s", "f"));
        assert!(change.is_tombstone());
        assert_eq!(change.key().to_string(), "s/f/e");
    }

    #[test]
    fn test_proposal_status_round_trip() {
        for status in [
            ProposalStatus::Open,
            ProposalStatus::Accepted,
            ProposalStatus::Rejected,
        ] {
            assert_eq!(ProposalStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(ProposalStatus::parse("merged"), None);
    }
}
