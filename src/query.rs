//! # Query Preprocessor
//!
//! The only read/write surface for entity state. Statements address two
//! logical views:
//!
//! - `state`: the active version only
//! - `state_all`: every version, or the one named by `version_id`
//!
//! ## Read Resolution
//!
//! ```text
//!   for each (version V, schema S):
//!     repopulate S if stale
//!     chain = [V, parent, ..., global]
//!
//!     fast path (no overlay or untracked rows anywhere in the chain):
//!       V's cache rows (own + inherited) minus tombstones
//!
//!     otherwise, per level L of the chain, first hit per entity wins:
//!       1. transaction overlay (L, S)
//!       2. untracked state     (L, S)
//!       3. own cache rows      (L, S)        tombstone hit = shadowed
//! ```
//!
//! Both paths produce exactly what [`resolve_direct`] computes by walking the
//! graph, plus the overlay and untracked layers.
//!
//! ## Writes
//!
//! Writes never touch the graph. They are validated and staged in the
//! [`TransactionOverlay`]; the engine turns the overlay into changes at commit.
//! Updating or deleting an inherited row stages a row in V (copy-on-write), so
//! the ancestor is never modified.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::cache::{CacheRow, StateCache};
use crate::error::{Error, Result};
use crate::graph::{GraphCache, GraphIndex};
use crate::overlay::{OverlayEntry, TransactionOverlay};
use crate::registry::{CompiledSchema, SchemaRegistry};
use crate::sequence::Sequencer;
use crate::snapshot::SnapshotStore;
use crate::types::{EntityKey, StateRow, VersionId, LIX_FILE_ID, LIX_OWN_PLUGIN_KEY};
use crate::untracked::{self, UntrackedRow};
use crate::version::{inheritance_chain, list_versions, version_map};

// =============================================================================
// Statements
// =============================================================================

/// Logical view a statement addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum View {
    State,
    StateAll,
}

/// Equality filter over state rows. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StateFilter {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_id: Option<VersionId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin_key: Option<String>,
    /// `snapshot_content.<field> = value` conditions.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub content: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub untracked: Option<bool>,
}

impl StateFilter {
    /// Rows of one schema.
    pub fn schema(schema_key: impl Into<String>) -> Self {
        Self {
            schema_key: Some(schema_key.into()),
            ..Self::default()
        }
    }

    pub fn entity(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn file(mut self, file_id: impl Into<String>) -> Self {
        self.file_id = Some(file_id.into());
        self
    }

    pub fn version(mut self, version_id: impl Into<VersionId>) -> Self {
        self.version_id = Some(version_id.into());
        self
    }

    pub fn plugin(mut self, plugin_key: impl Into<String>) -> Self {
        self.plugin_key = Some(plugin_key.into());
        self
    }

    pub fn content_eq(mut self, field: impl Into<String>, value: Value) -> Self {
        self.content.insert(field.into(), value);
        self
    }

    pub fn untracked(mut self, untracked: bool) -> Self {
        self.untracked = Some(untracked);
        self
    }

    fn matches(&self, row: &StateRow) -> bool {
        fn eq(expected: &Option<String>, actual: &str) -> bool {
            expected.as_deref().map_or(true, |e| e == actual)
        }
        eq(&self.entity_id, &row.entity_id)
            && eq(&self.schema_key, &row.schema_key)
            && eq(&self.file_id, &row.file_id)
            && eq(&self.plugin_key, &row.plugin_key)
            && self.untracked.map_or(true, |u| u == row.untracked)
            && self
                .content
                .iter()
                .all(|(field, value)| row.snapshot_content.get(field) == Some(value))
    }
}

/// A row to insert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsertRow {
    /// Derived from the schema primary key when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    pub schema_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plugin_key: Option<String>,
    /// Latest registered version when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_version: Option<String>,
    #[serde(default)]
    pub snapshot_content: Value,
    #[serde(default)]
    pub untracked: bool,
}

impl InsertRow {
    pub fn new(schema_key: impl Into<String>, snapshot_content: Value) -> Self {
        Self {
            entity_id: None,
            schema_key: schema_key.into(),
            file_id: None,
            plugin_key: None,
            schema_version: None,
            snapshot_content,
            untracked: false,
        }
    }

    pub fn entity_id(mut self, entity_id: impl Into<String>) -> Self {
        self.entity_id = Some(entity_id.into());
        self
    }

    pub fn file(mut self, file_id: impl Into<String>) -> Self {
        self.file_id = Some(file_id.into());
        self
    }

    pub fn plugin(mut self, plugin_key: impl Into<String>) -> Self {
        self.plugin_key = Some(plugin_key.into());
        self
    }

    pub fn schema_version(mut self, version: impl Into<String>) -> Self {
        self.schema_version = Some(version.into());
        self
    }

    pub fn untracked(mut self, untracked: bool) -> Self {
        self.untracked = untracked;
        self
    }
}

/// `column = value` in an update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub column: String,
    pub value: Value,
}

impl Assignment {
    pub fn new(column: impl Into<String>, value: Value) -> Self {
        Self {
            column: column.into(),
            value,
        }
    }
}

/// A statement against `state` or `state_all`. Also the `/query` wire format.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Statement {
    Select {
        view: View,
        #[serde(default)]
        filter: StateFilter,
    },
    Insert {
        view: View,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        version_id: Option<VersionId>,
        rows: Vec<InsertRow>,
    },
    Update {
        view: View,
        #[serde(default)]
        filter: StateFilter,
        set: Vec<Assignment>,
    },
    Delete {
        view: View,
        #[serde(default)]
        filter: StateFilter,
    },
}

impl Statement {
    pub fn select(view: View, filter: StateFilter) -> Self {
        Statement::Select { view, filter }
    }

    pub fn insert(view: View, version_id: Option<VersionId>, rows: Vec<InsertRow>) -> Self {
        Statement::Insert {
            view,
            version_id,
            rows,
        }
    }

    pub fn update(view: View, filter: StateFilter, set: Vec<Assignment>) -> Self {
        Statement::Update { view, filter, set }
    }

    pub fn delete(view: View, filter: StateFilter) -> Self {
        Statement::Delete { view, filter }
    }

    /// Returns true for statements that stage writes.
    pub fn is_write(&self) -> bool {
        !matches!(self, Statement::Select { .. })
    }
}

/// A column of the logical views.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Column {
    EntityId,
    SchemaKey,
    SchemaVersion,
    FileId,
    PluginKey,
    SnapshotContent,
    /// `snapshot_content.<field>`
    ContentField(String),
    VersionId,
    InheritedFromVersionId,
    ChangeId,
    CommitId,
    Untracked,
    CreatedAt,
    UpdatedAt,
}

impl Column {
    /// Parses a column name.
    ///
    /// # Errors
    ///
    /// `UnsupportedOperation` for unknown columns.
    pub fn parse(name: &str) -> Result<Self> {
        if let Some(field) = name.strip_prefix("snapshot_content.") {
            if field.is_empty() {
                return Err(Error::UnsupportedOperation(format!("unknown column '{name}'")));
            }
            return Ok(Column::ContentField(field.to_string()));
        }
        Ok(match name {
            "entity_id" => Column::EntityId,
            "schema_key" => Column::SchemaKey,
            "schema_version" => Column::SchemaVersion,
            "file_id" => Column::FileId,
            "plugin_key" => Column::PluginKey,
            "snapshot_content" => Column::SnapshotContent,
            "version_id" => Column::VersionId,
            "inherited_from_version_id" => Column::InheritedFromVersionId,
            "change_id" => Column::ChangeId,
            "commit_id" => Column::CommitId,
            "untracked" => Column::Untracked,
            "created_at" => Column::CreatedAt,
            "updated_at" => Column::UpdatedAt,
            other => {
                return Err(Error::UnsupportedOperation(format!(
                    "unknown column '{other}'"
                )))
            }
        })
    }

    /// Identity and derived columns cannot be assigned.
    pub fn is_writable(&self) -> bool {
        matches!(
            self,
            Column::SchemaVersion
                | Column::PluginKey
                | Column::SnapshotContent
                | Column::ContentField(_)
                | Column::Untracked
        )
    }
}

// =============================================================================
// Output and Plans
// =============================================================================

/// Result of executing a statement.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueryOutput {
    /// Selected rows (empty for writes).
    pub rows: Vec<StateRow>,
    /// Rows staged by a write.
    pub affected: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteKind {
    Insert,
    Update,
    Delete,
}

/// One step of a query plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "step", rename_all = "snake_case")]
pub enum PlanStep {
    /// The schema's cache is stale and is rebuilt first.
    Repopulate { schema_key: String },
    /// Cache rows served directly.
    FastPath {
        schema_key: String,
        version_id: VersionId,
    },
    /// Overlay, untracked and cache consulted level by level.
    InheritanceWalk {
        schema_key: String,
        version_id: VersionId,
        chain: Vec<VersionId>,
    },
    /// Writes staged in the transaction overlay.
    Stage {
        kind: WriteKind,
        version_id: VersionId,
    },
}

/// What [`QueryEnv::explain`] returns.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryPlan {
    pub steps: Vec<PlanStep>,
}

// =============================================================================
// Execution
// =============================================================================

/// Borrowed engine state a statement runs against.
pub struct QueryEnv<'a> {
    pub conn: &'a Connection,
    pub snapshots: &'a mut SnapshotStore,
    pub graphs: &'a GraphCache,
    pub registry: &'a mut SchemaRegistry,
    pub seq: &'a Sequencer,
    pub overlay: &'a mut TransactionOverlay,
    pub active_version: &'a VersionId,
    pub max_depth: usize,
}

impl QueryEnv<'_> {
    /// Executes a statement. Writes are staged in the overlay.
    pub fn execute(&mut self, statement: &Statement) -> Result<QueryOutput> {
        match statement {
            Statement::Select { view, filter } => {
                let mut rows = Vec::new();
                for version in self.read_targets(*view, filter)? {
                    rows.extend(self.read(&version, filter)?);
                }
                Ok(QueryOutput { rows, affected: 0 })
            }
            Statement::Insert {
                view,
                version_id,
                rows,
            } => {
                let version = self.write_target(*view, version_id.as_ref())?;
                let mut staged = Vec::with_capacity(rows.len());
                for row in rows {
                    staged.push(self.prepare_insert(&version, row)?);
                }
                let affected = staged.len();
                for entry in staged {
                    self.overlay.put(entry);
                }
                tracing::debug!(version_id = %version, affected, "insert staged");
                Ok(QueryOutput {
                    rows: Vec::new(),
                    affected,
                })
            }
            Statement::Update { view, filter, set } => {
                let assignments = parse_assignments(set)?;
                let version = self.write_target(*view, filter.version_id.as_ref())?;
                let targets = self.read(&version, filter)?;
                let mut staged = Vec::with_capacity(targets.len());
                for row in &targets {
                    staged.push(self.prepare_update(&version, row, &assignments)?);
                }
                let affected = staged.len();
                for entry in staged {
                    self.overlay.put(entry);
                }
                tracing::debug!(version_id = %version, affected, "update staged");
                Ok(QueryOutput {
                    rows: Vec::new(),
                    affected,
                })
            }
            Statement::Delete { view, filter } => {
                let version = self.write_target(*view, filter.version_id.as_ref())?;
                let targets = self.read(&version, filter)?;
                let staged_at = self.seq.timestamp();
                for row in &targets {
                    self.overlay.put(OverlayEntry {
                        version_id: version.clone(),
                        key: row.key(),
                        schema_version: row.schema_version.clone(),
                        plugin_key: row.plugin_key.clone(),
                        content: None,
                        // Inherited rows are shadowed by a tracked tombstone in V.
                        untracked: row.untracked && row.inherited_from_version_id.is_none(),
                        staged_at: staged_at.clone(),
                    });
                }
                tracing::debug!(version_id = %version, affected = targets.len(), "delete staged");
                Ok(QueryOutput {
                    rows: Vec::new(),
                    affected: targets.len(),
                })
            }
        }
    }

    /// Describes how a statement would run, without running it.
    pub fn explain(&mut self, statement: &Statement) -> Result<QueryPlan> {
        let (read_versions, filter, write) = match statement {
            Statement::Select { view, filter } => {
                (self.read_targets(*view, filter)?, filter.clone(), None)
            }
            Statement::Insert {
                view,
                version_id,
                rows,
            } => {
                let version = self.write_target(*view, version_id.as_ref())?;
                for row in rows {
                    if row.snapshot_content.is_null() {
                        return Err(null_insert());
                    }
                }
                return Ok(QueryPlan {
                    steps: vec![PlanStep::Stage {
                        kind: WriteKind::Insert,
                        version_id: version,
                    }],
                });
            }
            Statement::Update { view, filter, set } => {
                parse_assignments(set)?;
                let version = self.write_target(*view, filter.version_id.as_ref())?;
                (vec![version.clone()], filter.clone(), Some((WriteKind::Update, version)))
            }
            Statement::Delete { view, filter } => {
                let version = self.write_target(*view, filter.version_id.as_ref())?;
                (vec![version.clone()], filter.clone(), Some((WriteKind::Delete, version)))
            }
        };

        let versions = version_map(self.conn)?;
        let mut steps = Vec::new();
        let mut repopulated = BTreeSet::new();
        for version in &read_versions {
            let chain = inheritance_chain(&versions, version, self.max_depth)?;
            for schema_key in self.schema_keys(&filter)? {
                if !repopulated.contains(&schema_key) && self.chain_is_stale(&schema_key, &chain)? {
                    repopulated.insert(schema_key.clone());
                    steps.push(PlanStep::Repopulate {
                        schema_key: schema_key.clone(),
                    });
                }
                if self.needs_walk(&schema_key, &chain)? {
                    steps.push(PlanStep::InheritanceWalk {
                        schema_key,
                        version_id: version.clone(),
                        chain: chain.clone(),
                    });
                } else {
                    steps.push(PlanStep::FastPath {
                        schema_key,
                        version_id: version.clone(),
                    });
                }
            }
        }
        if let Some((kind, version_id)) = write {
            steps.push(PlanStep::Stage { kind, version_id });
        }
        Ok(QueryPlan { steps })
    }

    /// Rows visible in `version` that match `filter`, sorted by
    /// `(schema_key, file_id, entity_id)`.
    pub fn read(&mut self, version: &VersionId, filter: &StateFilter) -> Result<Vec<StateRow>> {
        let versions = version_map(self.conn)?;
        let chain = inheritance_chain(&versions, version, self.max_depth)?;
        let mut rows = Vec::new();
        for schema_key in self.schema_keys(filter)? {
            if self.chain_is_stale(&schema_key, &chain)? {
                let graph = self.graphs.get(self.conn)?;
                StateCache::populate(self.conn, &graph, self.snapshots, &schema_key, self.max_depth)?;
            }

            if self.needs_walk(&schema_key, &chain)? {
                rows.extend(self.walk(&schema_key, &chain)?);
            } else {
                rows.extend(
                    StateCache::rows_for_version(self.conn, &schema_key, version)?
                        .into_iter()
                        .filter_map(|row| cache_to_state(row, version)),
                );
            }
        }

        rows.retain(|row| filter.matches(row));
        rows.sort_by(|a, b| {
            (&a.schema_key, &a.file_id, &a.entity_id).cmp(&(&b.schema_key, &b.file_id, &b.entity_id))
        });
        Ok(rows)
    }

    fn walk(&self, schema_key: &str, chain: &[VersionId]) -> Result<Vec<StateRow>> {
        let target = &chain[0];
        let mut seen: HashSet<EntityKey> = HashSet::new();
        let mut rows = Vec::new();

        for (depth, level) in chain.iter().enumerate() {
            let inherited = (depth > 0).then(|| level.clone());

            for entry in self.overlay.entries_for(level, schema_key) {
                if !seen.insert(entry.key.clone()) {
                    continue;
                }
                if let Some(content) = &entry.content {
                    rows.push(StateRow {
                        entity_id: entry.key.entity_id.clone(),
                        schema_key: entry.key.schema_key.clone(),
                        schema_version: entry.schema_version.clone(),
                        file_id: entry.key.file_id.clone(),
                        plugin_key: entry.plugin_key.clone(),
                        snapshot_content: content.clone(),
                        version_id: target.clone(),
                        inherited_from_version_id: inherited.clone(),
                        change_id: None,
                        commit_id: None,
                        untracked: entry.untracked,
                        created_at: entry.staged_at.clone(),
                        updated_at: entry.staged_at.clone(),
                    });
                }
            }

            for row in untracked::rows(self.conn, schema_key, level)? {
                if seen.insert(row.key.clone()) {
                    rows.push(untracked_to_state(row, target, inherited.clone()));
                }
            }

            for row in StateCache::own_rows(self.conn, schema_key, level)? {
                if !seen.insert(row.key()) {
                    continue;
                }
                if let Some(mut state) = cache_to_state(row, target) {
                    state.inherited_from_version_id = inherited.clone();
                    rows.push(state);
                }
            }
        }
        Ok(rows)
    }

    fn needs_walk(&self, schema_key: &str, chain: &[VersionId]) -> Result<bool> {
        Ok(self.overlay.touches(chain, schema_key) || untracked::has_rows(self.conn, schema_key, chain)?)
    }

    fn chain_is_stale(&self, schema_key: &str, chain: &[VersionId]) -> Result<bool> {
        for level in chain {
            if StateCache::is_stale(self.conn, schema_key, level)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn schema_keys(&self, filter: &StateFilter) -> Result<BTreeSet<String>> {
        if let Some(key) = &filter.schema_key {
            return Ok(BTreeSet::from([key.clone()]));
        }
        let mut keys = StateCache::known_schema_keys(self.conn)?;
        keys.extend(untracked::schema_keys(self.conn)?);
        keys.extend(self.overlay.schema_keys());
        Ok(keys)
    }

    fn read_targets(&self, view: View, filter: &StateFilter) -> Result<Vec<VersionId>> {
        match (view, &filter.version_id) {
            (View::State, None) => Ok(vec![self.active_version.clone()]),
            (View::State, Some(v)) if v == self.active_version => Ok(vec![v.clone()]),
            (View::State, Some(v)) => Err(Error::UnsupportedOperation(format!(
                "state is scoped to the active version; use state_all to read '{v}'"
            ))),
            (View::StateAll, Some(v)) => Ok(vec![v.clone()]),
            (View::StateAll, None) => Ok(list_versions(self.conn)?
                .into_iter()
                .map(|v| v.id)
                .collect()),
        }
    }

    fn write_target(&self, view: View, version: Option<&VersionId>) -> Result<VersionId> {
        match (view, version) {
            (View::State, None) => Ok(self.active_version.clone()),
            (View::State, Some(v)) if v == self.active_version => Ok(v.clone()),
            (View::State, Some(v)) => Err(Error::UnsupportedOperation(format!(
                "state is scoped to the active version; use state_all to write '{v}'"
            ))),
            (View::StateAll, Some(v)) => {
                crate::version::load_version(self.conn, v)?;
                Ok(v.clone())
            }
            (View::StateAll, None) => Err(Error::UnsupportedOperation(
                "writes to state_all require a version_id".to_string(),
            )),
        }
    }

    fn schema_for(&mut self, schema_key: &str, version: Option<&str>) -> Result<std::sync::Arc<CompiledSchema>> {
        match version {
            Some(v) => self.registry.get(self.conn, schema_key, v),
            None => self.registry.latest(self.conn, schema_key),
        }
    }

    fn prepare_insert(&mut self, version: &VersionId, row: &InsertRow) -> Result<OverlayEntry> {
        if row.snapshot_content.is_null() {
            return Err(null_insert());
        }
        let schema = self.schema_for(&row.schema_key, row.schema_version.as_deref())?;
        schema.validate(&row.snapshot_content)?;
        let entity_id = match &row.entity_id {
            Some(id) => id.clone(),
            None => schema.entity_id(&row.snapshot_content)?,
        };
        Ok(OverlayEntry {
            version_id: version.clone(),
            key: EntityKey::new(
                entity_id,
                &row.schema_key,
                row.file_id.as_deref().unwrap_or(LIX_FILE_ID),
            ),
            schema_version: schema.version().to_string(),
            plugin_key: row
                .plugin_key
                .clone()
                .unwrap_or_else(|| LIX_OWN_PLUGIN_KEY.to_string()),
            content: Some(row.snapshot_content.clone()),
            untracked: row.untracked,
            staged_at: self.seq.timestamp(),
        })
    }

    fn prepare_update(
        &mut self,
        version: &VersionId,
        row: &StateRow,
        assignments: &[(Column, Value)],
    ) -> Result<OverlayEntry> {
        let mut content = row.snapshot_content.clone();
        let mut schema_version = row.schema_version.clone();
        let mut plugin_key = row.plugin_key.clone();
        let mut is_untracked = row.untracked && row.inherited_from_version_id.is_none();

        for (column, value) in assignments {
            match column {
                Column::SnapshotContent => {
                    if value.is_null() {
                        return Err(Error::UnsupportedOperation(
                            "setting snapshot_content to null; use delete".to_string(),
                        ));
                    }
                    content = value.clone();
                }
                Column::ContentField(field) => match content.as_object_mut() {
                    Some(object) => {
                        object.insert(field.clone(), value.clone());
                    }
                    None => {
                        return Err(Error::validation(
                            &row.schema_key,
                            "content must be a JSON object",
                        ))
                    }
                },
                Column::PluginKey => {
                    plugin_key = value
                        .as_str()
                        .ok_or_else(|| Error::InvalidArgument("plugin_key must be a string".to_string()))?
                        .to_string();
                }
                Column::SchemaVersion => {
                    schema_version = value
                        .as_str()
                        .ok_or_else(|| {
                            Error::InvalidArgument("schema_version must be a string".to_string())
                        })?
                        .to_string();
                }
                Column::Untracked => {
                    is_untracked = value.as_bool().ok_or_else(|| {
                        Error::InvalidArgument("untracked must be a boolean".to_string())
                    })?;
                }
                _ => {}
            }
        }

        let schema = self.schema_for(&row.schema_key, Some(&schema_version))?;
        schema.validate(&content)?;

        Ok(OverlayEntry {
            version_id: version.clone(),
            key: row.key(),
            schema_version,
            plugin_key,
            content: Some(content),
            untracked: is_untracked,
            staged_at: self.seq.timestamp(),
        })
    }
}

fn null_insert() -> Error {
    Error::UnsupportedOperation("insert requires non-null snapshot_content".to_string())
}

fn parse_assignments(set: &[Assignment]) -> Result<Vec<(Column, Value)>> {
    if set.is_empty() {
        return Err(Error::InvalidArgument("update without assignments".to_string()));
    }
    set.iter()
        .map(|a| {
            let column = Column::parse(&a.column)?;
            if !column.is_writable() {
                return Err(Error::UnsupportedOperation(format!(
                    "column '{}' is an identity or derived column",
                    a.column
                )));
            }
            Ok((column, a.value.clone()))
        })
        .collect()
}

fn cache_to_state(row: CacheRow, target: &VersionId) -> Option<StateRow> {
    if row.is_tombstone {
        return None;
    }
    Some(StateRow {
        entity_id: row.entity_id,
        schema_key: row.schema_key,
        schema_version: row.schema_version,
        file_id: row.file_id,
        plugin_key: row.plugin_key,
        snapshot_content: row.snapshot_content?,
        version_id: target.clone(),
        inherited_from_version_id: row.inherited_from_version_id,
        change_id: Some(row.change_id),
        commit_id: Some(row.commit_id),
        untracked: false,
        created_at: row.created_at,
        updated_at: row.updated_at,
    })
}

fn untracked_to_state(row: UntrackedRow, target: &VersionId, inherited: Option<VersionId>) -> StateRow {
    StateRow {
        entity_id: row.key.entity_id,
        schema_key: row.key.schema_key,
        schema_version: row.schema_version,
        file_id: row.key.file_id,
        plugin_key: row.plugin_key,
        snapshot_content: row.snapshot_content,
        version_id: target.clone(),
        inherited_from_version_id: inherited,
        change_id: None,
        commit_id: None,
        untracked: true,
        created_at: row.created_at,
        updated_at: row.updated_at,
    }
}

// =============================================================================
// Direct Resolution
// =============================================================================

/// Resolves tracked state of `version` straight from the graph, bypassing the
/// cache. Sorted like [`QueryEnv::read`].
pub fn resolve_direct(
    conn: &Connection,
    graph: &GraphIndex,
    snapshots: &mut SnapshotStore,
    version: &VersionId,
    schema_key: &str,
    max_depth: usize,
) -> Result<Vec<StateRow>> {
    let versions = version_map(conn)?;
    let chain = inheritance_chain(&versions, version, max_depth)?;
    let mut seen = HashSet::new();
    let mut rows = Vec::new();

    for (depth, level) in chain.iter().enumerate() {
        let head = &versions[level].commit_id;
        for (key, res) in graph.resolve_leaves(std::slice::from_ref(head))? {
            if key.schema_key != schema_key || !seen.insert(key.clone()) {
                continue;
            }
            let Some(content) = snapshots.get(conn, &res.change.snapshot_id)? else {
                continue;
            };
            rows.push(StateRow {
                entity_id: key.entity_id,
                schema_key: key.schema_key,
                schema_version: res.change.schema_version.clone(),
                file_id: key.file_id,
                plugin_key: res.change.plugin_key.clone(),
                snapshot_content: content,
                version_id: version.clone(),
                inherited_from_version_id: (depth > 0).then(|| level.clone()),
                change_id: Some(res.change.id.clone()),
                commit_id: Some(res.commit_id.clone()),
                untracked: false,
                created_at: res.first_created_at.clone(),
                updated_at: res.change.created_at.clone(),
            });
        }
    }
    rows.sort_by(|a, b| {
        (&a.schema_key, &a.file_id, &a.entity_id).cmp(&(&b.schema_key, &b.file_id, &b.entity_id))
    });
    Ok(rows)
}

// =============================================================================
// Tests
// =============================================================================
