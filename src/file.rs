//! # Files
//!
//! A file is a `lix_file_descriptor` entity `{id, path}` (file `lix`) plus the
//! entities a plugin detected in its bytes (file = descriptor id). The bytes
//! themselves are never stored:
//!
//! ```text
//!   write_file(path, bytes)
//!     descriptor ──► plugin = for_path(path)
//!                ──► before = materialize(current entities)
//!                ──► detect_changes(before, bytes) ──► staged inserts / deletes
//!
//!   read_file(path)
//!     descriptor ──► apply_changes(None, current entities) ──► bytes
//! ```
//!
//! Everything here goes through [`QueryEnv`], so file writes are staged in the
//! transaction overlay like any other write.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{Error, Result};
use crate::plugin::{DetectedChange, Plugin, PluginRegistry};
use crate::query::{InsertRow, QueryEnv, StateFilter, Statement, View};
use crate::registry::FILE_DESCRIPTOR_SCHEMA;
use crate::types::{StateRow, VersionId, LIX_FILE_ID};

/// A file known to a version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub id: String,
    pub path: String,
}

/// A file re-materialized after the active version changed. `data` is `None`
/// when the file does not exist in the new version.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterializedFile {
    pub id: String,
    pub path: String,
    pub data: Option<Vec<u8>>,
}

/// Descriptors visible in `version`, sorted by path.
pub fn list_files(env: &mut QueryEnv<'_>, version: &VersionId) -> Result<Vec<FileDescriptor>> {
    let rows = env.read(version, &StateFilter::schema(FILE_DESCRIPTOR_SCHEMA))?;
    let mut files: Vec<FileDescriptor> = rows.iter().filter_map(descriptor_of).collect();
    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}

fn find_descriptor(
    env: &mut QueryEnv<'_>,
    version: &VersionId,
    path: &str,
) -> Result<Option<FileDescriptor>> {
    let filter = StateFilter::schema(FILE_DESCRIPTOR_SCHEMA).content_eq("path", json!(path));
    Ok(env.read(version, &filter)?.iter().find_map(descriptor_of))
}

fn descriptor_of(row: &StateRow) -> Option<FileDescriptor> {
    Some(FileDescriptor {
        id: row.snapshot_content.get("id")?.as_str()?.to_string(),
        path: row.snapshot_content.get("path")?.as_str()?.to_string(),
    })
}

/// Entities of one file, sorted by `(schema_key, entity_id)`.
fn file_entities(
    env: &mut QueryEnv<'_>,
    version: &VersionId,
    file_id: &str,
) -> Result<Vec<StateRow>> {
    let filter = StateFilter {
        file_id: Some(file_id.to_string()),
        ..StateFilter::default()
    };
    env.read(version, &filter)
}

fn materialize(plugin: &dyn Plugin, rows: &[StateRow]) -> Result<Vec<u8>> {
    let changes: Vec<DetectedChange> = rows
        .iter()
        .map(|row| DetectedChange {
            entity_id: row.entity_id.clone(),
            schema_key: row.schema_key.clone(),
            snapshot_content: Some(row.snapshot_content.clone()),
        })
        .collect();
    plugin.apply_changes(None, &changes)
}

/// Writes a file in the active version. Returns the number of entity changes
/// the plugin detected.
///
/// # Errors
///
/// `PluginMissing` when no plugin matches `path`; whatever the plugin or the
/// schema validation reports.
pub fn write_file(
    env: &mut QueryEnv<'_>,
    plugins: &PluginRegistry,
    path: &str,
    data: &[u8],
) -> Result<usize> {
    validate_path(path)?;
    let plugin = plugins.for_path(path)?;
    let version = env.active_version.clone();

    let (file_id, before) = match find_descriptor(env, &version, path)? {
        Some(descriptor) => {
            let rows = file_entities(env, &version, &descriptor.id)?;
            let before = materialize(plugin.as_ref(), &rows)?;
            (descriptor.id, Some(before))
        }
        None => {
            let id = env.seq.uuid();
            env.execute(&Statement::insert(
                View::State,
                None,
                vec![InsertRow::new(FILE_DESCRIPTOR_SCHEMA, json!({ "id": id, "path": path }))
                    .file(LIX_FILE_ID)],
            ))?;
            (id, None)
        }
    };

    let detected = plugin.detect_changes(before.as_deref(), data)?;
    let mut inserts = Vec::new();
    for change in &detected {
        match &change.snapshot_content {
            Some(content) => inserts.push(
                InsertRow::new(&change.schema_key, content.clone())
                    .entity_id(&change.entity_id)
                    .file(&file_id)
                    .plugin(plugin.key()),
            ),
            None => {
                env.execute(&Statement::delete(
                    View::State,
                    StateFilter::schema(&change.schema_key)
                        .entity(&change.entity_id)
                        .file(&file_id),
                ))?;
            }
        }
    }
    if !inserts.is_empty() {
        env.execute(&Statement::insert(View::State, None, inserts))?;
    }

    tracing::debug!(path, file_id = %file_id, changes = detected.len(), "file written");
    Ok(detected.len())
}

/// Materializes a file as seen by `version`. `None` if it does not exist there.
pub fn read_file(
    env: &mut QueryEnv<'_>,
    plugins: &PluginRegistry,
    version: &VersionId,
    path: &str,
) -> Result<Option<Vec<u8>>> {
    let Some(descriptor) = find_descriptor(env, version, path)? else {
        return Ok(None);
    };
    let plugin = plugins.for_path(path)?;
    let rows = file_entities(env, version, &descriptor.id)?;
    materialize(plugin.as_ref(), &rows).map(Some)
}

/// Deletes a file and all of its entities from the active version.
pub fn delete_file(env: &mut QueryEnv<'_>, path: &str) -> Result<usize> {
    let version = env.active_version.clone();
    let descriptor = find_descriptor(env, &version, path)?
        .ok_or_else(|| Error::not_found("file", path))?;

    let removed = env
        .execute(&Statement::delete(
            View::State,
            StateFilter {
                file_id: Some(descriptor.id.clone()),
                ..StateFilter::default()
            },
        ))?
        .affected;
    env.execute(&Statement::delete(
        View::State,
        StateFilter::schema(FILE_DESCRIPTOR_SCHEMA)
            .entity(&descriptor.id)
            .file(LIX_FILE_ID),
    ))?;
    tracing::debug!(path, file_id = %descriptor.id, entities = removed, "file deleted");
    Ok(removed)
}

/// Files whose entities differ between `from` and `to`, materialized as `to`
/// sees them. Files without a matching plugin are skipped.
pub fn changed_files(
    env: &mut QueryEnv<'_>,
    plugins: &PluginRegistry,
    from: &VersionId,
    to: &VersionId,
) -> Result<Vec<MaterializedFile>> {
    let before = list_files(env, from)?;
    let after = list_files(env, to)?;

    let mut ids: Vec<(String, String)> = after
        .iter()
        .chain(before.iter())
        .map(|f| (f.id.clone(), f.path.clone()))
        .collect();
    ids.sort();
    ids.dedup_by(|a, b| a.0 == b.0);

    let mut out = Vec::new();
    for (id, path) in ids {
        let old = entity_contents(&file_entities(env, from, &id)?);
        let new_rows = file_entities(env, to, &id)?;
        let exists_after = after.iter().any(|f| f.id == id);
        let exists_before = before.iter().any(|f| f.id == id);
        if exists_before == exists_after && old == entity_contents(&new_rows) {
            continue;
        }

        let path = after
            .iter()
            .find(|f| f.id == id)
            .map_or(path, |f| f.path.clone());
        let plugin = match plugins.for_path(&path) {
            Ok(plugin) => plugin,
            Err(Error::PluginMissing { .. }) => {
                tracing::warn!(path = %path, "no plugin for changed file, skipping");
                continue;
            }
            Err(e) => return Err(e),
        };
        let data = if exists_after {
            Some(materialize(plugin.as_ref(), &new_rows)?)
        } else {
            None
        };
        out.push(MaterializedFile { id, path, data });
    }
    Ok(out)
}

fn entity_contents(rows: &[StateRow]) -> Vec<(String, String, Value)> {
    rows.iter()
        .map(|r| (r.schema_key.clone(), r.entity_id.clone(), r.snapshot_content.clone()))
        .collect()
}

fn validate_path(path: &str) -> Result<()> {
    if !path.starts_with('/') || path.ends_with('/') || path.contains("//") {
        return Err(Error::InvalidArgument(format!(
            "'{path}' is not an absolute file path"
        )));
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================
