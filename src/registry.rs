//! # Schema Registry
//!
//! Entity schemas describe the shape of snapshot content. A schema is
//! identified by `(key, version)` and parsed from a JSON-schema-like document:
//!
//! ```json
//! {
//!   "x-lix-key": "markdown_paragraph",
//!   "x-lix-version": "1.0",
//!   "x-lix-primary-key": ["id"],
//!   "type": "object",
//!   "properties": { "id": { "type": "string" }, "text": { "type": "string" } },
//!   "required": ["id", "text"],
//!   "additionalProperties": false
//! }
//! ```
//!
//! Each definition is compiled once into a [`CompiledSchema`] and cached by
//! `(key, version)`. Definitions are immutable once any change references them.
//!
//! A handful of schemas are built in and never stored: key-values, labels,
//! entity labels and file descriptors.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::error::{Error, Result};

// =============================================================================
// Built-in Schema Keys
// =============================================================================

/// Key-value pairs (`{key, value}`), used for runtime configuration.
pub const KEY_VALUE_SCHEMA: &str = "lix_key_value";
/// Labels (`{id, name}`).
pub const LABEL_SCHEMA: &str = "lix_label";
/// Label attachments (`{entity_id, schema_key, file_id, label_id}`).
pub const ENTITY_LABEL_SCHEMA: &str = "lix_entity_label";
/// File descriptors (`{id, path, metadata}`).
pub const FILE_DESCRIPTOR_SCHEMA: &str = "lix_file_descriptor";

/// Separator between primary-key parts in a derived entity id.
pub const ENTITY_ID_SEPARATOR: &str = "~";

// =============================================================================
// Schema Definition
// =============================================================================

/// JSON type allowed for a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Integer,
    Boolean,
    Object,
    Array,
    Null,
}

impl FieldType {
    fn parse(s: &str) -> Option<Self> {
        match s {
            "string" => Some(FieldType::String),
            "number" => Some(FieldType::Number),
            "integer" => Some(FieldType::Integer),
            "boolean" => Some(FieldType::Boolean),
            "object" => Some(FieldType::Object),
            "array" => Some(FieldType::Array),
            "null" => Some(FieldType::Null),
            _ => None,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Integer => "integer",
            FieldType::Boolean => "boolean",
            FieldType::Object => "object",
            FieldType::Array => "array",
            FieldType::Null => "null",
        }
    }

    fn matches(&self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Number => value.is_number(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Object => value.is_object(),
            FieldType::Array => value.is_array(),
            FieldType::Null => value.is_null(),
        }
    }
}

/// Shape of an object schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectShape {
    /// Property name to allowed types. An empty list allows any value.
    pub properties: BTreeMap<String, Vec<FieldType>>,
    pub required: Vec<String>,
    pub additional_properties: bool,
}

/// The shape a snapshot must have. Only objects are supported.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SchemaShape {
    Object(ObjectShape),
}

/// A parsed schema definition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaDefinition {
    pub key: String,
    /// `"major.minor"`.
    pub version: String,
    pub primary_key: Vec<String>,
    pub shape: SchemaShape,
}

impl SchemaDefinition {
    /// Parses a JSON-schema-like document.
    pub fn from_json(doc: &Value) -> Result<Self> {
        let key = doc
            .get("x-lix-key")
            .and_then(Value::as_str)
            .filter(|k| !k.is_empty())
            .ok_or_else(|| Error::validation("<unknown>", "missing x-lix-key"))?
            .to_string();
        let invalid = |message: String| Error::validation(key.clone(), message);

        let version = doc
            .get("x-lix-version")
            .and_then(Value::as_str)
            .ok_or_else(|| invalid("missing x-lix-version".to_string()))?
            .to_string();
        parse_version(&version)
            .ok_or_else(|| invalid(format!("version '{version}' is not major.minor")))?;

        if doc.get("type").and_then(Value::as_str) != Some("object") {
            return Err(invalid("only type \"object\" is supported".to_string()));
        }

        let mut properties = BTreeMap::new();
        if let Some(props) = doc.get("properties") {
            let props = props
                .as_object()
                .ok_or_else(|| invalid("properties must be an object".to_string()))?;
            for (name, prop) in props {
                let types = match prop.get("type") {
                    None => Vec::new(),
                    Some(Value::String(t)) => vec![parse_type(t).ok_or_else(|| {
                        invalid(format!("property '{name}' has unknown type '{t}'"))
                    })?],
                    Some(Value::Array(ts)) => {
                        let mut out = Vec::with_capacity(ts.len());
                        for t in ts {
                            let t = t.as_str().and_then(parse_type).ok_or_else(|| {
                                invalid(format!("property '{name}' has an invalid type list"))
                            })?;
                            out.push(t);
                        }
                        out.sort();
                        out.dedup();
                        out
                    }
                    Some(_) => {
                        return Err(invalid(format!("property '{name}' has an invalid type")))
                    }
                };
                properties.insert(name.clone(), types);
            }
        }

        let required = string_list(doc.get("required"))
            .ok_or_else(|| invalid("required must be a list of strings".to_string()))?;
        let primary_key = string_list(doc.get("x-lix-primary-key"))
            .ok_or_else(|| invalid("x-lix-primary-key must be a list of strings".to_string()))?;
        let additional_properties = match doc.get("additionalProperties") {
            None => true,
            Some(Value::Bool(b)) => *b,
            Some(_) => {
                return Err(invalid(
                    "additionalProperties must be a boolean".to_string(),
                ))
            }
        };

        for field in primary_key.iter().chain(required.iter()) {
            if !additional_properties && !properties.contains_key(field) {
                return Err(invalid(format!("'{field}' is not a declared property")));
            }
        }

        Ok(Self {
            key,
            version,
            primary_key,
            shape: SchemaShape::Object(ObjectShape {
                properties,
                required,
                additional_properties,
            }),
        })
    }

    /// Renders the definition back into the document format it was parsed from.
    pub fn to_json(&self) -> Value {
        let SchemaShape::Object(shape) = &self.shape;
        let properties: serde_json::Map<String, Value> = shape
            .properties
            .iter()
            .map(|(name, types)| {
                let prop = match types.as_slice() {
                    [] => json!({}),
                    [t] => json!({ "type": t.as_str() }),
                    ts => json!({ "type": ts.iter().map(FieldType::as_str).collect::<Vec<_>>() }),
                };
                (name.clone(), prop)
            })
            .collect();
        json!({
            "x-lix-key": self.key,
            "x-lix-version": self.version,
            "x-lix-primary-key": self.primary_key,
            "type": "object",
            "properties": properties,
            "required": shape.required,
            "additionalProperties": shape.additional_properties,
        })
    }
}

fn parse_type(s: &str) -> Option<FieldType> {
    FieldType::parse(s)
}

fn string_list(value: Option<&Value>) -> Option<Vec<String>> {
    match value {
        None => Some(Vec::new()),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| v.as_str().map(str::to_string))
            .collect(),
        Some(_) => None,
    }
}

/// Parses `"major.minor"`.
pub fn parse_version(version: &str) -> Option<(u32, u32)> {
    let (major, minor) = version.split_once('.')?;
    Some((major.parse().ok()?, minor.parse().ok()?))
}

// =============================================================================
// Compiled Schema
// =============================================================================

/// A definition prepared for validation.
#[derive(Debug, Clone)]
pub struct CompiledSchema {
    definition: SchemaDefinition,
}

impl CompiledSchema {
    /// Compiles a definition.
    pub fn compile(definition: SchemaDefinition) -> Self {
        Self { definition }
    }

    pub fn key(&self) -> &str {
        &self.definition.key
    }

    pub fn version(&self) -> &str {
        &self.definition.version
    }

    pub fn definition(&self) -> &SchemaDefinition {
        &self.definition
    }

    /// Validates snapshot content against the shape.
    ///
    /// # Errors
    ///
    /// `SchemaValidation` naming the first offending field.
    pub fn validate(&self, content: &Value) -> Result<()> {
        let SchemaShape::Object(shape) = &self.definition.shape;
        let invalid = |message: String| Error::validation(self.key(), message);

        let object = content
            .as_object()
            .ok_or_else(|| invalid("content must be a JSON object".to_string()))?;

        for field in &shape.required {
            if !object.contains_key(field) {
                return Err(invalid(format!("missing required field '{field}'")));
            }
        }
        for field in &self.definition.primary_key {
            match object.get(field) {
                None | Some(Value::Null) => {
                    return Err(invalid(format!("missing primary key field '{field}'")))
                }
                Some(_) => {}
            }
        }

        for (name, value) in object {
            match shape.properties.get(name) {
                Some(types) if types.is_empty() => {}
                Some(types) => {
                    if !types.iter().any(|t| t.matches(value)) {
                        let expected: Vec<&str> = types.iter().map(FieldType::as_str).collect();
                        return Err(invalid(format!(
                            "field '{name}' must be {}",
                            expected.join(" or ")
                        )));
                    }
                }
                None if shape.additional_properties => {}
                None => return Err(invalid(format!("unknown field '{name}'"))),
            }
        }

        Ok(())
    }

    /// Derives an entity id from the primary-key fields of `content`.
    ///
    /// String parts are used verbatim, other values as their JSON text; parts
    /// are joined with `~`.
    pub fn entity_id(&self, content: &Value) -> Result<String> {
        if self.definition.primary_key.is_empty() {
            return Err(Error::validation(
                self.key(),
                "schema has no primary key; entity_id must be given",
            ));
        }
        let mut parts = Vec::with_capacity(self.definition.primary_key.len());
        for field in &self.definition.primary_key {
            match content.get(field) {
                None | Some(Value::Null) => {
                    return Err(Error::validation(
                        self.key(),
                        format!("missing primary key field '{field}'"),
                    ))
                }
                Some(Value::String(s)) => parts.push(s.clone()),
                Some(other) => parts.push(other.to_string()),
            }
        }
        Ok(parts.join(ENTITY_ID_SEPARATOR))
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Stores definitions in `lix_stored_schema` and caches compiled schemas.
#[derive(Debug)]
pub struct SchemaRegistry {
    compiled: HashMap<(String, String), Arc<CompiledSchema>>,
}

impl Default for SchemaRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SchemaRegistry {
    /// Creates a registry preloaded with the built-in schemas.
    pub fn new() -> Self {
        let mut compiled = HashMap::new();
        for definition in builtin_definitions() {
            let key = (definition.key.clone(), definition.version.clone());
            compiled.insert(key, Arc::new(CompiledSchema::compile(definition)));
        }
        Self { compiled }
    }

    /// Returns true for schemas the engine defines itself.
    pub fn is_builtin(key: &str) -> bool {
        matches!(
            key,
            KEY_VALUE_SCHEMA | LABEL_SCHEMA | ENTITY_LABEL_SCHEMA | FILE_DESCRIPTOR_SCHEMA
        )
    }

    /// Registers a definition.
    ///
    /// Identical re-registration is a no-op. A different definition under an
    /// existing `(key, version)` is accepted only while no change references
    /// it.
    pub fn register(
        &mut self,
        conn: &Connection,
        definition: SchemaDefinition,
    ) -> Result<Arc<CompiledSchema>> {
        if Self::is_builtin(&definition.key) {
            return Err(Error::validation(
                definition.key,
                "built-in schemas cannot be redefined",
            ));
        }

        let encoded = serde_json::to_string(&definition)?;
        let existing: Option<String> = conn
            .query_row(
                "SELECT definition FROM lix_stored_schema WHERE key = ? AND version = ?",
                params![definition.key, definition.version],
                |row| row.get(0),
            )
            .optional()?;

        match existing {
            Some(stored) if stored == encoded => {}
            Some(_) => {
                let referenced: bool = conn.query_row(
                    "SELECT EXISTS(SELECT 1 FROM lix_change WHERE schema_key = ? AND schema_version = ?)",
                    params![definition.key, definition.version],
                    |row| row.get(0),
                )?;
                if referenced {
                    return Err(Error::validation(
                        definition.key,
                        format!(
                            "version {} is referenced by changes and cannot be redefined",
                            definition.version
                        ),
                    ));
                }
                conn.execute(
                    "UPDATE lix_stored_schema SET definition = ? WHERE key = ? AND version = ?",
                    params![encoded, definition.key, definition.version],
                )?;
            }
            None => {
                conn.execute(
                    "INSERT INTO lix_stored_schema (key, version, definition) VALUES (?, ?, ?)",
                    params![definition.key, definition.version, encoded],
                )?;
            }
        }

        tracing::debug!(
            schema_key = %definition.key,
            version = %definition.version,
            "schema registered"
        );
        let cache_key = (definition.key.clone(), definition.version.clone());
        let compiled = Arc::new(CompiledSchema::compile(definition));
        self.compiled.insert(cache_key, Arc::clone(&compiled));
        Ok(compiled)
    }

    /// Returns the compiled schema for `(key, version)`.
    pub fn get(&mut self, conn: &Connection, key: &str, version: &str) -> Result<Arc<CompiledSchema>> {
        let cache_key = (key.to_string(), version.to_string());
        if let Some(compiled) = self.compiled.get(&cache_key) {
            return Ok(Arc::clone(compiled));
        }

        let stored: Option<String> = conn
            .query_row(
                "SELECT definition FROM lix_stored_schema WHERE key = ? AND version = ?",
                params![key, version],
                |row| row.get(0),
            )
            .optional()?;
        let stored = stored.ok_or_else(|| Error::not_found("schema", format!("{key}@{version}")))?;
        let definition: SchemaDefinition = serde_json::from_str(&stored)?;
        let compiled = Arc::new(CompiledSchema::compile(definition));
        self.compiled.insert(cache_key, Arc::clone(&compiled));
        Ok(compiled)
    }

    /// Returns the highest registered version of `key`.
    pub fn latest(&mut self, conn: &Connection, key: &str) -> Result<Arc<CompiledSchema>> {
        let mut versions: Vec<String> = self
            .compiled
            .keys()
            .filter(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
            .collect();

        let mut stmt = conn.prepare("SELECT version FROM lix_stored_schema WHERE key = ?")?;
        let stored = stmt
            .query_map([key], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        versions.extend(stored);

        let version = versions
            .into_iter()
            .filter_map(|v| parse_version(&v).map(|parsed| (parsed, v)))
            .max_by_key(|(parsed, _)| *parsed)
            .map(|(_, v)| v)
            .ok_or_else(|| Error::not_found("schema", key))?;
        self.get(conn, key, &version)
    }

    /// Lists every stored (non-built-in) definition.
    pub fn list(&self, conn: &Connection) -> Result<Vec<SchemaDefinition>> {
        let mut stmt =
            conn.prepare("SELECT definition FROM lix_stored_schema ORDER BY key, version")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        rows.iter()
            .map(|s| serde_json::from_str(s).map_err(Error::from))
            .collect()
    }
}

fn builtin(
    key: &str,
    primary_key: &[&str],
    properties: &[(&str, &[FieldType])],
    required: &[&str],
) -> SchemaDefinition {
    let to_strings = |items: &[&str]| items.iter().map(|s| s.to_string()).collect::<Vec<_>>();
    SchemaDefinition {
        key: key.to_string(),
        version: "1.0".to_string(),
        primary_key: to_strings(primary_key),
        shape: SchemaShape::Object(ObjectShape {
            properties: properties
                .iter()
                .map(|(name, types)| (name.to_string(), types.to_vec()))
                .collect(),
            required: to_strings(required),
            additional_properties: false,
        }),
    }
}

fn builtin_definitions() -> Vec<SchemaDefinition> {
    const STRING: &[FieldType] = &[FieldType::String];
    const ANY: &[FieldType] = &[];
    vec![
        builtin(
            KEY_VALUE_SCHEMA,
            &["key"],
            &[("key", STRING), ("value", ANY)],
            &["key"],
        ),
        builtin(
            LABEL_SCHEMA,
            &["id"],
            &[("id", STRING), ("name", STRING)],
            &["id", "name"],
        ),
        builtin(
            ENTITY_LABEL_SCHEMA,
            &["entity_id", "schema_key", "file_id", "label_id"],
            &[
                ("entity_id", STRING),
                ("schema_key", STRING),
                ("file_id", STRING),
                ("label_id", STRING),
            ],
            &["entity_id", "schema_key", "file_id", "label_id"],
        ),
        builtin(
            FILE_DESCRIPTOR_SCHEMA,
            &["id"],
            &[("id", STRING), ("path", STRING), ("metadata", ANY)],
            &["id", "path"],
        ),
    ]
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Database;

    fn paragraph_doc() -> Value {
        json!({
            "x-lix-key": "paragraph",
            "x-lix-version": "1.0",
            "x-lix-primary-key": ["id"],
            "type": "object",
            "properties": {
                "id": { "type": "string" },
                "text": { "type": "string" },
                "order": { "type": ["integer", "null"] },
            },
            "required": ["id", "text"],
            "additionalProperties": false,
        })
    }

    #[test]
    fn test_parse_and_render_definition() {
        let definition = SchemaDefinition::from_json(&paragraph_doc()).unwrap();
        assert_eq!(definition.key, "paragraph");
        assert_eq!(definition.primary_key, vec!["id".to_string()]);
        let reparsed = SchemaDefinition::from_json(&definition.to_json()).unwrap();
        assert_eq!(reparsed, definition);
    }

    #[test]
    fn test_rejects_malformed_definitions() {
        let mut doc = paragraph_doc();
        doc["x-lix-version"] = json!("one");
        assert!(matches!(
            SchemaDefinition::from_json(&doc),
            Err(Error::SchemaValidation { .. })
        ));

        let mut doc = paragraph_doc();
        doc["type"] = json!("array");
        assert!(SchemaDefinition::from_json(&doc).is_err());

        let mut doc = paragraph_doc();
        doc["x-lix-primary-key"] = json!(["missing"]);
        assert!(SchemaDefinition::from_json(&doc).is_err());
    }

    #[test]
    fn test_validate_content() {
        let schema = CompiledSchema::compile(SchemaDefinition::from_json(&paragraph_doc()).unwrap());
        schema
            .validate(&json!({ "id": "p1", "text": "hello", "order": null }))
            .unwrap();

        let err = schema.validate(&json!({ "id": "p1" })).unwrap_err();
        assert!(err.to_string().contains("missing required field 'text'"));

        let err = schema
            .validate(&json!({ "id": "p1", "text": 5 }))
            .unwrap_err();
        assert!(err.to_string().contains("field 'text' must be string"));

        let err = schema
            .validate(&json!({ "id": "p1", "text": "x", "extra": true }))
            .unwrap_err();
        assert!(err.to_string().contains("unknown field 'extra'"));

        assert!(schema.validate(&json!("not an object")).is_err());
    }

    #[test]
    fn test_entity_id_from_primary_key() {
        let registry = SchemaRegistry::new();
        let entity_label = &registry.compiled[&(ENTITY_LABEL_SCHEMA.to_string(), "1.0".to_string())];
        let id = entity_label
            .entity_id(&json!({
                "entity_id": "c1",
                "schema_key": "lix_commit",
                "file_id": "lix",
                "label_id": "checkpoint",
            }))
            .unwrap();
        assert_eq!(id, "c1~lix_commit~lix~checkpoint");
    }

    #[test]
    fn test_register_is_idempotent_until_referenced() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.connection();
        let mut registry = SchemaRegistry::new();

        let definition = SchemaDefinition::from_json(&paragraph_doc()).unwrap();
        registry.register(conn, definition.clone()).unwrap();
        registry.register(conn, definition.clone()).unwrap();
        assert_eq!(registry.list(conn).unwrap().len(), 1);

        conn.execute(
            "INSERT INTO lix_change VALUES ('c1', 'p1', 'paragraph', '1.0', 'f', 'p', 'no-content', 't')",
            [],
        )
        .unwrap();

        let mut changed = definition;
        let SchemaShape::Object(shape) = &mut changed.shape;
        shape.additional_properties = true;
        let err = registry.register(conn, changed).unwrap_err();
        assert!(matches!(err, Error::SchemaValidation { .. }));
    }

    #[test]
    fn test_latest_picks_highest_version() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.connection();
        let mut registry = SchemaRegistry::new();

        for version in ["1.2", "1.10", "1.9"] {
            let mut doc = paragraph_doc();
            doc["x-lix-version"] = json!(version);
            registry
                .register(conn, SchemaDefinition::from_json(&doc).unwrap())
                .unwrap();
        }

        assert_eq!(registry.latest(conn, "paragraph").unwrap().version(), "1.10");
        assert_eq!(registry.latest(conn, KEY_VALUE_SCHEMA).unwrap().version(), "1.0");
        assert!(matches!(
            registry.latest(conn, "nope"),
            Err(Error::NotFound { .. })
        ));
    }

    #[test]
    fn test_builtins_cannot_be_redefined() {
        let db = Database::open_in_memory().unwrap();
        let mut registry = SchemaRegistry::new();
        let mut doc = paragraph_doc();
        doc["x-lix-key"] = json!(KEY_VALUE_SCHEMA);
        let err = registry
            .register(db.connection(), SchemaDefinition::from_json(&doc).unwrap())
            .unwrap_err();
        assert!(matches!(err, Error::SchemaValidation { .. }));
    }
}
