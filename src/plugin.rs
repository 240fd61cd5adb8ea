//! # Plugins
//!
//! A plugin translates between the bytes of a file format and entity rows:
//!
//! ```text
//!   detect_changes(before, after) ──► [DetectedChange]     bytes -> entities
//!   apply_changes(base, changes)  ──► bytes                entities -> bytes
//! ```
//!
//! The round trip `apply_changes(before, detect_changes(before, after))` must
//! reproduce `after` exactly. Plugins are selected by matching their glob
//! against a file path.
//!
//! # Rust Pattern: Default Trait Methods
//!
//! Both capabilities have default bodies that fail with
//! `PluginDoesNotImplementFunction`, so a read-only plugin only overrides
//! `apply_changes`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};
use crate::registry::SchemaDefinition;

/// One entity-level change reported by a plugin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedChange {
    pub entity_id: String,
    pub schema_key: String,
    /// `None` deletes the entity.
    pub snapshot_content: Option<Value>,
}

/// A file format handler.
pub trait Plugin: Send + Sync {
    /// Unique key stored on every change the plugin produces.
    fn key(&self) -> &str;

    /// Path glob, e.g. `*.json` or `docs/**/*.md`.
    fn glob(&self) -> &str;

    /// Schemas of the entities this plugin emits.
    fn schemas(&self) -> Vec<SchemaDefinition> {
        Vec::new()
    }

    /// Entity changes that turn `before` (absent for a new file) into `after`.
    fn detect_changes(&self, before: Option<&[u8]>, after: &[u8]) -> Result<Vec<DetectedChange>> {
        let _ = (before, after);
        Err(Error::PluginDoesNotImplementFunction {
            plugin_key: self.key().to_string(),
            function: "detect_changes",
        })
    }

    /// Materializes a file from `base` plus `changes`.
    fn apply_changes(&self, base: Option<&[u8]>, changes: &[DetectedChange]) -> Result<Vec<u8>> {
        let _ = (base, changes);
        Err(Error::PluginDoesNotImplementFunction {
            plugin_key: self.key().to_string(),
            function: "apply_changes",
        })
    }
}

/// Registered plugins, in registration order.
#[derive(Default, Clone)]
pub struct PluginRegistry {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a plugin.
    ///
    /// # Errors
    ///
    /// `InvalidArgument` if a plugin with the same key is registered.
    pub fn register(&mut self, plugin: Arc<dyn Plugin>) -> Result<()> {
        if self.plugins.iter().any(|p| p.key() == plugin.key()) {
            return Err(Error::InvalidArgument(format!(
                "plugin '{}' is already registered",
                plugin.key()
            )));
        }
        tracing::debug!(plugin_key = plugin.key(), glob = plugin.glob(), "plugin registered");
        self.plugins.push(plugin);
        Ok(())
    }

    /// Looks a plugin up by key.
    pub fn get(&self, key: &str) -> Result<Arc<dyn Plugin>> {
        self.plugins
            .iter()
            .find(|p| p.key() == key)
            .cloned()
            .ok_or_else(|| Error::PluginMissing {
                key: key.to_string(),
            })
    }

    /// The first registered plugin whose glob matches `path`.
    pub fn for_path(&self, path: &str) -> Result<Arc<dyn Plugin>> {
        self.plugins
            .iter()
            .find(|p| glob_match(p.glob(), path))
            .cloned()
            .ok_or_else(|| Error::PluginMissing {
                key: path.to_string(),
            })
    }

    pub fn keys(&self) -> Vec<String> {
        self.plugins.iter().map(|p| p.key().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.plugins.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plugins.is_empty()
    }
}

/// Matches a path against a glob.
///
/// `*` and `?` stay within one path segment, `**` crosses segments. A pattern
/// without `/` is matched against the file name only.
pub fn glob_match(pattern: &str, path: &str) -> bool {
    let pattern = pattern.trim_start_matches('/');
    let path = path.trim_start_matches('/');
    let subject = if pattern.contains('/') {
        path
    } else {
        path.rsplit('/').next().unwrap_or(path)
    };
    let p: Vec<char> = pattern.chars().collect();
    let s: Vec<char> = subject.chars().collect();
    glob_chars(&p, &s)
}

fn glob_chars(p: &[char], s: &[char]) -> bool {
    match p.first() {
        None => s.is_empty(),
        Some('*') if p.get(1) == Some(&'*') => {
            let rest = &p[2..];
            // "**/" may match zero directories.
            if rest.first() == Some(&'/') && glob_chars(&rest[1..], s) {
                return true;
            }
            (0..=s.len()).any(|i| glob_chars(rest, &s[i..]))
        }
        Some('*') => {
            let rest = &p[1..];
            for i in 0..=s.len() {
                if glob_chars(rest, &s[i..]) {
                    return true;
                }
                if i < s.len() && s[i] == '/' {
                    break;
                }
            }
            false
        }
        Some('?') => !s.is_empty() && s[0] != '/' && glob_chars(&p[1..], &s[1..]),
        Some(c) => s.first() == Some(c) && glob_chars(&p[1..], &s[1..]),
    }
}

// =============================================================================
// Tests
// =============================================================================
