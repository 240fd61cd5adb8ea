#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use lix_engine::{
    DetectedChange, Error, Lix, LixConfig, Plugin, Result, SchemaDefinition, StateFilter,
    Statement, StateRow, View,
};
use serde_json::{json, Value};

pub const ENV_LINE_SCHEMA: &str = "env_line";

/// One `env_line` entity per `KEY=value` line. Lines are written back sorted
/// by key.
pub struct EnvPlugin;

fn parse_env(bytes: &[u8]) -> Vec<(String, String)> {
    String::from_utf8_lossy(bytes)
        .lines()
        .filter_map(|l| l.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), v.trim().to_string()))
        .collect()
}

impl Plugin for EnvPlugin {
    fn key(&self) -> &str {
        "env"
    }

    fn glob(&self) -> &str {
        "*.env"
    }

    fn schemas(&self) -> Vec<SchemaDefinition> {
        let doc = json!({
            "x-lix-key": ENV_LINE_SCHEMA,
            "x-lix-version": "1.0",
            "x-lix-primary-key": ["key"],
            "type": "object",
            "properties": {"key": {"type": "string"}, "value": {"type": "string"}},
            "required": ["key", "value"],
            "additionalProperties": false
        });
        SchemaDefinition::from_json(&doc).map(|d| vec![d]).unwrap_or_default()
    }

    fn detect_changes(&self, before: Option<&[u8]>, after: &[u8]) -> Result<Vec<DetectedChange>> {
        let old = before.map(parse_env).unwrap_or_default();
        let new = parse_env(after);
        let mut out = Vec::new();
        for (k, v) in &new {
            if !old.iter().any(|(ok, ov)| ok == k && ov == v) {
                out.push(DetectedChange {
                    entity_id: k.clone(),
                    schema_key: ENV_LINE_SCHEMA.to_string(),
                    snapshot_content: Some(json!({ "key": k, "value": v })),
                });
            }
        }
        for (k, _) in &old {
            if !new.iter().any(|(nk, _)| nk == k) {
                out.push(DetectedChange {
                    entity_id: k.clone(),
                    schema_key: ENV_LINE_SCHEMA.to_string(),
                    snapshot_content: None,
                });
            }
        }
        Ok(out)
    }

    fn apply_changes(&self, _base: Option<&[u8]>, changes: &[DetectedChange]) -> Result<Vec<u8>> {
        let mut lines = Vec::new();
        for change in changes {
            let Some(content) = &change.snapshot_content else {
                continue;
            };
            let (Some(k), Some(v)) = (content["key"].as_str(), content["value"].as_str()) else {
                return Err(Error::InvalidArgument(format!(
                    "malformed env line '{}'",
                    change.entity_id
                )));
            };
            lines.push(format!("{k}={v}"));
        }
        lines.sort();
        Ok(lines.join("\n").into_bytes())
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub async fn open_deterministic() -> Lix {
    init_tracing();
    Lix::open_in_memory(LixConfig::default().deterministic(true))
        .await
        .expect("open deterministic store")
}

pub async fn open_with_env_plugin() -> Lix {
    let lix = open_deterministic().await;
    lix.register_plugin(Arc::new(EnvPlugin)).await.expect("register plugin");
    lix
}

pub fn create_temp_store(name: &str) -> (tempfile::TempDir, PathBuf) {
    let dir = tempfile::TempDir::new().expect("create temp dir");
    let path = dir.path().join(name);
    (dir, path)
}

/// Key-value rows of the active version as `(key, value)`.
pub async fn key_values(lix: &Lix) -> Vec<(String, Value)> {
    select(lix, StateFilter::schema("lix_key_value"))
        .await
        .into_iter()
        .map(|row| (row.entity_id, row.snapshot_content["value"].clone()))
        .collect()
}

pub async fn select(lix: &Lix, filter: StateFilter) -> Vec<StateRow> {
    lix.execute(Statement::select(View::State, filter))
        .await
        .expect("select")
        .rows
}

pub async fn eventually<T, F, Fut>(timeout: Duration, interval: Duration, mut f: F) -> T
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Option<T>>,
{
    let start = std::time::Instant::now();
    loop {
        if let Some(v) = f().await {
            return v;
        }
        if start.elapsed() > timeout {
            panic!("condition not met within {:?}", timeout);
        }
        tokio::time::sleep(interval).await;
    }
}
