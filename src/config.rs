//! Engine configuration.
//!
//! Values given at open time. Persistent runtime configuration (such as the
//! deterministic-mode flag) lives in `lix_key_value` entities instead.

use std::time::Duration;

use crate::error::{Error, Result};
use crate::snapshot::DEFAULT_SNAPSHOT_CACHE_CAPACITY;
use crate::subscription::DEFAULT_BROADCAST_CAPACITY;
use crate::version::DEFAULT_MAX_INHERITANCE_DEPTH;

/// Size of the request channel between the async handle and the worker.
pub const DEFAULT_CHANNEL_SIZE: usize = 256;

/// Default upper bound for one sync round trip.
pub const DEFAULT_SYNC_TIMEOUT_MS: u64 = 30_000;

/// Configuration for a [`Lix`](crate::Lix) handle.
#[derive(Debug, Clone)]
pub struct LixConfig {
    /// Start in deterministic mode (and persist the flag on a fresh store).
    pub deterministic: bool,
    /// Request channel capacity.
    pub channel_size: usize,
    /// Decoded snapshots kept in the LRU.
    pub snapshot_cache_capacity: usize,
    /// Longest allowed version inheritance chain.
    pub max_inheritance_depth: usize,
    /// Upper bound for a sync transport call.
    pub sync_timeout: Duration,
    /// Capacity of the commit notification channel.
    pub broadcast_capacity: usize,
}

impl Default for LixConfig {
    fn default() -> Self {
        Self {
            deterministic: false,
            channel_size: DEFAULT_CHANNEL_SIZE,
            snapshot_cache_capacity: DEFAULT_SNAPSHOT_CACHE_CAPACITY,
            max_inheritance_depth: DEFAULT_MAX_INHERITANCE_DEPTH,
            sync_timeout: Duration::from_millis(DEFAULT_SYNC_TIMEOUT_MS),
            broadcast_capacity: DEFAULT_BROADCAST_CAPACITY,
        }
    }
}

impl LixConfig {
    /// Defaults overridden by `LIX_DETERMINISTIC`, `LIX_SNAPSHOT_CACHE_CAPACITY`,
    /// `LIX_SYNC_TIMEOUT_MS` and `LIX_CHANNEL_SIZE`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(v) = lookup("LIX_DETERMINISTIC") {
            config.deterministic = matches!(v.trim(), "1" | "true" | "yes" | "on");
        }
        if let Some(v) = lookup("LIX_SNAPSHOT_CACHE_CAPACITY") {
            config.snapshot_cache_capacity = parse_number("LIX_SNAPSHOT_CACHE_CAPACITY", &v)? as usize;
        }
        if let Some(v) = lookup("LIX_SYNC_TIMEOUT_MS") {
            config.sync_timeout = Duration::from_millis(parse_number("LIX_SYNC_TIMEOUT_MS", &v)?);
        }
        if let Some(v) = lookup("LIX_CHANNEL_SIZE") {
            config.channel_size = parse_number("LIX_CHANNEL_SIZE", &v)?.max(1) as usize;
        }
        Ok(config)
    }

    pub fn deterministic(mut self, enabled: bool) -> Self {
        self.deterministic = enabled;
        self
    }

    pub fn channel_size(mut self, size: usize) -> Self {
        self.channel_size = size.max(1);
        self
    }

    pub fn snapshot_cache_capacity(mut self, capacity: usize) -> Self {
        self.snapshot_cache_capacity = capacity;
        self
    }

    pub fn max_inheritance_depth(mut self, depth: usize) -> Self {
        self.max_inheritance_depth = depth;
        self
    }

    pub fn sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }
}

fn parse_number(name: &str, value: &str) -> Result<u64> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::InvalidArgument(format!("{name} must be a number, got '{value}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults_and_builder() {
        let config = LixConfig::default()
            .deterministic(true)
            .channel_size(0)
            .sync_timeout(Duration::from_millis(50));
        assert!(config.deterministic);
        assert_eq!(config.channel_size, 1);
        assert_eq!(config.max_inheritance_depth, 64);
        assert_eq!(config.sync_timeout, Duration::from_millis(50));
    }

    #[test]
    fn test_from_lookup() {
        let vars: HashMap<&str, &str> = [
            ("LIX_DETERMINISTIC", "true"),
            ("LIX_SNAPSHOT_CACHE_CAPACITY", "8"),
            ("LIX_SYNC_TIMEOUT_MS", "250"),
        ]
        .into_iter()
        .collect();
        let config = LixConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert!(config.deterministic);
        assert_eq!(config.snapshot_cache_capacity, 8);
        assert_eq!(config.sync_timeout, Duration::from_millis(250));
        assert_eq!(config.channel_size, DEFAULT_CHANNEL_SIZE);

        let err = LixConfig::from_lookup(|k| (k == "LIX_CHANNEL_SIZE").then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }
}
