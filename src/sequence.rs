//! # Deterministic Sequencer
//!
//! Every id, timestamp and generated name in the engine comes from one
//! [`Sequencer`]. In normal mode it uses the wall clock, UUIDv7 and random
//! numbers. In deterministic mode everything derives from a single monotonic
//! counter, so two fresh stores fed the same operations produce
//! byte-identical graphs.
//!
//! ```text
//!   counter n ──► timestamp  1970-01-01T00:00:00.000Z + n ms
//!             ──► uuid       01920000-0000-7000-8000-{n:012x}
//!             ──► name       ADJECTIVES[n % A] NOUNS[(n / A) % N]
//! ```
//!
//! The counter is persisted in `lix_sequence` at every commit, and again
//! after every rollback so values handed out to discarded work are not
//! issued twice. It is resumed on reopen, so deterministic ids never repeat
//! across sessions.
//!
//! Deterministic mode is meant to be set with `LixConfig::deterministic` when
//! a store is created. Turning it on later through the `lix_deterministic_mode`
//! key-value keeps the ids created before it (including `main`'s), and lifts
//! the counter past the newest stored timestamp so that `(created_at, id)`
//! keeps following write order.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use chrono::{DateTime, TimeZone, Utc};
use rand::seq::SliceRandom;
use rand::Rng;
use rusqlite::{Connection, OptionalExtension};

use crate::error::Result;

const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3fZ";

const ADJECTIVES: &[&str] = &[
    "amber", "brave", "calm", "daring", "eager", "fancy", "gentle", "happy", "icy", "jolly",
    "keen", "lively", "mellow", "nimble", "odd", "proud", "quiet", "rapid", "sunny", "tidy",
];

const NOUNS: &[&str] = &[
    "otter", "falcon", "maple", "river", "comet", "badger", "cedar", "harbor", "lantern", "meadow",
    "pebble", "quill", "robin", "summit", "thistle", "willow",
];

/// Source of ids, timestamps and names.
#[derive(Debug)]
pub struct Sequencer {
    deterministic: AtomicBool,
    counter: AtomicU64,
}

impl Sequencer {
    /// Creates a sequencer whose counter starts at `start`.
    pub fn new(deterministic: bool, start: u64) -> Self {
        Self {
            deterministic: AtomicBool::new(deterministic),
            counter: AtomicU64::new(start),
        }
    }

    /// Creates a sequencer resuming the counter persisted in `conn`.
    pub fn load(conn: &Connection, deterministic: bool) -> Result<Self> {
        let stored: Option<i64> = conn
            .query_row("SELECT value FROM lix_sequence WHERE id = 1", [], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(Self::new(deterministic, stored.unwrap_or(0).max(0) as u64))
    }

    /// Writes the current counter value.
    pub fn persist(&self, conn: &Connection) -> Result<()> {
        conn.execute(
            "INSERT INTO lix_sequence (id, value) VALUES (1, ?)
             ON CONFLICT(id) DO UPDATE SET value = excluded.value",
            [self.current() as i64],
        )?;
        Ok(())
    }

    pub fn is_deterministic(&self) -> bool {
        self.deterministic.load(Ordering::SeqCst)
    }

    pub fn set_deterministic(&self, enabled: bool) {
        self.deterministic.store(enabled, Ordering::SeqCst);
    }

    /// The value the next deterministic call will consume.
    pub fn current(&self) -> u64 {
        self.counter.load(Ordering::SeqCst)
    }

    /// Moves the counter up to `floor`. Returns whether it moved.
    pub fn raise_to(&self, floor: u64) -> bool {
        self.counter.fetch_max(floor, Ordering::SeqCst) < floor
    }

    fn advance(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst)
    }

    /// Returns the next sequence number: strictly increasing when
    /// deterministic, random otherwise.
    pub fn next_sequence_number(&self) -> u64 {
        if self.is_deterministic() {
            self.advance()
        } else {
            rand::thread_rng().gen()
        }
    }

    /// Returns an ISO-8601 UTC timestamp with millisecond precision.
    pub fn timestamp(&self) -> String {
        let at = if self.is_deterministic() {
            let n = self.advance();
            Utc.timestamp_millis_opt(n.min(i64::MAX as u64) as i64)
                .single()
                .unwrap_or_else(DateTime::<Utc>::default)
        } else {
            Utc::now()
        };
        at.format(TIMESTAMP_FORMAT).to_string()
    }

    /// Returns a new id.
    pub fn uuid(&self) -> String {
        if self.is_deterministic() {
            format!("01920000-0000-7000-8000-{:012x}", self.advance())
        } else {
            uuid::Uuid::now_v7().to_string()
        }
    }

    /// Returns a human-readable name such as `"brave otter"`.
    pub fn human_name(&self) -> String {
        if self.is_deterministic() {
            let n = self.advance() as usize;
            let adjective = ADJECTIVES[n % ADJECTIVES.len()];
            let noun = NOUNS[(n / ADJECTIVES.len()) % NOUNS.len()];
            format!("{adjective} {noun}")
        } else {
            let mut rng = rand::thread_rng();
            let adjective = ADJECTIVES.choose(&mut rng).copied().unwrap_or("calm");
            let noun = NOUNS.choose(&mut rng).copied().unwrap_or("otter");
            let suffix: u16 = rng.gen_range(0..1000);
            format!("{adjective} {noun} {suffix}")
        }
    }
}

/// Milliseconds since the epoch of the newest change or commit timestamp.
pub fn latest_timestamp_millis(conn: &Connection) -> Result<Option<u64>> {
    let latest: Option<String> = conn.query_row(
        "SELECT MAX(created_at) FROM (
            SELECT created_at FROM lix_change
            UNION ALL
            SELECT created_at FROM lix_commit
        )",
        [],
        |row| row.get(0),
    )?;
    Ok(latest
        .and_then(|at| DateTime::parse_from_rfc3339(&at).ok())
        .map(|at| at.timestamp_millis().max(0) as u64))
}

// =============================================================================
// Tests
// =============================================================================
