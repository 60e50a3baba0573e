//! Durable response cache for model calls.
//!
//! SQLite-backed exact-match cache keyed by a digest of
//! `(model, temperature, prompt)`. Entries expire after `max_age_hours`
//! (lazily on lookup and in the janitor pass after every write) and the
//! store is bounded at `max_entries` by evicting the oldest entries.
//! There is no semantic similarity: two prompts differing only in
//! whitespace are different keys.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, params};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument, warn};

use crate::client::ModelResponse;
use crate::config::CacheConfig;
use crate::error::CoreError;

/// Width of the truncated cache key digest, in hex characters.
const KEY_WIDTH: usize = 32;

/// Length of the stored prompt prefix (diagnostics only).
const PROMPT_PREFIX_CHARS: usize = 1000;

/// Seconds-resolution clock, injectable for tests.
type Clock = Box<dyn Fn() -> f64 + Send + Sync>;

/// Aggregate cache statistics.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheStats {
    /// Number of entries in the store.
    pub entries: u64,
    /// Sum of all hit counts.
    pub total_hits: u64,
    /// Mean hit count per entry.
    pub avg_hits: f64,
}

/// SQLite-backed exact-match cache for model responses.
///
/// Safe for concurrent callers: every operation locks the connection for
/// its duration, so lookups and the janitor pass are each atomic. Cache
/// failures after opening are swallowed with a warning -- a broken cache
/// degrades to misses, it never stops the repair loop.
pub struct ResponseCache {
    /// Connection guarded by a single lock; operations are short.
    conn: Mutex<Connection>,
    /// Entries older than this many hours are expired.
    max_age_hours: u64,
    /// Size bound enforced by the janitor.
    max_entries: u64,
    /// Wall clock, injectable for age tests.
    clock: Clock,
}

impl std::fmt::Debug for ResponseCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResponseCache")
            .field("max_age_hours", &self.max_age_hours)
            .field("max_entries", &self.max_entries)
            .finish_non_exhaustive()
    }
}

impl ResponseCache {
    /// Open (or create) the cache database at `db_path`.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::CacheUnavailable` if the database cannot be
    /// opened or the schema cannot be created.
    pub fn open(db_path: &Path, config: &CacheConfig) -> Result<Self, CoreError> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(db_path)
            .map_err(|e| CoreError::CacheUnavailable(e.to_string()))?;
        Self::with_connection(conn, config)
    }

    /// Open an in-memory cache (tests and ephemeral runs).
    ///
    /// # Errors
    ///
    /// Returns `CoreError::CacheUnavailable` if the schema cannot be
    /// created.
    pub fn open_in_memory(config: &CacheConfig) -> Result<Self, CoreError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| CoreError::CacheUnavailable(e.to_string()))?;
        Self::with_connection(conn, config)
    }

    fn with_connection(conn: Connection, config: &CacheConfig) -> Result<Self, CoreError> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS cache (
                prompt_hash TEXT PRIMARY KEY,
                prompt      TEXT,
                model       TEXT,
                temperature REAL,
                response    TEXT,
                created_at  REAL,
                hit_count   INTEGER DEFAULT 0
            );
            CREATE INDEX IF NOT EXISTS idx_created ON cache(created_at);",
        )
        .map_err(|e| CoreError::CacheUnavailable(e.to_string()))?;

        Ok(Self {
            conn: Mutex::new(conn),
            max_age_hours: config.max_age_hours,
            max_entries: config.max_entries,
            clock: Box::new(wall_clock),
        })
    }

    /// Replace the wall clock (tests).
    #[cfg(test)]
    pub(crate) fn set_clock(&mut self, clock: Clock) {
        self.clock = clock;
    }

    /// Look up a cached response by `(model, temperature, prompt)`.
    ///
    /// A hit increments the entry's hit count and returns a response with
    /// `cached = true`. An entry older than `max_age_hours` is deleted and
    /// treated as absent.
    #[instrument(skip(self, prompt))]
    pub fn get(&self, prompt: &str, model: &str, temperature: f64) -> Option<ModelResponse> {
        let key = hash_key(prompt, model, temperature);
        let now = (self.clock)();
        let conn = self.conn.lock().expect("cache lock poisoned");

        let (response, created_at): (String, f64) = conn
            .query_row(
                "SELECT response, created_at FROM cache WHERE prompt_hash = ?1",
                params![key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()
            .unwrap_or_else(|e| {
                warn!(error = %e, "cache lookup failed");
                None
            })?;

        let age_hours = (now - created_at) / 3600.0;
        if age_hours > self.max_age_hours as f64 {
            debug!(age_hours, "cache entry expired");
            if let Err(e) = conn.execute("DELETE FROM cache WHERE prompt_hash = ?1", params![key]) {
                warn!(error = %e, "failed to delete expired cache entry");
            }
            return None;
        }

        if let Err(e) = conn.execute(
            "UPDATE cache SET hit_count = hit_count + 1 WHERE prompt_hash = ?1",
            params![key],
        ) {
            warn!(error = %e, "failed to update cache hit count");
        }

        Some(ModelResponse {
            content: response,
            model: model.to_owned(),
            temperature,
            prompt_tokens: 0,
            completion_tokens: 0,
            latency_ms: 0.0,
            cached: true,
        })
    }

    /// Upsert a response, then run the janitor pass.
    ///
    /// A write unconditionally supersedes any existing entry with the same
    /// key. The janitor deletes entries older than `max_age_hours` and, if
    /// the store still exceeds `max_entries`, the oldest entries by
    /// creation time until the bound holds.
    #[instrument(skip(self, prompt, response))]
    pub fn set(&self, prompt: &str, model: &str, temperature: f64, response: &str) {
        let key = hash_key(prompt, model, temperature);
        let prefix: String = prompt.chars().take(PROMPT_PREFIX_CHARS).collect();
        let now = (self.clock)();
        let conn = self.conn.lock().expect("cache lock poisoned");

        if let Err(e) = conn.execute(
            "INSERT OR REPLACE INTO cache
             (prompt_hash, prompt, model, temperature, response, created_at, hit_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)",
            params![key, prefix, model, temperature, response, now],
        ) {
            warn!(error = %e, "cache write failed");
            return;
        }

        self.janitor(&conn, now);
    }

    /// Enforce the age and size bounds. Called with the lock held.
    fn janitor(&self, conn: &Connection, now: f64) {
        let cutoff = now - (self.max_age_hours as f64) * 3600.0;
        if let Err(e) = conn.execute("DELETE FROM cache WHERE created_at < ?1", params![cutoff]) {
            warn!(error = %e, "cache age sweep failed");
        }

        let count: u64 = conn
            .query_row("SELECT COUNT(*) FROM cache", [], |row| row.get(0))
            .unwrap_or(0);

        if count > self.max_entries {
            let excess = count - self.max_entries;
            debug!(excess, "cache over size bound, evicting oldest entries");
            if let Err(e) = conn.execute(
                "DELETE FROM cache WHERE prompt_hash IN (
                     SELECT prompt_hash FROM cache ORDER BY created_at ASC LIMIT ?1
                 )",
                params![excess],
            ) {
                warn!(error = %e, "cache size sweep failed");
            }
        }
    }

    /// Aggregate statistics over the store.
    pub fn stats(&self) -> CacheStats {
        let conn = self.conn.lock().expect("cache lock poisoned");
        conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(hit_count), 0), COALESCE(AVG(hit_count), 0.0)
             FROM cache",
            [],
            |row| {
                Ok(CacheStats {
                    entries: row.get(0)?,
                    total_hits: row.get(1)?,
                    avg_hits: row.get(2)?,
                })
            },
        )
        .unwrap_or_else(|e| {
            warn!(error = %e, "cache stats query failed");
            CacheStats {
                entries: 0,
                total_hits: 0,
                avg_hits: 0.0,
            }
        })
    }

    /// Drop every entry.
    pub fn clear(&self) {
        let conn = self.conn.lock().expect("cache lock poisoned");
        if let Err(e) = conn.execute("DELETE FROM cache", []) {
            warn!(error = %e, "cache clear failed");
        }
    }
}

/// Digest `(model, temperature, prompt)` into the fixed-width cache key.
///
/// Temperature uses fixed 2-decimal formatting so `0.2` and `0.20` map to
/// the same key while `0.2` and `0.25` do not.
fn hash_key(prompt: &str, model: &str, temperature: f64) -> String {
    let material = format!("{model}:{temperature:.2}:{prompt}");
    let digest = Sha256::digest(material.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..KEY_WIDTH].to_owned()
}

/// Seconds since the Unix epoch.
fn wall_clock() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
