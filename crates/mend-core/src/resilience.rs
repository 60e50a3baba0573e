//! Generic resilience primitives.
//!
//! [`retry_with_backoff`] hardens flaky async operations with bounded
//! exponential backoff, and [`TtlCache`] memoizes expensive pure-ish
//! computations with a time-to-live and a hard size bound. Both are used
//! by the layers above to wrap model calls and repeated probes.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::RetryConfig;

// ── Retry with backoff ───────────────────────────────────────

/// Retry an async operation with exponential backoff.
///
/// Makes exactly `max_retries + 1` attempts. After a failure that
/// `is_retryable` accepts, sleeps
/// `min(base_delay_ms * exponential_base^attempt, max_delay_ms)` before the
/// next attempt. The final failure (or a non-retryable one) is returned
/// unchanged so callers can still match on the original error.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: &RetryConfig,
    is_retryable: impl Fn(&E) -> bool,
    mut op: F,
) -> Result<T, E>
where
    E: std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt: u32 = 0;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                if attempt >= policy.max_retries || !is_retryable(&e) {
                    return Err(e);
                }

                let delay = backoff_delay(policy, attempt);
                warn!(
                    attempt = attempt + 1,
                    max = policy.max_retries + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "operation failed, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}

/// Delay before the attempt after zero-based `attempt`, capped at the
/// policy ceiling.
fn backoff_delay(policy: &RetryConfig, attempt: u32) -> Duration {
    let exp = policy.base_delay_ms as f64 * policy.exponential_base.powi(attempt as i32);
    Duration::from_millis(exp.min(policy.max_delay_ms as f64) as u64)
}

// ── TTL memoization ──────────────────────────────────────────

/// Seconds-resolution clock, injectable for tests.
type Clock = Box<dyn Fn() -> f64 + Send + Sync>;

/// Thread-safe memo store with time-to-live and a hard size bound.
///
/// A hit younger than the TTL returns the cached value; an expired hit is
/// evicted and treated as a miss. When an insert would exceed `max_size`,
/// the single oldest-by-insertion entry is evicted first -- this is not an
/// LRU; reads never refresh an entry's age.
///
/// There is no single-flight guarantee: concurrent
/// [`get_or_compute`](Self::get_or_compute) calls with the same key may
/// both compute. The wrapped operations are assumed idempotent, and the
/// lock is never held across a compute.
pub struct TtlCache<K, V> {
    ttl_seconds: f64,
    max_size: usize,
    entries: Mutex<HashMap<K, (f64, V)>>,
    clock: Clock,
}

impl<K, V> std::fmt::Debug for TtlCache<K, V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TtlCache")
            .field("ttl_seconds", &self.ttl_seconds)
            .field("max_size", &self.max_size)
            .finish_non_exhaustive()
    }
}

impl<K, V> TtlCache<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    /// Create a cache holding values for `ttl_seconds`, bounded at
    /// `max_size` entries.
    pub fn new(ttl_seconds: f64, max_size: usize) -> Self {
        Self::with_clock(ttl_seconds, max_size, Box::new(wall_clock))
    }

    /// Create a cache with an injected clock (tests).
    pub(crate) fn with_clock(ttl_seconds: f64, max_size: usize, clock: Clock) -> Self {
        Self {
            ttl_seconds,
            max_size,
            entries: Mutex::new(HashMap::new()),
            clock,
        }
    }

    /// Look up a value, evicting it first if expired.
    pub fn get(&self, key: &K) -> Option<V> {
        let now = (self.clock)();
        let mut entries = self.entries.lock().expect("ttl cache lock poisoned");

        match entries.get(key) {
            Some((inserted_at, value)) if now - inserted_at < self.ttl_seconds => {
                Some(value.clone())
            }
            Some(_) => {
                entries.remove(key);
                None
            }
            None => None,
        }
    }

    /// Insert a value, evicting the oldest entry if the cache is full.
    pub fn insert(&self, key: K, value: V) {
        let now = (self.clock)();
        let mut entries = self.entries.lock().expect("ttl cache lock poisoned");

        if !entries.contains_key(&key) && entries.len() >= self.max_size {
            let oldest = entries
                .iter()
                .min_by(|a, b| a.1.0.total_cmp(&b.1.0))
                .map(|(k, _)| k.clone());
            if let Some(oldest) = oldest {
                debug!("ttl cache full, evicting oldest entry");
                entries.remove(&oldest);
            }
        }

        entries.insert(key, (now, value));
    }

    /// Return the cached value for `key`, computing and storing it on miss.
    ///
    /// The compute runs without the cache lock held, so concurrent callers
    /// with the same key may race; the last write wins.
    pub fn get_or_compute(&self, key: K, compute: impl FnOnce() -> V) -> V {
        if let Some(value) = self.get(&key) {
            return value;
        }
        let value = compute();
        self.insert(key, value.clone());
        value
    }

    /// Returns the number of live entries (expired ones included until
    /// their next lookup).
    pub fn len(&self) -> usize {
        self.entries.lock().expect("ttl cache lock poisoned").len()
    }

    /// Returns whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all entries.
    pub fn clear(&self) {
        self.entries
            .lock()
            .expect("ttl cache lock poisoned")
            .clear();
    }
}

/// Seconds since the Unix epoch.
fn wall_clock() -> f64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
