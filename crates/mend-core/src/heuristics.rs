//! Early-termination heuristics for the repair loop.
//!
//! Tracks the running history of patch attempts and signals when the outer
//! loop should stop instead of spending more model calls on a search that
//! is evidently unproductive. The heuristic is a continuous counter machine
//! over one field set per run, mutated only via
//! [`record_attempt`](TerminationHeuristics::record_attempt).

use std::collections::VecDeque;

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::config::TerminationConfig;

/// Capacity of the recent-patch ring buffer.
const PATCH_HISTORY_CAPACITY: usize = 20;

/// Width of the truncated patch digest, in hex characters.
const PATCH_HASH_WIDTH: usize = 16;

/// Stateful early-termination heuristic for one repair run.
///
/// Owned by the outer loop, which records every patch attempt and consults
/// [`should_terminate`](Self::should_terminate) before each new step.
/// [`reset`](Self::reset) clears all state when a new run reuses the same
/// instance.
#[derive(Debug)]
pub struct TerminationHeuristics {
    /// Heuristic thresholds.
    config: TerminationConfig,
    /// Ring buffer of truncated digests of recent patch attempts.
    patch_hashes: VecDeque<String>,
    /// Failures since the last success.
    consecutive_failures: u64,
    /// Attempts recorded this run.
    total_attempts: u64,
    /// Successful attempts recorded this run.
    successful_attempts: u64,
}

impl TerminationHeuristics {
    /// Create a heuristic with the given thresholds.
    pub fn new(config: TerminationConfig) -> Self {
        Self {
            config,
            patch_hashes: VecDeque::with_capacity(PATCH_HISTORY_CAPACITY),
            consecutive_failures: 0,
            total_attempts: 0,
            successful_attempts: 0,
        }
    }

    /// Record one patch attempt.
    ///
    /// Increments the attempt counters, resets or extends the consecutive
    /// failure streak, and appends the truncated digest of `diff` to the
    /// ring buffer (evicting the oldest entry once at capacity).
    pub fn record_attempt(&mut self, diff: &str, success: bool) {
        self.total_attempts += 1;

        if success {
            self.successful_attempts += 1;
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures += 1;
        }

        if self.patch_hashes.len() == PATCH_HISTORY_CAPACITY {
            self.patch_hashes.pop_front();
        }
        self.patch_hashes.push_back(hash_patch(diff));

        debug!(
            total = self.total_attempts,
            successes = self.successful_attempts,
            streak = self.consecutive_failures,
            "recorded patch attempt"
        );
    }

    /// Check whether the run should stop, returning the reason if so.
    ///
    /// Rules are evaluated in fixed priority order; the first that fires
    /// wins:
    ///
    /// 1. too many consecutive failures,
    /// 2. the last `max_similar_patches` recorded patches are identical
    ///    (never fires with fewer entries than that),
    /// 3. success rate below the floor once `min_steps` attempts exist.
    pub fn should_terminate(&self) -> Option<String> {
        if self.consecutive_failures >= self.config.max_consecutive_failures {
            return Some(format!(
                "too many consecutive failures ({})",
                self.consecutive_failures
            ));
        }

        let window = self.config.max_similar_patches;
        if window > 0 && self.patch_hashes.len() >= window {
            let mut recent = self.patch_hashes.iter().rev().take(window);
            let newest = recent.next();
            if let Some(newest) = newest
                && recent.all(|h| h == newest)
            {
                return Some("repeated identical patches".to_owned());
            }
        }

        if self.total_attempts >= self.config.min_steps {
            let rate = self.successful_attempts as f64 / self.total_attempts as f64;
            if rate < self.config.min_success_rate {
                return Some(format!("success rate too low ({:.1}%)", rate * 100.0));
            }
        }

        None
    }

    /// Returns the total attempts recorded this run.
    pub fn total_attempts(&self) -> u64 {
        self.total_attempts
    }

    /// Returns the successful attempts recorded this run.
    pub fn successful_attempts(&self) -> u64 {
        self.successful_attempts
    }

    /// Clear the ring buffer and all counters for a fresh run.
    pub fn reset(&mut self) {
        self.patch_hashes.clear();
        self.consecutive_failures = 0;
        self.total_attempts = 0;
        self.successful_attempts = 0;
    }
}

/// Digest a patch body to a fixed short width for similarity tracking.
fn hash_patch(diff: &str) -> String {
    let digest = Sha256::digest(diff.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{b:02x}")).collect();
    hex[..PATCH_HASH_WIDTH].to_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> TerminationConfig {
        TerminationConfig {
            min_steps: 3,
            max_consecutive_failures: 5,
            max_similar_patches: 3,
            min_success_rate: 0.05,
        }
    }

    fn distinct_diff(i: usize) -> String {
        format!("--- a/file\n+++ b/file\n+line {i}\n")
    }

    #[test]
    fn test_should_not_terminate_when_fresh() {
        let h = TerminationHeuristics::new(test_config());
        assert!(h.should_terminate().is_none());
    }

    #[test]
    fn test_should_terminate_after_max_consecutive_failures() {
        let mut h = TerminationHeuristics::new(test_config());

        for i in 0..5 {
            h.record_attempt(&distinct_diff(i), false);
        }

        // The streak rule has priority over the success-rate rule.
        let reason = h.should_terminate().expect("should terminate");
        assert!(reason.contains("consecutive failures"), "reason: {reason}");
    }

    #[test]
    fn test_should_reset_failure_streak_on_success() {
        let mut h = TerminationHeuristics::new(test_config());

        for i in 0..4 {
            h.record_attempt(&distinct_diff(i), false);
        }
        h.record_attempt(&distinct_diff(99), true);
        for i in 4..8 {
            h.record_attempt(&distinct_diff(i), false);
        }

        // 4 failures after the success: streak rule must not fire, and one
        // success in 9 attempts keeps the rate above 5%.
        assert!(h.should_terminate().is_none());
    }

    #[test]
    fn test_should_terminate_on_repeated_identical_patches() {
        let mut h = TerminationHeuristics::new(test_config());

        let same = "--- a/x\n+++ b/x\n+same\n";
        h.record_attempt(same, true);
        h.record_attempt(same, true);
        assert!(
            h.should_terminate().is_none(),
            "two identical patches are below the window"
        );

        h.record_attempt(same, true);
        let reason = h.should_terminate().expect("should terminate");
        assert!(reason.contains("repeated identical patches"));
    }

    #[test]
    fn test_should_not_terminate_when_one_recent_patch_differs() {
        let mut h = TerminationHeuristics::new(test_config());

        let same = "+same\n";
        h.record_attempt(same, true);
        h.record_attempt("+different\n", true);
        h.record_attempt(same, true);

        assert!(h.should_terminate().is_none());
    }

    #[test]
    fn test_should_terminate_on_low_success_rate_after_min_steps() {
        let mut h = TerminationHeuristics::new(TerminationConfig {
            max_consecutive_failures: 100,
            ..test_config()
        });

        for i in 0..3 {
            h.record_attempt(&distinct_diff(i), false);
        }

        let reason = h.should_terminate().expect("should terminate");
        assert!(reason.contains("success rate too low"), "reason: {reason}");
        assert!(reason.contains('%'), "reason should include the rate");
    }

    #[test]
    fn test_should_not_apply_rate_rule_before_min_steps() {
        let mut h = TerminationHeuristics::new(TerminationConfig {
            max_consecutive_failures: 100,
            ..test_config()
        });

        h.record_attempt(&distinct_diff(0), false);
        h.record_attempt(&distinct_diff(1), false);

        assert!(h.should_terminate().is_none());
    }

    #[test]
    fn test_should_clear_state_on_reset() {
        let mut h = TerminationHeuristics::new(test_config());

        for i in 0..5 {
            h.record_attempt(&distinct_diff(i), false);
        }
        assert!(h.should_terminate().is_some());

        h.reset();
        assert!(h.should_terminate().is_none());
        assert_eq!(h.total_attempts(), 0);
        assert_eq!(h.successful_attempts(), 0);
    }

    #[test]
    fn test_should_evict_oldest_hash_at_capacity() {
        let mut h = TerminationHeuristics::new(TerminationConfig {
            max_consecutive_failures: 1_000,
            min_success_rate: 0.0,
            ..test_config()
        });

        for i in 0..PATCH_HISTORY_CAPACITY + 5 {
            h.record_attempt(&distinct_diff(i), true);
        }

        assert_eq!(h.patch_hashes.len(), PATCH_HISTORY_CAPACITY);
        // The newest entry corresponds to the last recorded diff.
        assert_eq!(
            h.patch_hashes.back(),
            Some(&hash_patch(&distinct_diff(PATCH_HISTORY_CAPACITY + 4)))
        );
    }

    #[test]
    fn test_should_truncate_patch_hash_to_fixed_width() {
        let hash = hash_patch("some diff");
        assert_eq!(hash.len(), PATCH_HASH_WIDTH);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
