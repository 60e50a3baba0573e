//! Advisory resource ceilings.
//!
//! [`ResourceLimits`] bounds captured command output and offers a
//! best-effort check on process resident memory. These are soft guards for
//! the repair loop's own bookkeeping, not a sandbox boundary.

use tracing::warn;

use crate::config::LimitsConfig;

/// Stateless enforcement of output-size and memory ceilings.
#[derive(Debug, Clone)]
pub struct ResourceLimits {
    /// Soft ceiling on process resident memory, in megabytes.
    max_memory_mb: u64,
    /// Ceiling on captured output, in megabytes.
    max_output_size_mb: u64,
}

impl ResourceLimits {
    /// Create limits from configuration.
    pub fn new(config: &LimitsConfig) -> Self {
        Self {
            max_memory_mb: config.max_memory_mb,
            max_output_size_mb: config.max_output_size_mb,
        }
    }

    /// Truncate `output` to the configured byte budget.
    ///
    /// Oversized output is cut at a char boundary and a marker noting the
    /// number of dropped characters is appended. Never fails.
    pub fn limit_output(&self, output: &str) -> String {
        let max_bytes = (self.max_output_size_mb as usize).saturating_mul(1024 * 1024);
        if output.len() <= max_bytes {
            return output.to_owned();
        }

        let cut = floor_char_boundary(output, max_bytes);
        let dropped = output.chars().count() - output[..cut].chars().count();
        warn!(
            dropped_chars = dropped,
            budget_mb = self.max_output_size_mb,
            "output exceeded size budget, truncating"
        );
        format!("{}\n... [truncated {dropped} chars]", &output[..cut])
    }

    /// Check whether current resident memory is under the ceiling.
    ///
    /// Best-effort: when usage cannot be measured this returns `true`
    /// (fail open), since the guard is advisory.
    pub fn check_memory(&self) -> bool {
        match resident_memory_mb() {
            Some(rss_mb) => rss_mb < self.max_memory_mb,
            None => true,
        }
    }
}

/// Largest index `<= max` that sits on a char boundary of `s`.
fn floor_char_boundary(s: &str, max: usize) -> usize {
    if max >= s.len() {
        return s.len();
    }
    let mut idx = max;
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

/// Peak resident set size of this process in megabytes, if measurable.
fn resident_memory_mb() -> Option<u64> {
    // SAFETY: getrusage only writes into the struct we hand it.
    let usage = unsafe {
        let mut usage: libc::rusage = std::mem::zeroed();
        if libc::getrusage(libc::RUSAGE_SELF, &mut usage) != 0 {
            return None;
        }
        usage
    };

    // ru_maxrss is kilobytes on Linux, bytes on macOS.
    let kb = if cfg!(target_os = "macos") {
        usage.ru_maxrss as u64 / 1024
    } else {
        usage.ru_maxrss as u64
    };
    Some(kb / 1024)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits(max_output_size_mb: u64) -> ResourceLimits {
        ResourceLimits::new(&LimitsConfig {
            max_memory_mb: 1_000_000,
            max_output_size_mb,
        })
    }

    #[test]
    fn test_should_pass_through_small_output() {
        let limits = limits(1);
        let text = "short output";
        assert_eq!(limits.limit_output(text), text);
    }

    #[test]
    fn test_should_truncate_oversized_output_with_marker() {
        let limits = limits(1);
        let text = "x".repeat(1024 * 1024 + 500);

        let result = limits.limit_output(&text);

        assert!(result.len() < text.len());
        assert!(result.contains("[truncated 500 chars]"), "got: ...{}", {
            let tail_at = result.len().saturating_sub(40);
            &result[tail_at..]
        });
    }

    #[test]
    fn test_should_cut_at_char_boundary() {
        let limits = ResourceLimits::new(&LimitsConfig {
            max_memory_mb: 1_000_000,
            // Zero MB budget forces the cut to index 0 regardless of content.
            max_output_size_mb: 0,
        });

        let result = limits.limit_output("héllo wörld");
        assert!(result.starts_with("\n... [truncated"));
    }

    #[test]
    fn test_should_floor_to_char_boundary_inside_multibyte() {
        let s = "aé"; // 'é' spans bytes 1..3
        assert_eq!(floor_char_boundary(s, 2), 1);
        assert_eq!(floor_char_boundary(s, 3), 3);
        assert_eq!(floor_char_boundary(s, 10), 3);
    }

    #[test]
    fn test_should_report_memory_within_generous_ceiling() {
        let limits = limits(10);
        assert!(limits.check_memory(), "huge ceiling should not trip");
    }

    #[test]
    fn test_should_report_memory_over_tiny_ceiling() {
        let limits = ResourceLimits::new(&LimitsConfig {
            max_memory_mb: 0,
            max_output_size_mb: 10,
        });
        // Any measurable process uses more than 0 MB; if measurement fails
        // the guard fails open and this stays true.
        let _ = limits.check_memory();
    }
}
