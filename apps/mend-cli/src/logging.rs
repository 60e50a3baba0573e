//! Tracing setup for the CLI.
//!
//! Every run logs human-readable output to stderr. With `--log-file`, a
//! second JSON layer writes to `.mend/logs/<timestamp>.log` under the
//! target repository, and stale log files are swept on startup.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer};

/// Log files older than this are removed at startup.
const LOG_RETENTION_DAYS: u64 = 3;

/// Install the global tracing subscriber.
///
/// The returned [`WorkerGuard`], present when file logging is on, must
/// stay alive until exit so buffered log lines get flushed.
///
/// # Errors
///
/// Fails when the log directory or file cannot be created.
pub fn init_tracing(repo_path: &Path, log_to_file: bool) -> Result<Option<WorkerGuard>> {
    if !log_to_file {
        tracing_subscriber::fmt()
            .with_writer(std::io::stderr)
            .with_env_filter(EnvFilter::from_default_env())
            .init();
        return Ok(None);
    }

    let (file_writer, guard) = open_log_writer(repo_path)?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(EnvFilter::from_default_env()),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(file_writer)
                .with_filter(EnvFilter::from_default_env()),
        )
        .init();

    Ok(Some(guard))
}

/// Open this run's log file behind a non-blocking writer.
fn open_log_writer(
    repo_path: &Path,
) -> Result<(tracing_appender::non_blocking::NonBlocking, WorkerGuard)> {
    let log_path = log_file_path(repo_path);
    let log_dir = log_path
        .parent()
        .context("log path has no parent directory")?;

    fs::create_dir_all(log_dir)
        .with_context(|| format!("failed to create log directory: {}", log_dir.display()))?;
    let log_file = fs::File::create(&log_path)
        .with_context(|| format!("failed to create log file: {}", log_path.display()))?;

    Ok(tracing_appender::non_blocking(log_file))
}

/// Delete expired `.log` files under `.mend/logs/`.
///
/// Best-effort and silent on success; individual failures go to stderr
/// directly because tracing is not installed yet when this runs.
pub fn cleanup_old_logs(repo_path: &Path) {
    let logs_dir = repo_path.join(".mend").join("logs");
    if !logs_dir.is_dir() {
        return;
    }

    let cutoff = std::time::SystemTime::now()
        - std::time::Duration::from_secs(LOG_RETENTION_DAYS * 24 * 60 * 60);
    sweep_log_files(&logs_dir, cutoff);
}

/// Path of this run's log file: `.mend/logs/<YYYYMMDD_HHMMSS>.log`.
fn log_file_path(repo_path: &Path) -> PathBuf {
    let stamp = timestamp_for_filename(std::time::SystemTime::now());
    repo_path
        .join(".mend")
        .join("logs")
        .join(format!("{stamp}.log"))
}

/// Render a timestamp as `YYYYMMDD_HHMMSS` in UTC, done by hand so the
/// binary carries no calendar crate for one filename.
fn timestamp_for_filename(time: std::time::SystemTime) -> String {
    let secs = time
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs();

    let (year, month, day) = civil_date(secs / 86400);
    let clock = secs % 86400;
    format!(
        "{year:04}{month:02}{day:02}_{:02}{:02}{:02}",
        clock / 3600,
        (clock % 3600) / 60,
        clock % 60
    )
}

/// Gregorian (year, month, day) for a count of days since 1970-01-01.
///
/// Hinnant's civil_from_days: work in 400-year eras anchored at
/// 0000-03-01, where leap days fall at the end of the shifted year.
fn civil_date(days_since_epoch: u64) -> (u64, u64, u64) {
    let z = days_since_epoch as i64 + 719_468;
    let era = z.div_euclid(146_097);
    let doe = z.rem_euclid(146_097) as u64;
    let yoe = (doe - doe / 1460 + doe / 36524 - doe / 146_096) / 365;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;

    let day = doy - (153 * mp + 2) / 5 + 1;
    let month = if mp < 10 { mp + 3 } else { mp - 9 };
    let mut year = yoe as i64 + era * 400;
    if month <= 2 {
        year += 1;
    }
    (year as u64, month, day)
}

/// Remove `.log` files in `dir` whose mtime predates `cutoff`.
fn sweep_log_files(dir: &Path, cutoff: std::time::SystemTime) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            eprintln!("warning: cannot read log directory {}: {e}", dir.display());
            return;
        }
    };

    for entry in entries.flatten() {
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("log") {
            continue;
        }

        let expired = fs::metadata(&path)
            .and_then(|m| m.modified())
            .map(|mtime| mtime < cutoff)
            .unwrap_or(false);

        if expired
            && let Err(e) = fs::remove_file(&path)
        {
            eprintln!("warning: cannot remove stale log {}: {e}", path.display());
        }
    }
}
