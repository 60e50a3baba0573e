//! Reusable shell worker pool.
//!
//! Spawning a fresh shell per command dominates the cost of short repair
//! commands, so [`WorkerPool`] keeps up to `max_workers` long-lived `bash`
//! processes and leases them out one command at a time. Worker processes
//! are OS resources, so the pool is guarded by a blocking mutex and the
//! lease API is synchronous; async callers run leases inside
//! `spawn_blocking`.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader, Write};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

use crate::config::PoolConfig;
use crate::error::CoreError;

/// Grace period between SIGTERM and SIGKILL when retiring a worker.
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

/// Clock returning seconds since the Unix epoch, injectable for tests.
type Clock = Arc<dyn Fn() -> f64 + Send + Sync>;

fn system_clock() -> Clock {
    Arc::new(|| {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs_f64()
    })
}

/// Captured result of one command run on a worker.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Exit code reported by the shell.
    pub exit_code: i32,
    /// Interleaved stdout and stderr of the command.
    pub output: String,
}

impl CommandOutput {
    /// Whether the command exited zero.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

// ── Worker process ───────────────────────────────────────────

/// One long-lived `bash` process.
struct Worker {
    id: u64,
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
    /// Seconds-since-epoch timestamp of the last completed command.
    last_used: f64,
    /// Per-worker command counter, used to make completion markers unique.
    seq: u64,
}

impl Worker {
    fn spawn(id: u64, now: f64) -> std::io::Result<Self> {
        let mut child = Command::new("bash")
            .arg("--norc")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()?;

        // Both handles exist because both sides were piped above.
        let stdin = child.stdin.take().ok_or_else(|| {
            std::io::Error::other("worker stdin not captured")
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            std::io::Error::other("worker stdout not captured")
        })?;

        debug!(worker_id = id, pid = child.id(), "spawned shell worker");
        Ok(Self {
            id,
            child,
            stdin,
            stdout: BufReader::new(stdout),
            last_used: now,
            seq: 0,
        })
    }

    /// Whether the underlying process is still running.
    fn is_alive(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Run one command to completion and capture its output.
    ///
    /// The command is fed through `eval` with stderr folded into stdout,
    /// followed by a completion marker carrying the exit code. `eval`
    /// confines shell syntax errors to the command itself, so the marker
    /// always prints and the reader cannot stall on a malformed command.
    fn run(&mut self, command: &str) -> Result<CommandOutput, CoreError> {
        self.seq += 1;
        let marker = format!("__mend_done_{}_{}_", self.id, self.seq);
        let escaped = command.replace('\'', "'\\''");
        let script = format!("{{ eval '{escaped}'; }} 2>&1\nprintf '{marker}%s__\\n' \"$?\"\n");

        self.stdin
            .write_all(script.as_bytes())
            .and_then(|()| self.stdin.flush())
            .map_err(|e| CoreError::Worker(format!("worker {} write failed: {e}", self.id)))?;

        let mut output = String::new();
        let mut line = String::new();
        loop {
            line.clear();
            let n = self
                .stdout
                .read_line(&mut line)
                .map_err(|e| CoreError::Worker(format!("worker {} read failed: {e}", self.id)))?;
            if n == 0 {
                return Err(CoreError::Worker(format!(
                    "worker {} exited mid-command",
                    self.id
                )));
            }

            // The marker glues to a final unterminated output line, so
            // search within the line rather than matching a prefix.
            if let Some(pos) = line.find(&marker) {
                output.push_str(&line[..pos]);
                let code = line[pos + marker.len()..]
                    .trim_end()
                    .trim_end_matches("__")
                    .parse()
                    .unwrap_or(-1);
                return Ok(CommandOutput {
                    exit_code: code,
                    output,
                });
            }
            output.push_str(&line);
        }
    }

    /// Terminate the process: SIGTERM, a grace period, then SIGKILL.
    fn terminate(mut self) {
        let pid = self.child.id() as libc::pid_t;
        // SAFETY: pid belongs to a child we spawned and still own.
        unsafe {
            libc::kill(pid, libc::SIGTERM);
        }
        match self.child.wait_timeout(TERMINATE_GRACE) {
            Ok(Some(_)) => debug!(worker_id = self.id, "worker exited on SIGTERM"),
            _ => {
                warn!(worker_id = self.id, "worker ignored SIGTERM, killing");
                let _ = self.child.kill();
                let _ = self.child.wait();
            }
        }
    }
}

// ── Pool ─────────────────────────────────────────────────────

struct PoolState {
    idle: VecDeque<Worker>,
    /// Workers alive in total, idle plus leased.
    live: usize,
    next_id: u64,
    shutdown: bool,
}

struct PoolShared {
    state: Mutex<PoolState>,
    max_workers: usize,
    max_idle_secs: u64,
    clock: Clock,
}

/// Bounded pool of reusable shell workers.
///
/// Clones share the same pool. `acquire` never blocks waiting for
/// capacity; at the ceiling it returns `None` and the caller decides how
/// to back off.
#[derive(Clone)]
pub struct WorkerPool {
    shared: Arc<PoolShared>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("max_workers", &self.shared.max_workers)
            .field("live", &self.live_count())
            .finish()
    }
}

impl WorkerPool {
    /// Create a pool from configuration. No workers are spawned up front.
    pub fn new(config: &PoolConfig) -> Self {
        Self::with_clock(config, system_clock())
    }

    fn with_clock(config: &PoolConfig, clock: Clock) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    live: 0,
                    next_id: 0,
                    shutdown: false,
                }),
                max_workers: config.max_workers,
                max_idle_secs: config.max_idle_secs,
                clock,
            }),
        }
    }

    /// Lease a worker, reusing an idle one when available.
    ///
    /// Dead idle workers found along the way are discarded. Returns `None`
    /// when the pool is at capacity or shut down.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Io` when a fresh worker cannot be spawned.
    #[instrument(skip(self))]
    pub fn acquire(&self) -> Result<Option<WorkerLease>, CoreError> {
        let mut state = self.lock()?;
        if state.shutdown {
            return Ok(None);
        }

        while let Some(mut worker) = state.idle.pop_front() {
            if worker.is_alive() {
                debug!(worker_id = worker.id, "reusing idle worker");
                return Ok(Some(WorkerLease::new(worker, Arc::clone(&self.shared))));
            }
            debug!(worker_id = worker.id, "discarding dead idle worker");
            state.live -= 1;
        }

        if state.live >= self.shared.max_workers {
            debug!(live = state.live, "pool at capacity");
            return Ok(None);
        }

        // Reserve the slot, then spawn without the lock held: fork/exec
        // is process I/O and must not stall concurrent acquires.
        let id = state.next_id;
        state.next_id += 1;
        state.live += 1;
        drop(state);

        match Worker::spawn(id, (self.shared.clock)()) {
            Ok(worker) => Ok(Some(WorkerLease::new(worker, Arc::clone(&self.shared)))),
            Err(e) => {
                if let Ok(mut state) = self.shared.state.lock() {
                    state.live -= 1;
                }
                Err(e.into())
            }
        }
    }

    /// Retire idle workers whose last use is older than the idle budget.
    pub fn cleanup(&self) {
        let now = (self.shared.clock)();
        let max_idle = self.shared.max_idle_secs as f64;

        let stale = {
            let Ok(mut state) = self.shared.state.lock() else {
                return;
            };
            let mut stale = Vec::new();
            let mut keep = VecDeque::with_capacity(state.idle.len());
            while let Some(worker) = state.idle.pop_front() {
                if now - worker.last_used > max_idle {
                    stale.push(worker);
                } else {
                    keep.push_back(worker);
                }
            }
            state.idle = keep;
            state.live -= stale.len();
            stale
        };

        // Terminating outside the lock keeps acquire responsive during
        // the SIGTERM grace period.
        for worker in stale {
            debug!(worker_id = worker.id, "retiring idle worker");
            worker.terminate();
        }
    }

    /// Retire every idle worker and refuse further leases.
    ///
    /// Workers currently out on a lease are not killed here: the lease
    /// owns the process, and releasing it after shutdown retires the
    /// worker instead of returning it. Shutdown is therefore complete
    /// only once every outstanding lease has dropped.
    pub fn shutdown(&self) {
        let drained = {
            let Ok(mut state) = self.shared.state.lock() else {
                return;
            };
            state.shutdown = true;
            let drained: Vec<_> = state.idle.drain(..).collect();
            state.live -= drained.len();
            drained
        };
        for worker in drained {
            worker.terminate();
        }
    }

    /// Number of workers alive (idle plus leased).
    pub fn live_count(&self) -> usize {
        self.shared.state.lock().map(|s| s.live).unwrap_or(0)
    }

    /// Number of idle workers ready for reuse.
    pub fn idle_count(&self) -> usize {
        self.shared.state.lock().map(|s| s.idle.len()).unwrap_or(0)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, PoolState>, CoreError> {
        self.shared
            .state
            .lock()
            .map_err(|_| CoreError::Worker("pool lock poisoned".to_owned()))
    }
}

// ── Lease ────────────────────────────────────────────────────

/// Exclusive lease on one worker.
///
/// Dropping the lease returns a healthy worker to the pool; a worker that
/// died or errored mid-command is retired instead.
pub struct WorkerLease {
    worker: Option<Worker>,
    shared: Arc<PoolShared>,
    /// Set when a command failed on this worker. A failed worker is
    /// retired on release even if `try_wait` has not observed the exit
    /// yet (pipes close before the child becomes reapable).
    failed: bool,
}

impl WorkerLease {
    fn new(worker: Worker, shared: Arc<PoolShared>) -> Self {
        Self {
            worker: Some(worker),
            shared,
            failed: false,
        }
    }

    /// Identifier of the leased worker.
    pub fn worker_id(&self) -> u64 {
        self.worker.as_ref().map(|w| w.id).unwrap_or(u64::MAX)
    }

    /// Run one command on the leased worker.
    ///
    /// Shell state (environment, working directory) persists between
    /// commands on the same worker.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Worker` when the worker dies or its pipes
    /// break; the lease retires such a worker on release.
    pub fn run(&mut self, command: &str) -> Result<CommandOutput, CoreError> {
        let worker = self
            .worker
            .as_mut()
            .ok_or_else(|| CoreError::Worker("lease already released".to_owned()))?;
        let result = worker.run(command);
        if result.is_err() {
            self.failed = true;
        }
        result
    }
}

impl std::fmt::Debug for WorkerLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerLease")
            .field("worker_id", &self.worker_id())
            .finish()
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        let Some(mut worker) = self.worker.take() else {
            return;
        };
        worker.last_used = (self.shared.clock)();

        let retire = {
            let Ok(mut state) = self.shared.state.lock() else {
                return;
            };
            if !state.shutdown && !self.failed && worker.is_alive() {
                state.idle.push_back(worker);
                None
            } else {
                state.live -= 1;
                Some(worker)
            }
        };
        if let Some(worker) = retire {
            worker.terminate();
        }
    }
}
