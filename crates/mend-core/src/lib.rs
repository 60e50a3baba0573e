//! Core resource and concurrency control for the mend repair loop.
//!
//! The crate wires four concerns under one [`Controller`]: model
//! invocation (single, streaming, parallel, and cached calls), a durable
//! SQLite response cache, a bounded pool of reusable shell workers, and
//! the termination heuristics that keep a repair session from looping
//! forever. Resilience primitives (retry with backoff, an in-memory TTL
//! cache) and advisory resource limits round it out.

pub mod cache;
pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod heuristics;
pub mod limits;
pub mod pool;
pub mod resilience;
pub mod telemetry;

pub use cache::{CacheStats, ResponseCache};
pub use client::{ChunkStream, ModelClient, ModelResponse};
pub use config::{load_project_config, ControllerConfig, ProjectConfig};
pub use engine::Controller;
pub use error::CoreError;
pub use heuristics::TerminationHeuristics;
pub use limits::ResourceLimits;
pub use pool::{CommandOutput, WorkerLease, WorkerPool};
pub use resilience::{retry_with_backoff, TtlCache};
pub use telemetry::{Telemetry, TelemetryEvent, TelemetrySink};
