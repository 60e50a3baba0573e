//! Configuration types for mend-core.
//!
//! This module defines [`ControllerConfig`] (CLI-level overrides),
//! [`ProjectConfig`] (from `.mend/config.yaml`), and all sub-configuration
//! types. During controller initialization, CLI flags in `ControllerConfig`
//! take precedence over values read from `ProjectConfig`.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

// ── Controller Configuration (CLI-level) ─────────────────────

/// Controller configuration provided by the CLI layer.
///
/// Contains the repository path and optional overrides for the model and
/// caching behavior. When the controller starts, these values are merged
/// with [`ProjectConfig`] from `.mend/config.yaml`, with `ControllerConfig`
/// values taking precedence.
///
/// # Examples
///
/// ```
/// use std::path::PathBuf;
/// use mend_core::ControllerConfig;
///
/// let config = ControllerConfig::builder()
///     .repo_path(PathBuf::from("/tmp/my-repo"))
///     .model("deepseek-chat")
///     .build();
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, TypedBuilder)]
pub struct ControllerConfig {
    /// Path to the target repository.
    repo_path: PathBuf,

    /// Override model name (takes precedence over config.yaml).
    #[builder(default, setter(strip_option, into))]
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<String>,

    /// Override backend base URL (takes precedence over config.yaml).
    #[builder(default, setter(strip_option, into))]
    #[serde(skip_serializing_if = "Option::is_none")]
    base_url: Option<String>,

    /// Enable the response cache (takes precedence over config.yaml).
    #[builder(default, setter(strip_option))]
    #[serde(skip_serializing_if = "Option::is_none")]
    use_cache: Option<bool>,
}

impl ControllerConfig {
    /// Returns the repository path.
    pub fn repo_path(&self) -> &PathBuf {
        &self.repo_path
    }

    /// Returns the model override, if set.
    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    /// Returns the base URL override, if set.
    pub fn base_url(&self) -> Option<&str> {
        self.base_url.as_deref()
    }

    /// Returns the cache toggle override, if set.
    pub fn use_cache(&self) -> Option<bool> {
        self.use_cache
    }

    /// Returns the `.mend` directory path for this repository.
    pub fn mend_dir(&self) -> PathBuf {
        self.repo_path.join(".mend")
    }

    /// Returns the path to `config.yaml` inside the `.mend` directory.
    pub fn config_path(&self) -> PathBuf {
        self.mend_dir().join("config.yaml")
    }

    /// Returns the path to the response cache database.
    pub fn cache_db_path(&self) -> PathBuf {
        self.mend_dir().join("llm_cache.db")
    }
}

// ── Project Configuration (.mend/config.yaml) ────────────────

/// Project-level mend configuration, deserialized from `.mend/config.yaml`.
///
/// All fields have serde defaults so that missing keys in the YAML file
/// produce valid configuration with sensible defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectConfig {
    /// Model backend settings (model, base URL, timeout, fan-out ladder).
    #[serde(default)]
    pub llm: LlmConfig,

    /// Response cache settings (age and size bounds).
    #[serde(default)]
    pub cache: CacheConfig,

    /// Worker pool settings (size and idle bounds).
    #[serde(default)]
    pub pool: PoolConfig,

    /// Early-termination heuristic thresholds.
    #[serde(default)]
    pub termination: TerminationConfig,

    /// Retry policy for flaky operations.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Advisory resource ceilings.
    #[serde(default)]
    pub limits: LimitsConfig,
}

// ── Sub-configuration types ──────────────────────────────────

/// Model backend configuration.
///
/// The backend speaks the generic chat-completions wire shape; anything
/// provider-specific beyond model name and base URL is out of scope.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmConfig {
    /// Model name sent with every request.
    #[serde(default = "default_model")]
    pub model: String,

    /// Chat-completions base URL.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Environment variable holding the API key.
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Per-request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// Temperature ladder for parallel patch fan-out.
    #[serde(default = "default_temperatures")]
    pub temperatures: Vec<f64>,

    /// Enable the response cache for model calls.
    #[serde(default)]
    pub use_cache: bool,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: default_model(),
            base_url: default_base_url(),
            api_key_env: default_api_key_env(),
            timeout_secs: default_timeout_secs(),
            temperatures: default_temperatures(),
            use_cache: false,
        }
    }
}

/// Response cache configuration.
///
/// Controls the age-based expiry and size-based eviction bounds enforced
/// by the cache janitor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheConfig {
    /// Entries older than this many hours are expired.
    #[serde(default = "default_max_age_hours")]
    pub max_age_hours: u64,

    /// Maximum number of entries kept in the store.
    #[serde(default = "default_max_entries")]
    pub max_entries: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_age_hours: default_max_age_hours(),
            max_entries: default_max_entries(),
        }
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolConfig {
    /// Maximum number of live worker processes.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,

    /// Idle workers older than this many seconds are reaped.
    #[serde(default = "default_max_idle_secs")]
    pub max_idle_secs: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            max_idle_secs: default_max_idle_secs(),
        }
    }
}

/// Early-termination heuristic thresholds.
///
/// These bound the worst-case number of repair attempts; see
/// [`TerminationHeuristics`](crate::TerminationHeuristics) for the
/// evaluation order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TerminationConfig {
    /// Minimum attempts before the success-rate rule applies.
    #[serde(default = "default_min_steps")]
    pub min_steps: u64,

    /// Consecutive failures that force termination.
    #[serde(default = "default_max_consecutive_failures")]
    pub max_consecutive_failures: u64,

    /// Identical trailing patches that force termination.
    #[serde(default = "default_max_similar_patches")]
    pub max_similar_patches: usize,

    /// Success-rate floor applied after `min_steps` attempts.
    #[serde(default = "default_min_success_rate")]
    pub min_success_rate: f64,
}

impl Default for TerminationConfig {
    fn default() -> Self {
        Self {
            min_steps: default_min_steps(),
            max_consecutive_failures: default_max_consecutive_failures(),
            max_similar_patches: default_max_similar_patches(),
            min_success_rate: default_min_success_rate(),
        }
    }
}

/// Retry policy for flaky operations.
///
/// Delay for attempt `n` (zero-based) is
/// `min(base_delay_ms * exponential_base^n, max_delay_ms)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryConfig {
    /// Retries after the first attempt (total attempts = retries + 1).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Initial inter-attempt delay in milliseconds.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Inter-attempt delay ceiling in milliseconds.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Exponential growth base for the delay.
    #[serde(default = "default_exponential_base")]
    pub exponential_base: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            exponential_base: default_exponential_base(),
        }
    }
}

/// Advisory resource ceilings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitsConfig {
    /// Soft ceiling on process resident memory, in megabytes.
    #[serde(default = "default_max_memory_mb")]
    pub max_memory_mb: u64,

    /// Ceiling on captured command output, in megabytes.
    #[serde(default = "default_max_output_size_mb")]
    pub max_output_size_mb: u64,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_memory_mb: default_max_memory_mb(),
            max_output_size_mb: default_max_output_size_mb(),
        }
    }
}

// ── Default value functions for serde ────────────────────────

fn default_model() -> String {
    "deepseek-chat".to_owned()
}

fn default_base_url() -> String {
    "https://api.deepseek.com/v1".to_owned()
}

fn default_api_key_env() -> String {
    "DEEPSEEK_API_KEY".to_owned()
}

fn default_timeout_secs() -> u64 {
    120
}

fn default_temperatures() -> Vec<f64> {
    vec![0.0, 0.2, 0.4]
}

fn default_max_age_hours() -> u64 {
    24
}

fn default_max_entries() -> u64 {
    10_000
}

fn default_max_workers() -> usize {
    4
}

fn default_max_idle_secs() -> u64 {
    60
}

fn default_min_steps() -> u64 {
    3
}

fn default_max_consecutive_failures() -> u64 {
    5
}

fn default_max_similar_patches() -> usize {
    3
}

fn default_min_success_rate() -> f64 {
    0.05
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1_000
}

fn default_max_delay_ms() -> u64 {
    60_000
}

fn default_exponential_base() -> f64 {
    2.0
}

fn default_max_memory_mb() -> u64 {
    4_096
}

fn default_max_output_size_mb() -> u64 {
    10
}

// ── Config loading ───────────────────────────────────────────

/// Load [`ProjectConfig`] from the `.mend/config.yaml` file.
///
/// If the file does not exist, returns the default configuration.
///
/// # Errors
///
/// Returns `CoreError::Io` if the file exists but cannot be read.
/// Returns `CoreError::Yaml` if the file contains invalid YAML.
pub fn load_project_config(
    config_path: &std::path::Path,
) -> Result<ProjectConfig, crate::CoreError> {
    if !config_path.exists() {
        return Ok(ProjectConfig::default());
    }
    let content = std::fs::read_to_string(config_path)?;
    let config: ProjectConfig = serde_yaml::from_str(&content)?;
    Ok(config)
}
