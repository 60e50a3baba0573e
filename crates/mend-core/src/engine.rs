//! Controller wiring and lifecycle.
//!
//! [`Controller`] owns the long-lived resources of the repair loop: the
//! model client, the optional response cache, the shell worker pool, and
//! the background janitor that reaps idle workers. Construction reads
//! `.mend/config.yaml` and applies CLI-level overrides on top; shutdown is
//! explicit and idempotent.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument};

use crate::cache::ResponseCache;
use crate::client::{ModelClient, ModelResponse};
use crate::config::{load_project_config, ControllerConfig, ProjectConfig};
use crate::error::CoreError;
use crate::heuristics::TerminationHeuristics;
use crate::limits::ResourceLimits;
use crate::pool::WorkerPool;
use crate::telemetry::Telemetry;

/// Cadence of the background worker-pool janitor.
const JANITOR_INTERVAL: Duration = Duration::from_secs(30);

/// Long-lived resource owner for one repair session.
pub struct Controller {
    project: ProjectConfig,
    client: ModelClient,
    cache: Option<Arc<ResponseCache>>,
    pool: WorkerPool,
    limits: ResourceLimits,
    telemetry: Telemetry,
    janitor: Option<tokio::task::JoinHandle<()>>,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("model", &self.client.model())
            .field("cache", &self.cache.is_some())
            .field("pool", &self.pool)
            .finish()
    }
}

impl Controller {
    /// Build a controller for the repository named by `config`.
    ///
    /// Reads `.mend/config.yaml` (defaults apply when absent), then lets
    /// the CLI-level overrides in `config` win over file values. The
    /// response cache opens only when caching ends up enabled.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Io`/`CoreError::Yaml` when the config file is
    /// unreadable or malformed, `CoreError::CacheUnavailable` when the
    /// cache database cannot be opened.
    #[instrument(skip(config), fields(repo = %config.repo_path().display()))]
    pub fn new(config: &ControllerConfig) -> Result<Self, CoreError> {
        let mut project = load_project_config(&config.config_path())?;

        if let Some(model) = config.model() {
            project.llm.model = model.to_owned();
        }
        if let Some(base_url) = config.base_url() {
            project.llm.base_url = base_url.to_owned();
        }
        if let Some(use_cache) = config.use_cache() {
            project.llm.use_cache = use_cache;
        }

        let telemetry = Telemetry::new();
        let cache = if project.llm.use_cache {
            Some(Arc::new(ResponseCache::open(
                &config.cache_db_path(),
                &project.cache,
            )?))
        } else {
            None
        };

        let client = ModelClient::new(&project.llm, cache.clone(), telemetry.clone());
        let pool = WorkerPool::new(&project.pool);
        let limits = ResourceLimits::new(&project.limits);

        let janitor = {
            let pool = pool.clone();
            tokio::spawn(async move {
                let mut interval = tokio::time::interval(JANITOR_INTERVAL);
                // The immediate first tick has nothing to reap.
                interval.tick().await;
                loop {
                    interval.tick().await;
                    // cleanup blocks on the pool mutex and on worker
                    // termination, so it runs off the async threads.
                    // spawn_blocking (unlike block_in_place) also works
                    // on a current_thread runtime.
                    let pool = pool.clone();
                    let _ = tokio::task::spawn_blocking(move || pool.cleanup()).await;
                }
            })
        };

        info!(
            model = %project.llm.model,
            cache = cache.is_some(),
            max_workers = project.pool.max_workers,
            "controller initialized"
        );

        Ok(Self {
            project,
            client,
            cache,
            pool,
            limits,
            telemetry,
            janitor: Some(janitor),
        })
    }

    /// Effective project configuration after overrides.
    pub fn project(&self) -> &ProjectConfig {
        &self.project
    }

    /// The model client.
    pub fn client(&self) -> &ModelClient {
        &self.client
    }

    /// The response cache, when caching is enabled.
    pub fn cache(&self) -> Option<&Arc<ResponseCache>> {
        self.cache.as_ref()
    }

    /// The shell worker pool.
    pub fn pool(&self) -> &WorkerPool {
        &self.pool
    }

    /// Advisory resource limits.
    pub fn limits(&self) -> &ResourceLimits {
        &self.limits
    }

    /// The telemetry handle.
    pub fn telemetry(&self) -> &Telemetry {
        &self.telemetry
    }

    /// Fresh termination heuristics sized from the project config.
    pub fn heuristics(&self) -> TerminationHeuristics {
        TerminationHeuristics::new(self.project.termination.clone())
    }

    /// Generate one patch candidate per configured temperature.
    ///
    /// Calls fan out concurrently and go through the response cache when
    /// caching is enabled. Each slot resolves independently, in ladder
    /// order; a failed call occupies its slot as an error.
    pub async fn generate_patch_candidates(
        &self,
        prompt: &str,
        system_prompt: Option<&str>,
    ) -> Vec<Result<ModelResponse, CoreError>> {
        let use_cache = self.project.llm.use_cache;
        let calls = self
            .project
            .llm
            .temperatures
            .iter()
            .map(|&temperature| {
                self.client
                    .invoke_cached(prompt, temperature, system_prompt, use_cache)
            });
        futures::future::join_all(calls).await
    }

    /// Stop the janitor and retire every pooled worker. Idempotent.
    pub fn shutdown(&mut self) {
        if let Some(janitor) = self.janitor.take() {
            janitor.abort();
        }
        debug!("shutting down worker pool");
        self.pool.shutdown();
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_for(dir: &tempfile::TempDir) -> ControllerConfig {
        ControllerConfig::builder()
            .repo_path(dir.path().to_path_buf())
            .build()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_should_initialize_with_defaults_when_config_absent() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let controller = Controller::new(&config_for(&dir)).expect("should initialize");

        assert_eq!(controller.project().llm.model, "deepseek-chat");
        assert!(controller.cache().is_none(), "cache is off by default");
        assert_eq!(controller.pool().live_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_should_apply_cli_overrides_over_file_config() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let mend_dir = dir.path().join(".mend");
        std::fs::create_dir_all(&mend_dir).expect("mkdir");
        std::fs::write(mend_dir.join("config.yaml"), "llm:\n  model: file-model\n")
            .expect("write config");

        let config = ControllerConfig::builder()
            .repo_path(dir.path().to_path_buf())
            .model("cli-model")
            .build();
        let controller = Controller::new(&config).expect("should initialize");

        assert_eq!(controller.project().llm.model, "cli-model");
        assert_eq!(controller.client().model(), "cli-model");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_should_open_cache_when_enabled() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let config = ControllerConfig::builder()
            .repo_path(dir.path().to_path_buf())
            .use_cache(true)
            .build();

        let controller = Controller::new(&config).expect("should initialize");

        assert!(controller.cache().is_some());
        assert!(config.cache_db_path().exists(), "database file created");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_should_generate_one_candidate_per_temperature() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let controller = Controller::new(&config_for(&dir)).expect("should initialize");

        let candidates = controller.generate_patch_candidates("fix it", None).await;

        let ladder = &controller.project().llm.temperatures;
        assert_eq!(candidates.len(), ladder.len());
        for (candidate, &temperature) in candidates.iter().zip(ladder) {
            let response = candidate.as_ref().expect("placeholder mode succeeds");
            assert_eq!(response.temperature, temperature);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_should_keep_janitor_alive_on_current_thread_runtime() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let controller = Controller::new(&config_for(&dir)).expect("should initialize");

        // Let the janitor take at least one cleanup pass.
        tokio::time::sleep(JANITOR_INTERVAL + Duration::from_secs(1)).await;
        tokio::task::yield_now().await;

        let janitor = controller.janitor.as_ref().expect("janitor running");
        assert!(
            !janitor.is_finished(),
            "janitor must survive a cleanup pass on a current_thread runtime"
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_should_shut_down_idempotently() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let mut controller = Controller::new(&config_for(&dir)).expect("should initialize");

        let lease = controller.pool().acquire().expect("acquire").expect("capacity");
        drop(lease);

        controller.shutdown();
        controller.shutdown();

        assert_eq!(controller.pool().live_count(), 0);
        assert!(controller.pool().acquire().expect("acquire").is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_should_build_heuristics_from_project_thresholds() {
        let dir = tempfile::TempDir::new().expect("temp dir");
        let mend_dir = dir.path().join(".mend");
        std::fs::create_dir_all(&mend_dir).expect("mkdir");
        std::fs::write(
            mend_dir.join("config.yaml"),
            "termination:\n  maxConsecutiveFailures: 2\n",
        )
        .expect("write config");

        let controller = Controller::new(&config_for(&dir)).expect("should initialize");
        let mut heuristics = controller.heuristics();

        heuristics.record_attempt("diff a", false);
        heuristics.record_attempt("diff b", false);
        assert!(heuristics.should_terminate().is_some());
    }
}
