use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mend_core::{Controller, ControllerConfig};

#[derive(Debug, Parser)]
#[command(name = "mend", about = "Resource and concurrency control for automated repair loops")]
pub struct Cli {
    /// Path to the target repository (defaults to current directory)
    #[arg(short, long, default_value = ".", global = true)]
    repo: PathBuf,

    /// Also write JSON logs to .mend/logs/
    #[arg(long, global = true)]
    log_file: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Inspect or clear the response cache
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Check configuration, backend credentials, and the worker pool
    Doctor,

    /// Execute a one-shot prompt against the configured backend
    Invoke {
        /// The prompt to send
        #[arg(short, long)]
        prompt: String,

        /// Sampling temperature
        #[arg(short, long, default_value_t = 0.0)]
        temperature: f64,

        /// Stream the response chunk by chunk
        #[arg(long)]
        stream: bool,
    },
}

#[derive(Debug, Subcommand)]
pub enum CacheAction {
    /// Show entry count and hit statistics
    Stats,
    /// Delete every cached response
    Clear,
}

impl Cli {
    /// The repository path this invocation operates on.
    pub fn repo_path(&self) -> PathBuf {
        self.repo.clone()
    }

    /// Whether the JSON file log layer was requested.
    pub fn log_to_file(&self) -> bool {
        self.log_file
    }

    pub async fn run(self) -> Result<()> {
        match self.command {
            Commands::Cache { action } => {
                // Cache subcommands always open the store, regardless of
                // whether model calls have caching enabled.
                let config = ControllerConfig::builder()
                    .repo_path(self.repo)
                    .use_cache(true)
                    .build();
                let controller = Controller::new(&config)?;
                let cache = controller
                    .cache()
                    .context("response cache failed to open")?;

                match action {
                    CacheAction::Stats => {
                        let stats = cache.stats();
                        println!("entries:    {}", stats.entries);
                        println!("total hits: {}", stats.total_hits);
                        println!("avg hits:   {:.2}", stats.avg_hits);
                    }
                    CacheAction::Clear => {
                        let before = cache.stats().entries;
                        cache.clear();
                        println!("cleared {before} cached responses");
                    }
                }
                Ok(())
            }

            Commands::Doctor => {
                let config = ControllerConfig::builder().repo_path(self.repo).build();
                let controller = Controller::new(&config)?;
                let project = controller.project();

                println!("model:      {}", project.llm.model);
                println!("base url:   {}", project.llm.base_url);
                println!(
                    "credential: {} ({})",
                    if controller.client().is_available() {
                        "present"
                    } else {
                        "absent, placeholder mode"
                    },
                    project.llm.api_key_env,
                );
                println!("cache:      {}", if project.llm.use_cache { "on" } else { "off" });

                // Pool smoke check: lease one worker and run a trivial command.
                let pool = controller.pool().clone();
                let output = tokio::task::spawn_blocking(move || {
                    let mut lease = pool
                        .acquire()?
                        .context("worker pool refused a lease")?;
                    lease.run("echo ok").map_err(anyhow::Error::from)
                })
                .await
                .context("pool check task panicked")??;

                if output.success() && output.output.trim() == "ok" {
                    println!("workers:    ok ({} max)", project.pool.max_workers);
                } else {
                    anyhow::bail!("worker smoke check failed: {}", output.output.trim());
                }
                Ok(())
            }

            Commands::Invoke {
                prompt,
                temperature,
                stream,
            } => {
                let config = ControllerConfig::builder().repo_path(self.repo).build();
                let controller = Controller::new(&config)?;
                let client = controller.client();

                if stream {
                    let mut chunks = client.invoke_streaming(&prompt, temperature, None).await;
                    while let Some(chunk) = chunks.next().await {
                        print!("{}", chunk?);
                    }
                    println!();
                } else {
                    let use_cache = controller.project().llm.use_cache;
                    let response = client
                        .invoke_cached(&prompt, temperature, None, use_cache)
                        .await?;
                    println!("{}", response.content);
                    if response.cached {
                        eprintln!("(served from cache)");
                    }
                }
                Ok(())
            }
        }
    }
}
