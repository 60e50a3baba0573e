use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    /// The backend returned a non-success status or the transport failed.
    #[error("model backend error: {0}")]
    Backend(String),

    /// A model call exceeded its time budget.
    #[error("model call timed out after {seconds}s")]
    Timeout { seconds: u64 },

    /// The durable cache store could not be opened.
    #[error("response cache unavailable: {0}")]
    CacheUnavailable(String),

    /// A pooled worker process could not be spawned or driven.
    #[error("worker error: {0}")]
    Worker(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
