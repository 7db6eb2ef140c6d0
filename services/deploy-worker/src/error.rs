use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Kube error: {0}")]
    Kube(#[from] kube::Error),

    #[error("HTTP request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("IO error, {0}")]
    Io(#[from] std::io::Error),

    #[error("Serde json error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    /// Non-2xx answer from the control plane.
    #[error("{0}")]
    Api(String),

    /// Fatal git materialisation failure. The message is user-visible.
    #[error("{0}")]
    Git(String),

    /// Fatal image build failure. The message is user-visible.
    #[error("{0}")]
    Build(String),

    /// Fatal Kubernetes rollout or teardown failure.
    #[error("{0}")]
    Deploy(String),

    #[error("{0}")]
    NotFound(String),

    #[error("deployment canceled")]
    Canceled,

    #[error("Internal error: {0}")]
    Internal(String),
}
