use std::time::Duration;

use config::{ConfigError, Environment};
use serde::Deserialize;

/// Worker configuration, sourced entirely from the environment.
/// `WORKER_API_KEY` is the only required variable.
#[derive(Deserialize, Clone, Debug)]
pub struct Config {
    #[serde(default = "default_env")]
    pub env: String,
    pub worker_api_key: String,
    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,
    #[serde(default = "default_redis_url")]
    pub redis_url: String,
    #[serde(default = "default_buildkit_addr")]
    pub buildkit_addr: String,
    #[serde(default = "default_registry_url")]
    pub registry_url: String,
    #[serde(default = "default_registry_insecure")]
    pub registry_insecure: bool,
    /// Per-build deadline in seconds.
    #[serde(default = "default_build_timeout")]
    pub build_timeout: u64,
    #[serde(default)]
    pub build_platform: Option<String>,
    #[serde(default = "default_k8s_namespace")]
    pub k8s_namespace: String,
    #[serde(default)]
    pub kubeconfig: Option<String>,
    #[serde(default)]
    pub base_domain: String,
    #[serde(default)]
    pub server_ip: String,
    #[serde(default = "default_queue_name")]
    pub queue_name: String,
    #[serde(default = "default_worker_id")]
    pub worker_id: String,
    #[serde(default = "default_concurrent_jobs")]
    pub concurrent_jobs: u32,
    #[serde(default = "default_workspace_path")]
    pub workspace_path: String,
    #[serde(default = "default_health_addr")]
    pub health_addr: String,
}

impl Config {
    pub fn init() -> Result<Self, ConfigError> {
        config::Config::builder()
            .add_source(Environment::default().try_parsing(true))
            .build()?
            .try_deserialize()
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout)
    }
}

fn default_env() -> String {
    "production".to_string()
}

fn default_api_base_url() -> String {
    "http://localhost:4000".to_string()
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_buildkit_addr() -> String {
    "tcp://127.0.0.1:1234".to_string()
}

fn default_registry_url() -> String {
    "127.0.0.1:5000".to_string()
}

fn default_registry_insecure() -> bool {
    true
}

fn default_build_timeout() -> u64 {
    15 * 60
}

fn default_k8s_namespace() -> String {
    "deployments".to_string()
}

fn default_queue_name() -> String {
    "build-queue".to_string()
}

fn default_worker_id() -> String {
    "worker-1".to_string()
}

fn default_concurrent_jobs() -> u32 {
    1
}

fn default_workspace_path() -> String {
    "/tmp/builds".to_string()
}

fn default_health_addr() -> String {
    "0.0.0.0:8081".to_string()
}
