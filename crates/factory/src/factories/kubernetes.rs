use kube::{
    Client, Config,
    config::{KubeConfigOptions, Kubeconfig},
};
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum KubernetesError {
    #[error("Kube error: {0}")]
    Kube(#[from] kube::Error),
    #[error("KubeconfigError, {0}")]
    Kubeconfig(#[from] kube::config::KubeconfigError),
    #[error("InferConfigError, {0}")]
    InferConfig(#[from] kube::config::InferConfigError),
}

#[derive(Clone)]
pub struct Kubernetes {
    pub client: Client,
}

impl Kubernetes {
    /// In-cluster config is preferred; outside a cluster an explicit
    /// kubeconfig path wins, otherwise the usual `KUBECONFIG` /
    /// `~/.kube/config` inference applies.
    pub async fn new(kubeconfig_path: Option<&str>) -> Result<Self, KubernetesError> {
        let client = match Config::incluster() {
            Ok(config) => {
                info!("✅ Connected from in-cluster environment");
                Client::try_from(config)?
            }
            Err(_) => {
                let config = if let Some(path) = kubeconfig_path {
                    let kubeconfig = Kubeconfig::read_from(path)?;
                    Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                        .await?
                } else {
                    Config::infer().await?
                };
                info!("✅ Connected from local environment");
                Client::try_from(config)?
            }
        };

        Ok(Self { client })
    }
}
