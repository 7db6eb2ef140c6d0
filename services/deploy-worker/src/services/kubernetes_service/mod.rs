pub mod implementations;

use std::collections::HashMap;

use kube::Client;

use super::logs::LogSinkFactory;

/// Shared wildcard certificate covering every platform subdomain.
pub const WILDCARD_TLS_SECRET: &str = "preview-wildcard-tls";
pub const CLUSTER_ISSUER_ANNOTATION: &str = "cert-manager.io/cluster-issuer";
pub const CLUSTER_ISSUER: &str = "letsencrypt-prod";
pub const MANAGED_BY: &str = "code2cloud";
pub const UPDATED_AT_ANNOTATION: &str = "code2cloud/updated-at";

/// Idempotent reconciler for the per-application object set:
/// ServiceAccount, NetworkPolicy, Deployment, Service, Ingress.
#[derive(Clone)]
pub struct KubernetesService {
    pub client: Client,
    pub namespace: String,
    pub base_domain: String,
    pub sinks: LogSinkFactory,
}

#[derive(Clone, Debug)]
pub struct DeployOptions {
    pub deployment_id: String,
    pub project_id: String,
    pub project_name: String,
    pub image_name: String,
    pub port: i32,
    pub replicas: i32,
    pub cpu_request: String,
    pub cpu_limit: String,
    pub memory_request: String,
    pub memory_limit: String,
    pub env_vars: HashMap<String, String>,
    pub domains: Vec<String>,
}

#[derive(Debug)]
pub struct DeployResult {
    pub name: String,
    pub urls: Vec<String>,
    pub ready: bool,
}
