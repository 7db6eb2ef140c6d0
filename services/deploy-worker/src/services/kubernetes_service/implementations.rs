use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use k8s_openapi::api::apps::v1::{
    Deployment as K8sDeployment, DeploymentSpec, DeploymentStrategy, RollingUpdateDeployment,
};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, PodSpec, PodTemplateSpec, Probe, ResourceRequirements,
    Service, ServiceAccount, ServicePort, ServiceSpec, TCPSocketAction,
};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, IngressTLS, NetworkPolicy, NetworkPolicyIngressRule,
    NetworkPolicyPeer, NetworkPolicySpec, ServiceBackendPort,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, DeleteParams, ObjectMeta, PostParams};
use tokio::time::Instant;
use tracing::{info, warn};
use worker_core::formatters::{
    custom_tls_secret_name, is_platform_subdomain, network_policy_name, sanitize_host,
    sanitize_k8s_name, service_account_name,
};
use worker_core::models::LogSource;

use crate::error::AppError;
use super::{
    CLUSTER_ISSUER, CLUSTER_ISSUER_ANNOTATION, DeployOptions, DeployResult, KubernetesService,
    MANAGED_BY, UPDATED_AT_ANNOTATION, WILDCARD_TLS_SECRET,
};

const READY_TIMEOUT: Duration = Duration::from_secs(5 * 60);
const READY_POLL_INTERVAL: Duration = Duration::from_secs(2);

impl KubernetesService {
    /// Creates or updates the whole application set in a fixed order, then
    /// waits for the rollout. A readiness timeout is not fatal — pods may
    /// still be starting.
    pub async fn deploy(&self, opts: DeployOptions) -> Result<DeployResult, AppError> {
        let name = sanitize_k8s_name(&opts.project_name);

        let sink = self
            .sinks
            .prefixed_sink(&opts.deployment_id, "[k8s] ", LogSource::Build);

        info!(
            name = %name,
            image = %opts.image_name,
            domains = ?opts.domains,
            "Starting Kubernetes deployment"
        );
        sink.log(format!("Deploying {name} to Kubernetes..."));

        self.create_or_update_service_account(&name, &opts).await?;
        sink.log(format!("✓ Service account {} ready", service_account_name(&name)));

        self.create_or_update_network_policy(&name, &opts).await?;
        sink.log(format!("✓ Network policy {} ready", network_policy_name(&name)));

        self.create_or_update_deployment(&name, &opts).await?;
        sink.log(format!("✓ Deployment {name} created"));

        self.create_or_update_service(&name, &opts).await?;
        sink.log(format!("✓ Service {name} created (port 80 → {})", opts.port));

        let hosts = self.create_or_update_ingress(&name, &opts).await?;
        for host in &hosts {
            sink.log(format!("✓ Ingress configured: https://{host}"));
        }

        sink.log("Waiting for pods to be ready...");
        let ready = match self.wait_for_deployment_ready(&name, READY_TIMEOUT).await {
            Ok(()) => {
                sink.log("✓ Pods are ready and healthy");
                true
            }
            Err(e) => {
                warn!(name = %name, error = %e, "Deployment not ready within timeout");
                sink.log("⚠ Warning: Deployment may still be starting up");
                false
            }
        };

        sink.close().await;

        let urls = hosts.iter().map(|h| format!("https://{h}")).collect();
        Ok(DeployResult { name, urls, ready })
    }

    /// Tears the application set down in reverse network-visibility order,
    /// collecting every error instead of stopping at the first.
    pub async fn teardown(&self, project_name: &str) -> Result<(), AppError> {
        let name = sanitize_k8s_name(project_name);
        info!(name = %name, "Cleaning up Kubernetes resources");

        let mut errors: Vec<String> = Vec::new();

        if let Err(e) = self.delete_ingress(&name).await {
            errors.push(format!("ingress: {e}"));
        }
        if let Err(e) = self.delete_service(&name).await {
            errors.push(format!("service: {e}"));
        }
        if let Err(e) = self.delete_deployment(&name).await {
            errors.push(format!("deployment: {e}"));
        }
        if let Err(e) = self.delete_network_policy(&name).await {
            errors.push(format!("network policy: {e}"));
        }
        if let Err(e) = self.delete_service_account(&name).await {
            errors.push(format!("service account: {e}"));
        }

        if !errors.is_empty() {
            return Err(AppError::Deploy(format!(
                "cleanup errors: {}",
                errors.join("; ")
            )));
        }

        info!(name = %name, "Kubernetes cleanup complete");
        Ok(())
    }

    // ─────────────────────────────────────────────────────────
    // ServiceAccount
    // ─────────────────────────────────────────────────────────

    async fn create_or_update_service_account(
        &self,
        name: &str,
        opts: &DeployOptions,
    ) -> Result<(), AppError> {
        let sa_name = service_account_name(name);
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), &self.namespace);

        let service_account = ServiceAccount {
            metadata: ObjectMeta {
                name: Some(sa_name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(app_labels(name, opts)),
                ..Default::default()
            },
            ..Default::default()
        };

        match api.get(&sa_name).await {
            Ok(existing) => {
                let mut updated = service_account;
                updated.metadata.resource_version = existing.metadata.resource_version;
                api.replace(&sa_name, &PostParams::default(), &updated)
                    .await?;
            }
            Err(e) if is_not_found(&e) => {
                api.create(&PostParams::default(), &service_account).await?;
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    async fn delete_service_account(&self, name: &str) -> Result<(), AppError> {
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), &self.namespace);
        ignore_not_found(api.delete(&service_account_name(name), &DeleteParams::default()).await)
    }

    // ─────────────────────────────────────────────────────────
    // NetworkPolicy
    // ─────────────────────────────────────────────────────────

    /// Ingress-only policy: replicas of the same app may talk to each
    /// other, and the ingress controller's namespace may reach the pods.
    /// Combined with the namespace-level default deny this isolates
    /// tenants at L3/L4.
    async fn create_or_update_network_policy(
        &self,
        name: &str,
        opts: &DeployOptions,
    ) -> Result<(), AppError> {
        let policy_name = network_policy_name(name);
        let api: Api<NetworkPolicy> = Api::namespaced(self.client.clone(), &self.namespace);

        let app_selector = LabelSelector {
            match_labels: Some(BTreeMap::from([("app".to_string(), name.to_string())])),
            ..Default::default()
        };

        let policy = NetworkPolicy {
            metadata: ObjectMeta {
                name: Some(policy_name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(app_labels(name, opts)),
                ..Default::default()
            },
            spec: Some(NetworkPolicySpec {
                pod_selector: app_selector.clone(),
                policy_types: Some(vec!["Ingress".to_string()]),
                ingress: Some(vec![NetworkPolicyIngressRule {
                    from: Some(vec![
                        NetworkPolicyPeer {
                            pod_selector: Some(app_selector),
                            ..Default::default()
                        },
                        NetworkPolicyPeer {
                            namespace_selector: Some(LabelSelector {
                                match_labels: Some(BTreeMap::from([(
                                    "app.kubernetes.io/name".to_string(),
                                    "traefik".to_string(),
                                )])),
                                ..Default::default()
                            }),
                            ..Default::default()
                        },
                    ]),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };

        match api.get(&policy_name).await {
            Ok(existing) => {
                let mut updated = policy;
                updated.metadata.resource_version = existing.metadata.resource_version;
                api.replace(&policy_name, &PostParams::default(), &updated)
                    .await?;
            }
            Err(e) if is_not_found(&e) => {
                api.create(&PostParams::default(), &policy).await?;
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    async fn delete_network_policy(&self, name: &str) -> Result<(), AppError> {
        let api: Api<NetworkPolicy> = Api::namespaced(self.client.clone(), &self.namespace);
        ignore_not_found(api.delete(&network_policy_name(name), &DeleteParams::default()).await)
    }

    // ─────────────────────────────────────────────────────────
    // Deployment
    // ─────────────────────────────────────────────────────────

    async fn create_or_update_deployment(
        &self,
        name: &str,
        opts: &DeployOptions,
    ) -> Result<(), AppError> {
        let api: Api<K8sDeployment> = Api::namespaced(self.client.clone(), &self.namespace);
        let labels = app_labels(name, opts);

        // Forces a rollout even when the image reference is unchanged.
        let annotations = BTreeMap::from([(
            UPDATED_AT_ANNOTATION.to_string(),
            Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        )]);

        let deployment = K8sDeployment {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(self.namespace.clone()),
                labels: Some(labels.clone()),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(opts.replicas),
                selector: LabelSelector {
                    match_labels: Some(BTreeMap::from([(
                        "app".to_string(),
                        name.to_string(),
                    )])),
                    ..Default::default()
                },
                strategy: Some(DeploymentStrategy {
                    type_: Some("RollingUpdate".to_string()),
                    rolling_update: Some(RollingUpdateDeployment {
                        max_unavailable: Some(IntOrString::Int(0)),
                        max_surge: Some(IntOrString::Int(1)),
                    }),
                }),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        annotations: Some(annotations),
                        ..Default::default()
                    }),
                    spec: Some(PodSpec {
                        termination_grace_period_seconds: Some(30),
                        service_account_name: Some(service_account_name(name)),
                        containers: vec![Container {
                            name: name.to_string(),
                            image: Some(opts.image_name.clone()),
                            image_pull_policy: Some("Always".to_string()),
                            ports: Some(vec![ContainerPort {
                                name: Some("http".to_string()),
                                container_port: opts.port,
                                protocol: Some("TCP".to_string()),
                                ..Default::default()
                            }]),
                            env: Some(build_container_env(&opts.env_vars, opts.port)),
                            resources: Some(ResourceRequirements {
                                requests: Some(BTreeMap::from([
                                    ("cpu".to_string(), Quantity(opts.cpu_request.clone())),
                                    ("memory".to_string(), Quantity(opts.memory_request.clone())),
                                ])),
                                limits: Some(BTreeMap::from([
                                    ("cpu".to_string(), Quantity(opts.cpu_limit.clone())),
                                    ("memory".to_string(), Quantity(opts.memory_limit.clone())),
                                ])),
                                ..Default::default()
                            }),
                            liveness_probe: Some(tcp_probe(opts.port, 10, 30, 5)),
                            readiness_probe: Some(tcp_probe(opts.port, 5, 10, 3)),
                            ..Default::default()
                        }],
                        ..Default::default()
                    }),
                },
                ..Default::default()
            }),
            ..Default::default()
        };

        match api.get(name).await {
            Ok(existing) => {
                let mut updated = deployment;
                updated.metadata.resource_version = existing.metadata.resource_version;
                api.replace(name, &PostParams::default(), &updated).await?;
                info!(name = %name, "Deployment updated");
            }
            Err(e) if is_not_found(&e) => {
                api.create(&PostParams::default(), &deployment).await?;
                info!(name = %name, "Deployment created");
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    async fn delete_deployment(&self, name: &str) -> Result<(), AppError> {
        let api: Api<K8sDeployment> = Api::namespaced(self.client.clone(), &self.namespace);
        ignore_not_found(api.delete(name, &DeleteParams::foreground()).await)
    }

    pub async fn wait_for_deployment_ready(
        &self,
        name: &str,
        timeout: Duration,
    ) -> Result<(), AppError> {
        let api: Api<K8sDeployment> = Api::namespaced(self.client.clone(), &self.namespace);
        let deadline = Instant::now() + timeout;
        let mut ticker = tokio::time::interval(READY_POLL_INTERVAL);

        loop {
            ticker.tick().await;
            if Instant::now() >= deadline {
                return Err(AppError::Deploy(format!(
                    "timeout waiting for deployment {name} to be ready"
                )));
            }

            let deployment = match api.get(name).await {
                Ok(d) => d,
                Err(e) => {
                    warn!(name = %name, error = %e, "Failed to get deployment status");
                    continue;
                }
            };

            let desired = deployment
                .spec
                .as_ref()
                .and_then(|s| s.replicas)
                .unwrap_or(1);
            let ready = deployment
                .status
                .as_ref()
                .and_then(|s| s.ready_replicas)
                .unwrap_or(0);

            if ready >= desired {
                info!(name = %name, ready, "Deployment is ready");
                return Ok(());
            }
        }
    }

    // ─────────────────────────────────────────────────────────
    // Service
    // ─────────────────────────────────────────────────────────

    async fn create_or_update_service(
        &self,
        name: &str,
        opts: &DeployOptions,
    ) -> Result<(), AppError> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), &self.namespace);

        let mut service = Service {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(self.namespace.clone()),
                labels: Some(app_labels(name, opts)),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                type_: Some("ClusterIP".to_string()),
                selector: Some(BTreeMap::from([("app".to_string(), name.to_string())])),
                ports: Some(vec![ServicePort {
                    name: Some("http".to_string()),
                    protocol: Some("TCP".to_string()),
                    port: 80,
                    target_port: Some(IntOrString::Int(opts.port)),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };

        match api.get(name).await {
            Ok(existing) => {
                // ClusterIP is immutable; carry it over.
                if let (Some(spec), Some(existing_spec)) =
                    (service.spec.as_mut(), existing.spec.as_ref())
                {
                    spec.cluster_ip = existing_spec.cluster_ip.clone();
                }
                service.metadata.resource_version = existing.metadata.resource_version;
                api.replace(name, &PostParams::default(), &service).await?;
                info!(name = %name, "Service updated");
            }
            Err(e) if is_not_found(&e) => {
                api.create(&PostParams::default(), &service).await?;
                info!(name = %name, "Service created");
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    async fn delete_service(&self, name: &str) -> Result<(), AppError> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), &self.namespace);
        ignore_not_found(api.delete(name, &DeleteParams::default()).await)
    }

    // ─────────────────────────────────────────────────────────
    // Ingress
    // ─────────────────────────────────────────────────────────

    async fn create_or_update_ingress(
        &self,
        name: &str,
        opts: &DeployOptions,
    ) -> Result<Vec<String>, AppError> {
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), &self.namespace);

        let (all_hosts, subdomain_hosts, custom_hosts) =
            classify_hosts(&opts.domains, &self.base_domain);

        info!(
            name = %name,
            subdomain_hosts = ?subdomain_hosts,
            custom_hosts = ?custom_hosts,
            "Creating/updating ingress"
        );

        let ingress = Ingress {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(self.namespace.clone()),
                labels: Some(app_labels(name, opts)),
                annotations: Some(ingress_annotations(&custom_hosts)),
                ..Default::default()
            },
            spec: Some(IngressSpec {
                ingress_class_name: Some("traefik".to_string()),
                rules: Some(build_ingress_rules(&all_hosts, name)),
                tls: Some(build_tls_entries(name, &subdomain_hosts, &custom_hosts)),
                ..Default::default()
            }),
            ..Default::default()
        };

        match api.get(name).await {
            Ok(existing) => {
                let mut updated = ingress;
                updated.metadata.resource_version = existing.metadata.resource_version;
                api.replace(name, &PostParams::default(), &updated).await?;
                info!(name = %name, hosts = ?all_hosts, "Ingress updated");
            }
            Err(e) if is_not_found(&e) => {
                api.create(&PostParams::default(), &ingress).await?;
                info!(name = %name, hosts = ?all_hosts, "Ingress created");
            }
            Err(e) => return Err(e.into()),
        }

        Ok(all_hosts)
    }

    async fn delete_ingress(&self, name: &str) -> Result<(), AppError> {
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), &self.namespace);
        ignore_not_found(api.delete(name, &DeleteParams::default()).await)
    }

    /// Adds a verified custom domain to the app's ingress. A no-op when the
    /// host is already routed.
    pub async fn add_domain(&self, project_name: &str, domain: &str) -> Result<(), AppError> {
        let name = sanitize_k8s_name(project_name);
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), &self.namespace);

        info!(project = %name, domain = %domain, "Adding domain to ingress");

        let ingress = api.get(&name).await.map_err(|e| {
            AppError::Deploy(format!("failed to get ingress for {name}: {e}"))
        })?;

        let mut hosts = existing_hosts(&ingress);
        let domain = sanitize_host(domain);
        if hosts.iter().any(|h| h == &domain) {
            info!(domain = %domain, "Domain already configured");
            return Ok(());
        }
        hosts.push(domain);

        self.update_ingress_hosts(&name, hosts).await
    }

    /// An ingress with zero rules is meaningless, so the last host cannot
    /// be removed.
    pub async fn remove_domain(&self, project_name: &str, domain: &str) -> Result<(), AppError> {
        let name = sanitize_k8s_name(project_name);
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), &self.namespace);

        info!(project = %name, domain = %domain, "Removing domain from ingress");

        let ingress = api.get(&name).await.map_err(|e| {
            AppError::Deploy(format!("failed to get ingress for {name}: {e}"))
        })?;

        let domain = sanitize_host(domain);
        let hosts: Vec<String> = existing_hosts(&ingress)
            .into_iter()
            .filter(|h| h != &domain)
            .collect();

        if hosts.is_empty() {
            warn!(project = %name, "Cannot remove last domain");
            return Err(AppError::Deploy(
                "cannot remove all domains from ingress".to_string(),
            ));
        }

        self.update_ingress_hosts(&name, hosts).await
    }

    async fn update_ingress_hosts(&self, name: &str, hosts: Vec<String>) -> Result<(), AppError> {
        let api: Api<Ingress> = Api::namespaced(self.client.clone(), &self.namespace);
        let mut ingress = api.get(name).await?;

        let (all_hosts, subdomain_hosts, custom_hosts) =
            classify_hosts(&hosts, &self.base_domain);

        let annotations = ingress.metadata.annotations.get_or_insert_with(BTreeMap::new);
        if custom_hosts.is_empty() {
            annotations.remove(CLUSTER_ISSUER_ANNOTATION);
        } else {
            annotations.insert(
                CLUSTER_ISSUER_ANNOTATION.to_string(),
                CLUSTER_ISSUER.to_string(),
            );
        }

        let spec = ingress.spec.get_or_insert_with(Default::default);
        spec.rules = Some(build_ingress_rules(&all_hosts, name));
        spec.tls = Some(build_tls_entries(name, &subdomain_hosts, &custom_hosts));

        api.replace(name, &PostParams::default(), &ingress).await?;

        info!(
            name = %name,
            subdomain_hosts = ?subdomain_hosts,
            custom_hosts = ?custom_hosts,
            "Ingress hosts updated"
        );
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────
// Object builders
// ─────────────────────────────────────────────────────────────

fn app_labels(name: &str, opts: &DeployOptions) -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app".to_string(), name.to_string()),
        ("app.kubernetes.io/name".to_string(), name.to_string()),
        (
            "app.kubernetes.io/managed-by".to_string(),
            MANAGED_BY.to_string(),
        ),
        (
            format!("{MANAGED_BY}/deployment-id"),
            opts.deployment_id.clone(),
        ),
        (format!("{MANAGED_BY}/project-id"), opts.project_id.clone()),
    ])
}

/// User env first, then `PORT` and `NODE_ENV` appended only when absent.
pub fn build_container_env(env_vars: &std::collections::HashMap<String, String>, port: i32) -> Vec<EnvVar> {
    let mut keys: Vec<&String> = env_vars.keys().collect();
    keys.sort();

    let mut env: Vec<EnvVar> = keys
        .into_iter()
        .map(|key| EnvVar {
            name: key.clone(),
            value: Some(env_vars[key].clone()),
            ..Default::default()
        })
        .collect();

    if !env_vars.contains_key("PORT") {
        env.push(EnvVar {
            name: "PORT".to_string(),
            value: Some(port.to_string()),
            ..Default::default()
        });
    }
    if !env_vars.contains_key("NODE_ENV") {
        env.push(EnvVar {
            name: "NODE_ENV".to_string(),
            value: Some("production".to_string()),
            ..Default::default()
        });
    }

    env
}

fn tcp_probe(port: i32, initial_delay: i32, period: i32, timeout: i32) -> Probe {
    Probe {
        tcp_socket: Some(TCPSocketAction {
            port: IntOrString::Int(port),
            ..Default::default()
        }),
        initial_delay_seconds: Some(initial_delay),
        period_seconds: Some(period),
        timeout_seconds: Some(timeout),
        failure_threshold: Some(3),
        ..Default::default()
    }
}

/// Splits requested domains into platform subdomains (covered by the
/// wildcard cert) and custom hosts (which need their own secret).
pub fn classify_hosts(
    domains: &[String],
    base_domain: &str,
) -> (Vec<String>, Vec<String>, Vec<String>) {
    let mut all = Vec::with_capacity(domains.len());
    let mut subdomains = Vec::new();
    let mut custom = Vec::new();

    for domain in domains {
        if domain.is_empty() {
            continue;
        }
        let host = sanitize_host(domain);
        all.push(host.clone());
        if is_platform_subdomain(&host, base_domain) {
            subdomains.push(host);
        } else {
            custom.push(host);
        }
    }

    (all, subdomains, custom)
}

/// The issuer annotation is present iff at least one host needs its own
/// certificate; wildcard-covered hosts must not trigger issuing.
pub fn ingress_annotations(custom_hosts: &[String]) -> BTreeMap<String, String> {
    let mut annotations = BTreeMap::from([
        (
            "traefik.ingress.kubernetes.io/router.entrypoints".to_string(),
            "websecure".to_string(),
        ),
        (
            "traefik.ingress.kubernetes.io/router.tls".to_string(),
            "true".to_string(),
        ),
    ]);

    if !custom_hosts.is_empty() {
        annotations.insert(
            CLUSTER_ISSUER_ANNOTATION.to_string(),
            CLUSTER_ISSUER.to_string(),
        );
    }

    annotations
}

/// One rule per host, everything routed to the service on port 80.
pub fn build_ingress_rules(hosts: &[String], service_name: &str) -> Vec<IngressRule> {
    hosts
        .iter()
        .map(|host| IngressRule {
            host: Some(sanitize_host(host)),
            http: Some(HTTPIngressRuleValue {
                paths: vec![HTTPIngressPath {
                    path: Some("/".to_string()),
                    path_type: "Prefix".to_string(),
                    backend: IngressBackend {
                        service: Some(IngressServiceBackend {
                            name: service_name.to_string(),
                            port: Some(ServiceBackendPort {
                                number: Some(80),
                                ..Default::default()
                            }),
                        }),
                        ..Default::default()
                    },
                }],
            }),
        })
        .collect()
}

/// One TLS entry per non-empty host group: the shared wildcard secret for
/// platform subdomains, a per-app secret for custom hosts.
pub fn build_tls_entries(
    name: &str,
    subdomain_hosts: &[String],
    custom_hosts: &[String],
) -> Vec<IngressTLS> {
    let mut tls = Vec::new();

    if !subdomain_hosts.is_empty() {
        tls.push(IngressTLS {
            hosts: Some(subdomain_hosts.to_vec()),
            secret_name: Some(WILDCARD_TLS_SECRET.to_string()),
        });
    }

    if !custom_hosts.is_empty() {
        tls.push(IngressTLS {
            hosts: Some(custom_hosts.to_vec()),
            secret_name: Some(custom_tls_secret_name(name)),
        });
    }

    tls
}

fn existing_hosts(ingress: &Ingress) -> Vec<String> {
    ingress
        .spec
        .as_ref()
        .and_then(|s| s.rules.as_ref())
        .map(|rules| {
            rules
                .iter()
                .filter_map(|rule| rule.host.clone())
                .collect()
        })
        .unwrap_or_default()
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 404)
}

fn ignore_not_found<T>(result: Result<T, kube::Error>) -> Result<(), AppError> {
    match result {
        Ok(_) => Ok(()),
        Err(e) if is_not_found(&e) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn hosts(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn classification_splits_host_groups() {
        let (all, subs, custom) = classify_hosts(
            &hosts(&["demo.base.example", "app.customer.com", ""]),
            "base.example",
        );
        assert_eq!(all, hosts(&["demo.base.example", "app.customer.com"]));
        assert_eq!(subs, hosts(&["demo.base.example"]));
        assert_eq!(custom, hosts(&["app.customer.com"]));
    }

    #[test]
    fn issuer_annotation_present_iff_custom_hosts() {
        let without = ingress_annotations(&[]);
        assert!(!without.contains_key(CLUSTER_ISSUER_ANNOTATION));
        assert_eq!(
            without["traefik.ingress.kubernetes.io/router.entrypoints"],
            "websecure"
        );

        let with = ingress_annotations(&hosts(&["app.customer.com"]));
        assert_eq!(with[CLUSTER_ISSUER_ANNOTATION], CLUSTER_ISSUER);
    }

    #[test]
    fn rules_route_every_host_to_the_service() {
        let rules = build_ingress_rules(&hosts(&["a.base.example", "b.customer.com"]), "demo");
        assert_eq!(rules.len(), 2);
        for rule in &rules {
            let paths = &rule.http.as_ref().unwrap().paths;
            assert_eq!(paths.len(), 1);
            assert_eq!(paths[0].path.as_deref(), Some("/"));
            assert_eq!(paths[0].path_type, "Prefix");
            let backend = paths[0].backend.service.as_ref().unwrap();
            assert_eq!(backend.name, "demo");
            assert_eq!(backend.port.as_ref().unwrap().number, Some(80));
        }
    }

    #[test]
    fn tls_groups_use_wildcard_and_per_app_secrets() {
        let tls = build_tls_entries(
            "demo",
            &hosts(&["demo.base.example"]),
            &hosts(&["app.customer.com"]),
        );
        assert_eq!(tls.len(), 2);
        assert_eq!(tls[0].secret_name.as_deref(), Some(WILDCARD_TLS_SECRET));
        assert_eq!(tls[1].secret_name.as_deref(), Some("demo-custom-tls"));
    }

    #[test]
    fn tls_entries_skip_empty_groups() {
        let tls = build_tls_entries("demo", &hosts(&["demo.base.example"]), &[]);
        assert_eq!(tls.len(), 1);
        assert_eq!(tls[0].secret_name.as_deref(), Some(WILDCARD_TLS_SECRET));

        let tls = build_tls_entries("demo", &[], &hosts(&["app.customer.com"]));
        assert_eq!(tls.len(), 1);
        assert_eq!(tls[0].secret_name.as_deref(), Some("demo-custom-tls"));
    }

    #[test]
    fn container_env_appends_port_and_node_env_when_absent() {
        let env = build_container_env(&HashMap::new(), 3000);
        let names: Vec<&str> = env.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["PORT", "NODE_ENV"]);
        assert_eq!(env[0].value.as_deref(), Some("3000"));
        assert_eq!(env[1].value.as_deref(), Some("production"));
    }

    #[test]
    fn container_env_respects_user_overrides() {
        let user = HashMap::from([
            ("PORT".to_string(), "8080".to_string()),
            ("NODE_ENV".to_string(), "staging".to_string()),
        ]);
        let env = build_container_env(&user, 3000);
        assert_eq!(env.len(), 2);
        let port = env.iter().find(|e| e.name == "PORT").unwrap();
        assert_eq!(port.value.as_deref(), Some("8080"));
        let node_env = env.iter().find(|e| e.name == "NODE_ENV").unwrap();
        assert_eq!(node_env.value.as_deref(), Some("staging"));
    }

    #[test]
    fn probes_use_spec_thresholds() {
        let liveness = tcp_probe(3000, 10, 30, 5);
        assert_eq!(liveness.initial_delay_seconds, Some(10));
        assert_eq!(liveness.period_seconds, Some(30));
        assert_eq!(liveness.timeout_seconds, Some(5));
        assert_eq!(liveness.failure_threshold, Some(3));

        let readiness = tcp_probe(3000, 5, 10, 3);
        assert_eq!(readiness.initial_delay_seconds, Some(5));
        assert_eq!(readiness.period_seconds, Some(10));
    }
}
