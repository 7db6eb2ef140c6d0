use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use hickory_resolver::TokioAsyncResolver;
use hickory_resolver::config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts};
use hickory_resolver::proto::rr::{RData, RecordType};
use tracing::{debug, error, info, warn};
use worker_core::schemas::PendingDomain;

use crate::error::AppError;
use crate::services::api::ApiClient;
use crate::services::kubernetes_service::KubernetesService;

const PUBLIC_RESOLVER: SocketAddr =
    SocketAddr::new(IpAddr::V4(Ipv4Addr::new(8, 8, 8, 8)), 53);
const LOOKUP_TIMEOUT: Duration = Duration::from_secs(5);
const OVERALL_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct DnsVerifyResult {
    pub verified: bool,
    pub method: &'static str,
    pub value: String,
    pub error: String,
}

impl DnsVerifyResult {
    fn verified(method: &'static str, value: String) -> Self {
        Self {
            verified: true,
            method,
            value,
            error: String::new(),
        }
    }

    fn pending(error: String) -> Self {
        Self {
            verified: false,
            method: "",
            value: String::new(),
            error,
        }
    }
}

/// Verifies customer DNS against a pinned public resolver so results do not
/// depend on the cluster's split-horizon view.
pub struct DomainVerifier {
    resolver: TokioAsyncResolver,
    server_ip: String,
    base_domain: String,
}

impl DomainVerifier {
    pub fn new(server_ip: &str, base_domain: &str) -> Self {
        let mut config = ResolverConfig::new();
        config.add_name_server(NameServerConfig::new(PUBLIC_RESOLVER, Protocol::Udp));

        let mut opts = ResolverOpts::default();
        opts.timeout = LOOKUP_TIMEOUT;

        Self {
            resolver: TokioAsyncResolver::tokio(config, opts),
            server_ip: server_ip.to_string(),
            base_domain: base_domain.to_string(),
        }
    }

    /// A domain verifies via (a) a CNAME equal to or under the base domain,
    /// or (b) an A record answering with the platform's server IP.
    pub async fn verify(&self, domain: &str) -> DnsVerifyResult {
        match tokio::time::timeout(OVERALL_TIMEOUT, self.verify_inner(domain)).await {
            Ok(result) => result,
            Err(_) => DnsVerifyResult::pending(format!(
                "DNS lookup timed out. Make sure you've added an A record pointing to {}",
                self.server_ip
            )),
        }
    }

    async fn verify_inner(&self, domain: &str) -> DnsVerifyResult {
        debug!(
            domain = %domain,
            expected_ip = %self.server_ip,
            expected_cname = %self.base_domain,
            "Verifying DNS for domain"
        );

        if let Ok(lookup) = self.resolver.lookup(domain, RecordType::CNAME).await {
            for record in lookup.iter() {
                if let RData::CNAME(target) = record {
                    let cname = target.0.to_utf8();
                    let cname = cname.trim_end_matches('.');
                    if self.matches_base_domain(cname) {
                        info!(domain = %domain, cname = %cname, "DNS verified via CNAME");
                        return DnsVerifyResult::verified("CNAME", cname.to_string());
                    }
                }
            }
        }

        let ips = match self.resolver.lookup_ip(domain).await {
            Ok(lookup) => lookup.iter().collect::<Vec<_>>(),
            Err(e) => {
                debug!(domain = %domain, error = %e, "DNS lookup failed");
                return DnsVerifyResult::pending(format!(
                    "DNS lookup failed: {e}. Make sure you've added an A record pointing to {}",
                    self.server_ip
                ));
            }
        };

        for ip in &ips {
            if ip.to_string() == self.server_ip {
                info!(domain = %domain, ip = %ip, "DNS verified via A record");
                return DnsVerifyResult::verified("A", ip.to_string());
            }
        }

        let seen = ips
            .iter()
            .map(|ip| ip.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        DnsVerifyResult::pending(format!(
            "Domain resolves to {seen}, but expected {ip}. Update your A record to point to {ip}",
            ip = self.server_ip
        ))
    }

    fn matches_base_domain(&self, cname: &str) -> bool {
        if self.base_domain.is_empty() {
            return false;
        }
        let cname = cname.to_lowercase();
        let base = self.base_domain.to_lowercase();
        cname == base || cname.ends_with(&format!(".{base}"))
    }
}

/// Walks pending custom domains: once DNS checks out, wire the host into
/// the project's ingress and flip the domain to ACTIVE.
pub async fn start_domain_verifier(
    api: ApiClient,
    k8s: KubernetesService,
    verifier: DomainVerifier,
    interval: Duration,
) -> Result<(), AppError> {
    let mut ticker = tokio::time::interval(interval);
    info!(interval_secs = interval.as_secs(), "Domain verification worker started");

    loop {
        ticker.tick().await;
        if let Err(e) = check_pending_domains(&api, &k8s, &verifier).await {
            error!(error = %e, "Domain verification cycle failed");
        }
    }
}

async fn check_pending_domains(
    api: &ApiClient,
    k8s: &KubernetesService,
    verifier: &DomainVerifier,
) -> Result<(), AppError> {
    let domains = api.get_pending_domains().await?;
    if domains.is_empty() {
        return Ok(());
    }

    info!(count = domains.len(), "Checking pending domains");

    for domain in domains {
        verify_and_activate(api, k8s, verifier, domain).await;
    }

    Ok(())
}

async fn verify_and_activate(
    api: &ApiClient,
    k8s: &KubernetesService,
    verifier: &DomainVerifier,
    domain: PendingDomain,
) {
    debug!(domain = %domain.domain, project = %domain.project_name, "Verifying domain");

    let result = verifier.verify(&domain.domain).await;

    if !result.verified {
        debug!(domain = %domain.domain, error = %result.error, "DNS not verified yet");
        if let Err(e) = api
            .update_domain_status(&domain.id, "PENDING", &result.error)
            .await
        {
            warn!(domain = %domain.domain, error = %e, "Failed to update domain status");
        }
        return;
    }

    info!(
        domain = %domain.domain,
        method = result.method,
        value = %result.value,
        "DNS verified, configuring ingress"
    );

    if let Err(e) = k8s.add_domain(&domain.project_name, &domain.domain).await {
        error!(domain = %domain.domain, error = %e, "Failed to add domain to ingress");
        if let Err(e) = api
            .update_domain_status(
                &domain.id,
                "ERROR",
                "DNS verified but failed to configure routing. Will retry.",
            )
            .await
        {
            warn!(domain = %domain.domain, error = %e, "Failed to update domain status");
        }
        return;
    }

    if let Err(e) = api.update_domain_status(&domain.id, "ACTIVE", "").await {
        warn!(domain = %domain.domain, error = %e, "Failed to mark domain as active");
        return;
    }

    info!(
        domain = %domain.domain,
        project = %domain.project_name,
        verified_via = result.method,
        "Domain activated 🌐"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cname_matching_accepts_base_and_subdomains() {
        let verifier = DomainVerifier::new("203.0.113.7", "preview.example.com");
        assert!(verifier.matches_base_domain("preview.example.com"));
        assert!(verifier.matches_base_domain("demo.preview.example.com"));
        assert!(verifier.matches_base_domain("DEMO.PREVIEW.EXAMPLE.COM"));
        assert!(!verifier.matches_base_domain("evilpreview.example.com"));
        assert!(!verifier.matches_base_domain("other.example.org"));
    }

    #[tokio::test]
    async fn empty_base_domain_never_matches() {
        let verifier = DomainVerifier::new("203.0.113.7", "");
        assert!(!verifier.matches_base_domain("anything.example.com"));
    }
}
