mod app;
mod config;
mod error;
mod services;

use std::sync::Arc;
use std::time::Duration;

use factory::factories::{kubernetes::Kubernetes, observability::Observability, redis::Redis};
use tokio::task::JoinSet;
use tracing::{error, info};
use utility::shutdown_signal::shutdown_signal;

use crate::config::Config;
use crate::error::AppError;
use crate::services::api::{ApiClient, SettingsFallback};
use crate::services::builder::{self, BuilderConfig, ImageBuilder};
use crate::services::consumer::{Worker, run_consumer};
use crate::services::git::GitCloner;
use crate::services::kubernetes_service::KubernetesService;
use crate::services::log_streamer::LogStreamer;
use crate::services::logs::{ApiLogDispatcher, LogSinkFactory};
use crate::services::queue::QueueService;
use crate::services::reconcilers::{domains, expiry, log_retention, project_cleanup};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    dotenvy::dotenv().ok();

    let cfg = Config::init()?;
    Observability::init(&cfg.env);

    info!(
        worker_id = %cfg.worker_id,
        queue = %cfg.queue_name,
        api_url = %cfg.api_base_url,
        buildkit_addr = %cfg.buildkit_addr,
        registry_url = %cfg.registry_url,
        k8s_namespace = %cfg.k8s_namespace,
        concurrent_jobs = cfg.concurrent_jobs,
        "🚀 Deploy worker starting"
    );

    // External binaries are hard requirements; the daemon probe is not.
    builder::verify_tooling().await?;
    builder::check_buildkit_health(&cfg.buildkit_addr).await;

    let redis = Redis::new(&cfg.redis_url).await?;
    let kubernetes = Kubernetes::new(cfg.kubeconfig.as_deref()).await?;

    let api = ApiClient::new(&cfg.api_base_url, &cfg.worker_api_key, SettingsFallback::Defaults)?;
    let sinks = LogSinkFactory::new(Arc::new(ApiLogDispatcher::new(api.clone())));
    let queue = QueueService::new(redis.connection.clone(), &cfg.queue_name);
    let git = GitCloner::new(&cfg.workspace_path, sinks.clone());
    let image_builder = ImageBuilder::new(
        BuilderConfig {
            buildkit_addr: cfg.buildkit_addr.clone(),
            registry_url: cfg.registry_url.clone(),
            insecure_registry: cfg.registry_insecure,
            platform: cfg.build_platform.clone(),
            timeout: cfg.build_timeout(),
        },
        sinks.clone(),
    );
    let k8s = KubernetesService {
        client: kubernetes.client.clone(),
        namespace: cfg.k8s_namespace.clone(),
        base_domain: cfg.base_domain.clone(),
        sinks: sinks.clone(),
    };
    let streamer = Arc::new(LogStreamer::new(
        kubernetes.client,
        cfg.k8s_namespace.clone(),
        sinks.clone(),
    ));
    let verifier = domains::DomainVerifier::new(&cfg.server_ip, &cfg.base_domain);

    let mut background = JoinSet::new();
    background.spawn(expiry::start_expiry_reconciler(
        api.clone(),
        k8s.clone(),
        Arc::clone(&streamer),
        Duration::from_secs(60),
    ));
    background.spawn(project_cleanup::start_project_cleanup_loop(
        queue.clone(),
        k8s.clone(),
        Arc::clone(&streamer),
        Duration::from_secs(5),
    ));
    background.spawn(domains::start_domain_verifier(
        api.clone(),
        k8s.clone(),
        verifier,
        Duration::from_secs(30),
    ));
    background.spawn(log_retention::start_log_retention_loop(
        api.clone(),
        Duration::from_secs(3600),
    ));
    background.spawn(serve_health(cfg.health_addr.clone()));

    let worker = Worker {
        cfg: cfg.clone(),
        queue: queue.clone(),
        api,
        sinks,
        git,
        builder: image_builder,
        k8s,
        streamer: Arc::clone(&streamer),
    };
    let mut consumer = tokio::spawn(run_consumer(worker));

    info!("✅ All background tasks started");

    let consumer_result = tokio::select! {
        _ = shutdown_signal() => {
            info!("🛑 Shutdown signal received");
            None
        }
        result = &mut consumer => Some(result),
    };

    // Drain in order: stop all runtime streams, close the queue client,
    // await the background loops.
    streamer.stop_all();

    let exit: anyhow::Result<()> = match consumer_result {
        None => {
            consumer.abort();
            let _ = consumer.await;
            Ok(())
        }
        Some(Ok(Ok(()))) => {
            error!("Consumer exited unexpectedly");
            Ok(())
        }
        Some(Ok(Err(e))) => {
            error!(error = %e, "Consumer failed");
            Err(e.into())
        }
        Some(Err(e)) => {
            error!(error = %e, "Consumer panicked");
            Err(e.into())
        }
    };

    queue.close();
    background.shutdown().await;

    info!("👋 Shutting down gracefully");
    exit
}

async fn serve_health(addr: String) -> Result<(), AppError> {
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(addr = %addr, "Health server listening");
    axum::serve(listener, app::app()).await?;
    Ok(())
}
