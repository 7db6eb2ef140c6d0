use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info, warn};
use worker_core::models::DeploymentStatus;
use worker_core::schemas::ExpiredDeployment;

use crate::error::AppError;
use crate::services::api::ApiClient;
use crate::services::kubernetes_service::KubernetesService;
use crate::services::log_streamer::LogStreamer;

/// Periodically tears down deployments that exceeded their TTL. Partial
/// cleanup failures are warnings; the next cycle retries.
pub async fn start_expiry_reconciler(
    api: ApiClient,
    k8s: KubernetesService,
    streamer: Arc<LogStreamer>,
    interval: Duration,
) -> Result<(), AppError> {
    let mut ticker = tokio::time::interval(interval);
    info!(interval_secs = interval.as_secs(), "Expiry reconciler started");

    loop {
        ticker.tick().await;
        if let Err(e) = reconcile_expired(&api, &k8s, &streamer).await {
            error!(error = %e, "Expiry reconciliation failed");
        }
    }
}

async fn reconcile_expired(
    api: &ApiClient,
    k8s: &KubernetesService,
    streamer: &LogStreamer,
) -> Result<(), AppError> {
    let deployments = api.get_expired_deployments().await?;
    if deployments.is_empty() {
        return Ok(());
    }

    info!(count = deployments.len(), "Found expired deployments");

    for deployment in deployments {
        cleanup_deployment(api, k8s, streamer, deployment).await;
    }

    Ok(())
}

async fn cleanup_deployment(
    api: &ApiClient,
    k8s: &KubernetesService,
    streamer: &LogStreamer,
    deployment: ExpiredDeployment,
) {
    info!(
        deployment = %deployment.id,
        project = %deployment.project_name,
        ttl_minutes = deployment.ttl_minutes,
        "Cleaning up expired deployment"
    );

    // Leave a trace in the deployment's own log before the pods go away.
    let system_log = k8s.sinks.system_sink(&deployment.id);
    system_log.log(format!(
        "⏱ Deployment expired after {} minutes, tearing down resources",
        deployment.ttl_minutes
    ));
    system_log.close().await;

    streamer.stop(&deployment.id);

    if let Err(e) = k8s.teardown(&deployment.project_name).await {
        warn!(
            deployment = %deployment.id,
            error = %e,
            "Partial cleanup failure (will retry next cycle)"
        );
    }

    // Control-plane DB bookkeeping mirrors the cluster teardown.
    if let Err(e) = api.cleanup_deployment(&deployment.id).await {
        warn!(deployment = %deployment.id, error = %e, "Failed to notify resource cleanup");
    }

    if let Err(e) = api
        .update_status(&deployment.id, DeploymentStatus::Expired)
        .await
    {
        error!(deployment = %deployment.id, error = %e, "Failed to mark deployment as expired");
        return;
    }

    if let Err(e) = api
        .update_project_status(&deployment.project_id, "INACTIVE")
        .await
    {
        warn!(project = %deployment.project_id, error = %e, "Failed to update project status");
    }

    info!(
        deployment = %deployment.id,
        project = %deployment.project_name,
        "Deployment cleaned up 🧹"
    );
}
