use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};
use worker_core::schemas::ProjectCleanupJob;

use crate::error::AppError;
use crate::services::kubernetes_service::KubernetesService;
use crate::services::log_streamer::LogStreamer;
use crate::services::queue::QueueService;

/// Drains the project-deletion queue: stop runtime streams for every listed
/// deployment, then tear the application set down.
pub async fn start_project_cleanup_loop(
    queue: QueueService,
    k8s: KubernetesService,
    streamer: Arc<LogStreamer>,
    interval: Duration,
) -> Result<(), AppError> {
    let mut ticker = tokio::time::interval(interval);
    info!(interval_secs = interval.as_secs(), "Project cleanup worker started");

    loop {
        ticker.tick().await;

        loop {
            match queue.pop_project_cleanup().await {
                Ok(Some(job)) => cleanup_project(&k8s, &streamer, job).await,
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "Failed to pop project cleanup job");
                    break;
                }
            }
        }
    }
}

async fn cleanup_project(k8s: &KubernetesService, streamer: &LogStreamer, job: ProjectCleanupJob) {
    info!(
        project_id = %job.project_id,
        project_name = %job.project_name,
        active_deployments = job.active_deployment_ids.len(),
        "Processing project cleanup"
    );

    for deployment_id in &job.active_deployment_ids {
        streamer.stop(deployment_id);
    }

    if let Err(e) = k8s.teardown(&job.project_name).await {
        warn!(
            project = %job.project_name,
            error = %e,
            "Partial cleanup failure for project deletion"
        );
    }

    info!(
        project_id = %job.project_id,
        project_name = %job.project_name,
        "Project cleanup complete 🗑️"
    );
}
