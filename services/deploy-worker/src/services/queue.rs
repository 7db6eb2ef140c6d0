use std::time::Duration;

use redis::aio::MultiplexedConnection;
use tracing::{debug, error, info, warn};
use worker_core::schemas::{BuildJob, ProjectCleanupJob};

use crate::error::AppError;

pub const PROJECT_CLEANUP_QUEUE: &str = "project-cleanup-queue";

const POP_TIMEOUT_SECS: u64 = 5;
const CANCEL_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Redis-backed job queue. The blocking pop uses a short server-side
/// timeout so shutdown never waits longer than one window.
#[derive(Clone)]
pub struct QueueService {
    connection: MultiplexedConnection,
    queue_name: String,
}

impl QueueService {
    pub fn new(connection: MultiplexedConnection, queue_name: impl Into<String>) -> Self {
        Self {
            connection,
            queue_name: queue_name.into(),
        }
    }

    /// Blocks until a job arrives. Malformed payloads are discarded with a
    /// warning so one bad message cannot stall the queue.
    pub async fn wait_for_job(&self) -> Result<(BuildJob, String), AppError> {
        let mut con = self.connection.clone();
        debug!(queue = %self.queue_name, "Waiting for job...");

        loop {
            let popped: Option<(String, String)> = redis::cmd("BLPOP")
                .arg(&self.queue_name)
                .arg(POP_TIMEOUT_SECS)
                .query_async(&mut con)
                .await?;

            let Some((_, raw)) = popped else { continue };

            match serde_json::from_str::<BuildJob>(&raw) {
                Ok(job) => {
                    let job_id = job.deployment_id.clone();
                    info!(
                        job_id = %job_id,
                        project = %job.project_name,
                        deployment = %job.deployment_id,
                        "Got job"
                    );
                    return Ok((job, job_id));
                }
                Err(e) => {
                    warn!(error = %e, raw = %raw, "Failed to parse job payload, discarding");
                    continue;
                }
            }
        }
    }

    pub async fn pop_project_cleanup(&self) -> Result<Option<ProjectCleanupJob>, AppError> {
        let mut con = self.connection.clone();

        let popped: Option<String> = redis::cmd("RPOP")
            .arg(PROJECT_CLEANUP_QUEUE)
            .query_async(&mut con)
            .await?;

        let Some(raw) = popped else { return Ok(None) };

        let job = serde_json::from_str::<ProjectCleanupJob>(&raw).map_err(|e| {
            error!(error = %e, raw = %raw, "Failed to parse project cleanup job");
            AppError::SerdeJson(e)
        })?;

        info!(
            project_id = %job.project_id,
            project_name = %job.project_name,
            deployments = job.active_deployment_ids.len(),
            "Got project cleanup job"
        );

        Ok(Some(job))
    }

    /// Readers of the flag never delete it; the orchestrator clears it
    /// after honouring the cancellation.
    pub async fn is_cancel_requested(&self, deployment_id: &str) -> bool {
        let mut con = self.connection.clone();
        let value: Option<String> = match redis::cmd("GET")
            .arg(cancel_key(deployment_id))
            .query_async(&mut con)
            .await
        {
            Ok(v) => v,
            Err(_) => None,
        };
        value.as_deref() == Some("1")
    }

    pub async fn clear_cancel(&self, deployment_id: &str) {
        let mut con = self.connection.clone();
        if let Err(e) = redis::cmd("DEL")
            .arg(cancel_key(deployment_id))
            .query_async::<()>(&mut con)
            .await
        {
            warn!(deployment = %deployment_id, error = %e, "Failed to clear cancel flag");
        }
    }

    /// Closes this handle. The multiplexed connection is shared by every
    /// clone, so the socket itself goes away once the remaining holders
    /// (consumer, reconcilers) are drained right after this call.
    pub fn close(self) {
        info!(queue = %self.queue_name, "Queue client closed");
    }

    /// The list pop already consumed the message; completion is an
    /// observability event, not a broker round-trip.
    pub fn complete_job(&self, job_id: &str) {
        info!(job_id = %job_id, "Job completed");
    }

    pub fn fail_job(&self, job_id: &str, reason: &str) {
        error!(job_id = %job_id, reason = %reason, "Job failed");
    }

    pub fn cancel_watch(&self, deployment_id: &str) -> CancelWatch {
        CancelWatch {
            queue: self.clone(),
            deployment_id: deployment_id.to_string(),
        }
    }
}

/// Deployment-scoped cancellation handle, composed with long-running steps
/// via `tokio::select!`.
#[derive(Clone)]
pub struct CancelWatch {
    queue: QueueService,
    deployment_id: String,
}

impl CancelWatch {
    /// Resolves once cancellation has been requested for the deployment.
    pub async fn cancelled(&self) {
        loop {
            if self.queue.is_cancel_requested(&self.deployment_id).await {
                return;
            }
            tokio::time::sleep(CANCEL_POLL_INTERVAL).await;
        }
    }

    pub async fn is_requested(&self) -> bool {
        self.queue.is_cancel_requested(&self.deployment_id).await
    }
}

fn cancel_key(deployment_id: &str) -> String {
    format!("cancel:{deployment_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_keys_are_deployment_scoped() {
        assert_eq!(cancel_key("d1"), "cancel:d1");
    }
}
