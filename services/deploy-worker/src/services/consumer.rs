use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};
use worker_core::formatters::sanitize_k8s_name;
use worker_core::models::{DeploymentStatus, ProjectSettings};
use worker_core::schemas::BuildJob;

use crate::config::Config;
use crate::error::AppError;
use super::api::ApiClient;
use super::builder::{self, BuildOptions, ImageBuilder};
use super::git::{CloneOptions, CloneResult, GitCloner};
use super::kubernetes_service::{DeployOptions, KubernetesService};
use super::log_streamer::LogStreamer;
use super::logs::{LogSink, LogSinkFactory};
use super::queue::{CancelWatch, QueueService};

const DEFAULT_PORT: u16 = 3000;

/// Everything one job needs, wired once at startup.
pub struct Worker {
    pub cfg: Config,
    pub queue: QueueService,
    pub api: ApiClient,
    pub sinks: LogSinkFactory,
    pub git: GitCloner,
    pub builder: ImageBuilder,
    pub k8s: KubernetesService,
    pub streamer: Arc<LogStreamer>,
}

/// The foreground consume loop: one job at a time per worker process.
pub async fn run_consumer(worker: Worker) -> Result<(), AppError> {
    info!(
        queue = %worker.cfg.queue_name,
        worker_id = %worker.cfg.worker_id,
        api_url = %worker.cfg.api_base_url,
        workspace = %worker.cfg.workspace_path,
        "Worker started, waiting for jobs..."
    );

    loop {
        let (job, job_id) = match worker.queue.wait_for_job().await {
            Ok(v) => v,
            Err(e) => {
                error!(error = %e, "Error waiting for job");
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };

        info!(
            job_id = %job_id,
            deployment_id = %job.deployment_id,
            project = %job.project_name,
            "Processing job"
        );

        match process_job(&worker, &job).await {
            Ok(()) => {
                worker.queue.complete_job(&job_id);
            }
            Err(AppError::Canceled) => {
                info!(deployment_id = %job.deployment_id, "Job canceled by user");
                worker.streamer.stop(&job.deployment_id);
                if let Err(e) = worker
                    .api
                    .update_status(&job.deployment_id, DeploymentStatus::Canceled)
                    .await
                {
                    warn!(error = %e, "Failed to mark deployment canceled");
                }
                worker.queue.clear_cancel(&job.deployment_id).await;
                worker.queue.complete_job(&job_id);
            }
            Err(e) => {
                error!(job_id = %job_id, error = %e, "Job processing failed");
                worker.streamer.stop(&job.deployment_id);
                if let Err(api_err) = worker
                    .api
                    .fail_deployment(&job.deployment_id, &e.to_string())
                    .await
                {
                    error!(error = %api_err, "Failed to mark deployment failed");
                }
                worker
                    .api
                    .notify_failure(&job.deployment_id, &job.project_name, &e.to_string())
                    .await;
                worker.queue.fail_job(&job_id, &e.to_string());
            }
        }
    }
}

async fn process_job(worker: &Worker, job: &BuildJob) -> Result<(), AppError> {
    let started = Instant::now();
    let cancel = worker.queue.cancel_watch(&job.deployment_id);

    let build_log = worker.sinks.build_sink(&job.deployment_id);
    let result = run_pipeline(worker, job, &cancel, &build_log, started).await;
    build_log.close().await;
    result
}

async fn run_pipeline(
    worker: &Worker,
    job: &BuildJob,
    cancel: &CancelWatch,
    build_log: &LogSink,
    started: Instant,
) -> Result<(), AppError> {
    if cancel.is_requested().await {
        return Err(AppError::Canceled);
    }

    // ─────────────────────────────────────────────────────────
    // Step 1: status BUILDING, settings, GitHub token
    // ─────────────────────────────────────────────────────────
    worker
        .api
        .update_status(&job.deployment_id, DeploymentStatus::Building)
        .await
        .map_err(|e| AppError::Api(format!("failed to update status to BUILDING: {e}")))?;

    write_banner(build_log, job);

    let settings = worker.api.get_project_settings(&job.project_id).await?;
    info!(
        ttl_minutes = settings.global_ttl_minutes,
        turbo_mode = settings.turbo_mode,
        "Project settings loaded"
    );

    build_log.log("📦 Phase 1: Source Code");
    build_log.log("─────────────────────────────────────────────");
    build_log.log("🔑 Authenticating with GitHub...");

    let token = worker
        .api
        .get_installation_token(job.installation_id)
        .await
        .map_err(|e| AppError::Api(format!("failed to get installation token: {e}")))?;

    if cancel.is_requested().await {
        return Err(AppError::Canceled);
    }

    // ─────────────────────────────────────────────────────────
    // Step 2: clone (cleanup runs on every exit path below)
    // ─────────────────────────────────────────────────────────
    build_log.log("");
    build_log.log("📥 Cloning repository...");

    let clone_result = tokio::select! {
        result = worker.git.clone(CloneOptions {
            repo_url: job.git_url.clone(),
            branch: job.branch.clone(),
            commit_hash: job.commit_hash.clone(),
            token: token.token.clone(),
            deployment_id: job.deployment_id.clone(),
            shallow: true,
            depth: 1,
        }) => result.map_err(|e| AppError::Git(format!("failed to clone repository: {e}")))?,
        _ = cancel.cancelled() => return Err(AppError::Canceled),
    };

    let outcome = build_and_deploy(
        worker,
        job,
        &settings,
        &clone_result,
        cancel,
        build_log,
        started,
    )
    .await;

    worker.git.cleanup(&clone_result.path).await;
    outcome
}

async fn build_and_deploy(
    worker: &Worker,
    job: &BuildJob,
    settings: &ProjectSettings,
    clone_result: &CloneResult,
    cancel: &CancelWatch,
    build_log: &LogSink,
    started: Instant,
) -> Result<(), AppError> {
    if cancel.is_requested().await {
        return Err(AppError::Canceled);
    }

    // ─────────────────────────────────────────────────────────
    // Step 3: build the image
    // ─────────────────────────────────────────────────────────
    build_log.log("");
    build_log.log("🔨 Phase 2: Build Image");
    build_log.log("─────────────────────────────────────────────");

    let image_name = image_ref(
        &worker.cfg.registry_url,
        &job.project_name,
        &clone_result.commit_hash,
    );

    let env_vars = builder::merge_env_vars(&[
        builder::default_build_env(),
        builder::framework_env(&job.build_config.framework),
        job.env_vars.clone(),
    ]);

    let port = resolve_port(&job.env_vars);

    let build_result = tokio::select! {
        result = worker.builder.build(BuildOptions {
            source_path: clone_result.path.clone(),
            image_name: image_name.clone(),
            deployment_id: job.deployment_id.clone(),
            project_name: job.project_name.clone(),
            build_config: job.build_config.clone(),
            env_vars,
            port,
        }) => result.map_err(|e| AppError::Build(format!("build failed: {e}")))?,
        _ = cancel.cancelled() => return Err(AppError::Canceled),
    };

    // ─────────────────────────────────────────────────────────
    // Step 4: record the image ref (non-fatal)
    // ─────────────────────────────────────────────────────────
    if let Err(e) = worker
        .api
        .update_status_with_image(
            &job.deployment_id,
            DeploymentStatus::Building,
            &build_result.image_name,
        )
        .await
    {
        warn!(error = %e, "Failed to update deployment image");
    }

    if cancel.is_requested().await {
        return Err(AppError::Canceled);
    }

    // ─────────────────────────────────────────────────────────
    // Steps 5–6: status DEPLOYING, roll out
    // ─────────────────────────────────────────────────────────
    worker
        .api
        .update_status(&job.deployment_id, DeploymentStatus::Deploying)
        .await
        .map_err(|e| AppError::Api(format!("failed to update status to DEPLOYING: {e}")))?;

    build_log.log("");
    build_log.log("🚢 Phase 3: Deploy to Kubernetes");
    build_log.log("─────────────────────────────────────────────");

    let resources = settings.resources();
    let deploy_result = tokio::select! {
        result = worker.k8s.deploy(DeployOptions {
            deployment_id: job.deployment_id.clone(),
            project_id: job.project_id.clone(),
            project_name: job.project_name.clone(),
            image_name: build_result.image_name.clone(),
            port: port as i32,
            replicas: 1,
            cpu_request: resources.cpu_request,
            cpu_limit: resources.cpu_limit,
            memory_request: resources.memory_request,
            memory_limit: resources.memory_limit,
            env_vars: job.env_vars.clone(),
            domains: job.domains.clone(),
        }) => result.map_err(|e| AppError::Deploy(format!("kubernetes deployment failed: {e}")))?,
        _ = cancel.cancelled() => return Err(AppError::Canceled),
    };

    // ─────────────────────────────────────────────────────────
    // Steps 7–8: READY, project ACTIVE, notify
    // ─────────────────────────────────────────────────────────
    let deployment_url = deploy_result.urls.first().cloned().unwrap_or_default();

    worker
        .api
        .update_status_with_url(&job.deployment_id, DeploymentStatus::Ready, &deployment_url)
        .await
        .map_err(|e| AppError::Api(format!("failed to complete deployment: {e}")))?;

    if let Err(e) = worker
        .api
        .update_project_status(&job.project_id, "ACTIVE")
        .await
    {
        warn!(error = %e, "Failed to update project status");
    }

    let duration = started.elapsed();
    build_log.log("═════════════════════════════════════════════");
    build_log.log("  ✅ Deployment Complete!");
    build_log.log("═════════════════════════════════════════════");
    build_log.log(format!("  URL:      {deployment_url}"));
    if deploy_result.urls.len() > 1 {
        build_log.log(format!("  Aliases:  {}", deploy_result.urls[1..].join(", ")));
    }
    build_log.log(format!("  Image:    {}", build_result.image_name));
    build_log.log(format!("  Duration: {}s", duration.as_secs()));
    build_log.log("═════════════════════════════════════════════");

    worker
        .api
        .notify_success(&job.deployment_id, &job.project_name, &deployment_url)
        .await;

    // ─────────────────────────────────────────────────────────
    // Step 9: runtime log streaming (non-fatal, app is live)
    // ─────────────────────────────────────────────────────────
    match worker
        .streamer
        .start(&job.deployment_id, &job.project_name)
        .await
    {
        Ok(pods) => info!(
            deployment = %job.deployment_id,
            pods,
            active_streams = worker.streamer.active_streams(),
            "Runtime log streaming started"
        ),
        Err(e) => warn!(
            deployment = %job.deployment_id,
            error = %e,
            "Failed to start runtime log streaming (non-fatal)"
        ),
    }

    info!(
        deployment = %job.deployment_id,
        url = %deployment_url,
        duration_secs = duration.as_secs(),
        "Job completed successfully! 🎉"
    );

    Ok(())
}

fn write_banner(build_log: &LogSink, job: &BuildJob) {
    let commit = &job.commit_hash[..job.commit_hash.len().min(8)];
    build_log.log("═════════════════════════════════════════════");
    build_log.log(format!("  🚀 Build - {}", job.project_name));
    build_log.log("═════════════════════════════════════════════");
    build_log.log(format!("  Branch:    {}", job.branch));
    build_log.log(format!("  Commit:    {commit}"));
    build_log.log(format!("  Framework: {}", job.build_config.framework));
    build_log.log(format!("  Domains:   {}", job.domains.join(", ")));
    build_log.log("═════════════════════════════════════════════");
    build_log.log("");
}

/// `<registry>/<sanitised-project>:<commit[..8]>`
fn image_ref(registry_url: &str, project_name: &str, commit_hash: &str) -> String {
    let tag = &commit_hash[..commit_hash.len().min(8)];
    format!("{}/{}:{}", registry_url, sanitize_k8s_name(project_name), tag)
}

/// Apps listen on 3000 unless the user supplies their own `PORT`.
fn resolve_port(env_vars: &std::collections::HashMap<String, String>) -> u16 {
    env_vars
        .get("PORT")
        .and_then(|p| p.parse().ok())
        .unwrap_or(DEFAULT_PORT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn image_ref_uses_sanitised_project_and_short_commit() {
        assert_eq!(
            image_ref("reg.local", "My Demo", "abcdef1234567890"),
            "reg.local/my-demo:abcdef12"
        );
    }

    #[test]
    fn image_ref_tolerates_short_commits() {
        assert_eq!(image_ref("reg.local", "demo", "abc"), "reg.local/demo:abc");
    }

    #[test]
    fn port_defaults_to_3000() {
        assert_eq!(resolve_port(&HashMap::new()), 3000);
    }

    #[test]
    fn user_port_wins() {
        let env = HashMap::from([("PORT".to_string(), "8080".to_string())]);
        assert_eq!(resolve_port(&env), 8080);
        let bad = HashMap::from([("PORT".to_string(), "not-a-port".to_string())]);
        assert_eq!(resolve_port(&bad), 3000);
    }
}
