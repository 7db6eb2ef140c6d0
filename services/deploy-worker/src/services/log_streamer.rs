use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use futures::{AsyncBufReadExt, TryStreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams, LogParams};
use kube::Client;
use tokio::task::JoinSet;
use tracing::{info, warn};
use worker_core::formatters::{sanitize_k8s_name, short_pod_name, strip_pod_log_timestamp};
use worker_core::models::LogSource;

use crate::error::AppError;
use super::logs::{LogSink, LogSinkFactory};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const TAIL_LINES: i64 = 100;
const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Follows container logs for live deployments and fans them into runtime
/// sinks. One task per pod; tasks are grouped per deployment so a stop
/// cancels them together.
pub struct LogStreamer {
    client: Client,
    namespace: String,
    sinks: LogSinkFactory,
    active: Mutex<HashMap<String, JoinSet<()>>>,
}

impl LogStreamer {
    pub fn new(client: Client, namespace: impl Into<String>, sinks: LogSinkFactory) -> Self {
        Self {
            client,
            namespace: namespace.into(),
            sinks,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Spawns one streaming task per pod of the app. Replaces any previous
    /// stream group for the deployment.
    pub async fn start(&self, deployment_id: &str, project_name: &str) -> Result<usize, AppError> {
        let name = sanitize_k8s_name(project_name);
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);

        let list = pods
            .list(&ListParams::default().labels(&format!("app={name}")))
            .await?;

        if list.items.is_empty() {
            return Err(AppError::NotFound(format!("no pods found for app {name}")));
        }

        let mut set = JoinSet::new();
        for pod in &list.items {
            let Some(pod_name) = pod.metadata.name.clone() else {
                continue;
            };
            set.spawn(stream_pod_logs(
                pods.clone(),
                self.sinks.clone(),
                deployment_id.to_string(),
                name.clone(),
                pod_name,
            ));
        }

        let count = set.len();
        info!(
            deployment = %deployment_id,
            app = %name,
            pods = count,
            "Starting log streaming"
        );

        let mut active = self.active.lock().unwrap();
        // Dropping the old JoinSet aborts its tasks.
        if active.insert(deployment_id.to_string(), set).is_some() {
            info!(deployment = %deployment_id, "Replaced previous log stream");
        }

        Ok(count)
    }

    pub fn stop(&self, deployment_id: &str) {
        let removed = self.active.lock().unwrap().remove(deployment_id);
        if removed.is_some() {
            info!(deployment = %deployment_id, "Stopped log streaming");
        }
    }

    /// Called on worker shutdown.
    pub fn stop_all(&self) {
        let mut active = self.active.lock().unwrap();
        let count = active.len();
        active.clear();
        if count > 0 {
            info!(count, "All log streams stopped");
        }
    }

    pub fn active_streams(&self) -> usize {
        self.active.lock().unwrap().len()
    }
}

async fn stream_pod_logs(
    pods: Api<Pod>,
    sinks: LogSinkFactory,
    deployment_id: String,
    app_name: String,
    pod_name: String,
) {
    let prefix = format!("[{}] ", short_pod_name(&pod_name));
    let sink = sinks.prefixed_sink(&deployment_id, &prefix, LogSource::Runtime);

    info!(pod = %pod_name, deployment = %deployment_id, "Streaming logs from pod");

    loop {
        if let Err(e) = stream_once(&pods, &app_name, &pod_name, &sink).await {
            warn!(pod = %pod_name, error = %e, "Log stream disconnected, retrying in 5s...");
        }
        sink.log("⚠ Log stream disconnected, reconnecting...");
        tokio::time::sleep(RECONNECT_DELAY).await;

        // Teardown can race a registered stream; once the pod is gone for
        // good there is nothing left to reconnect to.
        if let Ok(None) = pods.get_opt(&pod_name).await {
            info!(pod = %pod_name, deployment = %deployment_id, "Pod is gone, stopping log stream");
            sink.log("Pod terminated, log stream closed");
            sink.close().await;
            return;
        }
    }
}

async fn stream_once(
    pods: &Api<Pod>,
    container: &str,
    pod_name: &str,
    sink: &LogSink,
) -> Result<(), AppError> {
    let params = LogParams {
        container: Some(container.to_string()),
        follow: true,
        timestamps: true,
        tail_lines: Some(TAIL_LINES),
        ..Default::default()
    };

    let stream = pods.log_stream(pod_name, &params).await?;
    let reader = futures::io::BufReader::with_capacity(MAX_LINE_BYTES, stream);
    let mut lines = reader.lines();

    while let Some(line) = lines.try_next().await? {
        if line.is_empty() {
            continue;
        }
        sink.log(strip_pod_log_timestamp(&line));
    }

    Ok(())
}
