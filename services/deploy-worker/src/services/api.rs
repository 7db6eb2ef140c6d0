use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use worker_core::models::{DeploymentStatus, LogSource, ProjectSettings};
use worker_core::schemas::{
    DeploymentNotification, DeploymentStatusUpdate, DeploymentSummary, ExpiredDeployment,
    ExpiredDeploymentsResponse, InstallationToken, PendingDomain, SaveLogEntry, SaveLogsRequest,
};

use crate::error::AppError;

const API_KEY_HEADER: &str = "X-Worker-Api-Key";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// What to do when the settings endpoint fails: silent defaults match the
/// control plane's expectations, `Fail` aborts the job instead of running it
/// with a different resource envelope than intended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SettingsFallback {
    Defaults,
    Fail,
}

/// Thin typed client for the control-plane REST API.
#[derive(Clone)]
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    settings_fallback: SettingsFallback,
}

impl ApiClient {
    pub fn new(
        base_url: &str,
        api_key: &str,
        settings_fallback: SettingsFallback,
    ) -> Result<Self, AppError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            settings_fallback,
        })
    }

    // ─────────────────────────────────────────────────────────
    // Deployments
    // ─────────────────────────────────────────────────────────

    pub async fn get_deployment(&self, id: &str) -> Result<DeploymentSummary, AppError> {
        self.get(&format!("/deployments/{id}")).await
    }

    pub async fn update_status(
        &self,
        id: &str,
        status: DeploymentStatus,
    ) -> Result<(), AppError> {
        self.patch(
            &format!("/internal/deployments/{id}/status"),
            &DeploymentStatusUpdate::status_only(status),
        )
        .await?;
        debug!(deployment_id = %id, status = %status, "Updated deployment status");
        Ok(())
    }

    pub async fn update_status_with_image(
        &self,
        id: &str,
        status: DeploymentStatus,
        image: &str,
    ) -> Result<(), AppError> {
        let body = DeploymentStatusUpdate {
            container_image: Some(image.to_string()),
            ..DeploymentStatusUpdate::status_only(status)
        };
        self.patch(&format!("/internal/deployments/{id}/status"), &body)
            .await
    }

    pub async fn update_status_with_url(
        &self,
        id: &str,
        status: DeploymentStatus,
        url: &str,
    ) -> Result<(), AppError> {
        let body = DeploymentStatusUpdate {
            deployment_url: Some(url.to_string()),
            ..DeploymentStatusUpdate::status_only(status)
        };
        self.patch(&format!("/internal/deployments/{id}/status"), &body)
            .await
    }

    /// Marks a deployment failed. The error message always travels with the
    /// status so users see why.
    pub async fn fail_deployment(&self, id: &str, error_message: &str) -> Result<(), AppError> {
        let body = DeploymentStatusUpdate {
            error_message: Some(error_message.to_string()),
            ..DeploymentStatusUpdate::status_only(DeploymentStatus::Failed)
        };
        self.patch(&format!("/internal/deployments/{id}/status"), &body)
            .await
    }

    pub async fn get_expired_deployments(&self) -> Result<Vec<ExpiredDeployment>, AppError> {
        let res: ExpiredDeploymentsResponse = self.get("/internal/deployments/expired").await?;
        Ok(res.deployments)
    }

    /// Control-plane DB bookkeeping after the worker tore resources down.
    pub async fn cleanup_deployment(&self, id: &str) -> Result<(), AppError> {
        self.delete(&format!("/internal/deployments/{id}/resources"))
            .await
    }

    // ─────────────────────────────────────────────────────────
    // Logs
    // ─────────────────────────────────────────────────────────

    pub async fn save_logs(
        &self,
        deployment_id: &str,
        source: LogSource,
        messages: &[String],
    ) -> Result<(), AppError> {
        if messages.is_empty() {
            return Ok(());
        }

        let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        let logs = messages
            .iter()
            .map(|message| SaveLogEntry {
                source: source.as_str().to_string(),
                message: message.clone(),
                timestamp: timestamp.clone(),
            })
            .collect();

        self.post(
            &format!("/internal/deployments/{deployment_id}/logs"),
            &SaveLogsRequest { logs },
        )
        .await
    }

    pub async fn trigger_log_cleanup(&self) -> Result<(), AppError> {
        self.post("/internal/logs/cleanup", &serde_json::json!({}))
            .await
    }

    // ─────────────────────────────────────────────────────────
    // Notifications (observability only, never fail the pipeline)
    // ─────────────────────────────────────────────────────────

    pub async fn notify_success(&self, deployment_id: &str, project_name: &str, url: &str) {
        self.send_notification(DeploymentNotification {
            deployment_id: deployment_id.to_string(),
            status: DeploymentStatus::Ready.to_string(),
            project_name: project_name.to_string(),
            deployment_url: Some(url.to_string()),
            message: None,
        })
        .await;
    }

    pub async fn notify_failure(&self, deployment_id: &str, project_name: &str, error: &str) {
        self.send_notification(DeploymentNotification {
            deployment_id: deployment_id.to_string(),
            status: DeploymentStatus::Failed.to_string(),
            project_name: project_name.to_string(),
            deployment_url: None,
            message: Some(error.to_string()),
        })
        .await;
    }

    async fn send_notification(&self, notification: DeploymentNotification) {
        if let Err(e) = self
            .post("/internal/notifications/deployment", &notification)
            .await
        {
            warn!(
                deployment_id = %notification.deployment_id,
                status = %notification.status,
                error = %e,
                "Failed to send notification"
            );
        }
    }

    // ─────────────────────────────────────────────────────────
    // Projects & settings
    // ─────────────────────────────────────────────────────────

    /// Never fails the pipeline under the `Defaults` policy.
    pub async fn get_project_settings(
        &self,
        project_id: &str,
    ) -> Result<ProjectSettings, AppError> {
        match self
            .get::<ProjectSettings>(&format!("/internal/settings/by-project/{project_id}"))
            .await
        {
            Ok(settings) => Ok(settings),
            Err(e) => match self.settings_fallback {
                SettingsFallback::Defaults => {
                    warn!(project_id = %project_id, error = %e, "Failed to get project settings, using defaults");
                    Ok(ProjectSettings::default())
                }
                SettingsFallback::Fail => Err(e),
            },
        }
    }

    pub async fn update_project_status(
        &self,
        project_id: &str,
        status: &str,
    ) -> Result<(), AppError> {
        self.patch(
            &format!("/internal/projects/{project_id}/status"),
            &serde_json::json!({ "onlineStatus": status }),
        )
        .await
    }

    // ─────────────────────────────────────────────────────────
    // Domains
    // ─────────────────────────────────────────────────────────

    pub async fn get_pending_domains(&self) -> Result<Vec<PendingDomain>, AppError> {
        self.get("/internal/domains/pending").await
    }

    pub async fn update_domain_status(
        &self,
        domain_id: &str,
        status: &str,
        error_message: &str,
    ) -> Result<(), AppError> {
        self.patch(
            &format!("/internal/domains/{domain_id}/status"),
            &serde_json::json!({ "status": status, "error": error_message }),
        )
        .await
    }

    // ─────────────────────────────────────────────────────────
    // Git
    // ─────────────────────────────────────────────────────────

    pub async fn get_installation_token(
        &self,
        installation_id: i64,
    ) -> Result<InstallationToken, AppError> {
        let token: InstallationToken = self
            .get(&format!("/internal/git/installation-token/{installation_id}"))
            .await?;
        debug!(
            installation_id,
            expires_at = token.expires_at.as_deref().unwrap_or("unknown"),
            "Got installation token"
        );
        Ok(token)
    }

    // ─────────────────────────────────────────────────────────
    // Transport
    // ─────────────────────────────────────────────────────────

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, AppError> {
        let res = self
            .http
            .get(self.url(path))
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await?;
        Ok(Self::check(res).await?.json().await?)
    }

    async fn post<B: Serialize>(&self, path: &str, body: &B) -> Result<(), AppError> {
        let res = self
            .http
            .post(self.url(path))
            .header(API_KEY_HEADER, &self.api_key)
            .json(body)
            .send()
            .await?;
        Self::check(res).await?;
        Ok(())
    }

    async fn patch<B: Serialize>(&self, path: &str, body: &B) -> Result<(), AppError> {
        let res = self
            .http
            .patch(self.url(path))
            .header(API_KEY_HEADER, &self.api_key)
            .json(body)
            .send()
            .await?;
        Self::check(res).await?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), AppError> {
        let res = self
            .http
            .delete(self.url(path))
            .header(API_KEY_HEADER, &self.api_key)
            .send()
            .await?;
        Self::check(res).await?;
        Ok(())
    }

    async fn check(res: reqwest::Response) -> Result<reqwest::Response, AppError> {
        if res.status().is_success() {
            return Ok(res);
        }
        let status = res.status();
        let body = res.text().await.unwrap_or_default();
        Err(AppError::Api(format!(
            "control plane returned {status}: {body}"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn base_url_is_normalised() {
        let client =
            ApiClient::new("http://api.local/", "key", SettingsFallback::Defaults).unwrap();
        assert_eq!(client.url("/internal/domains/pending"), "http://api.local/internal/domains/pending");
    }
}
