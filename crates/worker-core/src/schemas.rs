use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::models::DeploymentStatus;

// -----------------------------------------------
// QUEUE PAYLOADS
// -----------------------------------------------

/// Framework-specific build settings carried in the job payload.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct BuildConfig {
    #[serde(default)]
    pub install_command: Option<String>,
    #[serde(default)]
    pub build_command: Option<String>,
    #[serde(default)]
    pub run_command: Option<String>,
    #[serde(default)]
    pub output_dir: Option<String>,
    #[serde(default)]
    pub framework: String,
}

/// A deployment job as pushed by the control plane. Immutable after dequeue.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct BuildJob {
    pub deployment_id: String,
    pub project_id: String,
    pub project_name: String,
    pub git_url: String,
    pub installation_id: i64,
    pub branch: String,
    #[serde(default)]
    pub commit_hash: String,
    #[serde(default)]
    pub build_config: BuildConfig,
    #[serde(default)]
    pub domains: Vec<String>,
    #[serde(default)]
    pub env_vars: HashMap<String, String>,
}

/// Popped from `project-cleanup-queue` when a project is deleted.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ProjectCleanupJob {
    pub project_id: String,
    pub project_name: String,
    #[serde(default)]
    pub active_deployment_ids: Vec<String>,
}

// -----------------------------------------------
// CONTROL-PLANE PAYLOADS
// -----------------------------------------------

/// A deployment that exceeded its TTL, as reported by the control plane.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct ExpiredDeployment {
    pub id: String,
    pub project_id: String,
    pub project_name: String,
    #[serde(default)]
    pub container_image: Option<String>,
    #[serde(default)]
    pub ttl_minutes: i32,
    #[serde(default)]
    pub expired_at: Option<String>,
}

#[derive(Deserialize, Debug)]
pub struct ExpiredDeploymentsResponse {
    #[serde(default)]
    pub deployments: Vec<ExpiredDeployment>,
}

/// A custom domain awaiting DNS verification.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct PendingDomain {
    pub id: String,
    pub domain: String,
    pub project_id: String,
    pub project_name: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub created_at: Option<String>,
}

/// Short-lived GitHub App installation token minted by the control plane.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct InstallationToken {
    pub token: String,
    #[serde(default)]
    pub expires_at: Option<String>,
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentSummary {
    pub id: String,
    pub status: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub commit_hash: Option<String>,
    #[serde(default)]
    pub container_image: Option<String>,
    #[serde(default)]
    pub deployment_url: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
}

// -----------------------------------------------
// OUTBOUND BODIES
// -----------------------------------------------

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentStatusUpdate {
    pub status: DeploymentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub container_image: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl DeploymentStatusUpdate {
    pub fn status_only(status: DeploymentStatus) -> Self {
        Self {
            status,
            container_image: None,
            deployment_url: None,
            error_message: None,
        }
    }
}

#[derive(Serialize, Debug, Clone)]
#[serde(rename_all = "camelCase")]
pub struct DeploymentNotification {
    pub deployment_id: String,
    pub status: String,
    pub project_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Serialize, Debug, Clone)]
pub struct SaveLogEntry {
    pub source: String,
    pub message: String,
    pub timestamp: String,
}

#[derive(Serialize, Debug, Clone)]
pub struct SaveLogsRequest {
    pub logs: Vec<SaveLogEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_job_decodes_control_plane_payload() {
        let raw = r#"{
            "deploymentId": "d1",
            "projectId": "p1",
            "projectName": "demo",
            "gitUrl": "https://github.com/acme/demo.git",
            "installationId": 4242,
            "branch": "main",
            "commitHash": "abcdef1234567890",
            "buildConfig": {
                "buildCommand": "npm run build",
                "runCommand": "npm start",
                "framework": "nextjs"
            },
            "domains": ["demo.base.example"],
            "envVars": {"FOO": "bar"}
        }"#;
        let job: BuildJob = serde_json::from_str(raw).unwrap();
        assert_eq!(job.deployment_id, "d1");
        assert_eq!(job.installation_id, 4242);
        assert_eq!(job.build_config.framework, "nextjs");
        assert_eq!(job.build_config.build_command.as_deref(), Some("npm run build"));
        assert!(job.build_config.install_command.is_none());
        assert_eq!(job.domains, vec!["demo.base.example"]);
        assert_eq!(job.env_vars["FOO"], "bar");
    }

    #[test]
    fn build_job_tolerates_missing_optional_fields() {
        let raw = r#"{
            "deploymentId": "d2",
            "projectId": "p2",
            "projectName": "bare",
            "gitUrl": "https://github.com/acme/bare.git",
            "installationId": 1,
            "branch": "main"
        }"#;
        let job: BuildJob = serde_json::from_str(raw).unwrap();
        assert!(job.commit_hash.is_empty());
        assert!(job.domains.is_empty());
        assert!(job.env_vars.is_empty());
        assert!(job.build_config.framework.is_empty());
    }

    #[test]
    fn status_update_skips_absent_fields() {
        let body = DeploymentStatusUpdate::status_only(DeploymentStatus::Deploying);
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(json, serde_json::json!({"status": "DEPLOYING"}));

        let body = DeploymentStatusUpdate {
            status: DeploymentStatus::Failed,
            container_image: None,
            deployment_url: None,
            error_message: Some("build failed with exit code 1".to_string()),
        };
        let json = serde_json::to_value(&body).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"status": "FAILED", "errorMessage": "build failed with exit code 1"})
        );
    }

    #[test]
    fn expired_deployments_response_decodes() {
        let raw = r#"{"deployments": [
            {"id": "d1", "projectId": "p1", "projectName": "demo", "containerImage": "reg/demo:abc", "ttlMinutes": 5, "expiredAt": "2026-01-01T00:00:00Z"}
        ]}"#;
        let res: ExpiredDeploymentsResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(res.deployments.len(), 1);
        assert_eq!(res.deployments[0].project_name, "demo");
        assert_eq!(res.deployments[0].ttl_minutes, 5);
    }

    #[test]
    fn project_cleanup_job_decodes() {
        let raw = r#"{"projectId": "p1", "projectName": "demo", "activeDeploymentIds": ["d1", "d2"]}"#;
        let job: ProjectCleanupJob = serde_json::from_str(raw).unwrap();
        assert_eq!(job.active_deployment_ids.len(), 2);
    }

    #[test]
    fn deployment_summary_decodes_sparse_payload() {
        let raw = r#"{"id": "d9", "status": "READY"}"#;
        let summary: DeploymentSummary = serde_json::from_str(raw).unwrap();
        assert_eq!(summary.id, "d9");
        assert!(summary.deployment_url.is_none());
    }
}
