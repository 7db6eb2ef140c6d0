use serde::{Deserialize, Serialize};

// ---------------------------------------------
// ENUMS
// ---------------------------------------------

/// Externally authoritative deployment state. Only forward transitions are
/// emitted; `Failed` and `Canceled` may supersede any non-terminal state.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeploymentStatus {
    Queued,
    Building,
    Deploying,
    Ready,
    Failed,
    Canceled,
    Expired,
}

impl std::fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queued => write!(f, "QUEUED"),
            Self::Building => write!(f, "BUILDING"),
            Self::Deploying => write!(f, "DEPLOYING"),
            Self::Ready => write!(f, "READY"),
            Self::Failed => write!(f, "FAILED"),
            Self::Canceled => write!(f, "CANCELED"),
            Self::Expired => write!(f, "EXPIRED"),
        }
    }
}

/// Origin of a log line shipped to the control plane.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogSource {
    Build,
    Runtime,
    System,
}

impl LogSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Build => "BUILD",
            Self::Runtime => "RUNTIME",
            Self::System => "SYSTEM",
        }
    }
}

impl std::fmt::Display for LogSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------
// PROJECT SETTINGS
// ---------------------------------------------

/// Per-project settings fetched fresh for every job, never cached across
/// jobs. Unknown fields in the payload (user block etc.) are ignored.
#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "camelCase", default)]
pub struct ProjectSettings {
    #[serde(rename = "globalTTLMinutes")]
    pub global_ttl_minutes: i32,
    pub turbo_mode: bool,
    pub log_retention_days: i32,
    pub max_concurrent_builds: i32,
    pub slack_webhook: Option<String>,
    pub email_deploy_failed: bool,
    pub email_deploy_success: bool,
}

impl Default for ProjectSettings {
    fn default() -> Self {
        Self {
            global_ttl_minutes: 5,
            turbo_mode: false,
            log_retention_days: 1,
            max_concurrent_builds: 1,
            slack_webhook: None,
            email_deploy_failed: true,
            email_deploy_success: true,
        }
    }
}

/// Container resource envelope applied to the app deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceEnvelope {
    pub cpu_request: String,
    pub cpu_limit: String,
    pub memory_request: String,
    pub memory_limit: String,
}

impl ProjectSettings {
    /// Turbo mode selects the larger envelope.
    pub fn resources(&self) -> ResourceEnvelope {
        if self.turbo_mode {
            ResourceEnvelope {
                cpu_request: "250m".to_string(),
                cpu_limit: "1000m".to_string(),
                memory_request: "256Mi".to_string(),
                memory_limit: "1Gi".to_string(),
            }
        } else {
            ResourceEnvelope {
                cpu_request: "100m".to_string(),
                cpu_limit: "500m".to_string(),
                memory_request: "128Mi".to_string(),
                memory_limit: "512Mi".to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_serializes_screaming_snake_case() {
        let json = serde_json::to_string(&DeploymentStatus::Building).unwrap();
        assert_eq!(json, "\"BUILDING\"");
        let json = serde_json::to_string(&DeploymentStatus::Canceled).unwrap();
        assert_eq!(json, "\"CANCELED\"");
    }

    #[test]
    fn status_display_matches_wire_form() {
        assert_eq!(DeploymentStatus::Deploying.to_string(), "DEPLOYING");
        assert_eq!(DeploymentStatus::Expired.to_string(), "EXPIRED");
    }

    #[test]
    fn settings_default_on_missing_fields() {
        let settings: ProjectSettings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings.global_ttl_minutes, 5);
        assert!(!settings.turbo_mode);
        assert!(settings.email_deploy_failed);
    }

    #[test]
    fn settings_payload_with_user_block_is_accepted() {
        let raw = r#"{
            "globalTTLMinutes": 30,
            "turboMode": true,
            "logRetentionDays": 7,
            "maxConcurrentBuilds": 2,
            "slackWebhook": "https://hooks.example/x",
            "emailDeployFailed": false,
            "emailDeploySuccess": true,
            "user": {"id": "u1", "email": "a@b.c", "name": null}
        }"#;
        let settings: ProjectSettings = serde_json::from_str(raw).unwrap();
        assert_eq!(settings.global_ttl_minutes, 30);
        assert!(settings.turbo_mode);
        assert_eq!(settings.slack_webhook.as_deref(), Some("https://hooks.example/x"));
    }

    #[test]
    fn turbo_mode_selects_larger_envelope() {
        let normal = ProjectSettings::default().resources();
        assert_eq!(normal.cpu_request, "100m");
        assert_eq!(normal.memory_limit, "512Mi");

        let turbo = ProjectSettings {
            turbo_mode: true,
            ..Default::default()
        }
        .resources();
        assert_eq!(turbo.cpu_limit, "1000m");
        assert_eq!(turbo.memory_limit, "1Gi");
    }
}
