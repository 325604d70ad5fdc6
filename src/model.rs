//! Data model shared by every stage of a build.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use url::Url;

use crate::config::{Credentials, OrchestrationConfig};
use crate::error::JobError;
use crate::types::{BuildId, SandboxId, TaskId};

/// The orchestration entrypoint document.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildRequest {
    pub build_id: BuildId,
    #[serde(default)]
    pub intent_contract: Value,
    #[serde(default)]
    pub implementation_plan: Value,
    #[serde(default)]
    pub credentials: Credentials,
    /// Empty string disables progress delivery.
    #[serde(default)]
    pub webhook_url: String,
    #[serde(default)]
    pub config: Option<OrchestrationConfig>,
}

/// A validated build request, owned by the orchestrator for one run.
#[derive(Debug, Clone)]
pub struct BuildJob {
    pub build_id: BuildId,
    pub intent_contract: Arc<Value>,
    pub implementation_plan: Value,
    pub credentials: Credentials,
    pub webhook_url: Option<Url>,
    pub config: OrchestrationConfig,
}

impl BuildJob {
    /// Validate a request document received as JSON. Credentials are taken
    /// literally; `${VAR}` expansion only applies to locally loaded files.
    pub fn from_value(value: Value) -> Result<Self, JobError> {
        let request: BuildRequest =
            serde_json::from_value(value).map_err(|e| JobError::Malformed(e.to_string()))?;
        Self::try_from(request)
    }
}

impl TryFrom<BuildRequest> for BuildJob {
    type Error = JobError;

    fn try_from(request: BuildRequest) -> Result<Self, Self::Error> {
        if request.build_id.as_str().trim().is_empty() {
            return Err(JobError::MissingBuildId);
        }

        let webhook_url = match request.webhook_url.trim() {
            "" => None,
            raw => {
                let url = Url::parse(raw).map_err(|e| JobError::InvalidWebhookUrl {
                    url: raw.to_string(),
                    reason: e.to_string(),
                })?;
                if !matches!(url.scheme(), "http" | "https") {
                    return Err(JobError::InvalidWebhookUrl {
                        url: raw.to_string(),
                        reason: format!("unsupported scheme `{}`", url.scheme()),
                    });
                }
                Some(url)
            }
        };

        let config = request.config.unwrap_or_default();
        if !config.budget_limit_usd.is_finite() || config.budget_limit_usd < 0.0 {
            return Err(JobError::InvalidBudget(config.budget_limit_usd));
        }

        Ok(Self {
            build_id: request.build_id,
            intent_contract: Arc::new(request.intent_contract),
            implementation_plan: request.implementation_plan,
            credentials: request.credentials,
            webhook_url,
            config,
        })
    }
}

/// One unit of build work produced by partitioning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub name: String,
    #[serde(flatten)]
    pub kind: TaskKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TaskKind {
    Phase {
        features: Vec<Value>,
        dependencies: Vec<String>,
    },
    Feature {
        description: String,
        files: Vec<String>,
    },
}

/// Outcome of running one task in one sandbox. Produced exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskResult {
    pub task_id: TaskId,
    pub sandbox_id: SandboxId,
    pub success: bool,
    pub cost: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_score: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Final disposition of a task in the build tally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Completed,
    Failed,
    /// Assigned but never started because dispatch stopped early.
    Unattempted,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Unattempted => "unattempted",
        }
    }
}

/// Terminal record returned to the caller and sent with the terminal event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum BuildResult {
    Finished(BuildReport),
    Failed(BuildFailure),
}

/// A build that reached verification. `success` mirrors the verifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildReport {
    pub success: bool,
    pub build_id: BuildId,
    pub main_sandbox_url: Option<String>,
    pub duration: f64,
    pub duration_formatted: String,
    pub cost_usd: f64,
    pub tasks_completed: usize,
    pub tasks_failed: usize,
    pub tasks_unattempted: usize,
    pub verification_score: f64,
    pub completed_at: String,
}

/// A build aborted by an unhandled error.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildFailure {
    pub success: bool,
    pub build_id: BuildId,
    pub error: String,
    pub traceback: String,
    pub duration: f64,
    pub tasks_completed: usize,
    pub tasks_failed: usize,
    pub tasks_unattempted: usize,
}

impl BuildResult {
    /// True when the build reached `Completed`, whatever the verdict.
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Finished(_))
    }

    pub fn success(&self) -> bool {
        match self {
            Self::Finished(report) => report.success,
            Self::Failed(_) => false,
        }
    }

    pub fn build_id(&self) -> &BuildId {
        match self {
            Self::Finished(report) => &report.build_id,
            Self::Failed(failure) => &failure.build_id,
        }
    }

    pub fn tasks_completed(&self) -> usize {
        match self {
            Self::Finished(report) => report.tasks_completed,
            Self::Failed(failure) => failure.tasks_completed,
        }
    }

    pub fn tasks_failed(&self) -> usize {
        match self {
            Self::Finished(report) => report.tasks_failed,
            Self::Failed(failure) => failure.tasks_failed,
        }
    }

    pub fn tasks_unattempted(&self) -> usize {
        match self {
            Self::Finished(report) => report.tasks_unattempted,
            Self::Failed(failure) => failure.tasks_unattempted,
        }
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// Human-readable duration: `42.0s`, `3.5m`, `2.0h`, `1.5d`.
pub fn format_duration(seconds: f64) -> String {
    if seconds < 60.0 {
        format!("{:.1}s", seconds)
    } else if seconds < 3_600.0 {
        format!("{:.1}m", seconds / 60.0)
    } else if seconds < 86_400.0 {
        format!("{:.1}h", seconds / 3_600.0)
    } else {
        format!("{:.1}d", seconds / 86_400.0)
    }
}
