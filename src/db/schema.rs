use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Persisted view of one build (table: `build`, record id = build id).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildRecord {
    pub build_id: String,
    /// Latest orchestrator state, snake_case.
    pub state: String,
    /// Orchestration config the build ran with.
    pub config: Value,
    /// Digest of the credentials; the credentials themselves are never stored.
    pub credentials_fingerprint: String,
    pub started_at: String,
    pub updated_at: String,
    /// Final result payload once the build is terminal.
    #[serde(default)]
    pub outcome: Option<Value>,
}

/// Persisted outcome of one task (table: `task_result`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResultRecord {
    pub build_id: String,
    pub task_id: String,
    #[serde(default)]
    pub sandbox_id: Option<String>,
    /// `completed`, `failed` or `unattempted`.
    pub status: String,
    pub success: bool,
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub verification_score: Option<f64>,
    #[serde(default)]
    pub error: Option<String>,
    pub recorded_at: String,
}
