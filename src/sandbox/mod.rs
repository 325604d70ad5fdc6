//! Sandbox lifecycle contract and the per-build sandbox registry.
//!
//! The orchestrator never knows how a sandbox is implemented. It only drives
//! the [`SandboxClient`] lifecycle: create, execute a task, resolve the
//! ingress URL, merge and terminate.

pub mod http;
pub mod registry;

pub use http::HttpSandboxClient;
pub use registry::SandboxRegistry;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::Credentials;
use crate::model::{Task, TaskResult};
use crate::types::SandboxId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxRole {
    /// Durable, user-visible target that receives merged results.
    Main,
    /// Ephemeral worker, torn down at the end of the run.
    Build,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxStatus {
    Creating,
    Running,
    Terminated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Sandbox {
    pub id: SandboxId,
    pub role: SandboxRole,
    pub status: SandboxStatus,
    #[serde(default)]
    pub tunnel_url: Option<String>,
}

impl Sandbox {
    pub fn running(id: SandboxId, role: SandboxRole, tunnel_url: Option<String>) -> Self {
        Self {
            id,
            role,
            status: SandboxStatus::Running,
            tunnel_url,
        }
    }
}

/// Everything the substrate needs to start a sandbox.
#[derive(Debug, Clone, Copy)]
pub struct SandboxRequest<'a> {
    pub id: &'a SandboxId,
    pub role: SandboxRole,
    pub intent_contract: &'a Value,
    pub credentials: &'a Credentials,
}

/// What the substrate reports back for one executed task.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskExecution {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub cost: f64,
    #[serde(default)]
    pub verification_score: Option<f64>,
    #[serde(default)]
    pub error: Option<String>,
}

#[async_trait]
pub trait SandboxClient: Send + Sync {
    async fn create(&self, request: SandboxRequest<'_>) -> Result<Sandbox>;

    async fn execute_task(
        &self,
        sandbox: &Sandbox,
        task: &Task,
        intent_contract: &Value,
    ) -> Result<TaskExecution>;

    async fn ingress_url(&self, sandbox_id: &SandboxId) -> Result<Option<String>>;

    /// Apply a worker's result to the main sandbox.
    async fn merge(&self, _main: &Sandbox, _result: &TaskResult) -> Result<()> {
        Ok(())
    }

    /// Idempotent: unknown or already-terminated sandboxes are not an error.
    async fn terminate(&self, sandbox_id: &SandboxId) -> Result<()>;
}
