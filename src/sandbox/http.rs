//! Sandbox client backed by the sandbox bridge HTTP service.
//!
//! Every call is a `POST` of `{"action": ..., "sandboxId": ..., ...}` to the
//! bridge URL; the bridge answers `{"success": bool, "data": {...}, "error": "..."}`.
//! The bridge knows four actions: `create`, `exec`, `get_tunnel` and
//! `terminate`. A task runs as an `exec` of the task runner command, which
//! prints a JSON report as the last line of its stdout.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::debug;
use url::Url;

use super::{Sandbox, SandboxClient, SandboxRequest, TaskExecution};
use crate::error::SandboxError;
use crate::model::Task;
use crate::types::SandboxId;

/// Dev-server port exposed through the sandbox tunnel.
pub const DEFAULT_TUNNEL_PORT: u16 = 5173;

/// Program started inside a build sandbox for every task.
pub const DEFAULT_TASK_COMMAND: &str = "buildfleet-task";

/// Exit code the bridge reports when a command hits its timeout.
const EXIT_TIMED_OUT: i64 = 124;

#[derive(Debug, Deserialize)]
struct BridgeResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    data: Option<Value>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct CreatedSandbox {
    #[serde(default, alias = "tunnel_url")]
    #[serde(rename = "tunnelUrl")]
    tunnel_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Tunnel {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExecOutput {
    #[serde(default)]
    stdout: String,
    #[serde(default)]
    stderr: String,
    exit_code: i64,
}

/// The task runner's report, read from the last stdout line.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TaskReport {
    #[serde(default)]
    cost: f64,
    #[serde(default)]
    verification_score: Option<f64>,
    #[serde(default)]
    error: Option<String>,
}

impl ExecOutput {
    fn report(&self) -> TaskReport {
        self.stdout
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .and_then(|line| serde_json::from_str(line.trim()).ok())
            .unwrap_or_default()
    }

    fn into_execution(self) -> TaskExecution {
        let report = self.report();
        let success = self.exit_code == 0;
        let error = if success {
            None
        } else if self.exit_code == EXIT_TIMED_OUT {
            Some(format!("task timed out: {}", self.stderr.trim()))
        } else {
            report.error.or_else(|| {
                let stderr = self.stderr.trim();
                Some(if stderr.is_empty() {
                    format!("task runner exited with code {}", self.exit_code)
                } else {
                    stderr.to_string()
                })
            })
        };

        TaskExecution {
            success,
            cost: report.cost,
            verification_score: report.verification_score,
            error,
        }
    }
}

pub struct HttpSandboxClient {
    bridge_url: Url,
    tunnel_port: u16,
    task_command: Vec<String>,
    exec_timeout: Duration,
    client: reqwest::Client,
}

impl HttpSandboxClient {
    pub fn new(bridge_url: &str, timeout: Duration) -> Result<Self> {
        let bridge_url = Url::parse(bridge_url)
            .with_context(|| format!("invalid sandbox bridge url `{}`", bridge_url))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build sandbox bridge HTTP client")?;

        Ok(Self {
            bridge_url,
            tunnel_port: DEFAULT_TUNNEL_PORT,
            task_command: vec![DEFAULT_TASK_COMMAND.to_string()],
            exec_timeout: timeout,
            client,
        })
    }

    pub fn with_tunnel_port(mut self, port: u16) -> Self {
        self.tunnel_port = port;
        self
    }

    /// Replace the task runner command. The task and the intent contract are
    /// appended as `--task <json> --intent-contract <json>`.
    pub fn with_task_command(mut self, command: Vec<String>) -> Self {
        self.task_command = command;
        self
    }

    fn task_command_for(&self, task: &Task, intent_contract: &Value) -> Result<Vec<String>> {
        let mut command = self.task_command.clone();
        command.push("--task".to_string());
        command.push(serde_json::to_string(task).context("failed to encode task")?);
        command.push("--intent-contract".to_string());
        command.push(serde_json::to_string(intent_contract).context("failed to encode intent contract")?);
        Ok(command)
    }

    async fn call(&self, action: &str, mut payload: Value) -> Result<Value, SandboxError> {
        payload["action"] = Value::String(action.to_string());
        debug!(action, "sandbox bridge request");

        let response: BridgeResponse = self
            .client
            .post(self.bridge_url.clone())
            .json(&payload)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        if response.success {
            Ok(response.data.unwrap_or(Value::Null))
        } else {
            Err(SandboxError::Rejected {
                action: action.to_string(),
                message: response
                    .error
                    .unwrap_or_else(|| "unknown error".to_string()),
            })
        }
    }
}

#[async_trait]
impl SandboxClient for HttpSandboxClient {
    async fn create(&self, request: SandboxRequest<'_>) -> Result<Sandbox> {
        let data = self
            .call(
                "create",
                json!({
                    "sandboxId": request.id,
                    "role": request.role,
                    "isMain": request.role == super::SandboxRole::Main,
                    "intentContract": request.intent_contract,
                    "credentials": request.credentials,
                }),
            )
            .await?;

        let created: CreatedSandbox = if data.is_null() {
            CreatedSandbox::default()
        } else {
            serde_json::from_value(data)
                .with_context(|| format!("unexpected create response for {}", request.id))?
        };

        Ok(Sandbox::running(
            request.id.clone(),
            request.role,
            created.tunnel_url,
        ))
    }

    async fn execute_task(
        &self,
        sandbox: &Sandbox,
        task: &Task,
        intent_contract: &Value,
    ) -> Result<TaskExecution> {
        let command = self.task_command_for(task, intent_contract)?;
        let data = self
            .call(
                "exec",
                json!({
                    "sandboxId": sandbox.id,
                    "command": command,
                    "timeout": self.exec_timeout.as_secs(),
                }),
            )
            .await?;

        let output: ExecOutput = serde_json::from_value(data)
            .with_context(|| format!("unexpected exec response for task {}", task.id))?;
        debug!(
            sandbox_id = %sandbox.id,
            task_id = %task.id,
            exit_code = output.exit_code,
            "task runner finished"
        );
        Ok(output.into_execution())
    }

    async fn ingress_url(&self, sandbox_id: &SandboxId) -> Result<Option<String>> {
        let data = self
            .call(
                "get_tunnel",
                json!({ "sandboxId": sandbox_id, "port": self.tunnel_port }),
            )
            .await?;

        if data.is_null() {
            return Ok(None);
        }
        let tunnel: Tunnel = serde_json::from_value(data)
            .with_context(|| format!("unexpected get_tunnel response for {}", sandbox_id))?;
        Ok(tunnel.url)
    }

    async fn terminate(&self, sandbox_id: &SandboxId) -> Result<()> {
        match self
            .call("terminate", json!({ "sandboxId": sandbox_id }))
            .await
        {
            Ok(_) => Ok(()),
            Err(SandboxError::Rejected { message, .. }) if message.contains("not found") => {
                debug!(%sandbox_id, "terminate on unknown sandbox treated as done");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}
