//! Folding worker results into the main sandbox.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::model::TaskResult;
use crate::sandbox::{Sandbox, SandboxClient};
use crate::types::TaskId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeRecord {
    pub task_id: TaskId,
    pub merged: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Decides which results reach the main sandbox and asks the sandbox client
/// to apply them, one at a time, in result order.
pub struct MergeProcessor {
    client: Arc<dyn SandboxClient>,
}

impl MergeProcessor {
    pub fn new(client: Arc<dyn SandboxClient>) -> Self {
        Self { client }
    }

    /// Failed results never produce a record and are never applied.
    pub async fn process(&self, main: &Sandbox, results: &[TaskResult]) -> Vec<MergeRecord> {
        let mut records = Vec::new();

        for result in results.iter().filter(|r| r.success) {
            let record = match self.client.merge(main, result).await {
                Ok(()) => MergeRecord {
                    task_id: result.task_id.clone(),
                    merged: true,
                    error: None,
                },
                Err(e) => {
                    warn!(
                        main_sandbox = %main.id,
                        task_id = %result.task_id,
                        error = %e,
                        "merge into main sandbox failed"
                    );
                    MergeRecord {
                        task_id: result.task_id.clone(),
                        merged: false,
                        error: Some(format!("{e:#}")),
                    }
                }
            };
            records.push(record);
        }

        info!(
            main_sandbox = %main.id,
            merged = records.iter().filter(|r| r.merged).count(),
            skipped_failed = results.iter().filter(|r| !r.success).count(),
            "merge pass finished"
        );

        records
    }
}
