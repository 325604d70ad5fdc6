// Build persistence on SurrealDB.
//
// Rows are written as the build moves through its states so an operator (or
// the HTTP API) can see where a build is and how its tasks went.

use crate::db::connection::Db;
use crate::db::schema::*;
use crate::model::{TaskResult, TaskStatus};
use crate::types::{BuildId, TaskId};
use anyhow::Result;
use chrono::SecondsFormat;
use serde_json::Value;

fn now() -> String {
    chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Handle over the `build` and `task_result` tables.
#[derive(Clone)]
pub struct BuildStore {
    db: Db,
}

impl BuildStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    /// Create (or reset) the row for a build that is about to start. Task rows
    /// left by an earlier run of the same build id are dropped.
    pub async fn record_build(
        &self,
        build_id: &BuildId,
        state: &str,
        config: Value,
        credentials_fingerprint: &str,
    ) -> Result<()> {
        let now = now();
        self.db
            .query(
                r#"
                UPSERT type::thing('build', $build_id) CONTENT {
                    build_id: $build_id,
                    state: $state,
                    config: $config,
                    credentials_fingerprint: $fingerprint,
                    started_at: $now,
                    updated_at: $now,
                    outcome: NONE
                };
                DELETE task_result WHERE build_id = $build_id;
                "#,
            )
            .bind(("build_id", build_id.to_string()))
            .bind(("state", state.to_string()))
            .bind(("config", config))
            .bind(("fingerprint", credentials_fingerprint.to_string()))
            .bind(("now", now))
            .await?
            .check()?;
        Ok(())
    }

    pub async fn record_state(&self, build_id: &BuildId, state: &str) -> Result<()> {
        self.db
            .query(
                r#"
                UPDATE type::thing('build', $build_id) SET
                    state = $state,
                    updated_at = $now
                "#,
            )
            .bind(("build_id", build_id.to_string()))
            .bind(("state", state.to_string()))
            .bind(("now", now()))
            .await?
            .check()?;
        Ok(())
    }

    /// Store the terminal state together with the result payload.
    pub async fn record_outcome(&self, build_id: &BuildId, state: &str, outcome: Value) -> Result<()> {
        self.db
            .query(
                r#"
                UPDATE type::thing('build', $build_id) SET
                    state = $state,
                    outcome = $outcome,
                    updated_at = $now
                "#,
            )
            .bind(("build_id", build_id.to_string()))
            .bind(("state", state.to_string()))
            .bind(("outcome", outcome))
            .bind(("now", now()))
            .await?
            .check()?;
        Ok(())
    }

    pub async fn record_task_result(&self, build_id: &BuildId, result: &TaskResult) -> Result<()> {
        let status = if result.success {
            TaskStatus::Completed
        } else {
            TaskStatus::Failed
        };
        self.insert_task_row(TaskResultRecord {
            build_id: build_id.to_string(),
            task_id: result.task_id.to_string(),
            sandbox_id: Some(result.sandbox_id.to_string()),
            status: status.as_str().to_string(),
            success: result.success,
            cost: result.cost,
            verification_score: result.verification_score,
            error: result.error.clone(),
            recorded_at: now(),
        })
        .await
    }

    pub async fn record_unattempted(&self, build_id: &BuildId, task_id: &TaskId) -> Result<()> {
        self.insert_task_row(TaskResultRecord {
            build_id: build_id.to_string(),
            task_id: task_id.to_string(),
            sandbox_id: None,
            status: TaskStatus::Unattempted.as_str().to_string(),
            success: false,
            cost: 0.0,
            verification_score: None,
            error: None,
            recorded_at: now(),
        })
        .await
    }

    async fn insert_task_row(&self, row: TaskResultRecord) -> Result<()> {
        self.db
            .query("CREATE task_result CONTENT $row")
            .bind(("row", row))
            .await?
            .check()?;
        Ok(())
    }

    pub async fn get_build(&self, build_id: &BuildId) -> Result<Option<BuildRecord>> {
        let mut res = self
            .db
            .query(
                r#"
                SELECT build_id, state, config, credentials_fingerprint,
                       started_at, updated_at, outcome
                FROM type::thing('build', $build_id)
                "#,
            )
            .bind(("build_id", build_id.to_string()))
            .await?;

        let build: Option<BuildRecord> = res.take(0)?;
        Ok(build)
    }

    pub async fn list_task_results(&self, build_id: &BuildId) -> Result<Vec<TaskResultRecord>> {
        let mut res = self
            .db
            .query(
                r#"
                SELECT build_id, task_id, sandbox_id, status, success, cost,
                       verification_score, error, recorded_at
                FROM task_result
                WHERE build_id = $build_id
                ORDER BY recorded_at ASC
                "#,
            )
            .bind(("build_id", build_id.to_string()))
            .await?;

        let rows: Vec<TaskResultRecord> = res.take(0)?;
        Ok(rows)
    }
}
