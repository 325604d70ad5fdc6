// Per-sandbox execution loop

use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use serde_json::{Value, json};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::budget::BudgetTracker;
use crate::model::{Task, TaskResult, TaskStatus};
use crate::progress::{EventKind, ProgressEmitter};
use crate::sandbox::{Sandbox, SandboxClient};
use crate::types::{SandboxId, TaskId};

/// Why a worker stopped dispatching before its list was exhausted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum StopReason {
    BudgetExceeded,
    DeadlineExceeded,
    Cancelled,
}

/// Deadline and external cancellation, checked at every task boundary.
#[derive(Debug, Clone)]
pub struct StopSignal {
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl StopSignal {
    pub fn new(deadline: Option<Instant>, cancel: CancellationToken) -> Self {
        Self { deadline, cancel }
    }

    fn triggered(&self) -> Option<StopReason> {
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            Some(StopReason::DeadlineExceeded)
        } else if self.cancel.is_cancelled() {
            Some(StopReason::Cancelled)
        } else {
            None
        }
    }
}

#[derive(Debug, Default)]
struct LedgerInner {
    completed: Vec<TaskId>,
    failed: Vec<TaskId>,
    unattempted: Vec<TaskId>,
    results: Vec<TaskResult>,
}

/// Completed / failed / unattempted sets shared by all workers of a build.
#[derive(Debug, Default)]
pub struct TaskLedger {
    inner: Mutex<LedgerInner>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedgerCounts {
    pub completed: usize,
    pub failed: usize,
    pub unattempted: usize,
}

impl TaskLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn record(&self, result: TaskResult) -> TaskStatus {
        let mut inner = self.inner.lock().await;
        let status = if result.success {
            inner.completed.push(result.task_id.clone());
            TaskStatus::Completed
        } else {
            inner.failed.push(result.task_id.clone());
            TaskStatus::Failed
        };
        inner.results.push(result);
        status
    }

    pub async fn mark_unattempted(&self, ids: impl IntoIterator<Item = TaskId>) {
        self.inner.lock().await.unattempted.extend(ids);
    }

    pub async fn counts(&self) -> LedgerCounts {
        let inner = self.inner.lock().await;
        LedgerCounts {
            completed: inner.completed.len(),
            failed: inner.failed.len(),
            unattempted: inner.unattempted.len(),
        }
    }

    /// Every result recorded so far, in completion order.
    pub async fn results(&self) -> Vec<TaskResult> {
        self.inner.lock().await.results.clone()
    }

    pub async fn unattempted(&self) -> Vec<TaskId> {
        self.inner.lock().await.unattempted.clone()
    }
}

/// Shared handles every execution loop of a build works against.
#[derive(Clone)]
pub struct ExecutionContext {
    pub client: Arc<dyn SandboxClient>,
    pub budget: Arc<BudgetTracker>,
    pub ledger: Arc<TaskLedger>,
    pub emitter: ProgressEmitter,
    pub intent_contract: Arc<Value>,
    pub stop: StopSignal,
}

#[derive(Debug, Clone)]
pub struct WorkerSummary {
    pub sandbox_id: SandboxId,
    pub attempted: usize,
    pub unattempted: Vec<TaskId>,
    pub stopped: Option<StopReason>,
}

impl ExecutionContext {
    fn stop_reason(&self) -> Option<StopReason> {
        if self.budget.is_exceeded() {
            self.announce_budget_exceeded();
            return Some(StopReason::BudgetExceeded);
        }
        self.stop.triggered()
    }

    fn announce_budget_exceeded(&self) {
        if self.budget.claim_exceeded_notice() {
            warn!(
                current_cost = self.budget.spent(),
                budget_limit = self.budget.ceiling(),
                "budget exceeded, halting new task dispatch"
            );
            self.emitter.emit(
                EventKind::BudgetExceeded,
                json!({
                    "currentCost": self.budget.spent(),
                    "budgetLimit": self.budget.ceiling(),
                }),
            );
        }
    }

    /// Run one task to completion. Client errors and panics become a failed
    /// result; nothing escapes.
    async fn execute(&self, sandbox: &Sandbox, task: &Task) -> TaskResult {
        let client = self.client.clone();
        let contract = self.intent_contract.clone();
        let owned_sandbox = sandbox.clone();
        let owned_task = task.clone();

        let outcome = tokio::spawn(async move {
            client
                .execute_task(&owned_sandbox, &owned_task, &contract)
                .await
        })
        .await;

        let failed = |error: String| TaskResult {
            task_id: task.id.clone(),
            sandbox_id: sandbox.id.clone(),
            success: false,
            cost: 0.0,
            verification_score: None,
            error: Some(error),
        };

        match outcome {
            Ok(Ok(execution)) => TaskResult {
                task_id: task.id.clone(),
                sandbox_id: sandbox.id.clone(),
                success: execution.success,
                cost: if execution.cost.is_finite() && execution.cost > 0.0 {
                    execution.cost
                } else {
                    0.0
                },
                verification_score: execution.verification_score,
                error: if execution.success {
                    None
                } else {
                    Some(execution.error.unwrap_or_else(|| "Unknown error".to_string()))
                },
            },
            Ok(Err(e)) => failed(format!("{e:#}")),
            Err(join) => failed(format!("task execution aborted: {join}")),
        }
    }
}

/// Run a sandbox's assigned tasks strictly in order.
///
/// Stops at the next task boundary once the budget, the deadline or the
/// cancellation token says so; the tasks left over are reported unattempted.
pub async fn run_worker(ctx: ExecutionContext, sandbox: Sandbox, tasks: Vec<Task>) -> WorkerSummary {
    let mut attempted = 0;
    let mut queue = tasks.into_iter();

    while let Some(task) = queue.next() {
        if let Some(reason) = ctx.stop_reason() {
            let skipped: Vec<TaskId> = std::iter::once(task.id)
                .chain(queue.by_ref().map(|t| t.id))
                .collect();
            info!(
                sandbox_id = %sandbox.id,
                reason = ?reason,
                skipped = skipped.len(),
                "worker stopped dispatching"
            );
            ctx.ledger.mark_unattempted(skipped.clone()).await;

            return WorkerSummary {
                sandbox_id: sandbox.id,
                attempted,
                unattempted: skipped,
                stopped: Some(reason),
            };
        }

        ctx.emitter.emit(
            EventKind::TaskStarted,
            json!({
                "sandboxId": sandbox.id,
                "taskId": task.id,
                "taskName": task.name,
            }),
        );
        debug!(sandbox_id = %sandbox.id, task_id = %task.id, "task started");

        let result = ctx.execute(&sandbox, &task).await;
        attempted += 1;
        ctx.budget.record_spend(result.cost);

        if result.success {
            ctx.emitter.emit(
                EventKind::TaskCompleted,
                json!({
                    "sandboxId": sandbox.id,
                    "taskId": task.id,
                    "verificationScore": result.verification_score.unwrap_or(0.0),
                    "cost": result.cost,
                }),
            );
            info!(sandbox_id = %sandbox.id, task_id = %task.id, cost = result.cost, "task completed");
        } else {
            let error = result.error.clone().unwrap_or_default();
            warn!(sandbox_id = %sandbox.id, task_id = %task.id, error = %error, "task failed");
            ctx.emitter.emit(
                EventKind::TaskFailed,
                json!({
                    "sandboxId": sandbox.id,
                    "taskId": task.id,
                    "error": error,
                }),
            );
        }
        ctx.ledger.record(result).await;

        if ctx.budget.is_exceeded() {
            ctx.announce_budget_exceeded();
        }
    }

    WorkerSummary {
        sandbox_id: sandbox.id,
        attempted,
        unattempted: Vec::new(),
        stopped: None,
    }
}
