//! Build orchestration.
//!
//! The `Orchestrator` drives one build from request to terminal result:
//! partition the plan, bring up the main and build sandboxes, fan tasks out
//! to one execution loop per build sandbox, merge what succeeded into the
//! main sandbox and ask the verifier whether the intent was met.
//!
//! Build sandboxes are always torn down before `run` returns, and the
//! terminal webhook event is always queued and drained, whether the build
//! completed or failed.

mod state;

#[cfg(test)]
mod integration_tests;

pub use state::{BuildState, BuildStateMachine, TransitionError};

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use chrono::SecondsFormat;
use futures::FutureExt;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::budget::BudgetTracker;
use crate::config::{DEFAULT_WEBHOOK_TIMEOUT_SECS, EngineConfig};
use crate::core::{AssignmentStrategy, ExecutionContext, RoundRobin, StopSignal, TaskLedger, partition, run_worker};
use crate::db::BuildStore;
use crate::merge::{MergeProcessor, MergeRecord};
use crate::model::{BuildFailure, BuildJob, BuildReport, BuildResult, Task, format_duration};
use crate::progress::{EventKind, EventSink, ProgressEmitter, WebhookSink};
use crate::sandbox::{HttpSandboxClient, Sandbox, SandboxClient, SandboxRegistry, SandboxRequest, SandboxRole};
use crate::types::{SandboxId, TaskId};
use crate::verify::{HttpIntentVerifier, IntentVerifier, StaticVerifier, Verification};

/// Runs builds against a sandbox substrate. Holds no per-build state, so a
/// single instance can run many builds concurrently.
pub struct Orchestrator {
    sandboxes: Arc<dyn SandboxClient>,
    verifier: Arc<dyn IntentVerifier>,
    sink: Arc<dyn EventSink>,
    assigner: Arc<dyn AssignmentStrategy>,
    store: Option<BuildStore>,
    webhook_timeout: Duration,
}

/// Everything that belongs to a single in-flight build.
struct BuildRun<'a> {
    job: &'a BuildJob,
    machine: BuildStateMachine,
    emitter: ProgressEmitter,
    registry: SandboxRegistry,
    budget: Arc<BudgetTracker>,
    ledger: Arc<TaskLedger>,
    started: Instant,
    started_at: String,
    cancel: CancellationToken,
}

/// What a build that made it through verification produced.
struct Verified {
    main: Sandbox,
    merges: Vec<MergeRecord>,
    verification: Verification,
}

impl Orchestrator {
    pub fn new(
        sandboxes: Arc<dyn SandboxClient>,
        verifier: Arc<dyn IntentVerifier>,
        sink: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            sandboxes,
            verifier,
            sink,
            assigner: Arc::new(RoundRobin),
            store: None,
            webhook_timeout: Duration::from_secs(DEFAULT_WEBHOOK_TIMEOUT_SECS),
        }
    }

    /// Wire the orchestrator to the HTTP sandbox bridge, verifier and webhook
    /// client described by `engine`.
    pub fn from_config(engine: &EngineConfig) -> Result<Self> {
        let bridge = engine.sandbox_bridge_url.as_deref().context(
            "no sandbox bridge configured (set BUILDFLEET_SANDBOX_BRIDGE_URL or --sandbox-bridge-url)",
        )?;
        let sandboxes = Arc::new(HttpSandboxClient::new(bridge, engine.sandbox_timeout)?);

        let verifier: Arc<dyn IntentVerifier> = match engine.verifier_url.as_deref() {
            Some(url) => Arc::new(HttpIntentVerifier::new(url, engine.sandbox_timeout)?),
            None => {
                info!("No verifier configured, builds are accepted once merged");
                Arc::new(StaticVerifier::accepting())
            }
        };

        let sink = Arc::new(WebhookSink::new(engine.webhook_timeout)?);

        Ok(Self::new(sandboxes, verifier, sink).with_webhook_timeout(engine.webhook_timeout))
    }

    pub fn with_store(mut self, store: BuildStore) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_assigner(mut self, assigner: Arc<dyn AssignmentStrategy>) -> Self {
        self.assigner = assigner;
        self
    }

    pub fn with_webhook_timeout(mut self, timeout: Duration) -> Self {
        self.webhook_timeout = timeout;
        self
    }

    /// Run one build to its terminal result.
    pub async fn run(&self, job: BuildJob) -> BuildResult {
        self.run_with_cancel(job, CancellationToken::new()).await
    }

    /// Like [`Orchestrator::run`], but `cancel` stops task dispatch at the
    /// next task boundary. Teardown and the terminal event still happen.
    pub async fn run_with_cancel(&self, job: BuildJob, cancel: CancellationToken) -> BuildResult {
        self.register(&job).await;
        self.run_registered(job, cancel).await
    }

    /// Run a build whose row was already written by [`Orchestrator::register`].
    pub async fn run_registered(&self, job: BuildJob, cancel: CancellationToken) -> BuildResult {
        let (emitter, delivery) = ProgressEmitter::spawn(
            job.build_id.clone(),
            job.webhook_url.clone(),
            self.sink.clone(),
            self.webhook_timeout,
        );

        let mut run = BuildRun {
            job: &job,
            machine: BuildStateMachine::new(job.build_id.clone()),
            emitter,
            registry: SandboxRegistry::new(),
            budget: Arc::new(BudgetTracker::new(job.config.budget_limit_usd)),
            ledger: Arc::new(TaskLedger::new()),
            started: Instant::now(),
            started_at: chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            cancel,
        };

        // A panicking collaborator fails the build instead of skipping teardown.
        let outcome = match AssertUnwindSafe(self.drive(&mut run)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(payload) => Err(anyhow!("build aborted by a panic: {}", panic_message(payload.as_ref()))),
        };
        let terminated = self.teardown(&mut run.registry).await;
        debug!(build_id = %job.build_id, terminated, "build sandboxes torn down");

        self.persist_task_results(&run).await;
        let result = self.conclude(&mut run, outcome).await;

        let (event, state) = if result.is_finished() {
            (EventKind::Completed, BuildState::Completed)
        } else {
            (EventKind::Failed, BuildState::Failed)
        };
        run.emitter.emit(event, result.to_json());
        self.persist_outcome(&run, state, &result).await;

        // The delivery task finishes once the last emitter handle is gone.
        drop(run);
        let stats = delivery.drain().await;
        debug!(
            build_id = %job.build_id,
            delivered = stats.delivered,
            failed = stats.failed,
            "progress events drained"
        );

        result
    }

    /// Record a build before it starts, so it is visible to status queries.
    pub async fn register(&self, job: &BuildJob) {
        if let Some(store) = &self.store {
            let config = serde_json::to_value(&job.config).unwrap_or_default();
            if let Err(e) = store
                .record_build(
                    &job.build_id,
                    BuildState::Created.as_str(),
                    config,
                    &job.credentials.fingerprint(),
                )
                .await
            {
                warn!(build_id = %job.build_id, error = %e, "Failed to persist build record");
            }
        }
    }

    async fn drive(&self, run: &mut BuildRun<'_>) -> Result<Verified> {
        let job = run.job;

        self.transition(run, BuildState::Started).await?;
        info!(
            build_id = %job.build_id,
            max_parallel_sandboxes = job.config.max_parallel_sandboxes,
            budget_limit_usd = job.config.budget_limit_usd,
            "Build started"
        );
        run.emitter.emit(
            EventKind::Started,
            json!({
                "buildId": job.build_id,
                "startedAt": run.started_at,
                "config": job.config,
                "credentialsFingerprint": job.credentials.fingerprint(),
            }),
        );

        let tasks = partition(&job.implementation_plan).context("invalid implementation plan")?;
        self.transition(run, BuildState::TasksPartitioned).await?;
        info!(
            build_id = %job.build_id,
            task_count = tasks.len(),
            strategy = %job.config.task_partition_strategy,
            "Tasks partitioned"
        );
        run.emitter.emit(
            EventKind::TasksPartitioned,
            json!({
                "taskCount": tasks.len(),
                "strategy": job.config.task_partition_strategy,
            }),
        );

        let main = self.create_main_sandbox(run).await?;
        let workers = self.create_build_sandboxes(run, tasks.len()).await?;
        self.transition(run, BuildState::SandboxesReady).await?;

        let assignments = self.assigner.assign(&tasks, &workers);
        check_assignments(self.assigner.name(), &tasks, &workers, &assignments)?;
        self.transition(run, BuildState::TasksAssigned).await?;
        run.emitter.emit(
            EventKind::TasksAssigned,
            json!({
                "strategy": self.assigner.name(),
                "assignments": assignment_summary(&workers, &assignments),
            }),
        );

        self.transition(run, BuildState::Executing).await?;
        self.execute(run, workers, assignments).await?;

        self.transition(run, BuildState::Merging).await?;
        let results = run.ledger.results().await;
        let merges = MergeProcessor::new(self.sandboxes.clone())
            .process(&main, &results)
            .await;

        self.transition(run, BuildState::Verifying).await?;
        let verification = self
            .verifier
            .verify(&main, &job.intent_contract)
            .await
            .context("intent verification failed")?;
        info!(
            build_id = %job.build_id,
            satisfied = verification.satisfied,
            score = verification.score,
            "Intent verified"
        );

        self.transition(run, BuildState::Completed).await?;

        Ok(Verified {
            main,
            merges,
            verification,
        })
    }

    async fn transition(&self, run: &mut BuildRun<'_>, next: BuildState) -> Result<()> {
        run.machine.advance(next)?;
        debug!(build_id = %run.job.build_id, state = next.as_str(), "state transition");

        // terminal states are written together with the outcome
        if next.is_terminal() {
            return Ok(());
        }
        if let Some(store) = &self.store {
            if let Err(e) = store.record_state(&run.job.build_id, next.as_str()).await {
                warn!(build_id = %run.job.build_id, error = %e, "Failed to persist build state");
            }
        }
        Ok(())
    }

    async fn create_main_sandbox(&self, run: &mut BuildRun<'_>) -> Result<Sandbox> {
        let job = run.job;
        let id = SandboxId::main_for(&job.build_id);
        run.registry.begin(id.clone(), SandboxRole::Main);

        let mut main = self
            .sandboxes
            .create(SandboxRequest {
                id: &id,
                role: SandboxRole::Main,
                intent_contract: job.intent_contract.as_ref(),
                credentials: &job.credentials,
            })
            .await
            .with_context(|| format!("failed to create main sandbox {}", id))?;

        if main.tunnel_url.is_none() {
            match self.sandboxes.ingress_url(&main.id).await {
                Ok(url) => main.tunnel_url = url,
                Err(e) => warn!(sandbox_id = %main.id, error = %format!("{e:#}"), "Could not resolve main sandbox ingress URL"),
            }
        }

        run.registry.mark_running(&main);
        info!(build_id = %job.build_id, sandbox_id = %main.id, tunnel_url = ?main.tunnel_url, "Main sandbox created");
        run.emitter.emit(
            EventKind::SandboxCreated,
            json!({
                "sandboxId": main.id,
                "type": "main",
                "tunnelUrl": main.tunnel_url,
            }),
        );

        Ok(main)
    }

    /// Start up to `maxParallelSandboxes` build sandboxes. Individual failures
    /// only shrink the pool; an empty pool with work to do is fatal.
    async fn create_build_sandboxes(&self, run: &mut BuildRun<'_>, task_count: usize) -> Result<Vec<Sandbox>> {
        let job = run.job;
        let wanted = job.config.build_sandbox_count(task_count);
        let mut ready = Vec::with_capacity(wanted);

        for index in 0..wanted {
            let id = SandboxId::build_for(&job.build_id, index);
            run.registry.begin(id.clone(), SandboxRole::Build);

            let created = self
                .sandboxes
                .create(SandboxRequest {
                    id: &id,
                    role: SandboxRole::Build,
                    intent_contract: job.intent_contract.as_ref(),
                    credentials: &job.credentials,
                })
                .await;

            match created {
                Ok(sandbox) => {
                    run.registry.mark_running(&sandbox);
                    debug!(build_id = %job.build_id, sandbox_id = %sandbox.id, index, "Build sandbox created");
                    run.emitter.emit(
                        EventKind::SandboxCreated,
                        json!({
                            "sandboxId": sandbox.id,
                            "type": "build",
                            "index": index,
                        }),
                    );
                    ready.push(sandbox);
                }
                Err(e) => {
                    warn!(
                        build_id = %job.build_id,
                        sandbox_id = %id,
                        error = %format!("{e:#}"),
                        "Build sandbox creation failed, continuing with fewer workers"
                    );
                }
            }
        }

        if wanted > 0 && ready.is_empty() {
            bail!("none of the {} build sandboxes could be created", wanted);
        }

        info!(
            build_id = %job.build_id,
            requested = wanted,
            ready = run.registry.live_build_count(),
            "Build sandboxes ready"
        );
        Ok(ready)
    }

    /// One execution loop per build sandbox, all awaited before returning.
    async fn execute(&self, run: &BuildRun<'_>, workers: Vec<Sandbox>, assignments: Vec<Vec<Task>>) -> Result<()> {
        let job = run.job;
        let ctx = ExecutionContext {
            client: self.sandboxes.clone(),
            budget: run.budget.clone(),
            ledger: run.ledger.clone(),
            emitter: run.emitter.clone(),
            intent_contract: job.intent_contract.clone(),
            stop: StopSignal::new(
                run.started.checked_add(job.config.max_duration()),
                run.cancel.clone(),
            ),
        };

        let handles: Vec<_> = workers
            .into_iter()
            .zip(assignments)
            .map(|(sandbox, tasks)| {
                let id = sandbox.id.clone();
                (id, tokio::spawn(run_worker(ctx.clone(), sandbox, tasks)))
            })
            .collect();
        drop(ctx);

        let mut aborted = None;
        for (sandbox_id, handle) in handles {
            match handle.await {
                Ok(summary) => debug!(
                    sandbox_id = %summary.sandbox_id,
                    attempted = summary.attempted,
                    unattempted = summary.unattempted.len(),
                    stopped = ?summary.stopped,
                    "execution loop finished"
                ),
                Err(e) => {
                    error!(sandbox_id = %sandbox_id, error = %e, "Execution loop aborted");
                    if aborted.is_none() {
                        aborted = Some(anyhow!("execution loop for {} aborted: {}", sandbox_id, e));
                    }
                }
            }
        }

        if let Some(err) = aborted {
            return Err(err);
        }

        let counts = run.ledger.counts().await;
        info!(
            build_id = %job.build_id,
            completed = counts.completed,
            failed = counts.failed,
            unattempted = counts.unattempted,
            cost_usd = run.budget.spent(),
            "Task execution finished"
        );
        Ok(())
    }

    /// Terminate every build sandbox that is not yet known to be gone.
    /// Safe to call repeatedly; the main sandbox is left running.
    async fn teardown(&self, registry: &mut SandboxRegistry) -> usize {
        let mut terminated = 0;
        for id in registry.pending_teardown() {
            match self.sandboxes.terminate(&id).await {
                Ok(()) => {
                    if registry.mark_terminated(&id) {
                        terminated += 1;
                    }
                }
                Err(e) => warn!(sandbox_id = %id, error = %format!("{e:#}"), "Failed to terminate build sandbox"),
            }
        }
        terminated
    }

    async fn conclude(&self, run: &mut BuildRun<'_>, outcome: Result<Verified>) -> BuildResult {
        let job = run.job;
        let counts = run.ledger.counts().await;
        let duration = run.started.elapsed().as_secs_f64();

        match outcome {
            Ok(verified) => {
                let merged = verified.merges.iter().filter(|m| m.merged).count();
                let report = BuildReport {
                    success: verified.verification.satisfied,
                    build_id: job.build_id.clone(),
                    main_sandbox_url: verified.main.tunnel_url,
                    duration,
                    duration_formatted: format_duration(duration),
                    cost_usd: run.budget.spent(),
                    tasks_completed: counts.completed,
                    tasks_failed: counts.failed,
                    tasks_unattempted: counts.unattempted,
                    verification_score: verified.verification.score,
                    completed_at: chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
                };
                info!(
                    build_id = %job.build_id,
                    success = report.success,
                    merged,
                    cost_usd = report.cost_usd,
                    duration = %report.duration_formatted,
                    "Build completed"
                );
                BuildResult::Finished(report)
            }
            Err(err) => {
                run.machine.fail();
                error!(build_id = %job.build_id, error = %format!("{err:#}"), "Build failed");
                BuildResult::Failed(BuildFailure {
                    success: false,
                    build_id: job.build_id.clone(),
                    error: format!("{err:#}"),
                    traceback: format!("{err:?}"),
                    duration,
                    tasks_completed: counts.completed,
                    tasks_failed: counts.failed,
                    tasks_unattempted: counts.unattempted,
                })
            }
        }
    }

    async fn persist_task_results(&self, run: &BuildRun<'_>) {
        let Some(store) = &self.store else {
            return;
        };
        let build_id = &run.job.build_id;

        for result in run.ledger.results().await {
            if let Err(e) = store.record_task_result(build_id, &result).await {
                warn!(build_id = %build_id, task_id = %result.task_id, error = %e, "Failed to persist task result");
            }
        }
        for task_id in run.ledger.unattempted().await {
            if let Err(e) = store.record_unattempted(build_id, &task_id).await {
                warn!(build_id = %build_id, task_id = %task_id, error = %e, "Failed to persist task result");
            }
        }
    }

    async fn persist_outcome(&self, run: &BuildRun<'_>, state: BuildState, result: &BuildResult) {
        if let Some(store) = &self.store {
            if let Err(e) = store
                .record_outcome(&run.job.build_id, state.as_str(), result.to_json())
                .await
            {
                warn!(build_id = %run.job.build_id, error = %e, "Failed to persist build outcome");
            }
        }
    }
}

/// Every task must land on exactly one of the live build sandboxes.
fn check_assignments(strategy: &str, tasks: &[Task], workers: &[Sandbox], assignments: &[Vec<Task>]) -> Result<()> {
    if assignments.len() != workers.len() {
        bail!(
            "assignment strategy `{}` returned {} task lists for {} build sandboxes",
            strategy,
            assignments.len(),
            workers.len()
        );
    }

    let mut expected: Vec<&TaskId> = tasks.iter().map(|t| &t.id).collect();
    let mut assigned: Vec<&TaskId> = assignments.iter().flatten().map(|t| &t.id).collect();
    expected.sort();
    assigned.sort();
    if expected != assigned {
        bail!(
            "assignment strategy `{}` assigned {} tasks, expected each of the {} partitioned tasks exactly once",
            strategy,
            assigned.len(),
            expected.len()
        );
    }
    Ok(())
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn assignment_summary(workers: &[Sandbox], assignments: &[Vec<Task>]) -> Value {
    workers
        .iter()
        .zip(assignments)
        .map(|(sandbox, tasks)| {
            json!({
                "sandboxId": sandbox.id,
                "taskIds": tasks.iter().map(|t| &t.id).collect::<Vec<_>>(),
            })
        })
        .collect()
}
