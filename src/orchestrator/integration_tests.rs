#![cfg(test)]

//! End-to-end runs of the orchestrator against scripted sandboxes.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use url::Url;

use super::*;
use crate::config::{Credentials, OrchestrationConfig};
use crate::db::{DatabaseConfig, create_connection, ensure_schema};
use crate::model::TaskResult;
use crate::progress::ProgressEvent;
use crate::sandbox::TaskExecution;
use crate::types::{BuildId, TaskId};

#[derive(Default)]
struct Script {
    fail_main: bool,
    failing_sandboxes: HashSet<String>,
    failing_tasks: HashSet<String>,
    task_costs: HashMap<String, f64>,
}

#[derive(Default, Clone)]
struct Calls {
    create_attempts: Vec<SandboxId>,
    executed: Vec<(SandboxId, TaskId)>,
    merged: Vec<TaskId>,
    terminated: Vec<SandboxId>,
}

#[derive(Default)]
struct ScriptedSandboxes {
    script: Script,
    calls: Mutex<Calls>,
}

impl ScriptedSandboxes {
    fn with(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            calls: Mutex::new(Calls::default()),
        })
    }

    fn calls(&self) -> Calls {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl SandboxClient for ScriptedSandboxes {
    async fn create(&self, request: SandboxRequest<'_>) -> Result<Sandbox> {
        self.calls.lock().unwrap().create_attempts.push(request.id.clone());

        let fails = match request.role {
            SandboxRole::Main => self.script.fail_main,
            SandboxRole::Build => self.script.failing_sandboxes.contains(request.id.as_str()),
        };
        if fails {
            bail!("substrate refused to start {}", request.id);
        }
        Ok(Sandbox::running(request.id.clone(), request.role, None))
    }

    async fn execute_task(&self, sandbox: &Sandbox, task: &Task, _contract: &Value) -> Result<TaskExecution> {
        self.calls
            .lock()
            .unwrap()
            .executed
            .push((sandbox.id.clone(), task.id.clone()));
        tokio::time::sleep(Duration::from_millis(5)).await;

        let id = task.id.as_str();
        let cost = self.script.task_costs.get(id).copied().unwrap_or(1.0);
        if self.script.failing_tasks.contains(id) {
            return Ok(TaskExecution {
                success: false,
                cost,
                verification_score: None,
                error: Some(format!("{} did not pass its checks", id)),
            });
        }
        Ok(TaskExecution {
            success: true,
            cost,
            verification_score: Some(90.0),
            error: None,
        })
    }

    async fn ingress_url(&self, id: &SandboxId) -> Result<Option<String>> {
        Ok(Some(format!("https://{}.sandbox.test", id)))
    }

    async fn merge(&self, _main: &Sandbox, result: &TaskResult) -> Result<()> {
        self.calls.lock().unwrap().merged.push(result.task_id.clone());
        Ok(())
    }

    async fn terminate(&self, id: &SandboxId) -> Result<()> {
        self.calls.lock().unwrap().terminated.push(id.clone());
        Ok(())
    }
}

#[derive(Default)]
struct RecordingSink {
    events: Mutex<Vec<ProgressEvent>>,
}

impl RecordingSink {
    fn kinds(&self) -> Vec<&'static str> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .map(|e| e.event.as_str())
            .collect()
    }

    fn count(&self, kind: EventKind) -> usize {
        self.events.lock().unwrap().iter().filter(|e| e.event == kind).count()
    }

    fn events(&self) -> Vec<ProgressEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn deliver(&self, _target: Option<&Url>, event: &ProgressEvent) -> Result<()> {
        self.events.lock().unwrap().push(event.clone());
        Ok(())
    }
}

struct BrokenVerifier;

#[async_trait]
impl IntentVerifier for BrokenVerifier {
    async fn verify(&self, _main: &Sandbox, _contract: &Value) -> Result<Verification> {
        bail!("verification service unavailable")
    }
}

fn phases(n: usize) -> Value {
    let list: Vec<Value> = (0..n)
        .map(|i| json!({"id": format!("p{}", i), "name": format!("Phase {}", i)}))
        .collect();
    json!({ "phases": list })
}

fn config(max_parallel: usize, budget: f64) -> OrchestrationConfig {
    OrchestrationConfig {
        max_parallel_sandboxes: max_parallel,
        budget_limit_usd: budget,
        ..OrchestrationConfig::default()
    }
}

fn job(id: &str, plan: Value, config: OrchestrationConfig) -> BuildJob {
    BuildJob {
        build_id: BuildId::new(id),
        intent_contract: Arc::new(json!({"goal": "todo app"})),
        implementation_plan: plan,
        credentials: Credentials::default(),
        webhook_url: None,
        config,
    }
}

fn orchestrator(
    sandboxes: Arc<ScriptedSandboxes>,
    sink: Arc<RecordingSink>,
    verifier: impl IntentVerifier + 'static,
) -> Orchestrator {
    Orchestrator::new(sandboxes, Arc::new(verifier), sink)
}

fn ids(list: &[SandboxId]) -> Vec<&str> {
    list.iter().map(|s| s.as_str()).collect()
}

#[tokio::test]
async fn test_two_phases_complete_and_tear_down() {
    let sandboxes = ScriptedSandboxes::with(Script::default());
    let sink = Arc::new(RecordingSink::default());
    let orch = orchestrator(sandboxes.clone(), sink.clone(), StaticVerifier::accepting());

    let result = orch.run(job("b-a", phases(2), config(5, 100.0))).await;

    let BuildResult::Finished(report) = &result else {
        panic!("expected a finished build, got {:?}", result);
    };
    assert!(report.success);
    assert_eq!(report.tasks_completed, 2);
    assert_eq!(report.tasks_failed, 0);
    assert_eq!(report.tasks_unattempted, 0);
    assert_eq!(report.cost_usd, 2.0);
    assert_eq!(report.main_sandbox_url.as_deref(), Some("https://b-a-main.sandbox.test"));

    let kinds = sink.kinds();
    assert_eq!(
        &kinds[..6],
        &["started", "tasksPartitioned", "sandboxCreated", "sandboxCreated", "sandboxCreated", "tasksAssigned"]
    );
    assert_eq!(kinds.last(), Some(&"completed"));
    assert_eq!(sink.count(EventKind::TaskStarted), 2);
    assert_eq!(sink.count(EventKind::TaskCompleted), 2);
    assert_eq!(sink.count(EventKind::Completed), 1);
    assert_eq!(sink.count(EventKind::Failed), 0);

    let events = sink.events();
    assert_eq!(events[2].data["type"], "main");
    assert_eq!(events[3].data["type"], "build");
    assert_eq!(events[3].data["index"], 0);
    assert_eq!(events[5].data["assignments"][1]["taskIds"], json!(["p1"]));

    let calls = sandboxes.calls();
    assert_eq!(ids(&calls.terminated), vec!["b-a-build-0", "b-a-build-1"]);
    assert_eq!(calls.merged.len(), 2);
}

#[tokio::test]
async fn test_budget_stops_dispatch_once() {
    let sandboxes = ScriptedSandboxes::with(Script::default());
    let sink = Arc::new(RecordingSink::default());
    let orch = orchestrator(sandboxes.clone(), sink.clone(), StaticVerifier::accepting());

    let result = orch.run(job("b-b", phases(3), config(1, 2.0))).await;

    assert!(result.is_finished());
    assert_eq!(result.tasks_completed(), 2);
    assert_eq!(result.tasks_failed(), 0);
    assert_eq!(result.tasks_unattempted(), 1);
    assert_eq!(sink.count(EventKind::BudgetExceeded), 1);
    assert_eq!(sink.count(EventKind::TaskStarted), 2);

    let calls = sandboxes.calls();
    let executed: Vec<&str> = calls.executed.iter().map(|(_, t)| t.as_str()).collect();
    assert_eq!(executed, vec!["p0", "p1"]);

    let kinds = sink.kinds();
    let exceeded = kinds.iter().position(|k| *k == "budgetExceeded").unwrap();
    assert!(exceeded < kinds.len() - 1);
}

#[tokio::test]
async fn test_main_sandbox_failure_fails_build() {
    let sandboxes = ScriptedSandboxes::with(Script {
        fail_main: true,
        ..Script::default()
    });
    let sink = Arc::new(RecordingSink::default());
    let orch = orchestrator(sandboxes.clone(), sink.clone(), StaticVerifier::accepting());

    let result = orch.run(job("b-c", phases(2), config(5, 100.0))).await;

    let BuildResult::Failed(failure) = &result else {
        panic!("expected a failed build, got {:?}", result);
    };
    assert!(!failure.success);
    assert!(failure.error.contains("main sandbox"));
    assert!(failure.traceback.contains("substrate refused"));
    assert_eq!(failure.tasks_completed, 0);

    assert_eq!(sink.kinds(), vec!["started", "tasksPartitioned", "failed"]);
    let calls = sandboxes.calls();
    assert_eq!(ids(&calls.create_attempts), vec!["b-c-main"]);
    assert!(calls.executed.is_empty());
    assert!(calls.terminated.is_empty());
}

#[tokio::test]
async fn test_unsatisfied_intent_is_not_a_success() {
    let sandboxes = ScriptedSandboxes::with(Script::default());
    let sink = Arc::new(RecordingSink::default());
    let orch = orchestrator(sandboxes, sink.clone(), StaticVerifier::new(false, 35.0));

    let result = orch.run(job("b-d", phases(2), config(2, 100.0))).await;

    let BuildResult::Finished(report) = &result else {
        panic!("expected a finished build, got {:?}", result);
    };
    assert!(!report.success);
    assert_eq!(report.tasks_failed, 0);
    assert_eq!(report.verification_score, 35.0);
    assert_eq!(sink.count(EventKind::Completed), 1);

    let terminal = sink.events().pop().unwrap();
    assert_eq!(terminal.data["success"], false);
    assert_eq!(terminal.data["verificationScore"], 35.0);
}

#[tokio::test]
async fn test_failed_tasks_are_counted_and_not_merged() {
    let sandboxes = ScriptedSandboxes::with(Script {
        failing_tasks: HashSet::from(["p1".to_string()]),
        ..Script::default()
    });
    let sink = Arc::new(RecordingSink::default());
    let orch = orchestrator(sandboxes.clone(), sink.clone(), StaticVerifier::accepting());

    let result = orch.run(job("b-e", phases(3), config(3, 100.0))).await;

    assert_eq!(result.tasks_completed(), 2);
    assert_eq!(result.tasks_failed(), 1);
    assert_eq!(sink.count(EventKind::TaskFailed), 1);

    let merged = sandboxes.calls().merged;
    assert_eq!(merged.len(), 2);
    assert!(!merged.contains(&TaskId::new("p1")));
}

#[tokio::test]
async fn test_build_sandbox_failure_shrinks_pool() {
    let sandboxes = ScriptedSandboxes::with(Script {
        failing_sandboxes: HashSet::from(["b-f-build-1".to_string()]),
        ..Script::default()
    });
    let sink = Arc::new(RecordingSink::default());
    let orch = orchestrator(sandboxes.clone(), sink.clone(), StaticVerifier::accepting());

    let result = orch.run(job("b-f", phases(4), config(2, 100.0))).await;

    assert!(result.success());
    assert_eq!(result.tasks_completed(), 4);
    assert_eq!(sink.count(EventKind::SandboxCreated), 2);

    let calls = sandboxes.calls();
    assert!(calls.executed.iter().all(|(s, _)| s.as_str() == "b-f-build-0"));
    let order: Vec<&str> = calls.executed.iter().map(|(_, t)| t.as_str()).collect();
    assert_eq!(order, vec!["p0", "p1", "p2", "p3"]);
    // the half-created sandbox is cleaned up too
    assert_eq!(ids(&calls.terminated), vec!["b-f-build-0", "b-f-build-1"]);
}

#[tokio::test]
async fn test_no_build_sandbox_fails_build_but_still_tears_down() {
    let sandboxes = ScriptedSandboxes::with(Script {
        failing_sandboxes: HashSet::from(["b-g-build-0".to_string()]),
        ..Script::default()
    });
    let sink = Arc::new(RecordingSink::default());
    let orch = orchestrator(sandboxes.clone(), sink.clone(), StaticVerifier::accepting());

    let result = orch.run(job("b-g", phases(3), config(1, 100.0))).await;

    let BuildResult::Failed(failure) = &result else {
        panic!("expected a failed build, got {:?}", result);
    };
    assert!(failure.error.contains("none of the 1 build sandboxes"));
    assert_eq!(sink.kinds().last(), Some(&"failed"));
    assert_eq!(ids(&sandboxes.calls().terminated), vec!["b-g-build-0"]);
}

#[tokio::test]
async fn test_empty_plan_is_a_trivial_build() {
    let sandboxes = ScriptedSandboxes::with(Script::default());
    let sink = Arc::new(RecordingSink::default());
    let orch = orchestrator(sandboxes.clone(), sink.clone(), StaticVerifier::accepting());

    let result = orch.run(job("b-h", json!({}), config(5, 100.0))).await;

    let BuildResult::Finished(report) = &result else {
        panic!("expected a finished build, got {:?}", result);
    };
    assert!(report.success);
    assert_eq!(report.cost_usd, 0.0);
    assert_eq!(report.tasks_completed, 0);
    assert_eq!(
        sink.kinds(),
        vec!["started", "tasksPartitioned", "sandboxCreated", "tasksAssigned", "completed"]
    );
    assert_eq!(ids(&sandboxes.calls().create_attempts), vec!["b-h-main"]);
}

#[tokio::test]
async fn test_malformed_plan_fails_before_any_sandbox() {
    let sandboxes = ScriptedSandboxes::with(Script::default());
    let sink = Arc::new(RecordingSink::default());
    let orch = orchestrator(sandboxes.clone(), sink.clone(), StaticVerifier::accepting());

    let result = orch.run(job("b-i", json!({"phases": "all of them"}), config(5, 100.0))).await;

    assert!(!result.success());
    assert!(!result.is_finished());
    assert_eq!(sink.kinds(), vec!["started", "failed"]);
    assert!(sandboxes.calls().create_attempts.is_empty());
}

#[tokio::test]
async fn test_deadline_leaves_tasks_unattempted() {
    let sandboxes = ScriptedSandboxes::with(Script::default());
    let sink = Arc::new(RecordingSink::default());
    let orch = orchestrator(sandboxes.clone(), sink.clone(), StaticVerifier::accepting());

    let mut cfg = config(2, 100.0);
    cfg.max_duration_secs = 0;
    let result = orch.run(job("b-j", phases(4), cfg)).await;

    assert!(result.is_finished());
    assert_eq!(result.tasks_completed(), 0);
    assert_eq!(result.tasks_failed(), 0);
    assert_eq!(result.tasks_unattempted(), 4);
    assert_eq!(sink.count(EventKind::TaskStarted), 0);

    let calls = sandboxes.calls();
    assert!(calls.executed.is_empty());
    assert_eq!(calls.terminated.len(), 2);
}

#[tokio::test]
async fn test_cancelled_build_stops_dispatch() {
    let sandboxes = ScriptedSandboxes::with(Script::default());
    let sink = Arc::new(RecordingSink::default());
    let orch = orchestrator(sandboxes.clone(), sink.clone(), StaticVerifier::accepting());

    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = orch
        .run_with_cancel(job("b-k", phases(3), config(1, 100.0)), cancel)
        .await;

    assert_eq!(result.tasks_unattempted(), 3);
    assert!(sandboxes.calls().executed.is_empty());
    assert_eq!(sink.kinds().last(), Some(&"completed"));
}

#[tokio::test]
async fn test_verifier_error_reports_partial_counts() {
    let sandboxes = ScriptedSandboxes::with(Script::default());
    let sink = Arc::new(RecordingSink::default());
    let orch = orchestrator(sandboxes.clone(), sink.clone(), BrokenVerifier);

    let result = orch.run(job("b-l", phases(2), config(2, 100.0))).await;

    let BuildResult::Failed(failure) = &result else {
        panic!("expected a failed build, got {:?}", result);
    };
    assert_eq!(failure.tasks_completed, 2);
    assert!(failure.error.contains("verification service unavailable"));
    assert_eq!(sink.count(EventKind::Failed), 1);
    assert_eq!(sink.count(EventKind::Completed), 0);
    assert_eq!(sandboxes.calls().terminated.len(), 2);
}

#[tokio::test]
async fn test_unreachable_webhook_does_not_block_build() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let sandboxes = ScriptedSandboxes::with(Script::default());
    let sink = Arc::new(WebhookSink::new(Duration::from_millis(500)).unwrap());
    let orch = Orchestrator::new(sandboxes.clone(), Arc::new(StaticVerifier::accepting()), sink)
        .with_webhook_timeout(Duration::from_millis(500));

    let mut build = job("b-m", phases(2), config(2, 100.0));
    build.webhook_url = Some(Url::parse(&format!("http://{}/hook", addr)).unwrap());

    let result = tokio::time::timeout(Duration::from_secs(30), orch.run(build))
        .await
        .expect("build should not hang on webhook delivery");

    assert!(result.success());
    assert_eq!(result.tasks_completed(), 2);
}

#[tokio::test]
async fn test_teardown_is_idempotent() {
    let sandboxes = ScriptedSandboxes::with(Script::default());
    let sink = Arc::new(RecordingSink::default());
    let orch = orchestrator(sandboxes.clone(), sink, StaticVerifier::accepting());

    let build_id = BuildId::new("b-n");
    let mut registry = SandboxRegistry::new();
    let main = SandboxId::main_for(&build_id);
    registry.begin(main.clone(), SandboxRole::Main);
    registry.mark_running(&Sandbox::running(main, SandboxRole::Main, None));
    for i in 0..2 {
        let id = SandboxId::build_for(&build_id, i);
        registry.begin(id.clone(), SandboxRole::Build);
        registry.mark_running(&Sandbox::running(id, SandboxRole::Build, None));
    }

    assert_eq!(orch.teardown(&mut registry).await, 2);
    assert_eq!(orch.teardown(&mut registry).await, 0);

    // main is never torn down and nothing is terminated twice
    assert_eq!(ids(&sandboxes.calls().terminated), vec!["b-n-build-0", "b-n-build-1"]);
}

#[tokio::test]
async fn test_build_and_task_rows_are_persisted() {
    let db = create_connection(DatabaseConfig::in_memory()).await.unwrap();
    ensure_schema(&db).await.unwrap();
    let store = BuildStore::new(db);

    let sandboxes = ScriptedSandboxes::with(Script::default());
    let sink = Arc::new(RecordingSink::default());
    let orch = orchestrator(sandboxes, sink, StaticVerifier::accepting()).with_store(store.clone());

    let build = job("b-o", phases(3), config(1, 2.0));
    let build_id = build.build_id.clone();
    orch.run(build).await;

    let row = store.get_build(&build_id).await.unwrap().unwrap();
    assert_eq!(row.state, "completed");
    let outcome = row.outcome.unwrap();
    assert_eq!(outcome["tasksCompleted"], 2);
    assert_eq!(outcome["tasksUnattempted"], 1);

    let tasks = store.list_task_results(&build_id).await.unwrap();
    assert_eq!(tasks.len(), 3);
    assert_eq!(tasks.iter().filter(|t| t.status == "completed").count(), 2);
    assert_eq!(tasks.iter().filter(|t| t.status == "unattempted").count(), 1);
}

#[tokio::test]
async fn test_failed_build_state_is_persisted() {
    let db = create_connection(DatabaseConfig::in_memory()).await.unwrap();
    ensure_schema(&db).await.unwrap();
    let store = BuildStore::new(db);

    let sandboxes = ScriptedSandboxes::with(Script {
        fail_main: true,
        ..Script::default()
    });
    let orch = orchestrator(sandboxes, Arc::new(RecordingSink::default()), StaticVerifier::accepting())
        .with_store(store.clone());

    orch.run(job("b-p", phases(1), config(1, 10.0))).await;

    let row = store.get_build(&BuildId::new("b-p")).await.unwrap().unwrap();
    assert_eq!(row.state, "failed");
    assert_eq!(row.outcome.unwrap()["success"], false);
}

struct FirstSandboxOnly;

impl AssignmentStrategy for FirstSandboxOnly {
    fn name(&self) -> &'static str {
        "first-only"
    }

    fn assign(&self, tasks: &[Task], sandboxes: &[Sandbox]) -> Vec<Vec<Task>> {
        let mut lists = vec![Vec::new(); sandboxes.len()];
        if let Some(first) = lists.first_mut() {
            first.extend(tasks.iter().cloned());
        }
        lists
    }
}

#[tokio::test]
async fn test_custom_assignment_strategy() {
    let sandboxes = ScriptedSandboxes::with(Script::default());
    let sink = Arc::new(RecordingSink::default());
    let orch = orchestrator(sandboxes.clone(), sink.clone(), StaticVerifier::accepting())
        .with_assigner(Arc::new(FirstSandboxOnly));

    let result = orch.run(job("b-q", phases(3), config(3, 100.0))).await;

    assert_eq!(result.tasks_completed(), 3);
    let calls = sandboxes.calls();
    assert!(calls.executed.iter().all(|(s, _)| s.as_str() == "b-q-build-0"));

    let assigned = sink
        .events()
        .into_iter()
        .find(|e| e.event == EventKind::TasksAssigned)
        .unwrap();
    assert_eq!(assigned.data["strategy"], "first-only");
    assert_eq!(assigned.data["assignments"][2]["taskIds"], json!([]));
}

struct PanickingVerifier;

#[async_trait]
impl IntentVerifier for PanickingVerifier {
    async fn verify(&self, _main: &Sandbox, _contract: &Value) -> Result<Verification> {
        panic!("verifier crashed")
    }
}

#[tokio::test]
async fn test_panicking_verifier_still_tears_down() {
    let sandboxes = ScriptedSandboxes::with(Script::default());
    let sink = Arc::new(RecordingSink::default());
    let orch = orchestrator(sandboxes.clone(), sink.clone(), PanickingVerifier);

    let result = orch.run(job("b-p", phases(2), config(2, 100.0))).await;

    let BuildResult::Failed(failure) = &result else {
        panic!("expected a failed build, got {:?}", result);
    };
    assert!(failure.error.contains("verifier crashed"));
    assert_eq!(failure.tasks_completed, 2);

    let calls = sandboxes.calls();
    assert_eq!(ids(&calls.terminated), vec!["b-p-build-0", "b-p-build-1"]);
    assert_eq!(sink.count(EventKind::Failed), 1);
    assert_eq!(sink.count(EventKind::Completed), 0);
    assert_eq!(sink.kinds().last(), Some(&"failed"));
}

/// Forgets the last build sandbox and everything assigned to it.
struct DropsLastSandbox;

impl AssignmentStrategy for DropsLastSandbox {
    fn name(&self) -> &'static str {
        "drops-last"
    }

    fn assign(&self, tasks: &[Task], sandboxes: &[Sandbox]) -> Vec<Vec<Task>> {
        let mut lists = RoundRobin.assign(tasks, sandboxes);
        lists.pop();
        lists
    }
}

/// Hands the first task to every sandbox.
struct DuplicatesFirstTask;

impl AssignmentStrategy for DuplicatesFirstTask {
    fn name(&self) -> &'static str {
        "duplicates-first"
    }

    fn assign(&self, tasks: &[Task], sandboxes: &[Sandbox]) -> Vec<Vec<Task>> {
        sandboxes.iter().map(|_| tasks[..1].to_vec()).collect()
    }
}

#[tokio::test]
async fn test_assignment_that_loses_tasks_fails_the_build() {
    for (strategy, build) in [
        (Arc::new(DropsLastSandbox) as Arc<dyn AssignmentStrategy>, "b-l"),
        (Arc::new(DuplicatesFirstTask), "b-m"),
    ] {
        let sandboxes = ScriptedSandboxes::with(Script::default());
        let sink = Arc::new(RecordingSink::default());
        let orch = orchestrator(sandboxes.clone(), sink.clone(), StaticVerifier::accepting()).with_assigner(strategy);

        let result = orch.run(job(build, phases(2), config(2, 100.0))).await;

        let BuildResult::Failed(failure) = &result else {
            panic!("expected a failed build, got {:?}", result);
        };
        assert!(failure.error.contains("assignment strategy"), "{}", failure.error);

        let calls = sandboxes.calls();
        assert!(calls.executed.is_empty());
        assert_eq!(calls.terminated.len(), 2);
        assert_eq!(sink.count(EventKind::TasksAssigned), 0);
        assert_eq!(sink.count(EventKind::Failed), 1);
    }
}

#[tokio::test]
async fn test_registered_build_keeps_its_start_time() {
    let db = create_connection(DatabaseConfig::in_memory()).await.unwrap();
    ensure_schema(&db).await.unwrap();
    let store = BuildStore::new(db);

    let sandboxes = ScriptedSandboxes::with(Script::default());
    let sink = Arc::new(RecordingSink::default());
    let orch = orchestrator(sandboxes, sink, StaticVerifier::accepting()).with_store(store.clone());

    let build = job("b-t", phases(1), config(1, 100.0));
    let build_id = build.build_id.clone();
    orch.register(&build).await;
    let registered = store.get_build(&build_id).await.unwrap().unwrap();
    assert_eq!(registered.state, "created");

    tokio::time::sleep(Duration::from_millis(10)).await;
    let result = orch.run_registered(build, CancellationToken::new()).await;
    assert!(result.success());

    let row = store.get_build(&build_id).await.unwrap().unwrap();
    assert_eq!(row.state, "completed");
    assert_eq!(row.started_at, registered.started_at);
}
