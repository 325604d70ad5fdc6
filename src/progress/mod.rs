//! Best-effort, ordered progress reporting for a build.
//!
//! Events are pushed onto an unbounded per-build queue and drained by a
//! single delivery task, so `emit` never waits on the network and events for
//! one build reach the sink in the order they were emitted.

pub mod webhook;

pub use webhook::WebhookSink;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

use crate::types::BuildId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    Started,
    TasksPartitioned,
    SandboxCreated,
    TasksAssigned,
    TaskStarted,
    TaskCompleted,
    TaskFailed,
    BudgetExceeded,
    Completed,
    Failed,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "started",
            Self::TasksPartitioned => "tasksPartitioned",
            Self::SandboxCreated => "sandboxCreated",
            Self::TasksAssigned => "tasksAssigned",
            Self::TaskStarted => "taskStarted",
            Self::TaskCompleted => "taskCompleted",
            Self::TaskFailed => "taskFailed",
            Self::BudgetExceeded => "budgetExceeded",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// Webhook body: `{event, buildId, timestamp, data}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub event: EventKind,
    pub build_id: BuildId,
    pub timestamp: String,
    pub data: Value,
}

/// Where progress events end up.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// `target` is the build's webhook URL, if it has one.
    async fn deliver(&self, target: Option<&Url>, event: &ProgressEvent) -> Result<()>;
}

/// Cloneable handle used by the orchestrator and every execution loop.
#[derive(Clone)]
pub struct ProgressEmitter {
    build_id: BuildId,
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

/// Outcome counts from a drained delivery queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliveryStats {
    pub delivered: usize,
    pub failed: usize,
}

/// Owns the delivery task. Drain it after every emitter clone is dropped.
pub struct DeliveryHandle {
    build_id: BuildId,
    worker: JoinHandle<DeliveryStats>,
}

impl ProgressEmitter {
    /// Start the delivery task for one build.
    pub fn spawn(
        build_id: BuildId,
        target: Option<Url>,
        sink: Arc<dyn EventSink>,
        attempt_timeout: Duration,
    ) -> (Self, DeliveryHandle) {
        let (tx, rx) = mpsc::unbounded_channel();
        let worker = tokio::spawn(deliver_all(rx, target, sink, attempt_timeout));

        (
            Self {
                build_id: build_id.clone(),
                tx,
            },
            DeliveryHandle { build_id, worker },
        )
    }

    /// Queue an event. Never blocks and never fails the caller.
    pub fn emit(&self, event: EventKind, data: Value) {
        let event = ProgressEvent {
            event,
            build_id: self.build_id.clone(),
            timestamp: chrono::Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            data,
        };

        if let Err(err) = self.tx.send(event) {
            warn!(
                build_id = %self.build_id,
                event = err.0.event.as_str(),
                "progress queue closed, dropping event"
            );
        }
    }
}

impl DeliveryHandle {
    /// Wait until every queued event has been attempted.
    pub async fn drain(self) -> DeliveryStats {
        match self.worker.await {
            Ok(stats) => stats,
            Err(e) => {
                warn!(build_id = %self.build_id, error = %e, "progress delivery task aborted");
                DeliveryStats::default()
            }
        }
    }
}

async fn deliver_all(
    mut rx: mpsc::UnboundedReceiver<ProgressEvent>,
    target: Option<Url>,
    sink: Arc<dyn EventSink>,
    attempt_timeout: Duration,
) -> DeliveryStats {
    let mut stats = DeliveryStats::default();

    while let Some(event) = rx.recv().await {
        let name = event.event.as_str();
        match tokio::time::timeout(attempt_timeout, sink.deliver(target.as_ref(), &event)).await {
            Ok(Ok(())) => {
                debug!(build_id = %event.build_id, event = name, "progress event delivered");
                stats.delivered += 1;
            }
            Ok(Err(e)) => {
                warn!(build_id = %event.build_id, event = name, error = %e, "webhook failed");
                stats.failed += 1;
            }
            Err(_) => {
                warn!(
                    build_id = %event.build_id,
                    event = name,
                    timeout_secs = attempt_timeout.as_secs_f64(),
                    "webhook timed out"
                );
                stats.failed += 1;
            }
        }
    }

    stats
}
