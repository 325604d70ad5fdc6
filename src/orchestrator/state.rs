//! Build lifecycle states.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::BuildId;

/// Where a build is. States only move forward, one step at a time, except
/// that any non-terminal state may drop straight to `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BuildState {
    Created,
    Started,
    TasksPartitioned,
    SandboxesReady,
    TasksAssigned,
    Executing,
    Merging,
    Verifying,
    Completed,
    Failed,
}

impl BuildState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Started => "started",
            Self::TasksPartitioned => "tasks_partitioned",
            Self::SandboxesReady => "sandboxes_ready",
            Self::TasksAssigned => "tasks_assigned",
            Self::Executing => "executing",
            Self::Merging => "merging",
            Self::Verifying => "verifying",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// The single state that follows this one on the success path.
    pub fn successor(&self) -> Option<BuildState> {
        match self {
            Self::Created => Some(Self::Started),
            Self::Started => Some(Self::TasksPartitioned),
            Self::TasksPartitioned => Some(Self::SandboxesReady),
            Self::SandboxesReady => Some(Self::TasksAssigned),
            Self::TasksAssigned => Some(Self::Executing),
            Self::Executing => Some(Self::Merging),
            Self::Merging => Some(Self::Verifying),
            Self::Verifying => Some(Self::Completed),
            Self::Completed | Self::Failed => None,
        }
    }

    pub fn can_transition_to(&self, next: BuildState) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == Self::Failed || self.successor() == Some(next)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("build {build_id}: illegal state transition {from:?} -> {to:?}")]
pub struct TransitionError {
    pub build_id: BuildId,
    pub from: BuildState,
    pub to: BuildState,
}

/// Tracks the current state of one build and rejects illegal moves.
#[derive(Debug, Clone)]
pub struct BuildStateMachine {
    build_id: BuildId,
    state: BuildState,
}

impl BuildStateMachine {
    pub fn new(build_id: BuildId) -> Self {
        Self {
            build_id,
            state: BuildState::Created,
        }
    }

    pub fn state(&self) -> BuildState {
        self.state
    }

    pub fn advance(&mut self, next: BuildState) -> Result<BuildState, TransitionError> {
        if !self.state.can_transition_to(next) {
            return Err(TransitionError {
                build_id: self.build_id.clone(),
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(next)
    }

    /// Move to `Failed`. Returns false if the build was already terminal.
    pub fn fail(&mut self) -> bool {
        self.advance(BuildState::Failed).is_ok()
    }
}
