use std::collections::HashMap;

use super::{Sandbox, SandboxRole, SandboxStatus};
use crate::types::SandboxId;

/// Sandboxes known to a single build run, in creation order.
///
/// Owned by the orchestrator for the lifetime of one `run` call; nothing
/// about it is process-wide.
#[derive(Debug, Default)]
pub struct SandboxRegistry {
    sandboxes: HashMap<SandboxId, Sandbox>,
    order: Vec<SandboxId>,
}

impl SandboxRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a sandbox whose creation is about to be requested.
    pub fn begin(&mut self, id: SandboxId, role: SandboxRole) {
        if !self.sandboxes.contains_key(&id) {
            self.order.push(id.clone());
        }
        self.sandboxes.insert(
            id.clone(),
            Sandbox {
                id,
                role,
                status: SandboxStatus::Creating,
                tunnel_url: None,
            },
        );
    }

    pub fn mark_running(&mut self, sandbox: &Sandbox) {
        if let Some(entry) = self.sandboxes.get_mut(&sandbox.id) {
            entry.status = SandboxStatus::Running;
            entry.tunnel_url = sandbox.tunnel_url.clone();
        }
    }

    /// Returns `true` only on the transition into `Terminated`.
    pub fn mark_terminated(&mut self, id: &SandboxId) -> bool {
        match self.sandboxes.get_mut(id) {
            Some(entry) if entry.status != SandboxStatus::Terminated => {
                entry.status = SandboxStatus::Terminated;
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, id: &SandboxId) -> Option<&Sandbox> {
        self.sandboxes.get(id)
    }

    /// Build sandboxes that still need a terminate call, including ones whose
    /// creation failed part-way.
    pub fn pending_teardown(&self) -> Vec<SandboxId> {
        self.order
            .iter()
            .filter_map(|id| self.sandboxes.get(id))
            .filter(|s| s.role == SandboxRole::Build && s.status != SandboxStatus::Terminated)
            .map(|s| s.id.clone())
            .collect()
    }

    pub fn live_build_count(&self) -> usize {
        self.sandboxes
            .values()
            .filter(|s| s.role == SandboxRole::Build && s.status == SandboxStatus::Running)
            .count()
    }
}
