// Task → sandbox assignment

use crate::model::Task;
use crate::sandbox::Sandbox;

/// Distributes partitioned tasks over the build sandboxes.
///
/// Implementations return exactly one list per sandbox, in sandbox order,
/// and keep the original relative task order inside each list.
pub trait AssignmentStrategy: Send + Sync {
    fn name(&self) -> &'static str;

    fn assign(&self, tasks: &[Task], sandboxes: &[Sandbox]) -> Vec<Vec<Task>>;
}

/// Task `i` goes to sandbox `i mod N`.
///
/// Deterministic for a given task order and sandbox count. It does not look
/// at estimated task cost.
#[derive(Debug, Clone, Copy, Default)]
pub struct RoundRobin;

impl AssignmentStrategy for RoundRobin {
    fn name(&self) -> &'static str {
        "round-robin"
    }

    fn assign(&self, tasks: &[Task], sandboxes: &[Sandbox]) -> Vec<Vec<Task>> {
        let mut assignments: Vec<Vec<Task>> = vec![Vec::new(); sandboxes.len()];
        if assignments.is_empty() {
            return assignments;
        }

        let slots = assignments.len();
        for (index, task) in tasks.iter().enumerate() {
            assignments[index % slots].push(task.clone());
        }

        assignments
    }
}
