// Implementation plan → ordered task list

use serde_json::{Map, Value};

use crate::error::PartitionError;
use crate::model::{Task, TaskKind};
use crate::types::TaskId;

/// Split an implementation plan into independent tasks.
///
/// Phases win: when the plan lists at least one phase, each phase becomes one
/// `phase` task and `features` is ignored. Otherwise each feature becomes a
/// `feature` task. Items without an id get a positional id (`phase-0`,
/// `feature-3`). An empty plan yields no tasks.
pub fn partition(plan: &Value) -> Result<Vec<Task>, PartitionError> {
    let plan = plan.as_object().ok_or(PartitionError::NotAnObject)?;

    let phases = items(plan, "phases")?;
    if !phases.is_empty() {
        return Ok(phases
            .into_iter()
            .enumerate()
            .map(|(index, phase)| Task {
                id: item_id(phase, "phase", index),
                name: item_name(phase, "Unnamed Phase"),
                kind: TaskKind::Phase {
                    features: phase
                        .get("features")
                        .and_then(Value::as_array)
                        .cloned()
                        .unwrap_or_default(),
                    dependencies: strings(phase, "dependencies"),
                },
            })
            .collect());
    }

    Ok(items(plan, "features")?
        .into_iter()
        .enumerate()
        .map(|(index, feature)| Task {
            id: item_id(feature, "feature", index),
            name: item_name(feature, "Unnamed Feature"),
            kind: TaskKind::Feature {
                description: feature
                    .get("description")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                files: strings(feature, "files"),
            },
        })
        .collect())
}

fn items<'a>(
    plan: &'a Map<String, Value>,
    field: &'static str,
) -> Result<Vec<&'a Map<String, Value>>, PartitionError> {
    match plan.get(field) {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Array(values)) => values
            .iter()
            .enumerate()
            .map(|(index, v)| v.as_object().ok_or(PartitionError::NotAnItem { field, index }))
            .collect(),
        Some(_) => Err(PartitionError::NotAList { field }),
    }
}

fn item_id(item: &Map<String, Value>, prefix: &str, index: usize) -> TaskId {
    match item.get("id") {
        Some(Value::String(s)) if !s.trim().is_empty() => TaskId::new(s.clone()),
        Some(Value::Number(n)) => TaskId::new(n.to_string()),
        _ => TaskId::new(format!("{prefix}-{index}")),
    }
}

fn item_name(item: &Map<String, Value>, fallback: &str) -> String {
    item.get("name")
        .and_then(Value::as_str)
        .unwrap_or(fallback)
        .to_string()
}

fn strings(item: &Map<String, Value>, field: &str) -> Vec<String> {
    item.get(field)
        .and_then(Value::as_array)
        .map(|values| {
            values
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}
