//! Dependency scheduling
//!
//! Functions over a definition and a workflow snapshot: which phases may
//! run, which of those to dispatch this tick, and what the aggregate
//! workflow status is. No I/O happens here; callers persist the result.

use gantry_core::{
    AuditLogEntry, ExecutionMode, PhaseStatus, PhaseTemplate, Result, Workflow,
    WorkflowDefinition, WorkflowStatus,
};
use serde_json::json;
use std::collections::HashSet;

use crate::state_machine::{self, PhaseEvent};

fn status_of(workflow: &Workflow, phase_id: &str) -> PhaseStatus {
    workflow
        .phase(phase_id)
        .map(|p| p.status)
        .unwrap_or(PhaseStatus::Pending)
}

/// Pending phases whose dependencies are all completed or skipped, in
/// declaration order
pub fn eligible_phases<'a>(
    definition: &'a WorkflowDefinition,
    workflow: &Workflow,
) -> Vec<&'a PhaseTemplate> {
    if workflow.is_terminal() {
        return Vec::new();
    }

    definition
        .phases
        .iter()
        .filter(|phase| status_of(workflow, &phase.id) == PhaseStatus::Pending)
        .filter(|phase| {
            phase
                .dependencies
                .iter()
                .all(|dep| status_of(workflow, dep).satisfies_dependency())
        })
        .collect()
}

/// Phases to dispatch on this tick
///
/// Serial mode dispatches the first eligible phase, and nothing while
/// another phase is still running. Parallel mode fills free slots up to
/// `max_parallel`.
pub fn select_for_dispatch<'a>(
    definition: &'a WorkflowDefinition,
    workflow: &Workflow,
    mode: ExecutionMode,
    max_parallel: usize,
) -> Vec<&'a PhaseTemplate> {
    let running = workflow
        .phases
        .iter()
        .filter(|p| p.status == PhaseStatus::Running)
        .count();

    let slots = match mode {
        ExecutionMode::Serial => 1usize.saturating_sub(running),
        ExecutionMode::Parallel => max_parallel.max(1).saturating_sub(running),
    };

    eligible_phases(definition, workflow)
        .into_iter()
        .take(slots)
        .collect()
}

/// Pending phases that can never run because a transitive dependency failed
pub fn unreachable_phases(definition: &WorkflowDefinition, workflow: &Workflow) -> Vec<String> {
    let mut blocked: HashSet<&str> = HashSet::new();

    // Dependencies are declared before dependents, so one pass suffices
    for phase in &definition.phases {
        if status_of(workflow, &phase.id) != PhaseStatus::Pending {
            continue;
        }
        let doomed = phase.dependencies.iter().any(|dep| {
            blocked.contains(dep.as_str()) || status_of(workflow, dep) == PhaseStatus::Failed
        });
        if doomed {
            blocked.insert(phase.id.as_str());
        }
    }

    definition
        .phases
        .iter()
        .filter(|p| blocked.contains(p.id.as_str()))
        .map(|p| p.id.clone())
        .collect()
}

/// Recompute the aggregate status of a workflow
///
/// Terminal statuses are sticky. Otherwise:
/// - completed when every phase is completed or skipped
/// - failed when a phase failed and nothing can run or be decided anymore
/// - paused when a gate is open and nothing else is runnable
/// - running in every other case
pub fn derive_status(definition: &WorkflowDefinition, workflow: &Workflow) -> WorkflowStatus {
    if workflow.is_terminal() {
        return workflow.status;
    }

    if workflow.phases.iter().all(|p| p.status.satisfies_dependency()) {
        return WorkflowStatus::Completed;
    }

    let any_running = workflow.phases.iter().any(|p| p.status == PhaseStatus::Running);
    if any_running {
        return WorkflowStatus::Running;
    }

    let any_waiting = workflow
        .phases
        .iter()
        .any(|p| p.status == PhaseStatus::WaitingApproval);
    let any_failed = workflow.phases.iter().any(|p| p.status == PhaseStatus::Failed);
    let runnable = !eligible_phases(definition, workflow).is_empty();

    if runnable {
        WorkflowStatus::Running
    } else if any_waiting {
        WorkflowStatus::Paused
    } else if any_failed {
        WorkflowStatus::Failed
    } else {
        WorkflowStatus::Running
    }
}

/// Recompute status and current phase after a change
///
/// A status change is recorded as `workflow_<status>`. When the workflow
/// becomes failed, phases that can no longer run are force-skipped and the
/// first failed phase's error becomes the workflow error.
pub fn refresh_status(
    definition: &WorkflowDefinition,
    workflow: &mut Workflow,
    audit: &mut Vec<AuditLogEntry>,
) -> Result<WorkflowStatus> {
    let previous = workflow.status;
    let next = derive_status(definition, workflow);

    if next == WorkflowStatus::Failed && previous != WorkflowStatus::Failed {
        let workflow_id = workflow.id.clone();
        for phase_id in unreachable_phases(definition, workflow) {
            if let Some(phase) = workflow.phase_mut(&phase_id) {
                state_machine::apply(phase, PhaseEvent::ForceSkip)?;
                audit.push(AuditLogEntry::system(
                    &workflow_id,
                    "phase_force_skipped",
                    Some(&phase_id),
                    json!({ "reason": "dependency failed" }),
                ));
            }
        }
        workflow.error = workflow
            .phases
            .iter()
            .find(|p| p.status == PhaseStatus::Failed)
            .and_then(|p| p.error.clone());
    }

    workflow.status = next;
    workflow.current_phase = current_phase(definition, workflow);

    if next != previous {
        audit.push(AuditLogEntry::system(
            &workflow.id,
            format!("workflow_{}", next),
            None,
            json!({ "previous": previous }),
        ));
    }

    Ok(next)
}

/// First phase, in declaration order, that directly depends on `phase_id`
pub fn next_phase(definition: &WorkflowDefinition, phase_id: &str) -> Option<String> {
    definition.dependents(phase_id).next().map(|p| p.id.clone())
}

/// The phase a status display should point at
///
/// The earliest running or gated phase wins, then the earliest eligible one.
pub fn current_phase(definition: &WorkflowDefinition, workflow: &Workflow) -> Option<String> {
    if workflow.is_terminal() {
        return None;
    }

    definition
        .phases
        .iter()
        .find(|p| {
            matches!(
                status_of(workflow, &p.id),
                PhaseStatus::Running | PhaseStatus::WaitingApproval
            )
        })
        .or_else(|| eligible_phases(definition, workflow).into_iter().next())
        .map(|p| p.id.clone())
}
