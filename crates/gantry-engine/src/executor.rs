//! Phase Executor
//!
//! Runs one phase to an outcome: dispatch, invoke the bound worker under a
//! timeout, retry on failure up to the phase's limit, then either complete
//! the phase, hand it to the approval gateway, or fail it.
//!
//! Each status change is a separate locked write. The worker itself runs
//! without any lock held, so decisions and cancellation can land while it
//! is busy; a result that arrives for a phase that is no longer running is
//! discarded.

use gantry_core::{
    merge_json, ApprovalMode, AuditLogEntry, GantryError, PhaseStatus, PhaseTemplate, Result,
    Workflow, WorkflowDefinition,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::time::timeout;
use tracing::{debug, error, info, instrument, warn};

use crate::gateway::ApprovalGateway;
use crate::persistence::WorkflowWriter;
use crate::scheduler;
use crate::state_machine::{self, PhaseEvent};
use crate::worker::{WorkerRegistry, WorkerResponse};

/// How a single `execute` call ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseOutcome {
    Completed,
    AwaitingApproval,
    Failed,
    /// The phase was not runnable, or its result arrived too late
    Discarded,
}

enum AfterFailure {
    Retry(u32),
    Failed,
    Discard,
}

enum AfterSuccess {
    Done,
    NeedsGate,
    Discard,
}

pub struct PhaseExecutor {
    writer: Arc<WorkflowWriter>,
    workers: Arc<WorkerRegistry>,
    gateway: Arc<ApprovalGateway>,
}

impl PhaseExecutor {
    pub fn new(
        writer: Arc<WorkflowWriter>,
        workers: Arc<WorkerRegistry>,
        gateway: Arc<ApprovalGateway>,
    ) -> Self {
        Self {
            writer,
            workers,
            gateway,
        }
    }

    /// Run a pending phase until it completes, gates, or fails
    #[instrument(skip(self, definition, phase), fields(phase_id = %phase.id))]
    pub async fn execute(
        &self,
        definition: &WorkflowDefinition,
        workflow_id: &str,
        phase: &PhaseTemplate,
    ) -> Result<PhaseOutcome> {
        let Some(input) = self.dispatch(definition, workflow_id, phase).await? else {
            debug!("Phase not dispatchable");
            return Ok(PhaseOutcome::Discarded);
        };

        let worker = match self.workers.get(&phase.agent_type, &phase.method) {
            Ok(worker) => worker,
            Err(e) => {
                // A missing binding will not appear on retry
                return self.fail(definition, workflow_id, phase, e.to_string()).await;
            }
        };

        loop {
            let invocation = worker.invoke(input.clone());
            let attempt = match timeout(phase.timeout_duration(), invocation).await {
                Ok(Ok(WorkerResponse {
                    success: true,
                    data,
                    ..
                })) => Ok(data),
                Ok(Ok(response)) => Err(response
                    .error
                    .unwrap_or_else(|| "worker reported failure".to_string())),
                Ok(Err(e)) => Err(e.to_string()),
                Err(_) => Err(GantryError::PhaseTimeout {
                    phase_id: phase.id.clone(),
                    timeout_secs: phase.timeout,
                }
                .to_string()),
            };

            match attempt {
                Ok(data) => return self.complete(definition, workflow_id, phase, data).await,
                Err(message) => {
                    match self
                        .after_failure(definition, workflow_id, phase, message.clone())
                        .await?
                    {
                        AfterFailure::Retry(next_attempt) => {
                            warn!(attempt = next_attempt, "Retrying phase: {}", message);
                        }
                        AfterFailure::Failed => return Ok(PhaseOutcome::Failed),
                        AfterFailure::Discard => return Ok(PhaseOutcome::Discarded),
                    }
                }
            }
        }
    }

    /// Move a pending phase to running and build its worker input
    async fn dispatch(
        &self,
        definition: &WorkflowDefinition,
        workflow_id: &str,
        phase: &PhaseTemplate,
    ) -> Result<Option<Value>> {
        self.writer
            .mutate(workflow_id, |wf, changes| {
                if wf.is_terminal() || status(wf, &phase.id) != Some(PhaseStatus::Pending) {
                    return Ok(None);
                }

                let input = build_input(definition, wf, phase);
                let state = running_state(wf, &phase.id)?;
                state_machine::apply(state, PhaseEvent::Dispatch)?;
                let attempt = state.retry_count + 1;

                changes.record(AuditLogEntry::system(
                    &wf.id,
                    "phase_started",
                    Some(&phase.id),
                    json!({
                        "attempt": attempt,
                        "agent_type": phase.agent_type,
                        "method": phase.method,
                    }),
                ));
                scheduler::refresh_status(definition, wf, &mut changes.audit)?;

                info!(attempt, "Dispatched phase to {}.{}", phase.agent_type, phase.method);
                Ok(Some(input))
            })
            .await
    }

    async fn after_failure(
        &self,
        definition: &WorkflowDefinition,
        workflow_id: &str,
        phase: &PhaseTemplate,
        message: String,
    ) -> Result<AfterFailure> {
        self.writer
            .mutate(workflow_id, |wf, changes| {
                if wf.is_terminal() || status(wf, &phase.id) != Some(PhaseStatus::Running) {
                    return Ok(AfterFailure::Discard);
                }

                let workflow_id = wf.id.clone();
                let state = running_state(wf, &phase.id)?;

                if state.retry_count < phase.max_retries {
                    state_machine::apply(state, PhaseEvent::Retry)?;
                    let next_attempt = state.retry_count + 1;
                    changes.record(AuditLogEntry::system(
                        &workflow_id,
                        "phase_retry",
                        Some(&phase.id),
                        json!({ "attempt": next_attempt, "error": message }),
                    ));
                    return Ok(AfterFailure::Retry(next_attempt));
                }

                let attempts = state.retry_count + 1;
                let reason = GantryError::RetriesExhausted {
                    phase_id: phase.id.clone(),
                    attempts,
                    last_error: message,
                }
                .to_string();
                record_failure(definition, wf, phase, reason, changes)?;
                Ok(AfterFailure::Failed)
            })
            .await
    }

    async fn fail(
        &self,
        definition: &WorkflowDefinition,
        workflow_id: &str,
        phase: &PhaseTemplate,
        reason: String,
    ) -> Result<PhaseOutcome> {
        self.writer
            .mutate(workflow_id, |wf, changes| {
                if wf.is_terminal() || status(wf, &phase.id) != Some(PhaseStatus::Running) {
                    return Ok(PhaseOutcome::Discarded);
                }
                record_failure(definition, wf, phase, reason, changes)?;
                Ok(PhaseOutcome::Failed)
            })
            .await
    }

    async fn complete(
        &self,
        definition: &WorkflowDefinition,
        workflow_id: &str,
        phase: &PhaseTemplate,
        data: Value,
    ) -> Result<PhaseOutcome> {
        let step = self
            .writer
            .mutate(workflow_id, |wf, changes| {
                if wf.is_terminal() || status(wf, &phase.id) != Some(PhaseStatus::Running) {
                    return Ok(AfterSuccess::Discard);
                }

                let auto_approve = wf.approval_mode == ApprovalMode::AutoApprove;
                if phase.approval_required && !auto_approve {
                    return Ok(AfterSuccess::NeedsGate);
                }

                let workflow_id = wf.id.clone();
                let state = running_state(wf, &phase.id)?;
                let action = if phase.approval_required {
                    state_machine::apply(state, PhaseEvent::Gate)?;
                    state_machine::apply(state, PhaseEvent::Approve)?;
                    "phase_auto_approved"
                } else {
                    state_machine::apply(state, PhaseEvent::Succeed)?;
                    "phase_completed"
                };
                state.result = Some(data.clone());
                let retry_count = state.retry_count;

                wf.record_artifacts(&data);
                changes.record(AuditLogEntry::system(
                    &workflow_id,
                    action,
                    Some(&phase.id),
                    json!({ "retry_count": retry_count }),
                ));
                scheduler::refresh_status(definition, wf, &mut changes.audit)?;
                Ok(AfterSuccess::Done)
            })
            .await?;

        match step {
            AfterSuccess::Done => {
                info!("Phase completed");
                Ok(PhaseOutcome::Completed)
            }
            AfterSuccess::NeedsGate => match self.gateway.request(workflow_id, phase, data).await? {
                Some(_) => Ok(PhaseOutcome::AwaitingApproval),
                None => Ok(PhaseOutcome::Discarded),
            },
            AfterSuccess::Discard => {
                warn!("Discarding result for phase that is no longer running");
                Ok(PhaseOutcome::Discarded)
            }
        }
    }
}

fn status(wf: &Workflow, phase_id: &str) -> Option<PhaseStatus> {
    wf.phase(phase_id).map(|p| p.status)
}

fn running_state<'a>(
    wf: &'a mut Workflow,
    phase_id: &str,
) -> Result<&'a mut gantry_core::PhaseState> {
    wf.phase_mut(phase_id)
        .ok_or_else(|| GantryError::Validation(format!("unknown phase {}", phase_id)))
}

fn record_failure(
    definition: &WorkflowDefinition,
    wf: &mut Workflow,
    phase: &PhaseTemplate,
    reason: String,
    changes: &mut crate::persistence::Changes,
) -> Result<()> {
    let workflow_id = wf.id.clone();
    let state = running_state(wf, &phase.id)?;
    state_machine::apply(state, PhaseEvent::Fail)?;
    state.error = Some(reason.clone());
    let attempts = state.retry_count + 1;

    error!(phase_id = %phase.id, "Phase failed: {}", reason);
    changes.record(AuditLogEntry::system(
        &workflow_id,
        "phase_failed",
        Some(&phase.id),
        json!({ "error": reason, "attempts": attempts }),
    ));
    scheduler::refresh_status(definition, wf, &mut changes.audit)?;
    Ok(())
}

/// Worker input: workflow context overlaid with each dependency's object
/// result in declaration order
pub fn build_input(definition: &WorkflowDefinition, wf: &Workflow, phase: &PhaseTemplate) -> Value {
    let mut input = json!({
        "workflow_id": wf.id,
        "phase_id": phase.id,
        "phase_name": phase.name,
        "requirements": wf.requirements,
        "technology": wf.technology,
        "output_path": wf.output_path,
        "config": definition.config,
    });

    for dep in &phase.dependencies {
        let result = wf.phase(dep).and_then(|p| p.result.as_ref());
        if let Some(result) = result.filter(|r| r.is_object()) {
            merge_json(&mut input, result);
        }
    }
    input
}
