//! Approval Gateway
//!
//! Suspends phases that need a human decision and resumes them when one
//! arrives. Each open gate exists twice: as a row in the store (the
//! authority) and in an in-memory index that status queries read. Both are
//! changed while holding the workflow's write lock, and the index is only
//! touched after the store transaction commits.

use chrono::{DateTime, Utc};
use gantry_core::{
    merge_json, ApprovalAction, ApprovalRequest, AuditLogEntry, Decision, GantryError,
    PhaseStatus, PhaseTemplate, Result, Workflow, WorkflowStatus,
};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::persistence::{Changes, WorkflowWriter};
use crate::registry::DefinitionRegistry;
use crate::scheduler;
use crate::state_machine::{self, PhaseEvent};

/// Actor recorded when an expired gate cancels its workflow
pub const EXPIRY_ACTOR: &str = "system:approval-expiry";

/// Result of a recorded decision
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecisionOutcome {
    pub workflow_id: String,
    pub phase_id: String,
    pub action: ApprovalAction,
    pub phase_status: PhaseStatus,
    pub workflow_status: WorkflowStatus,
    pub message: String,
}

type GateKey = (String, String);

/// Opens, decides and indexes approval gates
pub struct ApprovalGateway {
    writer: Arc<WorkflowWriter>,
    registry: Arc<DefinitionRegistry>,
    index: RwLock<HashMap<GateKey, ApprovalRequest>>,
    expiry: Option<Duration>,
}

impl ApprovalGateway {
    pub fn new(
        writer: Arc<WorkflowWriter>,
        registry: Arc<DefinitionRegistry>,
        expiry: Option<Duration>,
    ) -> Self {
        Self {
            writer,
            registry,
            index: RwLock::new(HashMap::new()),
            expiry,
        }
    }

    /// Gate a phase whose worker just succeeded with `result`
    ///
    /// Returns `None` when the phase is no longer running (the workflow was
    /// cancelled while the worker ran); the result is dropped.
    pub async fn request(
        &self,
        workflow_id: &str,
        phase: &PhaseTemplate,
        result: Value,
    ) -> Result<Option<ApprovalRequest>> {
        let guard = self.writer.lock(workflow_id).await;
        let mut wf = self.writer.load(workflow_id).await?;
        let definition = self.registry.get(&wf.definition_id)?;

        if wf.is_terminal() {
            warn!(
                workflow_id,
                phase_id = %phase.id,
                "Discarding result for {} workflow",
                wf.status
            );
            return Ok(None);
        }
        let state = phase_state_mut(&mut wf, &phase.id)?;
        if state.status != PhaseStatus::Running {
            warn!(
                workflow_id,
                phase_id = %phase.id,
                "Discarding result, phase is {}",
                state.status
            );
            return Ok(None);
        }

        let request = ApprovalRequest::new(
            workflow_id,
            phase,
            result.clone(),
            scheduler::next_phase(definition, &phase.id),
            state.retry_count,
            self.expiry,
        )?;
        state_machine::apply(state, PhaseEvent::Gate)?;
        state.result = Some(result);

        let mut changes = Changes::default();
        changes.record(AuditLogEntry::system(
            &wf.id,
            "approval_requested",
            Some(&phase.id),
            json!({
                "approval_id": request.id,
                "next_phase": request.next_phase,
                "expires_at": request.expires_at,
            }),
        ));
        scheduler::refresh_status(definition, &mut wf, &mut changes.audit)?;
        changes.opened = Some(request.clone());

        self.writer.persist(&guard, &mut wf, changes).await?;
        self.index
            .write()
            .await
            .insert((wf.id.clone(), phase.id.clone()), request.clone());

        info!(workflow_id, phase_id = %phase.id, "Approval requested");
        Ok(Some(request))
    }

    /// Record a decision on an open gate
    ///
    /// Fails with `ApprovalNotFound` and changes nothing when no gate is
    /// open for the pair, which makes repeated submissions harmless.
    pub async fn decide(
        &self,
        workflow_id: &str,
        phase_id: &str,
        decision: Decision,
        actor: &str,
    ) -> Result<DecisionOutcome> {
        let key = (workflow_id.to_string(), phase_id.to_string());
        let not_found = || GantryError::ApprovalNotFound {
            workflow_id: workflow_id.to_string(),
            phase_id: phase_id.to_string(),
        };

        let guard = self.writer.lock(workflow_id).await;
        let Some(request) = self.writer.store().get_approval(workflow_id, phase_id).await? else {
            self.index.write().await.remove(&key);
            return Err(not_found());
        };

        let action = decision.action();
        if !request.allows(action) {
            return Err(GantryError::ActionNotAllowed {
                approval_id: request.id.clone(),
                action: action.to_string(),
            });
        }

        let mut wf = self.writer.load(workflow_id).await?;
        let definition = self.registry.get(&wf.definition_id)?;
        if wf.phase(phase_id).map(|p| p.status) != Some(PhaseStatus::WaitingApproval) {
            return Err(not_found());
        }

        let open_gates: Vec<String> = if action == ApprovalAction::Cancel {
            self.writer
                .store()
                .list_approvals(Some(workflow_id))
                .await?
                .into_iter()
                .map(|r| r.phase_id)
                .collect()
        } else {
            vec![phase_id.to_string()]
        };

        let mut payload = json!({ "approval_id": request.id });
        match decision {
            Decision::Approve { modifications } => {
                let mut result = request.result.clone();
                if let Some(modifications) = modifications {
                    merge_json(&mut result, &modifications);
                    payload["modifications"] = modifications;
                }
                complete_gated_phase(&mut wf, phase_id, result)?;
            }
            Decision::Modify { modifications } => {
                payload["modifications"] = modifications.clone();
                complete_gated_phase(&mut wf, phase_id, modifications)?;
            }
            Decision::Retry => {
                let state = phase_state_mut(&mut wf, phase_id)?;
                state_machine::apply(state, PhaseEvent::Reopen)?;
                state.retry_count = request.retry_count_at_gate;
                state.result = None;
            }
            Decision::Skip => {
                let state = phase_state_mut(&mut wf, phase_id)?;
                state_machine::apply(state, PhaseEvent::Skip)?;
                state.result = None;
            }
            Decision::Cancel => {}
        }

        let mut changes = Changes::default();
        changes.record(AuditLogEntry::new(
            &wf.id,
            format!("approval_{}", action),
            Some(phase_id),
            actor,
            payload,
        ));

        if action == ApprovalAction::Cancel {
            let reason = format!("cancelled at approval gate {}", phase_id);
            cancel_in_place(&mut wf, actor, &reason, &mut changes.audit)?;
        } else {
            scheduler::refresh_status(definition, &mut wf, &mut changes.audit)?;
        }
        changes.closed = open_gates.clone();

        self.writer.persist(&guard, &mut wf, changes).await?;
        {
            let mut index = self.index.write().await;
            for gate in &open_gates {
                index.remove(&(workflow_id.to_string(), gate.clone()));
            }
        }

        let phase_status = wf
            .phase(phase_id)
            .map(|p| p.status)
            .unwrap_or(PhaseStatus::Skipped);
        info!(workflow_id, phase_id, actor, "Approval decision: {}", action);

        Ok(DecisionOutcome {
            workflow_id: workflow_id.to_string(),
            phase_id: phase_id.to_string(),
            action,
            phase_status,
            workflow_status: wf.status,
            message: format!(
                "{} recorded for phase {}; workflow is {}",
                action, phase_id, wf.status
            ),
        })
    }

    /// Cancel a workflow outside any gate decision
    ///
    /// Non-terminal phases are force-skipped and all open gates closed.
    pub async fn cancel_workflow(
        &self,
        workflow_id: &str,
        actor: &str,
        reason: &str,
    ) -> Result<Workflow> {
        let guard = self.writer.lock(workflow_id).await;
        let mut wf = self.writer.load(workflow_id).await?;
        if wf.is_terminal() {
            return Err(GantryError::Validation(format!(
                "workflow {} is already {}",
                workflow_id, wf.status
            )));
        }

        let open_gates: Vec<String> = self
            .writer
            .store()
            .list_approvals(Some(workflow_id))
            .await?
            .into_iter()
            .map(|r| r.phase_id)
            .collect();

        let mut changes = Changes::default();
        cancel_in_place(&mut wf, actor, reason, &mut changes.audit)?;
        changes.closed = open_gates.clone();

        self.writer.persist(&guard, &mut wf, changes).await?;
        {
            let mut index = self.index.write().await;
            for gate in &open_gates {
                index.remove(&(workflow_id.to_string(), gate.clone()));
            }
        }

        info!(workflow_id, actor, "Workflow cancelled");
        Ok(wf)
    }

    /// Approve every open gate of a workflow
    pub async fn approve_all(
        &self,
        workflow_id: &str,
        actor: &str,
    ) -> Result<Vec<DecisionOutcome>> {
        // Surface WorkflowNotFound rather than an empty result
        self.writer.load(workflow_id).await?;

        let gates = self.writer.store().list_approvals(Some(workflow_id)).await?;
        let mut outcomes = Vec::with_capacity(gates.len());

        for gate in gates {
            match self
                .decide(
                    workflow_id,
                    &gate.phase_id,
                    Decision::Approve { modifications: None },
                    actor,
                )
                .await
            {
                Ok(outcome) => outcomes.push(outcome),
                Err(GantryError::ApprovalNotFound { .. }) => {
                    debug!(workflow_id, phase_id = %gate.phase_id, "Gate closed concurrently");
                }
                Err(e) => return Err(e),
            }
        }

        Ok(outcomes)
    }

    /// Treat the first expired gate of a workflow as a cancel decision
    pub async fn expire_overdue(
        &self,
        workflow_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<DecisionOutcome>> {
        let expired: Vec<String> = self
            .index
            .read()
            .await
            .values()
            .filter(|r| r.workflow_id == workflow_id && r.is_expired(now))
            .map(|r| r.phase_id.clone())
            .collect();

        for phase_id in expired {
            warn!(workflow_id, phase_id = %phase_id, "Approval request expired");
            match self
                .decide(workflow_id, &phase_id, Decision::Cancel, EXPIRY_ACTOR)
                .await
            {
                Ok(outcome) => return Ok(Some(outcome)),
                Err(GantryError::ApprovalNotFound { .. }) => continue,
                Err(e) => return Err(e),
            }
        }

        Ok(None)
    }

    /// Open gates, optionally for one workflow, oldest first
    pub async fn pending(&self, workflow_id: Option<&str>) -> Vec<ApprovalRequest> {
        let mut requests: Vec<_> = self
            .index
            .read()
            .await
            .values()
            .filter(|r| workflow_id.map_or(true, |id| r.workflow_id == id))
            .cloned()
            .collect();
        requests.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        requests
    }

    /// Replace the index with the open gates recorded in the store
    pub async fn rebuild_index(&self) -> Result<usize> {
        let requests = self.writer.store().list_approvals(None).await?;
        let mut index = self.index.write().await;
        index.clear();
        for request in requests {
            index.insert(
                (request.workflow_id.clone(), request.phase_id.clone()),
                request,
            );
        }
        Ok(index.len())
    }
}

fn phase_state_mut<'a>(
    wf: &'a mut Workflow,
    phase_id: &str,
) -> Result<&'a mut gantry_core::PhaseState> {
    let workflow_id = wf.id.clone();
    wf.phase_mut(phase_id).ok_or_else(|| GantryError::ApprovalNotFound {
        workflow_id,
        phase_id: phase_id.to_string(),
    })
}

fn complete_gated_phase(wf: &mut Workflow, phase_id: &str, result: Value) -> Result<()> {
    let state = phase_state_mut(wf, phase_id)?;
    state_machine::apply(state, PhaseEvent::Approve)?;
    state.result = Some(result.clone());
    wf.record_artifacts(&result);
    Ok(())
}

/// Mark a workflow cancelled and force-skip its live phases
pub(crate) fn cancel_in_place(
    wf: &mut Workflow,
    actor: &str,
    reason: &str,
    audit: &mut Vec<AuditLogEntry>,
) -> Result<()> {
    let previous = wf.status;
    let workflow_id = wf.id.clone();

    for phase in wf.phases.iter_mut().filter(|p| !p.status.is_terminal()) {
        state_machine::apply(phase, PhaseEvent::ForceSkip)?;
        audit.push(AuditLogEntry::new(
            &workflow_id,
            "phase_force_skipped",
            Some(&phase.phase_id),
            actor,
            json!({ "reason": reason }),
        ));
    }

    wf.status = WorkflowStatus::Cancelled;
    wf.current_phase = None;
    audit.push(AuditLogEntry::new(
        &workflow_id,
        "workflow_cancelled",
        None,
        actor,
        json!({ "previous": previous, "reason": reason }),
    ));
    Ok(())
}
