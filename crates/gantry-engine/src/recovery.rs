//! Restart recovery
//!
//! After a restart no worker is running, so any phase persisted as running
//! was interrupted. The interrupted attempt counts against the phase's
//! retry budget: phases with retries left go back to pending, the rest fail
//! with `RetriesExhausted`. The approval index is rebuilt from the store.

use gantry_core::{AuditLogEntry, GantryError, PhaseStatus, Result};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::gateway::ApprovalGateway;
use crate::persistence::WorkflowWriter;
use crate::registry::DefinitionRegistry;
use crate::scheduler;
use crate::state_machine::{self, PhaseEvent};

/// What recovery found
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    pub workflows: Vec<String>,
    pub recovered_phases: usize,
    /// Interrupted phases that had no retries left
    pub failed_phases: usize,
    pub open_approvals: usize,
}

pub struct RecoveryManager {
    writer: Arc<WorkflowWriter>,
    registry: Arc<DefinitionRegistry>,
    gateway: Arc<ApprovalGateway>,
}

impl RecoveryManager {
    pub fn new(
        writer: Arc<WorkflowWriter>,
        registry: Arc<DefinitionRegistry>,
        gateway: Arc<ApprovalGateway>,
    ) -> Self {
        Self {
            writer,
            registry,
            gateway,
        }
    }

    /// Reconcile every non-terminal workflow with the fact that nothing is running
    pub async fn recover(&self) -> Result<RecoveryReport> {
        self.writer.invalidate().await;
        let open_approvals = self.gateway.rebuild_index().await?;

        let mut report = RecoveryReport {
            open_approvals,
            ..Default::default()
        };

        for wf in self.writer.store().list_active_workflows().await? {
            let definition = match self.registry.get(&wf.definition_id) {
                Ok(definition) => definition,
                Err(e) => {
                    warn!(workflow_id = %wf.id, "Skipping recovery: {}", e);
                    continue;
                }
            };

            let (recovered, failed) = self
                .writer
                .mutate(&wf.id, |wf, changes| {
                    let workflow_id = wf.id.clone();
                    let (mut recovered, mut failed) = (0, 0);
                    for phase in wf
                        .phases
                        .iter_mut()
                        .filter(|p| p.status == PhaseStatus::Running)
                    {
                        let max_retries = definition
                            .phase(&phase.phase_id)
                            .map(|t| t.max_retries)
                            .unwrap_or(0);

                        if phase.retry_count < max_retries {
                            state_machine::apply(phase, PhaseEvent::Recover)?;
                            changes.record(AuditLogEntry::system(
                                &workflow_id,
                                "phase_recovered",
                                Some(&phase.phase_id),
                                json!({ "retry_count": phase.retry_count }),
                            ));
                            recovered += 1;
                            continue;
                        }

                        let attempts = phase.retry_count + 1;
                        let reason = GantryError::RetriesExhausted {
                            phase_id: phase.phase_id.clone(),
                            attempts,
                            last_error: "interrupted by restart".to_string(),
                        }
                        .to_string();
                        state_machine::apply(phase, PhaseEvent::Fail)?;
                        phase.error = Some(reason.clone());

                        error!(
                            workflow_id = %workflow_id,
                            phase_id = %phase.phase_id,
                            "{}",
                            reason
                        );
                        changes.record(AuditLogEntry::system(
                            &workflow_id,
                            "phase_failed",
                            Some(&phase.phase_id),
                            json!({ "error": reason, "attempts": attempts }),
                        ));
                        failed += 1;
                    }
                    scheduler::refresh_status(definition, wf, &mut changes.audit)?;
                    Ok((recovered, failed))
                })
                .await?;

            if recovered + failed > 0 {
                info!(
                    workflow_id = %wf.id,
                    "Recovered {} interrupted phase(s), failed {}",
                    recovered,
                    failed
                );
            }
            report.recovered_phases += recovered;
            report.failed_phases += failed;
            report.workflows.push(wf.id);
        }

        Ok(report)
    }
}
