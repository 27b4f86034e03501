//! Workflow Controller
//!
//! Drives workflows forward one tick at a time. A tick expires overdue
//! gates, asks the scheduler which phases to dispatch, runs them through the
//! executor concurrently, and recomputes the aggregate status.

use chrono::Utc;
use futures::future::join_all;
use gantry_core::{ExecutionConfig, Result, WorkflowStatus};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::executor::{PhaseExecutor, PhaseOutcome};
use crate::gateway::ApprovalGateway;
use crate::persistence::WorkflowWriter;
use crate::registry::DefinitionRegistry;
use crate::scheduler;

/// What one tick did
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub status: WorkflowStatus,
    pub dispatched: usize,
    pub outcomes: Vec<(String, PhaseOutcome)>,
}

pub struct WorkflowController {
    writer: Arc<WorkflowWriter>,
    registry: Arc<DefinitionRegistry>,
    executor: Arc<PhaseExecutor>,
    gateway: Arc<ApprovalGateway>,
    execution: ExecutionConfig,
}

impl WorkflowController {
    pub fn new(
        writer: Arc<WorkflowWriter>,
        registry: Arc<DefinitionRegistry>,
        executor: Arc<PhaseExecutor>,
        gateway: Arc<ApprovalGateway>,
        execution: ExecutionConfig,
    ) -> Self {
        Self {
            writer,
            registry,
            executor,
            gateway,
            execution,
        }
    }

    /// Advance a workflow by one scheduling round
    pub async fn tick(&self, workflow_id: &str) -> Result<TickReport> {
        if let Some(expired) = self.gateway.expire_overdue(workflow_id, Utc::now()).await? {
            if expired.workflow_status.is_terminal() {
                self.finish(workflow_id).await?;
            }
        }

        let wf = self.writer.load(workflow_id).await?;
        if wf.is_terminal() {
            return Ok(TickReport {
                status: wf.status,
                dispatched: 0,
                outcomes: Vec::new(),
            });
        }

        let definition = self.registry.get(&wf.definition_id)?;
        let mode = definition.execution_mode().unwrap_or(self.execution.mode);
        let limit = definition
            .max_parallel_phases()
            .unwrap_or(self.execution.max_parallel_phases);

        let selected = scheduler::select_for_dispatch(definition, &wf, mode, limit);
        debug!(
            workflow_id,
            "Dispatching {} phase(s) in {:?} mode",
            selected.len(),
            mode
        );

        let results = join_all(
            selected
                .iter()
                .map(|phase| self.executor.execute(definition, workflow_id, phase)),
        )
        .await;

        let mut outcomes = Vec::with_capacity(selected.len());
        let mut first_error = None;
        for (phase, result) in selected.iter().zip(results) {
            match result {
                Ok(outcome) => outcomes.push((phase.id.clone(), outcome)),
                Err(e) => {
                    error!(workflow_id, phase_id = %phase.id, "Phase execution error: {}", e);
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        let status = self
            .writer
            .mutate(workflow_id, |wf, changes| {
                scheduler::refresh_status(definition, wf, &mut changes.audit)
            })
            .await?;

        if status.is_terminal() {
            self.finish(workflow_id).await?;
        }

        Ok(TickReport {
            status,
            dispatched: selected.len(),
            outcomes,
        })
    }

    /// Tick until the workflow is terminal or waiting on a person
    pub async fn run_until_settled(&self, workflow_id: &str) -> Result<WorkflowStatus> {
        let interval = Duration::from_millis(self.execution.tick_interval_ms);

        loop {
            let report = self.tick(workflow_id).await?;
            match report.status {
                status if status.is_terminal() => return Ok(status),
                WorkflowStatus::Paused => {
                    info!(workflow_id, "Workflow paused awaiting approval");
                    return Ok(WorkflowStatus::Paused);
                }
                _ if report.dispatched == 0 => tokio::time::sleep(interval).await,
                _ => {}
            }
        }
    }

    /// Write the closing activity summary for a terminal workflow
    pub async fn finish(&self, workflow_id: &str) -> Result<()> {
        let wf = self.writer.load(workflow_id).await?;
        info!(workflow_id, "Workflow finished: {}", wf.status);
        if let Some(activity) = self.writer.activity() {
            activity.log_summary(&wf).await;
        }
        Ok(())
    }
}
