//! Control-plane operations
//!
//! [`WorkflowService`] wires the store, registries, gateway, executor and
//! controller together and exposes the operations callers use: start a
//! workflow, inspect it, decide gates, cancel, and drive execution.

use futures::future::join_all;
use gantry_core::{
    ApprovalAction, ApprovalMode, ApprovalRequest, Artifact, AuditLogEntry, Decision,
    GantryConfig, GantryError, PhaseState, Result, Workflow, WorkflowDefinition, WorkflowStatus,
};
use gantry_store::StateStore;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tracing::info;

use crate::activity_logger::ActivityLogger;
use crate::controller::WorkflowController;
use crate::executor::PhaseExecutor;
use crate::gateway::{ApprovalGateway, DecisionOutcome};
use crate::persistence::WorkflowWriter;
use crate::recovery::{RecoveryManager, RecoveryReport};
use crate::registry::DefinitionRegistry;
use crate::worker::WorkerRegistry;

/// Reply to `start_workflow`
#[derive(Debug, Clone, Serialize)]
pub struct StartedWorkflow {
    pub workflow_id: String,
    pub status: WorkflowStatus,
    pub phases: Vec<PhaseState>,
}

/// Reply to `get_workflow_status`
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowStatusView {
    pub workflow_id: String,
    pub status: WorkflowStatus,
    pub phases: Vec<PhaseState>,
    pub progress_percentage: f64,
    pub current_phase: Option<String>,
    pub artifacts: Vec<Artifact>,
    pub error: Option<String>,
}

impl From<&Workflow> for WorkflowStatusView {
    fn from(wf: &Workflow) -> Self {
        Self {
            workflow_id: wf.id.clone(),
            status: wf.status,
            phases: wf.phases.clone(),
            progress_percentage: wf.progress_percentage(),
            current_phase: wf.current_phase.clone(),
            artifacts: wf.artifacts.clone(),
            error: wf.error.clone(),
        }
    }
}

/// Reply to `handle_approval`
#[derive(Debug, Clone, Serialize)]
pub struct ApprovalResponse {
    pub success: bool,
    pub message: String,
}

/// Entry point for every caller-facing operation
pub struct WorkflowService {
    config: GantryConfig,
    registry: Arc<DefinitionRegistry>,
    writer: Arc<WorkflowWriter>,
    gateway: Arc<ApprovalGateway>,
    controller: WorkflowController,
    recovery: RecoveryManager,
}

impl WorkflowService {
    /// Open the configured store and registries
    ///
    /// The approval index is loaded from the store; running phases are left
    /// alone until [`resume`](Self::resume) or [`recover`](Self::recover).
    pub async fn open(config: GantryConfig) -> Result<Self> {
        let store = StateStore::open(&config.database).await?;
        store.init_schema().await?;

        let registry = DefinitionRegistry::from_config(&config)?;
        let workers = WorkerRegistry::from_config(&config.workers);

        let service = Self::new(Arc::new(store), registry, workers, config);
        service.gateway.rebuild_index().await?;
        Ok(service)
    }

    pub fn new(
        store: Arc<StateStore>,
        registry: DefinitionRegistry,
        workers: WorkerRegistry,
        config: GantryConfig,
    ) -> Self {
        let registry = Arc::new(registry);
        let workers = Arc::new(workers);
        let activity = Arc::new(ActivityLogger::new(config.activity_dir()));
        let writer = Arc::new(WorkflowWriter::new(store, Some(activity)));

        let gateway = Arc::new(ApprovalGateway::new(
            writer.clone(),
            registry.clone(),
            config.approval_expiry(),
        ));
        let executor = Arc::new(PhaseExecutor::new(
            writer.clone(),
            workers.clone(),
            gateway.clone(),
        ));
        let controller = WorkflowController::new(
            writer.clone(),
            registry.clone(),
            executor,
            gateway.clone(),
            config.execution.clone(),
        );
        let recovery = RecoveryManager::new(writer.clone(), registry.clone(), gateway.clone());

        Self {
            config,
            registry,
            writer,
            gateway,
            controller,
            recovery,
        }
    }

    pub fn store(&self) -> &Arc<StateStore> {
        self.writer.store()
    }

    /// Create a workflow from the definition for `technology`
    ///
    /// The workflow starts with every phase pending; nothing runs until it
    /// is driven by [`run_workflow`](Self::run_workflow) or a tick.
    pub async fn start_workflow(
        &self,
        requirements: &str,
        technology: &str,
        output_path: &str,
        approval_mode: Option<ApprovalMode>,
    ) -> Result<StartedWorkflow> {
        if requirements.trim().is_empty() {
            return Err(GantryError::Validation(
                "requirements must not be empty".to_string(),
            ));
        }

        let definition = self.registry.by_technology(technology)?;
        let mode = approval_mode.unwrap_or(self.config.approvals.default_mode);
        let wf = Workflow::new(definition, requirements, output_path, mode);

        let audit = vec![AuditLogEntry::system(
            &wf.id,
            "workflow_started",
            None,
            json!({
                "definition_id": definition.id,
                "technology": wf.technology,
                "approval_mode": mode,
                "output_path": wf.output_path,
            }),
        )];
        self.writer.create(&wf, audit).await?;

        info!(workflow_id = %wf.id, definition = %definition.id, "Workflow started");
        Ok(StartedWorkflow {
            workflow_id: wf.id,
            status: wf.status,
            phases: wf.phases,
        })
    }

    pub async fn get_workflow_status(&self, workflow_id: &str) -> Result<WorkflowStatusView> {
        let wf = self.writer.load(workflow_id).await?;
        Ok(WorkflowStatusView::from(&wf))
    }

    /// Record a decision on an open gate
    pub async fn handle_approval(
        &self,
        workflow_id: &str,
        phase_id: &str,
        action: ApprovalAction,
        modifications: Option<Value>,
        actor: &str,
    ) -> Result<ApprovalResponse> {
        let decision = Decision::from_action(action, modifications)?;
        let outcome = self.decide(workflow_id, phase_id, decision, actor).await?;
        Ok(ApprovalResponse {
            success: true,
            message: outcome.message,
        })
    }

    /// Like [`handle_approval`](Self::handle_approval) with the full outcome
    pub async fn decide(
        &self,
        workflow_id: &str,
        phase_id: &str,
        decision: Decision,
        actor: &str,
    ) -> Result<DecisionOutcome> {
        let outcome = self
            .gateway
            .decide(workflow_id, phase_id, decision, actor)
            .await?;
        if outcome.workflow_status.is_terminal() {
            self.controller.finish(workflow_id).await?;
        }
        Ok(outcome)
    }

    /// Open gates across all workflows, oldest first
    pub async fn get_pending_approvals(&self) -> Vec<ApprovalRequest> {
        self.gateway.pending(None).await
    }

    pub fn get_workflow_definitions(&self) -> Vec<WorkflowDefinition> {
        self.registry.list().into_iter().cloned().collect()
    }

    pub async fn cancel_workflow(
        &self,
        workflow_id: &str,
        actor: &str,
    ) -> Result<WorkflowStatusView> {
        let wf = self
            .gateway
            .cancel_workflow(workflow_id, actor, "cancelled by request")
            .await?;
        self.controller.finish(workflow_id).await?;
        Ok(WorkflowStatusView::from(&wf))
    }

    /// Approve every open gate of one workflow
    pub async fn approve_all(
        &self,
        workflow_id: &str,
        actor: &str,
    ) -> Result<Vec<DecisionOutcome>> {
        let outcomes = self.gateway.approve_all(workflow_id, actor).await?;
        if outcomes.iter().any(|o| o.workflow_status.is_terminal()) {
            self.controller.finish(workflow_id).await?;
        }
        Ok(outcomes)
    }

    pub async fn list_workflows(&self, status: Option<WorkflowStatus>) -> Result<Vec<Workflow>> {
        Ok(self.store().list_workflows(status).await?)
    }

    pub async fn get_audit_log(&self, workflow_id: &str) -> Result<Vec<AuditLogEntry>> {
        // Distinguish an unknown workflow from one with no history
        self.writer.load(workflow_id).await?;
        Ok(self.store().audit_log(workflow_id).await?)
    }

    /// Advance a workflow by one scheduling round
    pub async fn tick(&self, workflow_id: &str) -> Result<WorkflowStatus> {
        Ok(self.controller.tick(workflow_id).await?.status)
    }

    /// Drive a workflow until it is terminal or waiting on a gate
    pub async fn run_workflow(&self, workflow_id: &str) -> Result<WorkflowStatusView> {
        self.controller.run_until_settled(workflow_id).await?;
        self.get_workflow_status(workflow_id).await
    }

    /// Rebuild in-memory state from the store and requeue interrupted phases
    pub async fn recover(&self) -> Result<RecoveryReport> {
        let report = self.recovery.recover().await?;
        if report.failed_phases > 0 {
            // Failing an interrupted phase may have ended its workflow
            for id in &report.workflows {
                if self.writer.load(id).await?.is_terminal() {
                    self.controller.finish(id).await?;
                }
            }
        }
        info!(
            workflows = report.workflows.len(),
            recovered_phases = report.recovered_phases,
            failed_phases = report.failed_phases,
            open_approvals = report.open_approvals,
            "Recovery complete"
        );
        Ok(report)
    }

    /// Recover, then drive every non-terminal workflow concurrently
    pub async fn resume(&self) -> Result<Vec<WorkflowStatusView>> {
        let report = self.recover().await?;

        let results = join_all(report.workflows.iter().map(|id| self.run_workflow(id))).await;
        results.into_iter().collect()
    }
}
