//! Core type definitions for Gantry workflows

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::time::Duration;
use uuid::Uuid;

use crate::{GantryError, Result};

/// Actor recorded for decisions the engine takes on its own
pub const SYSTEM_ACTOR: &str = "system";

/// Default phase timeout in seconds
pub const DEFAULT_PHASE_TIMEOUT_SECS: u64 = 300;

/// Aggregate status of a workflow instance
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    #[default]
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl WorkflowStatus {
    /// Terminal workflows never transition again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for WorkflowStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "running" => Ok(Self::Running),
            "paused" => Ok(Self::Paused),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" | "canceled" => Ok(Self::Cancelled),
            _ => Err(format!("Invalid workflow status: {}", s)),
        }
    }
}

/// Runtime status of a single phase
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    #[default]
    Pending,
    Running,
    Completed,
    Failed,
    WaitingApproval,
    Skipped,
}

impl PhaseStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    /// Whether dependents may treat this phase as done
    pub fn satisfies_dependency(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::WaitingApproval => "waiting_approval",
            Self::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for PhaseStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(Self::Pending),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "waiting_approval" | "waitingapproval" => Ok(Self::WaitingApproval),
            "skipped" => Ok(Self::Skipped),
            _ => Err(format!("Invalid phase status: {}", s)),
        }
    }
}

/// How approval gates are handled for a workflow
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalMode {
    #[default]
    Interactive,
    AutoApprove,
    Batch,
}

impl std::fmt::Display for ApprovalMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Interactive => write!(f, "interactive"),
            Self::AutoApprove => write!(f, "auto_approve"),
            Self::Batch => write!(f, "batch"),
        }
    }
}

impl std::str::FromStr for ApprovalMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "interactive" => Ok(Self::Interactive),
            "auto_approve" | "auto-approve" | "auto" => Ok(Self::AutoApprove),
            "batch" => Ok(Self::Batch),
            _ => Err(format!(
                "Invalid approval mode: {}. Use interactive, auto_approve, or batch.",
                s
            )),
        }
    }
}

/// Whether eligible phases are dispatched one at a time or together
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    #[default]
    Serial,
    Parallel,
}

impl std::str::FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "serial" => Ok(Self::Serial),
            "parallel" => Ok(Self::Parallel),
            _ => Err(format!("Invalid execution mode: {}", s)),
        }
    }
}

/// Actions a reviewer may take on an approval request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApprovalAction {
    Approve,
    Modify,
    Retry,
    Skip,
    Cancel,
}

impl ApprovalAction {
    pub const ALL: [ApprovalAction; 5] = [
        Self::Approve,
        Self::Modify,
        Self::Retry,
        Self::Skip,
        Self::Cancel,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Modify => "modify",
            Self::Retry => "retry",
            Self::Skip => "skip",
            Self::Cancel => "cancel",
        }
    }
}

impl std::fmt::Display for ApprovalAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ApprovalAction {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "approve" => Ok(Self::Approve),
            "modify" => Ok(Self::Modify),
            "retry" => Ok(Self::Retry),
            "skip" => Ok(Self::Skip),
            "cancel" => Ok(Self::Cancel),
            _ => Err(format!(
                "Invalid approval action: {}. Use approve, modify, retry, skip, or cancel.",
                s
            )),
        }
    }
}

/// A decision on an open approval request
///
/// Only `Modify` must carry a payload; `Approve` may carry modifications that
/// are merged over the captured result.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Decision {
    Approve {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        modifications: Option<Value>,
    },
    Modify {
        modifications: Value,
    },
    Retry,
    Skip,
    Cancel,
}

impl Decision {
    /// Build a decision from a loose action/payload pair
    pub fn from_action(action: ApprovalAction, modifications: Option<Value>) -> Result<Self> {
        match (action, modifications) {
            (ApprovalAction::Approve, modifications) => Ok(Self::Approve { modifications }),
            (ApprovalAction::Modify, Some(modifications)) => Ok(Self::Modify { modifications }),
            (ApprovalAction::Modify, None) => Err(GantryError::Validation(
                "modify requires a modifications payload".to_string(),
            )),
            (action, Some(_)) => Err(GantryError::Validation(format!(
                "{} does not accept modifications",
                action
            ))),
            (ApprovalAction::Retry, None) => Ok(Self::Retry),
            (ApprovalAction::Skip, None) => Ok(Self::Skip),
            (ApprovalAction::Cancel, None) => Ok(Self::Cancel),
        }
    }

    pub fn action(&self) -> ApprovalAction {
        match self {
            Self::Approve { .. } => ApprovalAction::Approve,
            Self::Modify { .. } => ApprovalAction::Modify,
            Self::Retry => ApprovalAction::Retry,
            Self::Skip => ApprovalAction::Skip,
            Self::Cancel => ApprovalAction::Cancel,
        }
    }
}

fn default_phase_timeout() -> u64 {
    DEFAULT_PHASE_TIMEOUT_SECS
}

/// One step of a workflow definition, bound to a worker operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseTemplate {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub agent_type: String,
    pub method: String,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub approval_required: bool,
    /// Timeout in seconds
    #[serde(default = "default_phase_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub max_retries: u32,
}

impl PhaseTemplate {
    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

/// Immutable workflow template loaded from a definition document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    pub id: String,
    pub name: String,
    pub technology: String,
    pub phases: Vec<PhaseTemplate>,
    #[serde(default)]
    pub config: Map<String, Value>,
}

impl WorkflowDefinition {
    pub fn phase(&self, phase_id: &str) -> Option<&PhaseTemplate> {
        self.phases.iter().find(|p| p.id == phase_id)
    }

    /// Declaration order of a phase
    pub fn phase_index(&self, phase_id: &str) -> Option<usize> {
        self.phases.iter().position(|p| p.id == phase_id)
    }

    /// Phases that list `phase_id` as a direct dependency, in declaration order
    pub fn dependents<'a>(&'a self, phase_id: &'a str) -> impl Iterator<Item = &'a PhaseTemplate> {
        self.phases
            .iter()
            .filter(move |p| p.dependencies.iter().any(|d| d == phase_id))
    }

    /// Execution mode override from the definition's config map
    pub fn execution_mode(&self) -> Option<ExecutionMode> {
        self.config
            .get("execution_mode")
            .and_then(Value::as_str)
            .and_then(|s| s.parse().ok())
    }

    /// Concurrency limit override from the definition's config map
    pub fn max_parallel_phases(&self) -> Option<usize> {
        self.config
            .get("max_parallel_phases")
            .and_then(Value::as_u64)
            .map(|n| n as usize)
    }
}

/// Runtime state of one phase within a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseState {
    pub phase_id: String,
    pub status: PhaseStatus,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
}

impl PhaseState {
    pub fn pending(phase_id: impl Into<String>) -> Self {
        Self {
            phase_id: phase_id.into(),
            status: PhaseStatus::Pending,
            result: None,
            error: None,
            retry_count: 0,
            started_at: None,
            finished_at: None,
        }
    }
}

/// A named output produced by a phase
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub name: String,
    pub kind: String,
    pub path: String,
    pub workflow_id: String,
}

impl Artifact {
    /// Extract artifacts declared in a worker result under `artifacts`
    ///
    /// Entries without a name or path are ignored; `kind` defaults to `file`.
    pub fn collect(workflow_id: &str, data: &Value) -> Vec<Artifact> {
        let Some(entries) = data.get("artifacts").and_then(Value::as_array) else {
            return Vec::new();
        };

        entries
            .iter()
            .filter_map(|entry| {
                let name = entry.get("name")?.as_str()?;
                let path = entry.get("path")?.as_str()?;
                let kind = entry.get("kind").and_then(Value::as_str).unwrap_or("file");
                Some(Artifact {
                    name: name.to_string(),
                    kind: kind.to_string(),
                    path: path.to_string(),
                    workflow_id: workflow_id.to_string(),
                })
            })
            .collect()
    }
}

/// Mutable workflow instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub definition_id: String,
    pub status: WorkflowStatus,
    pub requirements: String,
    pub technology: String,
    pub output_path: String,
    pub approval_mode: ApprovalMode,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub current_phase: Option<String>,
    pub phases: Vec<PhaseState>,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
    #[serde(default)]
    pub error: Option<String>,
}

impl Workflow {
    /// Instantiate a definition with every phase pending
    pub fn new(
        definition: &WorkflowDefinition,
        requirements: impl Into<String>,
        output_path: impl Into<String>,
        approval_mode: ApprovalMode,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            definition_id: definition.id.clone(),
            status: WorkflowStatus::Running,
            requirements: requirements.into(),
            technology: definition.technology.clone(),
            output_path: output_path.into(),
            approval_mode,
            created_at: now,
            updated_at: now,
            current_phase: None,
            phases: definition
                .phases
                .iter()
                .map(|p| PhaseState::pending(p.id.clone()))
                .collect(),
            artifacts: Vec::new(),
            error: None,
        }
    }

    pub fn phase(&self, phase_id: &str) -> Option<&PhaseState> {
        self.phases.iter().find(|p| p.phase_id == phase_id)
    }

    pub fn phase_mut(&mut self, phase_id: &str) -> Option<&mut PhaseState> {
        self.phases.iter_mut().find(|p| p.phase_id == phase_id)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Share of phases that are completed or skipped, 0-100
    pub fn progress_percentage(&self) -> f64 {
        if self.phases.is_empty() {
            return 100.0;
        }
        let done = self
            .phases
            .iter()
            .filter(|p| p.status.satisfies_dependency())
            .count();
        (done as f64 / self.phases.len() as f64) * 100.0
    }

    /// Record artifacts declared by a completed phase's result
    pub fn record_artifacts(&mut self, data: &Value) {
        for artifact in Artifact::collect(&self.id, data) {
            if !self.artifacts.contains(&artifact) {
                self.artifacts.push(artifact);
            }
        }
    }
}

/// A suspension point awaiting an external decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub id: String,
    pub workflow_id: String,
    pub phase_id: String,
    pub phase_name: String,
    /// Snapshot of the phase result awaiting judgment
    pub result: Value,
    pub next_phase: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
    pub allowed_actions: Vec<ApprovalAction>,
    /// Retry count restored when the reviewer asks for a retry
    #[serde(default)]
    pub retry_count_at_gate: u32,
}

impl ApprovalRequest {
    pub fn new(
        workflow_id: impl Into<String>,
        phase: &PhaseTemplate,
        result: Value,
        next_phase: Option<String>,
        retry_count_at_gate: u32,
        expiry: Option<Duration>,
    ) -> Result<Self> {
        let created_at = Utc::now();
        let expires_at = match expiry {
            Some(expiry) => Some(
                chrono::Duration::from_std(expiry)
                    .ok()
                    .and_then(|d| created_at.checked_add_signed(d))
                    .ok_or_else(|| {
                        GantryError::Config(format!(
                            "approval expiry of {}s is out of range",
                            expiry.as_secs()
                        ))
                    })?,
            ),
            None => None,
        };

        Ok(Self {
            id: Uuid::new_v4().to_string(),
            workflow_id: workflow_id.into(),
            phase_id: phase.id.clone(),
            phase_name: phase.name.clone(),
            result,
            next_phase,
            created_at,
            expires_at,
            allowed_actions: ApprovalAction::ALL.to_vec(),
            retry_count_at_gate,
        })
    }

    pub fn allows(&self, action: ApprovalAction) -> bool {
        self.allowed_actions.contains(&action)
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Append-only record of an action taken on a workflow
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditLogEntry {
    pub id: String,
    pub workflow_id: String,
    pub action: String,
    pub phase_id: Option<String>,
    pub actor: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl AuditLogEntry {
    pub fn new(
        workflow_id: impl Into<String>,
        action: impl Into<String>,
        phase_id: Option<&str>,
        actor: impl Into<String>,
        data: Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            workflow_id: workflow_id.into(),
            action: action.into(),
            phase_id: phase_id.map(str::to_string),
            actor: actor.into(),
            data,
            timestamp: Utc::now(),
        }
    }

    /// Entry recorded by the engine itself
    pub fn system(
        workflow_id: impl Into<String>,
        action: impl Into<String>,
        phase_id: Option<&str>,
        data: Value,
    ) -> Self {
        Self::new(workflow_id, action, phase_id, SYSTEM_ACTOR, data)
    }
}

/// Shallow-merge `overlay` into `base`
///
/// Object keys from `overlay` replace keys in `base`; a non-object on either
/// side replaces `base` entirely.
pub fn merge_json(base: &mut Value, overlay: &Value) {
    match (base.as_object_mut(), overlay.as_object()) {
        (Some(base_map), Some(overlay_map)) => {
            for (key, value) in overlay_map {
                base_map.insert(key.clone(), value.clone());
            }
        }
        _ => *base = overlay.clone(),
    }
}
