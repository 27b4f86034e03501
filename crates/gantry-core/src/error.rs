//! Unified error types for Gantry

use thiserror::Error;

/// Unified error type for all Gantry operations
#[derive(Error, Debug)]
pub enum GantryError {
    // Definition errors (load time)
    #[error("Cyclic dependency in definition {definition}: {cycle}")]
    CyclicDependency { definition: String, cycle: String },

    #[error("Invalid workflow definition: {0}")]
    InvalidDefinition(String),

    #[error("Workflow definition not found: {0}")]
    DefinitionNotFound(String),

    // Phase execution errors
    #[error("Phase {phase_id} timed out after {timeout_secs}s")]
    PhaseTimeout { phase_id: String, timeout_secs: u64 },

    #[error("Worker failure: {0}")]
    WorkerFailure(String),

    #[error("Phase {phase_id} failed after {attempts} attempt(s): {last_error}")]
    RetriesExhausted {
        phase_id: String,
        attempts: u32,
        last_error: String,
    },

    #[error("No worker registered for {agent_type}.{method}")]
    WorkerNotFound { agent_type: String, method: String },

    #[error("Invalid transition for phase {phase_id}: {from} on {event}")]
    InvalidTransition {
        phase_id: String,
        from: String,
        event: String,
    },

    // Caller errors
    #[error("No open approval request for workflow {workflow_id}, phase {phase_id}")]
    ApprovalNotFound {
        workflow_id: String,
        phase_id: String,
    },

    #[error("Action {action} is not allowed for approval {approval_id}")]
    ActionNotAllowed { approval_id: String, action: String },

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    // Infrastructure
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl GantryError {
    /// Errors caused by caller input rather than workflow execution
    pub fn is_caller_error(&self) -> bool {
        matches!(
            self,
            Self::ApprovalNotFound { .. }
                | Self::ActionNotAllowed { .. }
                | Self::WorkflowNotFound(_)
                | Self::DefinitionNotFound(_)
                | Self::Validation(_)
        )
    }
}

/// Result type alias using GantryError
pub type Result<T> = std::result::Result<T, GantryError>;
