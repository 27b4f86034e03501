//! # gantry-engine
//!
//! Workflow orchestration engine for Gantry.
//!
//! This crate provides:
//! - Definition registry with load-time validation
//! - Dependency scheduling and aggregate status
//! - Phase execution with timeouts and bounded retries
//! - Approval gates and decisions
//! - Restart recovery from the durable store
//! - The control-plane service used by the CLI

mod activity_logger;
mod controller;
mod executor;
mod gateway;
mod persistence;
mod recovery;
mod registry;
pub mod scheduler;
mod service;
pub mod state_machine;
mod worker;

pub use activity_logger::ActivityLogger;
pub use controller::{TickReport, WorkflowController};
pub use executor::{build_input, PhaseExecutor, PhaseOutcome};
pub use gateway::{ApprovalGateway, DecisionOutcome, EXPIRY_ACTOR};
pub use persistence::{Changes, WorkflowGuard, WorkflowWriter};
pub use recovery::{RecoveryManager, RecoveryReport};
pub use registry::{parse_json, parse_toml, validate_definition, DefinitionRegistry};
pub use service::{ApprovalResponse, StartedWorkflow, WorkflowService, WorkflowStatusView};
pub use worker::{CommandWorker, FnWorker, Worker, WorkerRegistry, WorkerResponse};
