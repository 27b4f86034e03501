//! # gantry-core
//!
//! Core types for the Gantry workflow orchestrator.
//!
//! A workflow definition is a DAG of phases, each bound to a worker
//! operation. Instances of a definition advance phase by phase, pausing at
//! approval gates until a reviewer decides what happens next.

mod config;
mod error;
pub mod fail_open;
mod types;

pub use config::{
    ApprovalConfig, ExecutionConfig, GantryConfig, WorkerConfig, CONFIG_DIR,
    MAX_APPROVAL_EXPIRY_SECS,
};
pub use error::{GantryError, Result};
pub use types::*;
