//! Gantry Storage - durable state for the workflow engine
//!
//! Everything the engine needs to resume after a restart lives here: the
//! full state of every workflow, the set of open approval gates and the
//! append-only audit trail.
//!
//! # Example Usage
//!
//! ```no_run
//! use gantry_store::StateStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = StateStore::open(".gantry/gantry.db").await?;
//! store.init_schema().await?;
//!
//! for workflow in store.list_active_workflows().await? {
//!     println!("{} is {}", workflow.id, workflow.status);
//! }
//! # Ok(())
//! # }
//! ```

pub mod db;

pub use db::{Result, StateStore, StoreError, WorkflowUpdate};
