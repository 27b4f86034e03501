//! Serialized workflow writes
//!
//! Every mutation of a workflow goes through [`WorkflowWriter`]: take the
//! workflow's own lock, load, change, commit to the store, refresh the
//! cache. Different workflows never contend. The cache only saves a read;
//! the store stays authoritative and [`WorkflowWriter::invalidate`] drops
//! everything on recovery.
//!
//! Terminal workflows are not cached, and a workflow's lock entry is
//! removed once no guard or waiter refers to it, so a long-running service
//! only holds state for workflows still in progress.

use chrono::Utc;
use gantry_core::{ApprovalRequest, AuditLogEntry, Result, Workflow};
use gantry_store::{StateStore, WorkflowUpdate};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::trace;

use crate::activity_logger::ActivityLogger;

/// Side effects recorded alongside a workflow change
#[derive(Debug, Default)]
pub struct Changes {
    pub audit: Vec<AuditLogEntry>,
    pub opened: Option<ApprovalRequest>,
    pub closed: Vec<String>,
}

impl Changes {
    pub fn record(&mut self, entry: AuditLogEntry) {
        self.audit.push(entry);
    }

    fn is_empty(&self) -> bool {
        self.audit.is_empty() && self.opened.is_none() && self.closed.is_empty()
    }
}

/// Per-workflow locks; only touched without awaiting
type LockTable = Arc<std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>>;

/// Guard proving the caller holds a workflow's write lock
pub struct WorkflowGuard {
    workflow_id: String,
    guard: Option<OwnedMutexGuard<()>>,
    locks: LockTable,
}

impl Drop for WorkflowGuard {
    fn drop(&mut self) {
        // Release first so an idle entry is referenced by the table alone
        drop(self.guard.take());

        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        let idle = locks
            .get(&self.workflow_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1);
        if idle {
            locks.remove(&self.workflow_id);
        }
    }
}

/// Single-writer-per-workflow access to persisted workflow state
pub struct WorkflowWriter {
    store: Arc<StateStore>,
    locks: LockTable,
    cache: RwLock<HashMap<String, Workflow>>,
    activity: Option<Arc<ActivityLogger>>,
}

impl WorkflowWriter {
    pub fn new(store: Arc<StateStore>, activity: Option<Arc<ActivityLogger>>) -> Self {
        Self {
            store,
            locks: Arc::new(std::sync::Mutex::new(HashMap::new())),
            cache: RwLock::new(HashMap::new()),
            activity,
        }
    }

    pub fn store(&self) -> &Arc<StateStore> {
        &self.store
    }

    pub fn activity(&self) -> Option<&Arc<ActivityLogger>> {
        self.activity.as_ref()
    }

    /// Acquire the write lock for one workflow
    pub async fn lock(&self, workflow_id: &str) -> WorkflowGuard {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks
                .entry(workflow_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        WorkflowGuard {
            workflow_id: workflow_id.to_string(),
            guard: Some(lock.lock_owned().await),
            locks: self.locks.clone(),
        }
    }

    /// Current state of a workflow, from cache or store
    pub async fn load(&self, workflow_id: &str) -> Result<Workflow> {
        if let Some(wf) = self.cache.read().await.get(workflow_id) {
            return Ok(wf.clone());
        }

        let wf = self.store.load_workflow(workflow_id).await?;
        if !wf.is_terminal() {
            self.cache
                .write()
                .await
                .insert(workflow_id.to_string(), wf.clone());
        }
        Ok(wf)
    }

    /// Persist a brand-new workflow
    pub async fn create(&self, workflow: &Workflow, audit: Vec<AuditLogEntry>) -> Result<()> {
        let guard = self.lock(&workflow.id).await;
        if let Some(activity) = &self.activity {
            activity.log_started(workflow).await;
        }
        let mut wf = workflow.clone();
        self.persist(
            &guard,
            &mut wf,
            Changes {
                audit,
                ..Default::default()
            },
        )
        .await
    }

    /// Commit a changed workflow while holding its lock
    pub async fn persist(
        &self,
        _guard: &WorkflowGuard,
        workflow: &mut Workflow,
        changes: Changes,
    ) -> Result<()> {
        workflow.updated_at = Utc::now();

        self.store
            .commit(WorkflowUpdate {
                workflow,
                opened: changes.opened.as_ref(),
                closed: &changes.closed,
                audit: &changes.audit,
            })
            .await?;

        trace!(
            "Committed workflow {} ({}, {} audit entries)",
            workflow.id,
            workflow.status,
            changes.audit.len()
        );

        {
            let mut cache = self.cache.write().await;
            if workflow.is_terminal() {
                cache.remove(&workflow.id);
            } else {
                cache.insert(workflow.id.clone(), workflow.clone());
            }
        }

        if let Some(activity) = &self.activity {
            activity.log_entries(&changes.audit).await;
        }
        Ok(())
    }

    /// Lock, load, apply `f`, and commit if anything changed
    ///
    /// If `f` fails nothing is written and the error is returned.
    pub async fn mutate<T, F>(&self, workflow_id: &str, f: F) -> Result<T>
    where
        F: FnOnce(&mut Workflow, &mut Changes) -> Result<T>,
    {
        let guard = self.lock(workflow_id).await;
        let mut wf = self.load(workflow_id).await?;
        let before = wf.clone();
        let mut changes = Changes::default();

        let out = f(&mut wf, &mut changes)?;

        if wf != before || !changes.is_empty() {
            self.persist(&guard, &mut wf, changes).await?;
        }
        Ok(out)
    }

    /// Drop every cached workflow
    pub async fn invalidate(&self) {
        self.cache.write().await.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::{
        ApprovalMode, PhaseStatus, PhaseTemplate, WorkflowDefinition, WorkflowStatus,
    };
    use serde_json::json;
    use tempfile::TempDir;

    async fn writer(dir: &TempDir) -> WorkflowWriter {
        let store = StateStore::open(dir.path().join("gantry.db")).await.unwrap();
        store.init_schema().await.unwrap();
        WorkflowWriter::new(Arc::new(store), None)
    }

    fn workflow() -> Workflow {
        let def = WorkflowDefinition {
            id: "d".to_string(),
            name: "D".to_string(),
            technology: "rust".to_string(),
            phases: vec![PhaseTemplate {
                id: "p".to_string(),
                name: "P".to_string(),
                description: String::new(),
                agent_type: "w".to_string(),
                method: "m".to_string(),
                dependencies: vec![],
                approval_required: false,
                timeout: 1,
                max_retries: 0,
            }],
            config: Default::default(),
        };
        Workflow::new(&def, "r", "/tmp/out", ApprovalMode::Interactive)
    }

    #[tokio::test]
    async fn test_mutate_persists_changes() {
        let dir = TempDir::new().unwrap();
        let writer = writer(&dir).await;
        let wf = workflow();
        writer.create(&wf, vec![]).await.unwrap();

        writer
            .mutate(&wf.id, |wf, changes| {
                wf.phase_mut("p").unwrap().status = PhaseStatus::Running;
                changes.record(AuditLogEntry::system(
                    &wf.id,
                    "phase_started",
                    Some("p"),
                    json!({}),
                ));
                Ok(())
            })
            .await
            .unwrap();

        writer.invalidate().await;
        let reloaded = writer.load(&wf.id).await.unwrap();
        assert_eq!(reloaded.phase("p").unwrap().status, PhaseStatus::Running);
        assert_eq!(writer.store().audit_log(&wf.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_mutation_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let writer = writer(&dir).await;
        let wf = workflow();
        writer.create(&wf, vec![]).await.unwrap();

        let result: Result<()> = writer
            .mutate(&wf.id, |wf, _| {
                wf.phase_mut("p").unwrap().status = PhaseStatus::Failed;
                Err(gantry_core::GantryError::Validation("nope".to_string()))
            })
            .await;
        assert!(result.is_err());

        let reloaded = writer.load(&wf.id).await.unwrap();
        assert_eq!(reloaded.phase("p").unwrap().status, PhaseStatus::Pending);
    }

    #[tokio::test]
    async fn test_concurrent_mutations_are_serialized() {
        let dir = TempDir::new().unwrap();
        let writer = Arc::new(writer(&dir).await);
        let wf = workflow();
        writer.create(&wf, vec![]).await.unwrap();

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let writer = writer.clone();
                let id = wf.id.clone();
                tokio::spawn(async move {
                    writer
                        .mutate(&id, |wf, _| {
                            wf.phase_mut("p").unwrap().retry_count += 1;
                            Ok(())
                        })
                        .await
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        writer.invalidate().await;
        let reloaded = writer.load(&wf.id).await.unwrap();
        assert_eq!(reloaded.phase("p").unwrap().retry_count, 10);
        assert!(writer.locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_finished_workflows_are_not_retained() {
        let dir = TempDir::new().unwrap();
        let writer = writer(&dir).await;
        let wf = workflow();
        writer.create(&wf, vec![]).await.unwrap();
        assert!(writer.cache.read().await.contains_key(&wf.id));
        assert!(writer.locks.lock().unwrap().is_empty());

        {
            let _held = writer.lock(&wf.id).await;
            assert_eq!(writer.locks.lock().unwrap().len(), 1);
        }
        assert!(writer.locks.lock().unwrap().is_empty());

        writer
            .mutate(&wf.id, |wf, _| {
                wf.status = WorkflowStatus::Completed;
                Ok(())
            })
            .await
            .unwrap();
        assert!(writer.cache.read().await.is_empty());
        assert!(writer.locks.lock().unwrap().is_empty());

        let reloaded = writer.load(&wf.id).await.unwrap();
        assert_eq!(reloaded.status, WorkflowStatus::Completed);
        assert!(writer.cache.read().await.is_empty());
    }
}
