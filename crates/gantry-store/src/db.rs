//! Durable state store for Gantry using Turso.
//!
//! Layout:
//!   - Database file: .gantry/gantry.db (WAL mode)
//!   - workflows: one row per instance, full state as JSON in `data`
//!   - approvals: open approval requests only, unique per (workflow, phase)
//!   - audit_log: append-only, ordered by insertion sequence
//!
//! Multi-row changes (a workflow update plus its gate and audit rows) go
//! through a single transaction so a crash never leaves them out of step.

use chrono::{DateTime, Utc};
use gantry_core::{ApprovalRequest, AuditLogEntry, GantryError, Workflow, WorkflowStatus};
use std::path::Path;
use tokio::sync::Mutex;
use tracing::debug;
use turso::{params, Builder, Connection};

/// Turso-backed store for workflows, approvals and the audit trail
pub struct StateStore {
    conn: Mutex<Connection>,
}

/// Storage errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("turso error: {0}")]
    Turso(#[from] turso::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

impl From<StoreError> for GantryError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::WorkflowNotFound(id) => GantryError::WorkflowNotFound(id),
            other => GantryError::Storage(other.to_string()),
        }
    }
}

/// Everything written by one state change of a workflow
#[derive(Debug, Clone, Copy)]
pub struct WorkflowUpdate<'a> {
    pub workflow: &'a Workflow,
    pub opened: Option<&'a ApprovalRequest>,
    pub closed: &'a [String],
    pub audit: &'a [AuditLogEntry],
}

const UPSERT_WORKFLOW: &str = r#"
    INSERT INTO workflows (
        id, definition_id, status, technology, approval_mode,
        data, created_at, updated_at
    ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT(id) DO UPDATE SET
        status = excluded.status,
        approval_mode = excluded.approval_mode,
        data = excluded.data,
        updated_at = excluded.updated_at
"#;

const INSERT_APPROVAL: &str = r#"
    INSERT INTO approvals (id, workflow_id, phase_id, data, created_at, expires_at)
    VALUES (?, ?, ?, ?, ?, ?)
"#;

const DELETE_APPROVAL: &str = "DELETE FROM approvals WHERE workflow_id = ? AND phase_id = ?";

const INSERT_AUDIT: &str = r#"
    INSERT INTO audit_log (id, workflow_id, action, phase_id, user_id, data, timestamp)
    VALUES (?, ?, ?, ?, ?, ?, ?)
"#;

impl StateStore {
    /// Open (or create) the database at `path`.
    ///
    /// The parent directory is created if needed. Call [`init_schema`]
    /// before first use.
    ///
    /// [`init_schema`]: StateStore::init_schema
    pub async fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path_str = path.as_ref().to_string_lossy().to_string();

        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let db = Builder::new_local(&path_str).build().await?;
        let conn = db.connect()?;

        // PRAGMA statements may return rows, so use query()
        let _ = conn.query("PRAGMA journal_mode=WAL", params![]).await?;
        let _ = conn.query("PRAGMA busy_timeout=5000", params![]).await?;

        debug!("Opened state store at {}", path_str);

        Ok(StateStore {
            conn: Mutex::new(conn),
        })
    }

    /// Create tables and indexes. Idempotent.
    pub async fn init_schema(&self) -> Result<()> {
        let statements = [
            r#"CREATE TABLE IF NOT EXISTS workflows (
                id TEXT PRIMARY KEY,
                definition_id TEXT NOT NULL,
                status TEXT NOT NULL,
                technology TEXT NOT NULL,
                approval_mode TEXT NOT NULL,
                data TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            )"#,
            r#"CREATE TABLE IF NOT EXISTS approvals (
                id TEXT PRIMARY KEY,
                workflow_id TEXT NOT NULL,
                phase_id TEXT NOT NULL,
                data TEXT NOT NULL,
                created_at TEXT NOT NULL,
                expires_at TEXT
            )"#,
            r#"CREATE TABLE IF NOT EXISTS audit_log (
                seq INTEGER PRIMARY KEY,
                id TEXT NOT NULL UNIQUE,
                workflow_id TEXT NOT NULL,
                action TEXT NOT NULL,
                phase_id TEXT,
                user_id TEXT NOT NULL,
                data TEXT NOT NULL,
                timestamp TEXT NOT NULL
            )"#,
            "CREATE INDEX IF NOT EXISTS idx_workflows_status ON workflows(status)",
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_approvals_gate ON approvals(workflow_id, phase_id)",
            "CREATE INDEX IF NOT EXISTS idx_audit_workflow ON audit_log(workflow_id)",
        ];

        let conn = self.conn.lock().await;
        for stmt in statements {
            conn.execute(stmt, params![]).await?;
        }

        Ok(())
    }

    /// Apply one workflow state change in a single transaction.
    ///
    /// Gates in `closed` are removed before `opened` is inserted, so an
    /// update may replace a gate on the same phase.
    pub async fn commit(&self, update: WorkflowUpdate<'_>) -> Result<()> {
        let workflow = update.workflow;
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().await?;

        tx.execute(UPSERT_WORKFLOW, workflow_params(workflow)?)
            .await?;
        for phase_id in update.closed {
            tx.execute(
                DELETE_APPROVAL,
                params![workflow.id.clone(), phase_id.clone()],
            )
            .await?;
        }
        if let Some(request) = update.opened {
            // At most one open gate per (workflow, phase)
            tx.execute(
                DELETE_APPROVAL,
                params![request.workflow_id.clone(), request.phase_id.clone()],
            )
            .await?;
            tx.execute(
                INSERT_APPROVAL,
                params![
                    request.id.clone(),
                    request.workflow_id.clone(),
                    request.phase_id.clone(),
                    serde_json::to_string(request)?,
                    request.created_at.to_rfc3339(),
                    request.expires_at.map(|dt| dt.to_rfc3339()),
                ],
            )
            .await?;
        }
        for entry in update.audit {
            tx.execute(INSERT_AUDIT, audit_params(entry)?).await?;
        }

        tx.commit().await?;
        Ok(())
    }

    /// Load one workflow by id.
    pub async fn load_workflow(&self, id: &str) -> Result<Workflow> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query("SELECT data FROM workflows WHERE id = ?", params![id])
            .await?;

        if let Some(row) = rows.next().await? {
            let state: String = row.get(0)?;
            Ok(serde_json::from_str(&state)?)
        } else {
            Err(StoreError::WorkflowNotFound(id.to_string()))
        }
    }

    /// List workflows, optionally filtered by status, oldest first.
    pub async fn list_workflows(&self, status: Option<WorkflowStatus>) -> Result<Vec<Workflow>> {
        let mut query = String::from("SELECT data FROM workflows");
        let mut params_vec: Vec<turso::Value> = Vec::new();

        if let Some(status) = status {
            query.push_str(" WHERE status = ?");
            params_vec.push(status.as_str().to_string().into());
        }
        query.push_str(" ORDER BY created_at ASC, id ASC");

        let conn = self.conn.lock().await;
        let mut rows = conn.query(&query, params_vec).await?;
        let mut workflows = Vec::new();

        while let Some(row) = rows.next().await? {
            let state: String = row.get(0)?;
            workflows.push(serde_json::from_str(&state)?);
        }

        Ok(workflows)
    }

    /// Workflows that are neither completed, failed nor cancelled.
    pub async fn list_active_workflows(&self) -> Result<Vec<Workflow>> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT data FROM workflows WHERE status IN (?, ?) ORDER BY created_at ASC, id ASC",
                params![
                    WorkflowStatus::Running.as_str(),
                    WorkflowStatus::Paused.as_str()
                ],
            )
            .await?;

        let mut workflows = Vec::new();
        while let Some(row) = rows.next().await? {
            let state: String = row.get(0)?;
            workflows.push(serde_json::from_str(&state)?);
        }

        Ok(workflows)
    }

    /// The open approval request for a (workflow, phase) pair, if any.
    pub async fn get_approval(
        &self,
        workflow_id: &str,
        phase_id: &str,
    ) -> Result<Option<ApprovalRequest>> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT data FROM approvals WHERE workflow_id = ? AND phase_id = ?",
                params![workflow_id, phase_id],
            )
            .await?;

        match rows.next().await? {
            Some(row) => {
                let request: String = row.get(0)?;
                Ok(Some(serde_json::from_str(&request)?))
            }
            None => Ok(None),
        }
    }

    /// Open approval requests, optionally for one workflow, oldest first.
    pub async fn list_approvals(&self, workflow_id: Option<&str>) -> Result<Vec<ApprovalRequest>> {
        let mut query = String::from("SELECT data FROM approvals");
        let mut params_vec: Vec<turso::Value> = Vec::new();

        if let Some(workflow_id) = workflow_id {
            query.push_str(" WHERE workflow_id = ?");
            params_vec.push(workflow_id.to_string().into());
        }
        query.push_str(" ORDER BY created_at ASC, id ASC");

        let conn = self.conn.lock().await;
        let mut rows = conn.query(&query, params_vec).await?;
        let mut requests = Vec::new();

        while let Some(row) = rows.next().await? {
            let request: String = row.get(0)?;
            requests.push(serde_json::from_str(&request)?);
        }

        Ok(requests)
    }

    /// Audit trail for a workflow in insertion order.
    pub async fn audit_log(&self, workflow_id: &str) -> Result<Vec<AuditLogEntry>> {
        let conn = self.conn.lock().await;
        let mut rows = conn
            .query(
                "SELECT id, workflow_id, action, phase_id, user_id, data, timestamp
                 FROM audit_log
                 WHERE workflow_id = ?
                 ORDER BY seq ASC",
                params![workflow_id],
            )
            .await?;

        let mut entries = Vec::new();
        while let Some(row) = rows.next().await? {
            entries.push(parse_audit_row(&row)?);
        }

        Ok(entries)
    }
}

fn workflow_params(workflow: &Workflow) -> Result<Vec<turso::Value>> {
    Ok(vec![
        workflow.id.clone().into(),
        workflow.definition_id.clone().into(),
        workflow.status.as_str().to_string().into(),
        workflow.technology.clone().into(),
        workflow.approval_mode.to_string().into(),
        serde_json::to_string(workflow)?.into(),
        workflow.created_at.to_rfc3339().into(),
        workflow.updated_at.to_rfc3339().into(),
    ])
}

fn audit_params(entry: &AuditLogEntry) -> Result<Vec<turso::Value>> {
    let phase_id: turso::Value = match &entry.phase_id {
        Some(id) => id.clone().into(),
        None => turso::Value::Null,
    };

    Ok(vec![
        entry.id.clone().into(),
        entry.workflow_id.clone().into(),
        entry.action.clone().into(),
        phase_id,
        entry.actor.clone().into(),
        serde_json::to_string(&entry.data)?.into(),
        entry.timestamp.to_rfc3339().into(),
    ])
}

/// Helper function to parse an audit row from query results
fn parse_audit_row(row: &turso::Row) -> Result<AuditLogEntry> {
    let data: String = row.get(5)?;
    let timestamp: String = row.get(6)?;

    Ok(AuditLogEntry {
        id: row.get(0)?,
        workflow_id: row.get(1)?,
        action: row.get(2)?,
        phase_id: row.get(3)?,
        actor: row.get(4)?,
        data: serde_json::from_str(&data)?,
        timestamp: DateTime::parse_from_rfc3339(&timestamp)
            .map_err(|e| StoreError::Other(format!("failed to parse timestamp: {}", e)))?
            .with_timezone(&Utc),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use gantry_core::{ApprovalMode, PhaseTemplate, WorkflowDefinition};
    use serde_json::json;
    use tempfile::TempDir;

    fn definition() -> WorkflowDefinition {
        WorkflowDefinition {
            id: "demo".to_string(),
            name: "Demo".to_string(),
            technology: "rust".to_string(),
            phases: vec![PhaseTemplate {
                id: "only".to_string(),
                name: "Only".to_string(),
                description: String::new(),
                agent_type: "coder".to_string(),
                method: "generate".to_string(),
                dependencies: vec![],
                approval_required: false,
                timeout: 5,
                max_retries: 0,
            }],
            config: Default::default(),
        }
    }

    #[tokio::test]
    async fn test_open_and_init() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(dir.path().join("nested/gantry.db")).await.unwrap();
        store.init_schema().await.unwrap();
        store.init_schema().await.unwrap();

        assert!(store.list_workflows(None).await.unwrap().is_empty());
        assert!(store.list_approvals(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_missing_workflow_maps_to_not_found() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(dir.path().join("gantry.db")).await.unwrap();
        store.init_schema().await.unwrap();

        let err = store.load_workflow("nope").await.unwrap_err();
        assert!(matches!(err, StoreError::WorkflowNotFound(_)));
        assert!(matches!(GantryError::from(err), GantryError::WorkflowNotFound(_)));
    }

    #[tokio::test]
    async fn test_audit_order_preserved() {
        let dir = TempDir::new().unwrap();
        let store = StateStore::open(dir.path().join("gantry.db")).await.unwrap();
        store.init_schema().await.unwrap();

        let wf = Workflow::new(&definition(), "r", "/tmp/out", ApprovalMode::Interactive);
        let entries: Vec<_> = (0..5)
            .map(|i| AuditLogEntry::system(&wf.id, format!("step_{}", i), None, json!({ "i": i })))
            .collect();
        store
            .commit(WorkflowUpdate {
                workflow: &wf,
                opened: None,
                closed: &[],
                audit: &entries,
            })
            .await
            .unwrap();

        let log = store.audit_log(&wf.id).await.unwrap();
        let actions: Vec<_> = log.iter().map(|e| e.action.as_str()).collect();
        assert_eq!(actions, vec!["step_0", "step_1", "step_2", "step_3", "step_4"]);
        assert_eq!(log[3].data, json!({ "i": 3 }));
    }
}
