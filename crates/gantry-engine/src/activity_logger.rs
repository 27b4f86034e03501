//! Activity Logger - human-readable per-workflow log under `<state_dir>/activity/`
//!
//! Each workflow gets `<id>.md` with a header followed by one line per audit
//! entry. The audit table stays the authoritative record; this file is for
//! people tailing a run, so every write is fail-open.

use chrono::Utc;
use gantry_core::fail_open::fail_open;
use gantry_core::{AuditLogEntry, Workflow};
use serde_json::Value;
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;

/// Maximum characters of an entry's payload shown inline
const PAYLOAD_PREVIEW_CHARS: usize = 200;

/// Markdown activity log writer
pub struct ActivityLogger {
    dir: PathBuf,
}

impl ActivityLogger {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Path of the log file for a workflow
    pub fn path_for(&self, workflow_id: &str) -> PathBuf {
        self.dir.join(format!("{}.md", workflow_id))
    }

    /// Write the header for a newly started workflow
    ///
    /// This operation is fail-open - logging failures won't stop the workflow
    pub async fn log_started(&self, workflow: &Workflow) {
        fail_open("activity_logger::log_started", || async {
            tokio::fs::create_dir_all(&self.dir).await?;

            let content = format!(
                "# Workflow {}\n\n**Definition**: {}\n**Technology**: {}\n**Approval mode**: {}\n**Output**: {}\n**Started**: {}\n\n## Requirements\n\n{}\n\n## Activity\n\n",
                workflow.id,
                workflow.definition_id,
                workflow.technology,
                workflow.approval_mode,
                workflow.output_path,
                workflow.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
                workflow.requirements.trim(),
            );

            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(self.path_for(&workflow.id))
                .await?;
            file.write_all(content.as_bytes()).await?;
            file.flush().await?;
            Ok(())
        })
        .await;
    }

    /// Append audit entries, one line each
    ///
    /// This operation is fail-open - logging failures won't stop the workflow
    pub async fn log_entries(&self, entries: &[AuditLogEntry]) {
        let Some(first) = entries.first() else {
            return;
        };
        let path = self.path_for(&first.workflow_id);

        fail_open("activity_logger::log_entries", || async {
            let content: String = entries.iter().map(format_entry).collect();
            append(&self.dir, &path, &content).await
        })
        .await;
    }

    /// Append a closing summary once a workflow is terminal
    ///
    /// This operation is fail-open - logging failures won't stop the workflow
    pub async fn log_summary(&self, workflow: &Workflow) {
        fail_open("activity_logger::log_summary", || async {
            let mut content = format!(
                "\n## Finished: {}\n\n**Progress**: {:.0}%\n**Time**: {}\n",
                workflow.status,
                workflow.progress_percentage(),
                Utc::now().format("%Y-%m-%d %H:%M:%S UTC"),
            );
            if let Some(error) = &workflow.error {
                content.push_str(&format!("**Error**: {}\n", error));
            }
            if !workflow.artifacts.is_empty() {
                content.push_str("\n**Artifacts**:\n");
                for artifact in &workflow.artifacts {
                    content.push_str(&format!(
                        "- {} ({}): {}\n",
                        artifact.name, artifact.kind, artifact.path
                    ));
                }
            }
            append(&self.dir, &self.path_for(&workflow.id), &content).await
        })
        .await;
    }
}

async fn append(dir: &Path, path: &Path, content: &str) -> gantry_core::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await?;
    file.write_all(content.as_bytes()).await?;
    file.flush().await?;
    Ok(())
}

fn format_entry(entry: &AuditLogEntry) -> String {
    let mut line = format!(
        "- `{}` **{}**",
        entry.timestamp.format("%H:%M:%S"),
        entry.action
    );
    if let Some(phase) = &entry.phase_id {
        line.push_str(&format!(" `{}`", phase));
    }
    line.push_str(&format!(" by {}", entry.actor));

    if !is_empty_payload(&entry.data) {
        let payload = entry.data.to_string();
        let preview: String = payload.chars().take(PAYLOAD_PREVIEW_CHARS).collect();
        if payload.chars().count() > PAYLOAD_PREVIEW_CHARS {
            line.push_str(&format!(": {}...", preview));
        } else {
            line.push_str(&format!(": {}", preview));
        }
    }

    line.push('\n');
    line
}

fn is_empty_payload(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        _ => false,
    }
}
