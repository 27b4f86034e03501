//! Worker capability table
//!
//! Phases name their worker as an `(agent_type, method)` pair. The registry
//! maps each pair to a typed [`Worker`] at startup; there is no dynamic
//! lookup beyond that table, and an unbound pair is a [`WorkerNotFound`]
//! error.
//!
//! [`WorkerNotFound`]: gantry_core::GantryError::WorkerNotFound

use async_trait::async_trait;
use gantry_core::{GantryError, Result, WorkerConfig};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::future::Future;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, instrument};

/// What a worker reports back for one invocation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerResponse {
    pub success: bool,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub error: Option<String>,
}

impl WorkerResponse {
    pub fn ok(data: Value) -> Self {
        Self {
            success: true,
            data,
            error: None,
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: Value::Null,
            error: Some(error.into()),
        }
    }
}

/// An external operation a phase can be bound to
///
/// Implementations may take arbitrarily long; the executor applies its own
/// timeout and drops the future when it fires.
#[async_trait]
pub trait Worker: Send + Sync {
    async fn invoke(&self, input: Value) -> Result<WorkerResponse>;
}

/// Adapts an async closure into a [`Worker`]
pub struct FnWorker<F> {
    f: F,
}

impl<F> FnWorker<F> {
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F, Fut> Worker for FnWorker<F>
where
    F: Fn(Value) -> Fut + Send + Sync,
    Fut: Future<Output = Result<WorkerResponse>> + Send,
{
    async fn invoke(&self, input: Value) -> Result<WorkerResponse> {
        (self.f)(input).await
    }
}

/// Runs an external command per invocation
///
/// The phase input is written to stdin as JSON. If stdout is a JSON object
/// with a `success` field it is taken as the [`WorkerResponse`]; otherwise
/// the exit status decides success and stdout becomes the data.
#[derive(Debug, Clone)]
pub struct CommandWorker {
    agent_type: String,
    method: String,
    command: String,
    args: Vec<String>,
    env: HashMap<String, String>,
}

impl CommandWorker {
    pub fn from_config(config: &WorkerConfig) -> Self {
        Self {
            agent_type: config.agent_type.clone(),
            method: config.method.clone(),
            command: config.command.clone(),
            args: config.args.clone(),
            env: config.env.clone(),
        }
    }
}

#[async_trait]
impl Worker for CommandWorker {
    #[instrument(skip(self, input), fields(agent_type = %self.agent_type, method = %self.method))]
    async fn invoke(&self, input: Value) -> Result<WorkerResponse> {
        debug!("Spawning {} {:?}", self.command, self.args);

        let mut child = Command::new(&self.command)
            .args(&self.args)
            .envs(&self.env)
            .env("GANTRY_AGENT_TYPE", &self.agent_type)
            .env("GANTRY_METHOD", &self.method)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                GantryError::WorkerFailure(format!("Failed to spawn {}: {}", self.command, e))
            })?;

        // Feed stdin while draining stdout and stderr, or a chatty child
        // blocks on a full pipe while we block on its input
        let payload = serde_json::to_vec(&input)?;
        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                // A worker that ignores stdin may close it early
                if let Err(e) = stdin.write_all(&payload).await {
                    debug!("Worker closed stdin early: {}", e);
                }
            }
        };

        let ((), output) = tokio::join!(feed, child.wait_with_output());
        let output = output.map_err(|e| {
            GantryError::WorkerFailure(format!("Failed to wait for {}: {}", self.command, e))
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        Ok(interpret_output(
            output.status.success(),
            output.status.code(),
            stdout,
            stderr,
        ))
    }
}

fn interpret_output(
    exited_ok: bool,
    code: Option<i32>,
    stdout: String,
    stderr: String,
) -> WorkerResponse {
    let parsed: Option<Value> = serde_json::from_str(&stdout).ok();

    if let Some(value) = &parsed {
        if value.get("success").is_some() {
            if let Ok(response) = serde_json::from_value::<WorkerResponse>(value.clone()) {
                return response;
            }
        }
    }

    if exited_ok {
        WorkerResponse::ok(parsed.unwrap_or_else(|| json!({ "stdout": stdout })))
    } else {
        let status = code
            .map(|c| format!("exit code {}", c))
            .unwrap_or_else(|| "terminated by signal".to_string());
        let detail = if stderr.is_empty() { stdout } else { stderr };
        WorkerResponse::failed(format!("{}: {}", status, detail))
    }
}

/// Closed lookup table from `(agent_type, method)` to a worker
#[derive(Clone, Default)]
pub struct WorkerRegistry {
    workers: HashMap<(String, String), Arc<dyn Worker>>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding one [`CommandWorker`] per configured binding
    pub fn from_config(configs: &[WorkerConfig]) -> Self {
        let mut registry = Self::new();
        for config in configs {
            registry.register(
                &config.agent_type,
                &config.method,
                CommandWorker::from_config(config),
            );
        }
        registry
    }

    /// Bind a worker, replacing any previous binding for the pair
    pub fn register(
        &mut self,
        agent_type: &str,
        method: &str,
        worker: impl Worker + 'static,
    ) -> &mut Self {
        self.workers
            .insert((agent_type.to_string(), method.to_string()), Arc::new(worker));
        self
    }

    /// Bind an async closure
    pub fn register_fn<F, Fut>(&mut self, agent_type: &str, method: &str, f: F) -> &mut Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<WorkerResponse>> + Send + 'static,
    {
        self.register(agent_type, method, FnWorker::new(f))
    }

    pub fn get(&self, agent_type: &str, method: &str) -> Result<Arc<dyn Worker>> {
        self.workers
            .get(&(agent_type.to_string(), method.to_string()))
            .cloned()
            .ok_or_else(|| GantryError::WorkerNotFound {
                agent_type: agent_type.to_string(),
                method: method.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_registry_lookup() {
        let mut registry = WorkerRegistry::new();
        registry.register_fn("coder", "generate", |input: Value| async move {
            Ok(WorkerResponse::ok(json!({ "echo": input })))
        });

        let worker = registry.get("coder", "generate").unwrap();
        let response = worker.invoke(json!({"x": 1})).await.unwrap();
        assert!(response.success);
        assert_eq!(response.data["echo"]["x"], 1);

        assert!(matches!(
            registry.get("coder", "review"),
            Err(GantryError::WorkerNotFound { .. })
        ));
        assert!(matches!(
            registry.get("reviewer", "generate"),
            Err(GantryError::WorkerNotFound { .. })
        ));
    }

    #[test]
    fn test_interpret_output() {
        let structured = interpret_output(
            true,
            Some(0),
            r#"{"success": false, "error": "lint failed"}"#.to_string(),
            String::new(),
        );
        assert_eq!(structured, WorkerResponse::failed("lint failed"));

        let plain = interpret_output(true, Some(0), "hello".to_string(), String::new());
        assert_eq!(plain.data, json!({"stdout": "hello"}));

        let json_data =
            interpret_output(true, Some(0), r#"{"files": 3}"#.to_string(), String::new());
        assert_eq!(json_data.data, json!({"files": 3}));

        let failed = interpret_output(false, Some(2), String::new(), "boom".to_string());
        assert!(!failed.success);
        assert_eq!(failed.error.as_deref(), Some("exit code 2: boom"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_worker_reads_stdin() {
        let worker = CommandWorker::from_config(&WorkerConfig {
            agent_type: "echo".to_string(),
            method: "cat".to_string(),
            command: "cat".to_string(),
            args: vec![],
            env: HashMap::new(),
        });

        let response = worker.invoke(json!({"requirements": "x"})).await.unwrap();
        assert!(response.success);
        assert_eq!(response.data, json!({"requirements": "x"}));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_worker_streams_large_input() {
        let worker = CommandWorker::from_config(&WorkerConfig {
            agent_type: "echo".to_string(),
            method: "cat".to_string(),
            command: "cat".to_string(),
            args: vec![],
            env: HashMap::new(),
        });

        // Well past the pipe buffer in both directions
        let code = "x".repeat(1_000_000);
        let response = tokio::time::timeout(
            std::time::Duration::from_secs(5),
            worker.invoke(json!({ "code": code })),
        )
        .await
        .expect("worker should not block on a full pipe")
        .unwrap();

        assert!(response.success);
        assert_eq!(response.data["code"].as_str().map(str::len), Some(1_000_000));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_worker_exit_status() {
        let worker = CommandWorker::from_config(&WorkerConfig {
            agent_type: "sh".to_string(),
            method: "fail".to_string(),
            command: "sh".to_string(),
            args: vec!["-c".to_string(), "echo nope >&2; exit 3".to_string()],
            env: HashMap::new(),
        });

        let response = worker.invoke(json!({})).await.unwrap();
        assert!(!response.success);
        assert_eq!(response.error.as_deref(), Some("exit code 3: nope"));
    }
}
