//! Configuration management for Gantry
//!
//! Settings live in `.gantry/config.toml` under the project root. Every field
//! has a default so a missing or partial file is valid.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::{ApprovalMode, ExecutionMode, GantryError, Result};

/// Directory holding Gantry state, relative to the project root
pub const CONFIG_DIR: &str = ".gantry";

/// Project-level Gantry configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GantryConfig {
    /// Directory for activity logs and other per-workflow files
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Path to the SQLite state database
    #[serde(default = "default_database")]
    pub database: PathBuf,

    /// Extra workflow definitions; entries override built-ins with the same id
    #[serde(default)]
    pub definitions_dir: Option<PathBuf>,

    /// Scheduling behavior
    #[serde(default)]
    pub execution: ExecutionConfig,

    /// Approval gate behavior
    #[serde(default)]
    pub approvals: ApprovalConfig,

    /// External worker commands bound to (agent_type, method)
    #[serde(default)]
    pub workers: Vec<WorkerConfig>,
}

/// Scheduling parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default)]
    pub mode: ExecutionMode,

    /// Upper bound on concurrently running phases in parallel mode
    #[serde(default = "default_max_parallel_phases")]
    pub max_parallel_phases: usize,

    /// Delay between scheduling ticks when driving a workflow
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
}

/// Longest accepted gate expiry, one hundred years
pub const MAX_APPROVAL_EXPIRY_SECS: u64 = 100 * 365 * 24 * 60 * 60;

/// Approval gate parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalConfig {
    #[serde(default)]
    pub default_mode: ApprovalMode,

    /// Seconds after which an unanswered gate cancels its workflow
    #[serde(default)]
    pub expiry_secs: Option<u64>,
}

/// An external command that performs one worker operation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub agent_type: String,
    pub method: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: HashMap<String, String>,
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(CONFIG_DIR)
}

fn default_database() -> PathBuf {
    PathBuf::from(CONFIG_DIR).join("gantry.db")
}

fn default_max_parallel_phases() -> usize {
    4
}

fn default_tick_interval_ms() -> u64 {
    500
}

impl GantryConfig {
    /// Load configuration from `.gantry/config.toml` or use defaults
    ///
    /// Relative paths in the file are resolved against `root`.
    pub fn load_or_default(root: &Path) -> Result<Self> {
        let config_path = root.join(CONFIG_DIR).join("config.toml");

        let mut config = if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            Self::from_toml(&content)?
        } else {
            Self::default()
        };

        config.resolve_paths(root);
        Ok(config)
    }

    /// Parse a configuration document
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content)
            .map_err(|e| GantryError::Config(format!("Failed to parse config file: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Write default configuration to `.gantry/config.toml`
    ///
    /// Leaves an existing file untouched and returns its path either way.
    pub fn write_default(root: &Path) -> Result<PathBuf> {
        let config_dir = root.join(CONFIG_DIR);
        std::fs::create_dir_all(&config_dir)?;

        let config_path = config_dir.join("config.toml");
        if config_path.exists() {
            return Ok(config_path);
        }

        let content = toml::to_string_pretty(&Self::default())
            .map_err(|e| GantryError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(&config_path, content)?;
        Ok(config_path)
    }

    fn validate(&self) -> Result<()> {
        if self.execution.max_parallel_phases == 0 {
            return Err(GantryError::Config(
                "execution.max_parallel_phases must be at least 1".to_string(),
            ));
        }
        if let Some(secs) = self.approvals.expiry_secs {
            if secs > MAX_APPROVAL_EXPIRY_SECS {
                return Err(GantryError::Config(format!(
                    "approvals.expiry_secs must be at most {} (got {})",
                    MAX_APPROVAL_EXPIRY_SECS, secs
                )));
            }
        }
        for worker in &self.workers {
            if worker.command.trim().is_empty() {
                return Err(GantryError::Config(format!(
                    "worker {}.{} has an empty command",
                    worker.agent_type, worker.method
                )));
            }
        }
        Ok(())
    }

    fn resolve_paths(&mut self, root: &Path) {
        if self.state_dir.is_relative() {
            self.state_dir = root.join(&self.state_dir);
        }
        if self.database.is_relative() {
            self.database = root.join(&self.database);
        }
        if let Some(dir) = self.definitions_dir.as_mut() {
            if dir.is_relative() {
                *dir = root.join(&*dir);
            }
        }
    }

    /// Directory for per-workflow activity logs
    pub fn activity_dir(&self) -> PathBuf {
        self.state_dir.join("activity")
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.execution.tick_interval_ms)
    }

    pub fn approval_expiry(&self) -> Option<Duration> {
        self.approvals.expiry_secs.map(Duration::from_secs)
    }
}

impl Default for GantryConfig {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            database: default_database(),
            definitions_dir: None,
            execution: ExecutionConfig::default(),
            approvals: ApprovalConfig::default(),
            workers: vec![],
        }
    }
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::Serial,
            max_parallel_phases: default_max_parallel_phases(),
            tick_interval_ms: default_tick_interval_ms(),
        }
    }
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            default_mode: ApprovalMode::Interactive,
            expiry_secs: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults_when_missing() {
        let dir = TempDir::new().unwrap();
        let config = GantryConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config.execution.mode, ExecutionMode::Serial);
        assert_eq!(config.execution.max_parallel_phases, 4);
        assert_eq!(config.database, dir.path().join(".gantry/gantry.db"));
        assert!(config.workers.is_empty());
    }

    #[test]
    fn test_write_default_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = GantryConfig::write_default(dir.path()).unwrap();
        assert!(path.exists());

        let config = GantryConfig::load_or_default(dir.path()).unwrap();
        assert_eq!(config.approvals.default_mode, ApprovalMode::Interactive);
        assert_eq!(config.tick_interval(), Duration::from_millis(500));
    }

    #[test]
    fn test_partial_file() {
        let config = GantryConfig::from_toml(
            r#"
            [execution]
            mode = "parallel"

            [approvals]
            default_mode = "batch"
            expiry_secs = 3600

            [[workers]]
            agent_type = "coder"
            method = "generate"
            command = "./bin/coder"
            args = ["--json"]
            "#,
        )
        .unwrap();

        assert_eq!(config.execution.mode, ExecutionMode::Parallel);
        assert_eq!(config.execution.max_parallel_phases, 4);
        assert_eq!(config.approvals.default_mode, ApprovalMode::Batch);
        assert_eq!(config.approval_expiry(), Some(Duration::from_secs(3600)));
        assert_eq!(config.workers[0].args, vec!["--json".to_string()]);
    }

    #[test]
    fn test_rejects_zero_parallelism() {
        let err = GantryConfig::from_toml("[execution]\nmax_parallel_phases = 0\n").unwrap_err();
        assert!(matches!(err, GantryError::Config(_)));
    }

    #[test]
    fn test_rejects_out_of_range_expiry() {
        let err = GantryConfig::from_toml("[approvals]\nexpiry_secs = 100000000000000\n")
            .unwrap_err();
        assert!(matches!(err, GantryError::Config(_)));

        let max = format!("[approvals]\nexpiry_secs = {}\n", MAX_APPROVAL_EXPIRY_SECS);
        assert!(GantryConfig::from_toml(&max).is_ok());
    }
}
