//! Configuration for the RASEN supervisor.
//!
//! Loaded from `config.yml` in the state directory; every section is optional
//! and falls back to defaults. A handful of `RASEN_*` environment variables
//! override the file for quick experiments.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// Errors raised while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid value for {field}: {message}")]
    InvalidValue { field: String, message: String },

    #[error("invalid environment override {var}: {message}")]
    InvalidEnvOverride { var: String, message: String },
}

/// Root configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,

    #[serde(default)]
    pub agent: AgentConfig,

    #[serde(default)]
    pub memory: MemoryConfig,

    #[serde(default)]
    pub backpressure: BackpressureConfig,

    #[serde(default)]
    pub background: BackgroundConfig,

    #[serde(default)]
    pub stall_detection: StallDetectionConfig,

    #[serde(default)]
    pub review: ReviewConfig,

    #[serde(default)]
    pub qa: QaConfig,

    #[serde(default)]
    pub worktree: WorktreeSettings,
}

/// Orchestration loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    /// Maximum loop iterations before giving up.
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,

    /// Maximum total runtime in seconds.
    #[serde(default = "default_max_runtime")]
    pub max_runtime_seconds: u64,

    /// Delay between sessions in seconds.
    #[serde(default = "default_session_delay")]
    pub session_delay_seconds: u64,

    /// Per-session wall-clock timeout in seconds.
    #[serde(default = "default_session_timeout")]
    pub session_timeout_seconds: u64,
}

fn default_max_iterations() -> u32 {
    50
}

fn default_max_runtime() -> u64 {
    14_400 // 4 hours
}

fn default_session_delay() -> u64 {
    3
}

fn default_session_timeout() -> u64 {
    1800 // 30 minutes
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            max_runtime_seconds: default_max_runtime(),
            session_delay_seconds: default_session_delay(),
            session_timeout_seconds: default_session_timeout(),
        }
    }
}

/// Assistant subprocess settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Assistant binary to invoke.
    #[serde(default = "default_agent_command")]
    pub command: String,

    /// Extra arguments appended after the built-in ones.
    #[serde(default)]
    pub args: Vec<String>,
}

fn default_agent_command() -> String {
    "claude".to_string()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: default_agent_command(),
            args: Vec::new(),
        }
    }
}

/// Cross-session memory settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Path to the memories file, relative to the project root.
    #[serde(default = "default_memory_path")]
    pub path: String,

    /// Approximate token budget for prompt injection.
    #[serde(default = "default_memory_tokens")]
    pub max_tokens: u32,
}

fn default_memory_path() -> String {
    ".rasen/memories.md".to_string()
}

fn default_memory_tokens() -> u32 {
    2000
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            path: default_memory_path(),
            max_tokens: default_memory_tokens(),
        }
    }
}

/// Quality-gate evidence requirements.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackpressureConfig {
    #[serde(default = "default_true")]
    pub require_tests: bool,

    #[serde(default = "default_true")]
    pub require_lint: bool,
}

impl Default for BackpressureConfig {
    fn default() -> Self {
        Self {
            require_tests: true,
            require_lint: true,
        }
    }
}

/// Background daemon paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackgroundConfig {
    #[serde(default = "default_pid_file")]
    pub pid_file: String,

    #[serde(default = "default_log_file")]
    pub log_file: String,

    #[serde(default = "default_status_file")]
    pub status_file: String,
}

fn default_pid_file() -> String {
    ".rasen/rasen.pid".to_string()
}

fn default_log_file() -> String {
    ".rasen/rasen.log".to_string()
}

fn default_status_file() -> String {
    ".rasen/status.json".to_string()
}

impl Default for BackgroundConfig {
    fn default() -> Self {
        Self {
            pid_file: default_pid_file(),
            log_file: default_log_file(),
            status_file: default_status_file(),
        }
    }
}

/// Stall detection thresholds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StallDetectionConfig {
    /// Consecutive zero-commit sessions on one subtask before `stalled`.
    #[serde(default = "default_no_commit_sessions")]
    pub max_no_commit_sessions: u32,

    /// Consecutive failed sessions across subtasks before giving up.
    #[serde(default = "default_consecutive_failures")]
    pub max_consecutive_failures: u32,

    /// Jaccard similarity above which two approaches count as the same idea.
    #[serde(default = "default_circular_threshold")]
    pub circular_fix_threshold: f64,
}

fn default_no_commit_sessions() -> u32 {
    3
}

fn default_consecutive_failures() -> u32 {
    5
}

fn default_circular_threshold() -> f64 {
    0.3
}

impl Default for StallDetectionConfig {
    fn default() -> Self {
        Self {
            max_no_commit_sessions: default_no_commit_sessions(),
            max_consecutive_failures: default_consecutive_failures(),
            circular_fix_threshold: default_circular_threshold(),
        }
    }
}

/// Review sub-loop settings (Coder ↔ Reviewer).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Review after every subtask instead of once at the end.
    #[serde(default)]
    pub per_subtask: bool,

    #[serde(default = "default_review_loops")]
    pub max_loops: u32,
}

fn default_review_loops() -> u32 {
    3
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            per_subtask: false,
            max_loops: default_review_loops(),
        }
    }
}

/// QA sub-loop settings (Coder ↔ QA).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QaConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Run a single QA check after every subtask as well.
    #[serde(default)]
    pub per_subtask: bool,

    #[serde(default = "default_qa_iterations")]
    pub max_iterations: u32,

    /// Occurrences of a normalized issue before escalating to a human.
    #[serde(default = "default_recurring_threshold")]
    pub recurring_issue_threshold: u32,
}

fn default_qa_iterations() -> u32 {
    50
}

fn default_recurring_threshold() -> u32 {
    3
}

impl Default for QaConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            per_subtask: false,
            max_iterations: default_qa_iterations(),
            recurring_issue_threshold: default_recurring_threshold(),
        }
    }
}

/// Git worktree isolation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorktreeSettings {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_worktree_base")]
    pub base_path: String,
}

fn default_worktree_base() -> String {
    ".worktrees".to_string()
}

impl Default for WorktreeSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            base_path: default_worktree_base(),
        }
    }
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Loads configuration from a YAML file, applying environment overrides.
    ///
    /// A missing file yields the defaults (still subject to overrides).
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            debug!(path = %path.display(), "loading configuration");
            let content = std::fs::read_to_string(path)?;
            Self::parse_yaml(&content)?
        } else {
            debug!(path = %path.display(), "no config file, using defaults");
            Self::default()
        };
        config.apply_env_overrides()?;
        config.validate()?;
        Ok(config)
    }

    /// Parses configuration from a YAML string.
    pub fn parse_yaml(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(content)?)
    }

    /// Applies `RASEN_*` environment variable overrides.
    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(value) = std::env::var("RASEN_MAX_ITERATIONS") {
            self.orchestrator.max_iterations =
                value
                    .parse()
                    .map_err(|_| ConfigError::InvalidEnvOverride {
                        var: "RASEN_MAX_ITERATIONS".to_string(),
                        message: format!("expected an integer, got {value:?}"),
                    })?;
        }
        if let Ok(value) = std::env::var("RASEN_SESSION_TIMEOUT") {
            self.orchestrator.session_timeout_seconds =
                value
                    .parse()
                    .map_err(|_| ConfigError::InvalidEnvOverride {
                        var: "RASEN_SESSION_TIMEOUT".to_string(),
                        message: format!("expected an integer, got {value:?}"),
                    })?;
        }
        if let Ok(value) = std::env::var("RASEN_AGENT_COMMAND") {
            if !value.trim().is_empty() {
                self.agent.command = value;
            }
        }
        Ok(())
    }

    /// Checks value ranges. Surfaced at startup; never mid-run.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.orchestrator.max_iterations == 0 {
            return Err(ConfigError::InvalidValue {
                field: "orchestrator.max_iterations".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.orchestrator.session_timeout_seconds == 0 {
            return Err(ConfigError::InvalidValue {
                field: "orchestrator.session_timeout_seconds".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.stall_detection.circular_fix_threshold) {
            return Err(ConfigError::InvalidValue {
                field: "stall_detection.circular_fix_threshold".to_string(),
                message: "must be within 0.0..=1.0".to_string(),
            });
        }
        if self.agent.command.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "agent.command".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        Ok(())
    }
}
