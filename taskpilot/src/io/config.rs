//! Project configuration stored under `.taskpilot/config.toml`.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::types::RunMode;
use crate::io::context::RecallSettings;
use crate::io::gates::{DEFAULT_GATE_OUTPUT_LIMIT_BYTES, DEFAULT_GATE_TIMEOUT};
use crate::io::prompt::DEFAULT_PROMPT_BUDGET_BYTES;
use crate::io::store::{STATE_DIR, write_atomic};
use crate::task::{DEFAULT_MAX_ATTEMPTS, QualityGate};

pub const CONFIG_FILE: &str = "config.toml";

/// Project configuration (TOML).
///
/// Edited by humans; every field has a default so a partial file is valid.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TaskpilotConfig {
    /// `max_attempts` given to newly decomposed tasks.
    pub max_attempts_default: u32,
    /// Cap on attempts started by one run.
    pub max_iterations: u32,
    /// Parallel attempts in team mode.
    pub concurrency: usize,
    pub mode: RunMode,
    /// Timeout for a single gate command.
    pub gate_timeout_secs: u64,
    /// Truncate each gate's output beyond this many bytes.
    pub gate_output_limit_bytes: usize,
    pub agent: AgentConfig,
    pub gates: Vec<QualityGate>,
    pub recall: RecallConfig,
    pub prompt: PromptConfig,
    pub branch: BranchConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent CLI; the prompt is written to its stdin.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    pub output_limit_bytes: usize,
    pub model: Option<String>,
    pub permission_mode: Option<String>,
    pub allowed_tools: Vec<String>,
    pub mcp_config: Option<String>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: vec!["claude".to_string(), "-p".to_string()],
            timeout_secs: 30 * 60,
            output_limit_bytes: 200_000,
            model: None,
            permission_mode: None,
            allowed_tools: Vec::new(),
            mcp_config: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RecallConfig {
    /// Recall CLI; empty disables recall.
    pub command: Vec<String>,
    pub limit: usize,
    pub threshold: f64,
    pub timeout_secs: u64,
}

impl Default for RecallConfig {
    fn default() -> Self {
        let settings = RecallSettings::default();
        Self {
            command: Vec::new(),
            limit: settings.limit,
            threshold: settings.threshold,
            timeout_secs: 30,
        }
    }
}

impl RecallConfig {
    pub fn enabled(&self) -> bool {
        !self.command.is_empty()
    }

    pub fn settings(&self) -> RecallSettings {
        RecallSettings {
            limit: self.limit,
            threshold: self.threshold,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PromptConfig {
    /// Byte budget for the per-task half of a prompt.
    pub budget_bytes: usize,
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            budget_bytes: DEFAULT_PROMPT_BUDGET_BYTES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BranchConfig {
    /// Run branches are named `<prefix><run_id>`.
    pub prefix: String,
    pub restore_on_success: bool,
    pub restore_on_failure: bool,
}

impl Default for BranchConfig {
    fn default() -> Self {
        Self {
            prefix: "taskpilot/".to_string(),
            restore_on_success: true,
            restore_on_failure: false,
        }
    }
}

impl Default for TaskpilotConfig {
    fn default() -> Self {
        Self {
            max_attempts_default: DEFAULT_MAX_ATTEMPTS,
            max_iterations: 100,
            concurrency: 2,
            mode: RunMode::Loop,
            gate_timeout_secs: DEFAULT_GATE_TIMEOUT.as_secs(),
            gate_output_limit_bytes: DEFAULT_GATE_OUTPUT_LIMIT_BYTES,
            agent: AgentConfig::default(),
            gates: Vec::new(),
            recall: RecallConfig::default(),
            prompt: PromptConfig::default(),
            branch: BranchConfig::default(),
        }
    }
}

impl TaskpilotConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts_default == 0 {
            return Err(anyhow!("max_attempts_default must be > 0"));
        }
        if self.max_iterations == 0 {
            return Err(anyhow!("max_iterations must be > 0"));
        }
        if self.concurrency == 0 {
            return Err(anyhow!("concurrency must be > 0"));
        }
        if self.gate_timeout_secs == 0 {
            return Err(anyhow!("gate_timeout_secs must be > 0"));
        }
        if self.gate_output_limit_bytes == 0 {
            return Err(anyhow!("gate_output_limit_bytes must be > 0"));
        }
        if self.agent.command.is_empty() || self.agent.command[0].trim().is_empty() {
            return Err(anyhow!("agent.command must be a non-empty array"));
        }
        if self.agent.timeout_secs == 0 {
            return Err(anyhow!("agent.timeout_secs must be > 0"));
        }
        if self.agent.output_limit_bytes == 0 {
            return Err(anyhow!("agent.output_limit_bytes must be > 0"));
        }
        if let Some(gate) = self.gates.iter().find(|g| g.command.trim().is_empty()) {
            return Err(anyhow!("gate '{}' has an empty command", gate.kind));
        }
        if self.recall.enabled() && self.recall.command[0].trim().is_empty() {
            return Err(anyhow!("recall.command must name a program"));
        }
        if self.recall.enabled() && self.recall.timeout_secs == 0 {
            return Err(anyhow!("recall.timeout_secs must be > 0"));
        }
        if self.prompt.budget_bytes == 0 {
            return Err(anyhow!("prompt.budget_bytes must be > 0"));
        }
        Ok(())
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent.timeout_secs)
    }

    pub fn gate_timeout(&self) -> Duration {
        Duration::from_secs(self.gate_timeout_secs)
    }

    pub fn recall_timeout(&self) -> Duration {
        Duration::from_secs(self.recall.timeout_secs)
    }
}

/// Path of the config file for the project at `project_root`.
pub fn config_path(project_root: &Path) -> std::path::PathBuf {
    project_root.join(STATE_DIR).join(CONFIG_FILE)
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `TaskpilotConfig::default()`.
pub fn load_config(path: &Path) -> Result<TaskpilotConfig> {
    if !path.exists() {
        let cfg = TaskpilotConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: TaskpilotConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()
        .with_context(|| format!("invalid config {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &TaskpilotConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, TaskpilotConfig::default());
        assert_eq!(cfg.agent.command, vec!["claude", "-p"]);
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = config_path(temp.path());
        let mut cfg = TaskpilotConfig::default();
        cfg.mode = RunMode::Team;
        cfg.gates.push(QualityGate {
            kind: "test".to_string(),
            command: "cargo test".to_string(),
        });
        cfg.agent.model = Some("sonnet".to_string());

        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("config.toml");
        fs::write(
            &path,
            r#"
mode = "team"
concurrency = 4

[[gates]]
type = "lint"
command = "cargo clippy"

[branch]
restore_on_failure = true
"#,
        )
        .expect("write");

        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.mode, RunMode::Team);
        assert_eq!(cfg.concurrency, 4);
        assert_eq!(cfg.gates[0].kind, "lint");
        assert!(cfg.branch.restore_on_failure);
        assert_eq!(cfg.branch.prefix, "taskpilot/");
        assert_eq!(cfg.max_attempts_default, 3);
        assert!(!cfg.recall.enabled());
    }

    #[test]
    fn invalid_values_are_rejected() {
        let mut cfg = TaskpilotConfig::default();
        cfg.concurrency = 0;
        assert!(cfg.validate().is_err());

        let mut cfg = TaskpilotConfig::default();
        cfg.agent.command.clear();
        assert!(cfg.validate().is_err());

        let mut cfg = TaskpilotConfig::default();
        cfg.gates.push(QualityGate {
            kind: "test".to_string(),
            command: " ".to_string(),
        });
        assert!(cfg.validate().is_err());
    }
}
