//! Model-backed planning: feature description -> document -> raw tasks.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Result, anyhow};
use tracing::{info, instrument, warn};

use crate::agents::decomposer::{RawTask, parse_raw_tasks};
use crate::io::config::AgentConfig;
use crate::io::executor::{AgentExecutor, ExecOptions};
use crate::io::git::Git;
use crate::io::prompt::{decomposer_prompt, generator_prompt};

/// Tracked files listed in the planning context.
const CODEBASE_FILE_LIMIT: usize = 300;
/// README lines included in the planning context.
const README_LINES: usize = 60;

pub trait DocumentGenerator {
    fn generate(&self, description: &str, codebase: &str) -> Result<String>;
}

pub trait TaskDecomposer {
    fn decompose(&self, document: &str, codebase: &str) -> Result<Vec<RawTask>>;
}

/// Runs both planning steps through the task agent.
pub struct AgentPlanner<'a> {
    executor: &'a dyn AgentExecutor,
    agent: &'a AgentConfig,
    cwd: &'a Path,
}

impl<'a> AgentPlanner<'a> {
    pub fn new(executor: &'a dyn AgentExecutor, agent: &'a AgentConfig, cwd: &'a Path) -> Self {
        Self {
            executor,
            agent,
            cwd,
        }
    }

    fn ask(&self, label: &str, prompt: &str) -> Result<String> {
        let opts = ExecOptions {
            model: self.agent.model.as_deref(),
            permission_mode: self.agent.permission_mode.as_deref(),
            allowed_tools: &self.agent.allowed_tools,
            mcp_config: self.agent.mcp_config.as_deref(),
            ..ExecOptions::new(self.cwd, Duration::from_secs(self.agent.timeout_secs), label)
        };
        let result = self.executor.execute(prompt, &opts)?;
        if !result.success {
            warn!(label, exit_code = result.exit_code, "planning agent failed");
            return Err(anyhow!(
                "{label} agent exited with code {} (timed out: {}, aborted: {}):\n{}",
                result.exit_code,
                result.timed_out,
                result.aborted,
                result.output.trim()
            ));
        }
        Ok(result.output)
    }
}

impl DocumentGenerator for AgentPlanner<'_> {
    #[instrument(skip_all)]
    fn generate(&self, description: &str, codebase: &str) -> Result<String> {
        info!("generating implementation document");
        let output = self.ask("generate", &generator_prompt(description, codebase)?)?;
        let document = output.trim();
        if document.is_empty() {
            return Err(anyhow!("document generator returned no text"));
        }
        Ok(format!("{document}\n"))
    }
}

impl TaskDecomposer for AgentPlanner<'_> {
    #[instrument(skip_all)]
    fn decompose(&self, document: &str, codebase: &str) -> Result<Vec<RawTask>> {
        info!("decomposing document into tasks");
        let output = self.ask("decompose", &decomposer_prompt(document, codebase)?)?;
        parse_raw_tasks(&output)
    }
}

/// Planning context: tracked files (capped) and the head of the README.
pub fn codebase_context(project_root: &Path) -> String {
    let mut buf = String::new();
    let git = Git::new(project_root);
    if git.is_repo() {
        match git.ls_files(CODEBASE_FILE_LIMIT) {
            Ok((files, omitted)) => {
                buf.push_str("Tracked files:\n");
                for file in files {
                    buf.push_str(&format!("- {file}\n"));
                }
                if omitted > 0 {
                    buf.push_str(&format!("- ... and {omitted} more\n"));
                }
            }
            Err(err) => warn!(err = %format!("{err:#}"), "could not list tracked files"),
        }
    } else {
        buf.push_str("(not a git repository; file list unavailable)\n");
    }

    let readme = ["README.md", "README", "readme.md"]
        .iter()
        .map(|name| project_root.join(name))
        .find(|path| path.is_file());
    if let Some(path) = readme
        && let Ok(text) = fs::read_to_string(&path)
    {
        buf.push_str("\nREADME (head):\n");
        for line in text.lines().take(README_LINES) {
            buf.push_str(line);
            buf.push('\n');
        }
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{ScriptedAgent, ScriptedExecutor};

    #[test]
    fn generator_returns_trimmed_document() {
        let temp = tempfile::tempdir().expect("tempdir");
        let executor = ScriptedExecutor::new()
            .script("generate", vec![ScriptedAgent::success("\n# Plan\nsteps\n\n")]);
        let agent = AgentConfig::default();
        let planner = AgentPlanner::new(&executor, &agent, temp.path());

        let doc = planner.generate("add search", "").expect("generate");

        assert_eq!(doc, "# Plan\nsteps\n");
        let calls = executor.calls();
        assert_eq!(calls.len(), 1);
        assert!(calls[0].prompt.contains("add search"));
    }

    #[test]
    fn decomposer_normalizes_fenced_output() {
        let temp = tempfile::tempdir().expect("tempdir");
        let output = "Plan:\n```json\n[{\"title\":\"A\",\"description\":\"a\"}]\n```";
        let executor =
            ScriptedExecutor::new().script("decompose", vec![ScriptedAgent::success(output)]);
        let agent = AgentConfig::default();
        let planner = AgentPlanner::new(&executor, &agent, temp.path());

        let raw = planner.decompose("# Plan", "").expect("decompose");
        assert_eq!(raw.len(), 1);
        assert_eq!(raw[0].title, "A");
    }

    #[test]
    fn failed_agent_is_fatal() {
        let temp = tempfile::tempdir().expect("tempdir");
        let executor =
            ScriptedExecutor::new().script("generate", vec![ScriptedAgent::exit(1, "rate limited")]);
        let agent = AgentConfig::default();
        let planner = AgentPlanner::new(&executor, &agent, temp.path());

        let err = planner.generate("x", "").expect_err("should fail");
        assert!(format!("{err:#}").contains("rate limited"));
    }

    #[test]
    fn codebase_context_includes_readme_head() {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::write(temp.path().join("README.md"), "# Project\nIntro line\n").expect("write");

        let ctx = codebase_context(temp.path());

        assert!(ctx.contains("Intro line"));
    }
}
