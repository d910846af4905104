//! Agent executor abstraction.
//!
//! The [`AgentExecutor`] trait decouples the orchestrator from the actual agent
//! backend (a CLI coding agent fed on stdin). Tests use scripted executors that
//! return predetermined outputs without spawning processes.

use std::path::Path;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, info, instrument, warn};

use crate::core::types::TIMEOUT_EXIT_CODE;
use crate::io::process::{ProcessRequest, run_process};

/// Exit code reported when the process ended without one (killed by a signal).
pub const SIGNALED_EXIT_CODE: i32 = -1;

/// Parameters for one executor invocation.
#[derive(Clone, Copy)]
pub struct ExecOptions<'a> {
    /// Working directory for the agent process.
    pub cwd: &'a Path,
    pub timeout: Duration,
    pub model: Option<&'a str>,
    pub permission_mode: Option<&'a str>,
    pub allowed_tools: &'a [String],
    pub mcp_config: Option<&'a str>,
    /// Identifies the work item (task id, or a planning step) in logs and test doubles.
    pub label: &'a str,
    /// Receives each output line as it arrives.
    pub on_output: Option<&'a (dyn Fn(&str) + Sync)>,
}

impl<'a> ExecOptions<'a> {
    pub fn new(cwd: &'a Path, timeout: Duration, label: &'a str) -> Self {
        Self {
            cwd,
            timeout,
            model: None,
            permission_mode: None,
            allowed_tools: &[],
            mcp_config: None,
            label,
            on_output: None,
        }
    }
}

/// Result of one agent invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecResult {
    /// `exit_code == 0` and not aborted.
    pub success: bool,
    /// Combined stdout/stderr, tail-bounded.
    pub output: String,
    pub duration_ms: u64,
    pub exit_code: i32,
    pub timed_out: bool,
    pub aborted: bool,
}

impl ExecResult {
    pub fn new(exit_code: i32, output: impl Into<String>, duration_ms: u64) -> Self {
        Self {
            success: exit_code == 0,
            output: output.into(),
            duration_ms,
            exit_code,
            timed_out: exit_code == TIMEOUT_EXIT_CODE,
            aborted: false,
        }
    }

    /// Result for an invocation that was cancelled before or while running.
    pub fn aborted(output: impl Into<String>, exit_code: i32, duration_ms: u64) -> Self {
        Self {
            success: false,
            output: output.into(),
            duration_ms,
            exit_code,
            timed_out: false,
            aborted: true,
        }
    }
}

/// Abstraction over agent execution backends.
///
/// Implementations are shared by every worker of a run, so `execute` may be
/// called concurrently and `abort` from any thread.
pub trait AgentExecutor: Send + Sync {
    /// Run the agent once with `prompt` on stdin.
    ///
    /// `Err` means the agent could not be run at all (for example the command
    /// failed to spawn); a non-zero exit is an `Ok` result with `success == false`.
    fn execute(&self, prompt: &str, opts: &ExecOptions<'_>) -> Result<ExecResult>;

    /// Cancel every in-flight and future invocation. Idempotent.
    fn abort(&self);
}

/// Executor that spawns the configured agent CLI once per call.
pub struct ProcessExecutor {
    command: Vec<String>,
    output_limit_bytes: usize,
    aborted: AtomicBool,
}

impl ProcessExecutor {
    pub fn new(command: Vec<String>, output_limit_bytes: usize) -> Result<Self> {
        if command.first().is_none_or(|program| program.trim().is_empty()) {
            return Err(anyhow!("agent command must be a non-empty array"));
        }
        Ok(Self {
            command,
            output_limit_bytes,
            aborted: AtomicBool::new(false),
        })
    }

    fn build_command(&self, opts: &ExecOptions<'_>) -> Command {
        let mut cmd = Command::new(&self.command[0]);
        cmd.args(&self.command[1..]);
        if let Some(model) = opts.model {
            cmd.arg("--model").arg(model);
        }
        if let Some(mode) = opts.permission_mode {
            cmd.arg("--permission-mode").arg(mode);
        }
        if !opts.allowed_tools.is_empty() {
            cmd.arg("--allowedTools").arg(opts.allowed_tools.join(","));
        }
        if let Some(mcp) = opts.mcp_config {
            cmd.arg("--mcp-config").arg(mcp);
        }
        cmd.current_dir(opts.cwd);
        cmd
    }
}

impl AgentExecutor for ProcessExecutor {
    #[instrument(skip_all, fields(label = opts.label, timeout_secs = opts.timeout.as_secs()))]
    fn execute(&self, prompt: &str, opts: &ExecOptions<'_>) -> Result<ExecResult> {
        if self.aborted.load(Ordering::SeqCst) {
            debug!("executor already aborted, not spawning");
            return Ok(ExecResult::aborted("[aborted before start]", SIGNALED_EXIT_CODE, 0));
        }
        info!(cwd = %opts.cwd.display(), program = %self.command[0], "starting agent");

        let started = Instant::now();
        let request = ProcessRequest {
            stdin: Some(prompt.as_bytes()),
            timeout: opts.timeout,
            output_limit_bytes: self.output_limit_bytes,
            abort: Some(&self.aborted),
            on_line: opts.on_output,
            discard_stderr: false,
        };
        let output = run_process(self.build_command(opts), &request)
            .with_context(|| format!("run agent command {}", self.command[0]))?;
        let duration_ms = started.elapsed().as_millis() as u64;

        if output.aborted {
            warn!("agent aborted");
            let code = output.code.unwrap_or(SIGNALED_EXIT_CODE);
            return Ok(ExecResult::aborted(output.output, code, duration_ms));
        }
        let exit_code = if output.timed_out {
            warn!(timeout_secs = opts.timeout.as_secs(), "agent timed out");
            TIMEOUT_EXIT_CODE
        } else {
            output.code.unwrap_or(SIGNALED_EXIT_CODE)
        };
        if exit_code != 0 {
            warn!(exit_code, "agent exited unsuccessfully");
        }
        debug!(exit_code, duration_ms, "agent finished");
        Ok(ExecResult::new(exit_code, output.output, duration_ms))
    }

    fn abort(&self) {
        if !self.aborted.swap(true, Ordering::SeqCst) {
            info!("abort requested for agent executor");
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::thread;

    fn sh_executor(script: &str) -> ProcessExecutor {
        ProcessExecutor::new(
            vec!["sh".to_string(), "-c".to_string(), script.to_string()],
            10_000,
        )
        .expect("executor")
    }

    #[test]
    fn prompt_is_piped_on_stdin() {
        let temp = tempfile::tempdir().expect("tempdir");
        let executor = sh_executor("cat");
        let opts = ExecOptions::new(temp.path(), Duration::from_secs(10), "task_001");

        let result = executor.execute("do the thing", &opts).expect("execute");

        assert!(result.success);
        assert_eq!(result.exit_code, 0);
        assert!(result.output.contains("do the thing"));
    }

    #[test]
    fn output_lines_reach_callback() {
        let temp = tempfile::tempdir().expect("tempdir");
        let executor = sh_executor("echo first; echo second >&2");
        let seen = Mutex::new(Vec::new());
        let on_output = |line: &str| seen.lock().expect("lock").push(line.to_string());
        let mut opts = ExecOptions::new(temp.path(), Duration::from_secs(10), "task_001");
        opts.on_output = Some(&on_output);

        executor.execute("", &opts).expect("execute");

        let seen = seen.lock().expect("lock");
        assert!(seen.contains(&"first".to_string()));
        assert!(seen.contains(&"second".to_string()));
    }

    #[test]
    fn timeout_reports_reserved_exit_code() {
        let temp = tempfile::tempdir().expect("tempdir");
        let executor = sh_executor("sleep 5");
        let opts = ExecOptions::new(temp.path(), Duration::from_millis(200), "task_001");

        let result = executor.execute("", &opts).expect("execute");

        assert!(!result.success);
        assert!(result.timed_out);
        assert_eq!(result.exit_code, TIMEOUT_EXIT_CODE);
        assert!(result.output.contains("timed out"));
    }

    #[test]
    fn abort_stops_running_agent_and_later_calls() {
        let temp = tempfile::tempdir().expect("tempdir");
        let executor = Arc::new(sh_executor("sleep 10"));
        let aborter = executor.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(150));
            aborter.abort();
            aborter.abort();
        });
        let opts = ExecOptions::new(temp.path(), Duration::from_secs(30), "task_001");

        let result = executor.execute("", &opts).expect("execute");
        handle.join().expect("join");

        assert!(result.aborted);
        assert!(!result.success);

        let again = executor.execute("", &opts).expect("execute");
        assert!(again.aborted);
    }

    #[test]
    fn nonzero_exit_is_unsuccessful() {
        let temp = tempfile::tempdir().expect("tempdir");
        let executor = sh_executor("echo nope; exit 2");
        let opts = ExecOptions::new(temp.path(), Duration::from_secs(10), "task_001");

        let result = executor.execute("", &opts).expect("execute");

        assert!(!result.success);
        assert_eq!(result.exit_code, 2);
    }

    #[test]
    fn empty_command_is_rejected() {
        assert!(ProcessExecutor::new(Vec::new(), 100).is_err());
        assert!(ProcessExecutor::new(vec![" ".to_string()], 100).is_err());
    }

    #[test]
    fn missing_program_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let executor = ProcessExecutor::new(vec!["taskpilot-no-such-agent".to_string()], 100)
            .expect("executor");
        let opts = ExecOptions::new(temp.path(), Duration::from_secs(1), "task_001");
        assert!(executor.execute("", &opts).is_err());
    }
}
