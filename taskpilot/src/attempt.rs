//! One task attempt: context, prompt, agent, gates, verdict.
//!
//! Workers run this without touching the task table; the orchestrator
//! applies the returned [`AttemptReport`].

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, trace, warn};

use crate::core::lifecycle::classify_attempt;
use crate::io::context::{Recall, RecallSettings, assemble_context};
use crate::io::executor::{AgentExecutor, ExecOptions, ExecResult, SIGNALED_EXIT_CODE};
use crate::io::gates::{GateRunner, all_passed, format_gate_report, run_gates};
use crate::io::prompt::{ComposedPrompt, FailureContext, PromptComposer, tail_chars};
use crate::task::{AttemptStatus, QualityGate, Task, TaskAttempt};

/// Characters of agent output kept on the task record.
pub const RECORDED_AGENT_CHARS: usize = 4_000;
/// Characters of gate output kept on the task record.
pub const RECORDED_GATE_CHARS: usize = 8_000;

/// Per-run settings shared by every attempt.
#[derive(Debug, Clone)]
pub struct AttemptSettings {
    /// Working directory for the agent and the gates.
    pub cwd: PathBuf,
    pub gates: Vec<QualityGate>,
    pub agent_timeout: Duration,
    pub model: Option<String>,
    pub permission_mode: Option<String>,
    pub allowed_tools: Vec<String>,
    pub mcp_config: Option<String>,
    pub recall: RecallSettings,
}

impl AttemptSettings {
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: cwd.into(),
            gates: Vec::new(),
            agent_timeout: Duration::from_secs(30 * 60),
            model: None,
            permission_mode: None,
            allowed_tools: Vec::new(),
            mcp_config: None,
            recall: RecallSettings::default(),
        }
    }
}

/// Collaborators an attempt needs. Shared by reference across worker threads.
pub struct AttemptEnv<'a> {
    pub executor: &'a dyn AgentExecutor,
    pub gate_runner: &'a dyn GateRunner,
    pub recall: &'a dyn Recall,
    pub composer: &'a PromptComposer,
    pub settings: &'a AttemptSettings,
}

/// Everything a worker needs to run one attempt of one task.
#[derive(Debug, Clone)]
pub struct AttemptJob {
    /// Snapshot taken when the task was dispatched.
    pub task: Task,
    pub attempt_number: u32,
    /// Prompt of this task's previous attempt in the same run, if any.
    pub previous_prompt: Option<ComposedPrompt>,
    /// Run progress log at dispatch time.
    pub progress: String,
}

/// What happened during one attempt.
#[derive(Debug, Clone)]
pub struct AttemptReport {
    pub task_id: String,
    /// Classified attempt, ready to record. Meaningless when `aborted`.
    pub attempt: TaskAttempt,
    pub aborted: bool,
    pub prompt: ComposedPrompt,
    /// Full agent output as returned by the executor.
    pub agent_output: String,
    pub gate_report: String,
}

/// Run one attempt end to end.
///
/// Agent and gate failures are part of the report; `Err` means the prompt
/// could not be rendered.
#[instrument(skip_all, fields(task = %job.task.id, attempt = job.attempt_number))]
pub fn run_attempt(env: &AttemptEnv<'_>, job: AttemptJob) -> Result<AttemptReport> {
    let started_at = Utc::now();
    let started = Instant::now();
    let prompt = build_prompt(env, &job)?;

    let task_id = job.task.id.as_str();
    let log_line = |line: &str| trace!(task = task_id, "{line}");
    let opts = ExecOptions {
        model: env.settings.model.as_deref(),
        permission_mode: env.settings.permission_mode.as_deref(),
        allowed_tools: &env.settings.allowed_tools,
        mcp_config: env.settings.mcp_config.as_deref(),
        on_output: Some(&log_line),
        ..ExecOptions::new(&env.settings.cwd, env.settings.agent_timeout, task_id)
    };
    info!("starting agent");
    let result = match env.executor.execute(&prompt.render(), &opts) {
        Ok(result) => result,
        Err(err) => {
            warn!(err = %format!("{err:#}"), "agent could not be run");
            ExecResult::new(
                SIGNALED_EXIT_CODE,
                format!("failed to run agent: {err:#}"),
                started.elapsed().as_millis() as u64,
            )
        }
    };

    if result.aborted {
        info!("attempt aborted");
        return Ok(AttemptReport {
            task_id: job.task.id.clone(),
            attempt: record(&job, started_at, started, &result, ""),
            aborted: true,
            prompt,
            agent_output: result.output,
            gate_report: String::new(),
        });
    }

    // Gates run for every finished attempt, not only successful ones.
    let results = run_gates(env.gate_runner, &env.settings.gates, &env.settings.cwd);
    let gates_passed = all_passed(&results);
    let gate_report = format_gate_report(&results);
    let mut attempt = record(&job, started_at, started, &result, &gate_report);
    attempt.status = classify_attempt(
        result.success,
        result.timed_out,
        gates_passed,
        &result.output,
    );
    info!(
        status = ?attempt.status,
        exit_code = result.exit_code,
        gates_passed,
        "attempt finished"
    );

    Ok(AttemptReport {
        task_id: job.task.id.clone(),
        attempt,
        aborted: false,
        prompt,
        agent_output: result.output,
        gate_report,
    })
}

/// First attempt: assemble context and compose. Later attempts: previous
/// prompt (or a fresh one after a restart) with the last failure attached.
fn build_prompt(env: &AttemptEnv<'_>, job: &AttemptJob) -> Result<ComposedPrompt> {
    let last_failure = job.task.last_attempt().map(|last| FailureContext {
        attempt_number: last.attempt_number,
        gate_output: last.gate_output.clone(),
        agent_output: last.agent_output.clone(),
    });
    let base = match &job.previous_prompt {
        Some(previous) if last_failure.is_some() => previous.clone(),
        _ => {
            let assembled =
                assemble_context(env.recall, env.settings.recall, &job.task, &job.progress);
            env.composer
                .compose(&job.task, &env.settings.gates, &assembled)?
        }
    };
    match last_failure {
        Some(failure) => {
            debug!(previous = failure.attempt_number, "adding retry context");
            env.composer.retry(&base, &failure)
        }
        None => Ok(base),
    }
}

fn record(
    job: &AttemptJob,
    started_at: DateTime<Utc>,
    started: Instant,
    result: &ExecResult,
    gate_report: &str,
) -> TaskAttempt {
    TaskAttempt {
        attempt_number: job.attempt_number,
        status: if result.timed_out {
            AttemptStatus::Timeout
        } else {
            AttemptStatus::Failure
        },
        agent_output: tail_chars(&result.output, RECORDED_AGENT_CHARS).to_string(),
        gate_output: tail_chars(gate_report, RECORDED_GATE_CHARS).to_string(),
        started_at,
        duration_ms: started.elapsed().as_millis() as u64,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::context::NoRecall;
    use crate::io::prompt::RETRY_MARKER;
    use crate::io::prompt::strip_retry_context;
    use crate::test_support::{
        ScriptedAgent, ScriptedExecutor, ScriptedGateRunner, attempt, gate, task,
    };

    fn settings() -> AttemptSettings {
        AttemptSettings {
            gates: vec![gate("test", "cargo test")],
            ..AttemptSettings::new("/tmp")
        }
    }

    fn job(task: Task) -> AttemptJob {
        let attempt_number = task.attempts.len() as u32 + 1;
        AttemptJob {
            task,
            attempt_number,
            previous_prompt: None,
            progress: String::new(),
        }
    }

    fn run(
        executor: &ScriptedExecutor,
        gates: &ScriptedGateRunner,
        job: AttemptJob,
    ) -> AttemptReport {
        let composer = PromptComposer::default();
        let settings = settings();
        let env = AttemptEnv {
            executor,
            gate_runner: gates,
            recall: &NoRecall,
            composer: &composer,
            settings: &settings,
        };
        run_attempt(&env, job).expect("attempt")
    }

    #[test]
    fn success_with_passing_gates() {
        let executor = ScriptedExecutor::new();
        let gates = ScriptedGateRunner::passing();

        let report = run(&executor, &gates, job(task(1)));

        assert_eq!(report.attempt.status, AttemptStatus::Success);
        assert_eq!(report.attempt.attempt_number, 1);
        assert_eq!(gates.calls(), 1);
        assert!(report.gate_report.contains("[PASS]"));
        assert!(!report.prompt.user.contains(RETRY_MARKER));
    }

    #[test]
    fn failing_gate_fails_the_attempt() {
        let executor = ScriptedExecutor::new();
        let gates = ScriptedGateRunner::failing();

        let report = run(&executor, &gates, job(task(1)));

        assert_eq!(report.attempt.status, AttemptStatus::Failure);
        assert!(report.attempt.gate_output.contains("test reported errors"));
    }

    #[test]
    fn failed_agent_still_runs_gates_but_cannot_succeed() {
        let executor =
            ScriptedExecutor::new().script("task_001", vec![ScriptedAgent::exit(2, "boom")]);
        let gates = ScriptedGateRunner::passing();

        let report = run(&executor, &gates, job(task(1)));

        assert_eq!(report.attempt.status, AttemptStatus::Failure);
        assert_eq!(gates.calls(), 1);
        assert!(report.gate_report.contains("[PASS]"));
    }

    /// The gate errors left by a timed-out attempt reach the next prompt.
    #[test]
    fn retry_after_timeout_carries_gate_output() {
        let executor = ScriptedExecutor::new().script(
            "task_001",
            vec![ScriptedAgent::timeout(), ScriptedAgent::success("done")],
        );
        let gates = ScriptedGateRunner::sequence(vec![false]);
        let mut t = task(1);

        let first = run(&executor, &gates, job(t.clone()));
        assert_eq!(first.attempt.status, AttemptStatus::Timeout);
        assert!(first.attempt.gate_output.contains("test reported errors"));

        t.attempts.push(first.attempt.clone());
        let mut retry_job = job(t);
        retry_job.previous_prompt = Some(first.prompt.clone());
        let second = run(&executor, &gates, retry_job);

        assert!(second.prompt.user.contains(RETRY_MARKER));
        assert!(second.prompt.user.contains("test reported errors"));
        assert_eq!(second.attempt.status, AttemptStatus::Success);
        assert_eq!(gates.calls(), 2);
    }

    #[test]
    fn timeout_and_blocked_are_classified() {
        let executor = ScriptedExecutor::new().script(
            "task_001",
            vec![ScriptedAgent::timeout(), ScriptedAgent::blocked("schema is missing")],
        );
        let gates = ScriptedGateRunner::passing();

        let first = run(&executor, &gates, job(task(1)));
        let second = run(&executor, &gates, job(task(1)));

        assert_eq!(first.attempt.status, AttemptStatus::Timeout);
        assert_eq!(second.attempt.status, AttemptStatus::Blocked);
    }

    #[test]
    fn spawn_error_becomes_a_failed_attempt() {
        let executor =
            ScriptedExecutor::new().script("task_001", vec![ScriptedAgent::spawn_error()]);
        let gates = ScriptedGateRunner::passing();

        let report = run(&executor, &gates, job(task(1)));

        assert!(!report.aborted);
        assert_eq!(report.attempt.status, AttemptStatus::Failure);
        assert!(report.agent_output.contains("failed to run agent"));
    }

    #[test]
    fn retry_reuses_previous_prompt_with_one_failure_section() {
        let executor = ScriptedExecutor::new();
        let gates = ScriptedGateRunner::passing();
        let mut t = task(1);
        let first = run(&executor, &gates, job(t.clone()));

        let mut failed = attempt(1, AttemptStatus::Failure);
        failed.gate_output = "assertion failed: left == right".into();
        t.attempts.push(failed);
        let mut retry_job = job(t.clone());
        retry_job.previous_prompt = Some(first.prompt.clone());
        let second = run(&executor, &gates, retry_job);

        let mut again = attempt(2, AttemptStatus::Failure);
        again.gate_output = "still failing".into();
        t.attempts.push(again);
        let mut third_job = job(t);
        third_job.previous_prompt = Some(second.prompt.clone());
        let third = run(&executor, &gates, third_job);

        assert_eq!(second.attempt.attempt_number, 2);
        assert!(second.prompt.user.contains("assertion failed"));
        assert_eq!(third.prompt.user.matches(RETRY_MARKER).count(), 1);
        assert!(third.prompt.user.contains("still failing"));
        assert!(!third.prompt.user.contains("assertion failed"));
        assert!(
            third
                .prompt
                .user
                .starts_with(strip_retry_context(&first.prompt.user))
        );
    }

    /// After a restart there is no cached prompt; the failure still reaches the agent.
    #[test]
    fn resumed_retry_composes_fresh_prompt_with_failure() {
        let executor = ScriptedExecutor::new();
        let gates = ScriptedGateRunner::passing();
        let mut t = task(1);
        let mut failed = attempt(1, AttemptStatus::Timeout);
        failed.agent_output = "compiling...".into();
        t.attempts.push(failed);

        let report = run(&executor, &gates, job(t));

        assert!(report.prompt.user.contains(RETRY_MARKER));
        assert!(report.prompt.user.contains("compiling..."));
        assert_eq!(executor.calls()[0].label, "task_001");
    }

    #[test]
    fn aborted_agent_reports_abort_without_running_gates() {
        let executor = ScriptedExecutor::new();
        executor.abort();
        let gates = ScriptedGateRunner::passing();

        let report = run(&executor, &gates, job(task(1)));

        assert!(report.aborted);
        assert_eq!(gates.calls(), 0);
    }
}
