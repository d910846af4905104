//! Run loop: validate, schedule, dispatch attempts, apply results.
//!
//! The orchestrator is the only writer of task state. In team mode workers
//! run [`run_attempt`] on scoped threads and send their reports back over a
//! channel; the orchestrator applies them one at a time, persists, and then
//! dispatches whatever became ready.
//!
//! Task records are saved when an attempt starts (`in_progress`) and when it
//! is recorded, so a crash leaves at most the running tasks `in_progress`.
//! `--resume` resets those to `pending` and keeps their attempts.

use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Instant;

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::attempt::{AttemptEnv, AttemptJob, AttemptReport, AttemptSettings, run_attempt};
use crate::core::graph::{ConflictMap, validate_graph};
use crate::core::invariants::validate_task_invariants;
use crate::core::lifecycle::{begin_attempt, propagate_failures, record_attempt, reset_interrupted};
use crate::core::scheduler::{Scope, TaskTable, next_dispatchable, plan_waves};
use crate::core::types::{AttemptDecision, FailReason, RunConfig, RunMode, RunStop};
use crate::error::RunError;
use crate::io::config::{BranchConfig, TaskpilotConfig};
use crate::io::context::Recall;
use crate::io::executor::AgentExecutor;
use crate::io::gates::GateRunner;
use crate::io::git::VersionControl;
use crate::io::prompt::{ComposedPrompt, PromptComposer, tail_chars};
use crate::io::store::{AttemptLog, RunRecord, RunStatus, RunStore, TaskOutcome};
use crate::task::{AttemptStatus, Task, TaskAttempt, TaskStatus};

/// Characters of failure output quoted in a progress entry.
const PROGRESS_FAILURE_CHARS: usize = 500;

/// External collaborators of a run.
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub executor: &'a dyn AgentExecutor,
    pub gates: &'a dyn GateRunner,
    pub recall: &'a dyn Recall,
    pub store: &'a dyn RunStore,
    /// Required only when a run asks for branch isolation.
    pub vcs: Option<&'a dyn VersionControl>,
}

/// Settings that come from project configuration rather than the run request.
#[derive(Debug, Clone)]
pub struct OrchestratorSettings {
    pub attempt: AttemptSettings,
    pub prompt_budget_bytes: usize,
    pub branch: BranchConfig,
}

impl OrchestratorSettings {
    pub fn from_config(config: &TaskpilotConfig, project_root: &Path) -> Self {
        Self {
            attempt: AttemptSettings {
                cwd: project_root.to_path_buf(),
                gates: config.gates.clone(),
                agent_timeout: config.agent_timeout(),
                model: config.agent.model.clone(),
                permission_mode: config.agent.permission_mode.clone(),
                allowed_tools: config.agent.allowed_tools.clone(),
                mcp_config: config.agent.mcp_config.clone(),
                recall: config.recall.settings(),
            },
            prompt_budget_bytes: config.prompt.budget_bytes,
            branch: config.branch.clone(),
        }
    }
}

/// Result of [`Orchestrator::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunOutcome {
    /// `None` for a dry run.
    pub run_id: Option<String>,
    /// No task failed and the run was not cut short.
    pub success: bool,
    pub stop: RunStop,
    /// Topological order of the whole task set.
    pub order: Vec<String>,
    /// Predicted dispatch waves at start.
    pub waves: Vec<Vec<String>>,
    pub warnings: Vec<String>,
    pub outcomes: Vec<TaskOutcome>,
    pub duration_ms: u64,
}

impl RunOutcome {
    pub fn count(&self, status: TaskStatus) -> usize {
        self.outcomes
            .iter()
            .filter(|outcome| outcome.status == status)
            .count()
    }
}

/// Mutable state of one run, owned by the orchestrator thread.
struct RunState {
    doc_id: String,
    table: TaskTable,
    order: Vec<String>,
    conflicts: ConflictMap,
    scope: Scope,
    record: RunRecord,
    /// Last prompt per task, reused for retries within this run.
    prompts: HashMap<String, ComposedPrompt>,
    /// Attempts started by this run.
    iterations: u32,
    max_iterations: u32,
}

pub struct Orchestrator<'a> {
    deps: Collaborators<'a>,
    settings: OrchestratorSettings,
    composer: PromptComposer,
    aborted: AtomicBool,
}

impl<'a> Orchestrator<'a> {
    pub fn new(deps: Collaborators<'a>, settings: OrchestratorSettings) -> Self {
        let composer = PromptComposer::new(settings.prompt_budget_bytes);
        Self {
            deps,
            settings,
            composer,
            aborted: AtomicBool::new(false),
        }
    }

    /// Stop dispatching and cancel running attempts. Safe to call from any thread.
    ///
    /// Aborted attempts are not recorded; their tasks stay `in_progress` on
    /// disk and are reset by the next `--resume`.
    pub fn abort(&self) {
        if !self.aborted.swap(true, Ordering::SeqCst) {
            info!("abort requested");
        }
        self.deps.executor.abort();
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Execute (or with `dry_run`, plan) the task set of `doc_id`.
    ///
    /// Errors:
    /// - [`RunError::Validation`]: invalid graph or request; nothing ran.
    /// - [`RunError::ResumeRefused`]: the previous run already ended.
    /// - [`RunError::Storage`]: persistence failed mid-run; the run was aborted.
    #[instrument(skip_all, fields(doc = doc_id, mode = config.mode.as_str()))]
    pub fn run(&self, doc_id: &str, config: &RunConfig) -> Result<RunOutcome> {
        let started = Instant::now();
        let mut tasks = self
            .deps
            .store
            .load_tasks(doc_id)
            .with_context(|| format!("load tasks for {doc_id}"))?;

        let previous = if config.resume {
            Some(self.resumable_run(doc_id, config.force)?)
        } else {
            None
        };
        let reset = if config.resume {
            reset_interrupted(&mut tasks)
        } else {
            Vec::new()
        };
        if !reset.is_empty() {
            info!(tasks = ?reset, "reset interrupted tasks to pending");
        }

        let report = validate_graph(&tasks);
        let mut errors = report.errors.clone();
        errors.extend(validate_task_invariants(&tasks));
        errors.extend(request_errors(&tasks, config));
        if !errors.is_empty() {
            return Err(RunError::Validation(errors).into());
        }
        for warning in &report.warnings {
            warn!("{warning}");
        }

        let scope = Scope::from_filter(config.task_filter.as_deref());
        let mut table = TaskTable::new(tasks);
        let skipped = propagate_failures(table.tasks_mut());
        let waves = plan_waves(
            &table,
            &report.order,
            &report.conflicts,
            &scope,
            config.effective_concurrency(),
        );
        debug!(waves = waves.len(), "planned dispatch waves");

        if config.dry_run {
            let outcomes = outcomes(&table);
            let success = outcomes.iter().all(|o| o.status != TaskStatus::Failed);
            return Ok(RunOutcome {
                run_id: None,
                success,
                stop: RunStop::DryRun,
                order: report.order,
                waves,
                warnings: report.warnings,
                outcomes,
                duration_ms: started.elapsed().as_millis() as u64,
            });
        }

        let mut record = match previous {
            Some(mut record) => {
                record.status = RunStatus::Running;
                record.mode = config.mode;
                record.finished_at = None;
                record
            }
            None => RunRecord::new(doc_id, config.mode),
        };
        let original_branch = if config.use_branch {
            Some(self.enter_branch(&mut record)?)
        } else {
            None
        };
        self.persist(|store| store.save_run(&record))?;
        for id in reset.iter().chain(&skipped) {
            if let Some(task) = table.get(id) {
                self.persist(|store| store.save_task(doc_id, task))?;
            }
        }
        info!(run = %record.id, tasks = table.tasks().len(), "run started");

        let mut state = RunState {
            doc_id: doc_id.to_string(),
            table,
            order: report.order,
            conflicts: report.conflicts,
            scope,
            record,
            prompts: HashMap::new(),
            iterations: 0,
            max_iterations: config.max_iterations,
        };
        let attempt_settings = self.attempt_settings(config);
        let env = AttemptEnv {
            executor: self.deps.executor,
            gate_runner: self.deps.gates,
            recall: self.deps.recall,
            composer: &self.composer,
            settings: &attempt_settings,
        };
        let stop = match config.mode {
            RunMode::Loop => self.run_loop(&env, &mut state)?,
            RunMode::Team => self.run_team(&env, &mut state, config.effective_concurrency())?,
        };

        let outcomes = outcomes(&state.table);
        let failed = outcomes.iter().any(|o| o.status == TaskStatus::Failed);
        let success = !failed && !stop.is_interrupted();
        state.record.status = match stop {
            RunStop::Aborted => RunStatus::Aborted,
            RunStop::IterationLimit | RunStop::Stalled => RunStatus::Stopped,
            _ if failed => RunStatus::Failed,
            _ => RunStatus::Completed,
        };
        state.record.finished_at = Some(Utc::now());
        state.record.outcomes = outcomes.clone();
        self.persist(|store| store.save_run(&state.record))?;

        if let Some(original) = original_branch
            && stop != RunStop::Aborted
        {
            self.leave_branch(&original, success);
        }
        info!(
            run = %state.record.id,
            status = state.record.status.as_str(),
            ?stop,
            "run finished"
        );

        Ok(RunOutcome {
            run_id: Some(state.record.id),
            success,
            stop,
            order: state.order,
            waves,
            warnings: report.warnings,
            outcomes,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    fn resumable_run(&self, doc_id: &str, force: bool) -> Result<RunRecord> {
        let Some(record) = self.deps.store.latest_run(doc_id)? else {
            return Err(RunError::validation(format!(
                "no previous run of {doc_id} to resume"
            ))
            .into());
        };
        if record.status.is_terminal() && !force {
            return Err(RunError::ResumeRefused {
                run_id: record.id,
                status: record.status.as_str().to_string(),
            }
            .into());
        }
        info!(run = %record.id, status = record.status.as_str(), "resuming run");
        Ok(record)
    }

    fn attempt_settings(&self, config: &RunConfig) -> AttemptSettings {
        let mut settings = self.settings.attempt.clone();
        if let Some(model) = &config.model_override {
            settings.model = Some(model.clone());
        }
        settings
    }

    /// Check out the run branch and return the branch to go back to.
    fn enter_branch(&self, record: &mut RunRecord) -> Result<String> {
        let vcs = self
            .deps
            .vcs
            .ok_or_else(|| RunError::validation("branch isolation needs a git repository"))?;
        let original = match &record.original_branch {
            Some(original) => original.clone(),
            None => vcs.current_branch()?,
        };
        let branch = record
            .branch
            .clone()
            .unwrap_or_else(|| format!("{}{}", self.settings.branch.prefix, record.id));
        vcs.create_and_checkout(&branch)?;
        info!(branch = %branch, original = %original, "working on run branch");
        record.branch = Some(branch);
        record.original_branch = Some(original.clone());
        Ok(original)
    }

    fn leave_branch(&self, original: &str, success: bool) {
        let restore = if success {
            self.settings.branch.restore_on_success
        } else {
            self.settings.branch.restore_on_failure
        };
        let Some(vcs) = self.deps.vcs else {
            return;
        };
        if !restore {
            info!("staying on run branch");
            return;
        }
        if let Err(err) = vcs.restore(original) {
            warn!(err = %format!("{err:#}"), branch = original, "could not restore branch");
        }
    }

    /// Serial mode: one attempt at a time in topological order.
    fn run_loop(&self, env: &AttemptEnv<'_>, state: &mut RunState) -> Result<RunStop> {
        loop {
            if let Some(stop) = self.stop_reason(state) {
                return Ok(stop);
            }
            let Some(id) = next_dispatchable(
                &state.table,
                &state.order,
                &BTreeSet::new(),
                &state.conflicts,
                &state.scope,
            )
            .map(str::to_string) else {
                return Ok(stalled());
            };
            let job = self.start_attempt(state, &id)?;
            let report = run_attempt(env, job)?;
            self.apply_report(state, report)?;
        }
    }

    /// Team mode: up to `concurrency` attempts on worker threads.
    fn run_team(
        &self,
        env: &AttemptEnv<'_>,
        state: &mut RunState,
        concurrency: usize,
    ) -> Result<RunStop> {
        thread::scope(|scope| {
            let (tx, rx) = mpsc::channel::<(String, Result<AttemptReport>)>();
            let mut running: BTreeSet<String> = BTreeSet::new();
            let mut failure: Option<anyhow::Error> = None;

            loop {
                while failure.is_none() && running.len() < concurrency {
                    if self.stop_reason(state).is_some() {
                        break;
                    }
                    let Some(id) = next_dispatchable(
                        &state.table,
                        &state.order,
                        &running,
                        &state.conflicts,
                        &state.scope,
                    )
                    .map(str::to_string) else {
                        break;
                    };
                    match self.start_attempt(state, &id) {
                        Ok(job) => {
                            debug!(task = %id, running = running.len() + 1, "dispatching");
                            running.insert(id.clone());
                            let tx = tx.clone();
                            scope.spawn(move || {
                                let result = run_attempt(env, job);
                                let _ = tx.send((id, result));
                            });
                        }
                        Err(err) => {
                            self.abort();
                            failure = Some(err);
                        }
                    }
                }

                if running.is_empty() {
                    if let Some(err) = failure {
                        return Err(err);
                    }
                    return Ok(self.stop_reason(state).unwrap_or_else(stalled));
                }

                let Ok((id, result)) = rx.recv() else {
                    return Err(anyhow!("attempt workers disconnected"));
                };
                running.remove(&id);
                if failure.is_some() {
                    continue;
                }
                if let Err(err) = result.and_then(|report| self.apply_report(state, report)) {
                    self.abort();
                    failure = Some(err);
                }
            }
        })
    }

    /// Why scheduling should stop now, if it should.
    fn stop_reason(&self, state: &RunState) -> Option<RunStop> {
        if !state.table.has_unfinished(&state.scope) {
            Some(RunStop::Finished)
        } else if self.is_aborted() {
            Some(RunStop::Aborted)
        } else if state.iterations >= state.max_iterations {
            warn!(max = state.max_iterations, "iteration limit reached");
            Some(RunStop::IterationLimit)
        } else {
            None
        }
    }

    /// Mark `id` in progress, persist it, and package the attempt for a worker.
    fn start_attempt(&self, state: &mut RunState, id: &str) -> Result<AttemptJob> {
        let task = state
            .table
            .get_mut(id)
            .ok_or_else(|| anyhow!("unknown task '{id}'"))?;
        let attempt_number = begin_attempt(task).map_err(|msg| anyhow!(msg))?;
        let task = task.clone();
        self.persist(|store| store.save_task(&state.doc_id, &task))?;
        let progress = self.persist(|store| store.read_progress(&state.record.id))?;
        state.iterations += 1;
        info!(task = %id, attempt = attempt_number, "attempt started");
        Ok(AttemptJob {
            previous_prompt: state.prompts.get(id).cloned(),
            task,
            attempt_number,
            progress,
        })
    }

    /// Record a finished attempt and apply the retry policy.
    fn apply_report(&self, state: &mut RunState, report: AttemptReport) -> Result<()> {
        if report.aborted {
            self.aborted.store(true, Ordering::SeqCst);
            debug!(task = %report.task_id, "aborted attempt left unrecorded");
            return Ok(());
        }

        let log = AttemptLog {
            task_id: report.task_id.clone(),
            prompt: report.prompt.render(),
            agent_output: report.agent_output,
            gate_report: report.gate_report,
            attempt: report.attempt.clone(),
        };
        self.persist(|store| store.save_attempt_log(&state.record.id, &log))?;

        let task = state
            .table
            .get_mut(&report.task_id)
            .ok_or_else(|| anyhow!("unknown task '{}'", report.task_id))?;
        let decision = record_attempt(task, report.attempt).map_err(|msg| anyhow!(msg))?;
        let task = task.clone();
        self.persist(|store| store.save_task(&state.doc_id, &task))?;
        state.prompts.insert(task.id.clone(), report.prompt);

        match decision {
            AttemptDecision::Complete => {
                info!(task = %task.id, "task completed");
                let entry = progress_entry(&task, "completed", None);
                self.persist(|store| store.append_progress(&state.record.id, &entry))?;
            }
            AttemptDecision::Retry => {
                info!(task = %task.id, remaining = task.remaining_attempts(), "will retry");
            }
            AttemptDecision::Fail(reason) => {
                let label = match reason {
                    FailReason::Blocked => "failed (blocked)",
                    FailReason::Exhausted => "failed (attempts exhausted)",
                };
                warn!(task = %task.id, ?reason, "task failed");
                let entry = progress_entry(&task, label, task.last_attempt().map(failure_tail));
                self.persist(|store| store.append_progress(&state.record.id, &entry))?;

                let skipped = propagate_failures(state.table.tasks_mut());
                for id in &skipped {
                    if let Some(skipped_task) = state.table.get(id) {
                        self.persist(|store| store.save_task(&state.doc_id, skipped_task))?;
                    }
                }
                if !skipped.is_empty() {
                    info!(tasks = ?skipped, "skipped dependents of failed task");
                }
            }
        }
        Ok(())
    }

    /// Run a store operation; failure aborts in-flight work and becomes [`RunError::Storage`].
    fn persist<T>(&self, op: impl FnOnce(&dyn RunStore) -> Result<T>) -> Result<T> {
        op(self.deps.store).map_err(|err| {
            warn!(err = %format!("{err:#}"), "storage failure; aborting run");
            self.abort();
            RunError::Storage(err).into()
        })
    }
}

fn stalled() -> RunStop {
    warn!("pending tasks remain but none can be dispatched");
    RunStop::Stalled
}

/// Request-level checks beyond the graph itself.
fn request_errors(tasks: &[Task], config: &RunConfig) -> Vec<String> {
    let mut errors = Vec::new();
    if let Some(filter) = &config.task_filter
        && !tasks.iter().any(|task| &task.id == filter)
    {
        errors.push(format!("--task names unknown task '{filter}'"));
    }
    if !config.resume {
        let scope = Scope::from_filter(config.task_filter.as_deref());
        for task in tasks.iter().filter(|task| scope.includes(&task.id)) {
            if task.status != TaskStatus::Pending {
                errors.push(format!(
                    "task '{}' is already {}; use --resume to continue the previous run",
                    task.id,
                    task.status.as_str()
                ));
            }
        }
    }
    errors
}

fn outcomes(table: &TaskTable) -> Vec<TaskOutcome> {
    table.tasks().iter().map(TaskOutcome::of).collect()
}

fn failure_tail(attempt: &TaskAttempt) -> String {
    let quote_agent =
        attempt.status == AttemptStatus::Blocked || attempt.gate_output.trim().is_empty();
    let source = if quote_agent {
        &attempt.agent_output
    } else {
        &attempt.gate_output
    };
    tail_chars(source.trim(), PROGRESS_FAILURE_CHARS).to_string()
}

fn progress_entry(task: &Task, outcome: &str, detail: Option<String>) -> String {
    let mut entry = format!(
        "### {} {outcome} after {} attempt(s): {}\n",
        task.id,
        task.attempts.len(),
        task.title
    );
    if let Some(detail) = detail.filter(|d| !d.is_empty()) {
        entry.push_str("```\n");
        entry.push_str(&detail);
        entry.push_str("\n```\n");
    }
    entry.push('\n');
    entry
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{attempt, task};

    #[test]
    fn progress_entry_quotes_failure_tail() {
        let mut t = task(2);
        t.attempts.push(attempt(1, AttemptStatus::Failure));
        t.attempts[0].gate_output = "error[E0308]: mismatched types".into();

        let detail = t.last_attempt().map(failure_tail);
        let entry = progress_entry(&t, "failed (attempts exhausted)", detail);

        assert!(entry.starts_with(
            "### task_002 failed (attempts exhausted) after 1 attempt(s): Task 2\n"
        ));
        assert!(entry.contains("mismatched types"));
    }

    #[test]
    fn blocked_entry_quotes_the_agent_reason() {
        let mut blocked = attempt(1, AttemptStatus::Blocked);
        blocked.agent_output = "BLOCKED: the upstream API was removed".into();
        blocked.gate_output = "== test [PASS] ==".into();

        assert!(failure_tail(&blocked).contains("upstream API was removed"));
    }

    #[test]
    fn fresh_run_rejects_non_pending_tasks_in_scope() {
        let mut done = task(1);
        done.status = TaskStatus::Completed;
        let tasks = vec![done, task(2)];

        let all = request_errors(&tasks, &RunConfig::default());
        let only_second = request_errors(
            &tasks,
            &RunConfig {
                task_filter: Some("task_002".into()),
                ..RunConfig::default()
            },
        );
        let resumed = request_errors(
            &tasks,
            &RunConfig {
                resume: true,
                ..RunConfig::default()
            },
        );

        assert_eq!(all.len(), 1);
        assert!(all[0].contains("task_001"));
        assert!(only_second.is_empty());
        assert!(resumed.is_empty());
    }

    #[test]
    fn unknown_filter_is_reported() {
        let errors = request_errors(
            &[task(1)],
            &RunConfig {
                task_filter: Some("task_009".into()),
                ..RunConfig::default()
            },
        );
        assert!(errors.iter().any(|e| e.contains("task_009")));
    }
}
