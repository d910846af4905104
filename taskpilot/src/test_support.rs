//! Test-only builders and scripted collaborators.
//!
//! The doubles here stand in for the agent CLI, gate commands, the recall
//! tool and the file store so orchestration can be driven deterministically.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::path::Path;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, anyhow};
use chrono::Utc;

use crate::io::context::{MemoryHit, Recall};
use crate::io::executor::{AgentExecutor, ExecOptions, ExecResult, SIGNALED_EXIT_CODE};
use crate::io::gates::{GateResult, GateRunner};
use crate::io::store::{AttemptLog, DocumentRecord, RunRecord, RunStore, RunSummary};
use crate::task::{AttemptStatus, QualityGate, Task, TaskAttempt};

const ABORT_POLL: Duration = Duration::from_millis(5);
/// Upper bound for agents scripted to wait for an abort.
const HANG_LIMIT: Duration = Duration::from_secs(10);

/// Deterministic pending task `task_<seq>` titled `Task <seq>`.
pub fn task(seq: u32) -> Task {
    Task::new(seq, format!("Task {seq}"), format!("Description for task {seq}"))
}

/// Pending task depending on the given ids.
pub fn task_with_deps(seq: u32, deps: &[&str]) -> Task {
    let mut task = task(seq);
    task.depends_on = deps.iter().map(|dep| dep.to_string()).collect();
    task
}

/// Pending task that declares the given files.
pub fn task_with_files(seq: u32, files: &[&str]) -> Task {
    let mut task = task(seq);
    task.files_to_modify = files.iter().map(|file| file.to_string()).collect();
    task
}

/// Recorded attempt with empty outputs.
pub fn attempt(number: u32, status: AttemptStatus) -> TaskAttempt {
    TaskAttempt {
        attempt_number: number,
        status,
        agent_output: String::new(),
        gate_output: String::new(),
        started_at: Utc::now(),
        duration_ms: 0,
    }
}

pub fn gate(kind: &str, command: &str) -> QualityGate {
    QualityGate {
        kind: kind.to_string(),
        command: command.to_string(),
    }
}

/// One scripted agent invocation.
#[derive(Debug, Clone)]
pub struct ScriptedAgent {
    exit_code: i32,
    output: String,
    delay: Duration,
    wait_for_abort: bool,
    spawn_error: bool,
}

impl ScriptedAgent {
    pub fn success(output: &str) -> Self {
        Self::exit(0, output)
    }

    pub fn exit(exit_code: i32, output: &str) -> Self {
        Self {
            exit_code,
            output: output.to_string(),
            delay: Duration::ZERO,
            wait_for_abort: false,
            spawn_error: false,
        }
    }

    /// Agent that declares its task impossible.
    pub fn blocked(reason: &str) -> Self {
        Self::exit(1, &format!("{} {reason}", crate::core::types::BLOCKED_MARKER))
    }

    /// Agent that ran into the executor timeout.
    pub fn timeout() -> Self {
        Self::exit(
            crate::core::types::TIMEOUT_EXIT_CODE,
            "[process timed out after 1s]",
        )
    }

    /// Agent whose command could not be started.
    pub fn spawn_error() -> Self {
        Self {
            spawn_error: true,
            ..Self::exit(SIGNALED_EXIT_CODE, "")
        }
    }

    /// Agent that runs until the executor is aborted.
    pub fn hang() -> Self {
        Self {
            wait_for_abort: true,
            ..Self::exit(0, "")
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// A recorded call to [`ScriptedExecutor::execute`].
#[derive(Debug, Clone)]
pub struct ExecCall {
    pub label: String,
    pub prompt: String,
    pub model: Option<String>,
}

/// Start and end of a scripted invocation, in the order they happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecEvent {
    Started(String),
    Finished(String),
}

/// Executor that replays scripted results per label (task id or planning step).
///
/// Labels without a script left get the default agent, which succeeds.
pub struct ScriptedExecutor {
    scripts: Mutex<HashMap<String, VecDeque<ScriptedAgent>>>,
    default: ScriptedAgent,
    calls: Mutex<Vec<ExecCall>>,
    events: Mutex<Vec<ExecEvent>>,
    active: AtomicUsize,
    max_active: AtomicUsize,
    aborted: AtomicBool,
    abort_after_calls: Option<usize>,
}

impl Default for ScriptedExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            default: ScriptedAgent::success("done"),
            calls: Mutex::new(Vec::new()),
            events: Mutex::new(Vec::new()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
            aborted: AtomicBool::new(false),
            abort_after_calls: None,
        }
    }

    /// Queue results for `label`, consumed one per call.
    pub fn script(self, label: &str, agents: Vec<ScriptedAgent>) -> Self {
        self.scripts
            .lock()
            .expect("scripts lock")
            .entry(label.to_string())
            .or_default()
            .extend(agents);
        self
    }

    pub fn with_default(mut self, agent: ScriptedAgent) -> Self {
        self.default = agent;
        self
    }

    /// Abort itself once this many calls have finished.
    pub fn abort_after(mut self, calls: usize) -> Self {
        self.abort_after_calls = Some(calls);
        self
    }

    pub fn calls(&self) -> Vec<ExecCall> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub fn calls_for(&self, label: &str) -> usize {
        self.calls().iter().filter(|call| call.label == label).count()
    }

    /// Labels in call order.
    pub fn labels(&self) -> Vec<String> {
        self.calls().into_iter().map(|call| call.label).collect()
    }

    pub fn events(&self) -> Vec<ExecEvent> {
        self.events.lock().expect("events lock").clone()
    }

    /// Highest number of invocations that were running at the same time.
    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn was_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    /// True if `a` and `b` were ever running at the same time.
    pub fn ran_concurrently(&self, a: &str, b: &str) -> bool {
        let mut running = HashSet::new();
        for event in self.events() {
            match event {
                ExecEvent::Started(label) => {
                    running.insert(label);
                    if running.contains(a) && running.contains(b) {
                        return true;
                    }
                }
                ExecEvent::Finished(label) => {
                    running.remove(&label);
                }
            }
        }
        false
    }

    fn next_agent(&self, label: &str) -> ScriptedAgent {
        self.scripts
            .lock()
            .expect("scripts lock")
            .get_mut(label)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| self.default.clone())
    }

    fn push_event(&self, event: ExecEvent) {
        self.events.lock().expect("events lock").push(event);
    }

    /// Sleep for `delay`, returning early (true) if aborted meanwhile.
    fn sleep_unless_aborted(&self, delay: Duration) -> bool {
        let deadline = Instant::now() + delay;
        while Instant::now() < deadline {
            if self.was_aborted() {
                return true;
            }
            thread::sleep(ABORT_POLL.min(deadline.saturating_duration_since(Instant::now())));
        }
        self.was_aborted()
    }
}

impl AgentExecutor for ScriptedExecutor {
    fn execute(&self, prompt: &str, opts: &ExecOptions<'_>) -> Result<ExecResult> {
        let call_index = {
            let mut calls = self.calls.lock().expect("calls lock");
            calls.push(ExecCall {
                label: opts.label.to_string(),
                prompt: prompt.to_string(),
                model: opts.model.map(str::to_string),
            });
            calls.len()
        };
        if self.was_aborted() {
            return Ok(ExecResult::aborted("", SIGNALED_EXIT_CODE, 0));
        }
        let agent = self.next_agent(opts.label);
        if agent.spawn_error {
            return Err(anyhow!("spawn scripted agent for {}", opts.label));
        }

        let started = Instant::now();
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);
        self.push_event(ExecEvent::Started(opts.label.to_string()));

        let aborted = if agent.wait_for_abort {
            self.sleep_unless_aborted(HANG_LIMIT)
        } else {
            self.sleep_unless_aborted(agent.delay)
        };
        if let Some(on_output) = opts.on_output {
            for line in agent.output.lines() {
                on_output(line);
            }
        }

        self.push_event(ExecEvent::Finished(opts.label.to_string()));
        self.active.fetch_sub(1, Ordering::SeqCst);
        if self.abort_after_calls.is_some_and(|limit| call_index >= limit) {
            self.abort();
        }

        let elapsed = started.elapsed().as_millis() as u64;
        if aborted {
            return Ok(ExecResult::aborted(
                format!("{}\n[process aborted]", agent.output),
                SIGNALED_EXIT_CODE,
                elapsed,
            ));
        }
        Ok(ExecResult::new(agent.exit_code, agent.output, elapsed))
    }

    fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
    }
}

/// Gate runner replaying a queue of pass/fail verdicts; passes once the queue is empty.
pub struct ScriptedGateRunner {
    verdicts: Mutex<VecDeque<bool>>,
    default_pass: bool,
    calls: AtomicUsize,
}

impl ScriptedGateRunner {
    pub fn passing() -> Self {
        Self::with_verdicts(Vec::new(), true)
    }

    pub fn failing() -> Self {
        Self::with_verdicts(Vec::new(), false)
    }

    /// One verdict per gate invocation, then pass.
    pub fn sequence(verdicts: Vec<bool>) -> Self {
        Self::with_verdicts(verdicts, true)
    }

    fn with_verdicts(verdicts: Vec<bool>, default_pass: bool) -> Self {
        Self {
            verdicts: Mutex::new(verdicts.into()),
            default_pass,
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl GateRunner for ScriptedGateRunner {
    fn run_gate(&self, gate: &QualityGate, _cwd: &Path) -> Result<GateResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let passed = self
            .verdicts
            .lock()
            .expect("verdicts lock")
            .pop_front()
            .unwrap_or(self.default_pass);
        let output = if passed {
            "ok".to_string()
        } else {
            format!("{} reported errors", gate.kind)
        };
        Ok(GateResult {
            kind: gate.kind.clone(),
            command: gate.command.clone(),
            passed,
            output,
        })
    }
}

/// Recall double answering fixed queries.
#[derive(Default)]
pub struct StaticRecall {
    hits: HashMap<String, Vec<MemoryHit>>,
    failing: HashSet<String>,
    queries: Mutex<Vec<String>>,
}

impl StaticRecall {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, query: &str, hits: Vec<MemoryHit>) -> Self {
        self.hits.insert(query.to_string(), hits);
        self
    }

    pub fn failing_on(mut self, query: &str) -> Self {
        self.failing.insert(query.to_string());
        self
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().expect("queries lock").clone()
    }
}

impl Recall for StaticRecall {
    fn recall(&self, query: &str, limit: usize, _threshold: f64) -> Result<Vec<MemoryHit>> {
        self.queries
            .lock()
            .expect("queries lock")
            .push(query.to_string());
        if self.failing.contains(query) {
            return Err(anyhow!("recall backend unavailable"));
        }
        let mut hits = self.hits.get(query).cloned().unwrap_or_default();
        hits.truncate(limit);
        Ok(hits)
    }
}

#[derive(Default)]
struct MemoryState {
    documents: HashMap<String, (DocumentRecord, String)>,
    tasks: HashMap<String, BTreeMap<u32, Task>>,
    runs: Vec<RunRecord>,
    progress: HashMap<String, String>,
    attempt_logs: Vec<(String, AttemptLog)>,
    writes: usize,
}

/// In-memory [`RunStore`] that can be told to start failing writes.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    fail_after_writes: Option<usize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with a document's task set.
    pub fn with_tasks(doc_id: &str, tasks: Vec<Task>) -> Self {
        let store = Self::new();
        {
            let mut state = store.state.lock().expect("store lock");
            state.tasks.insert(
                doc_id.to_string(),
                tasks.into_iter().map(|task| (task.sequence, task)).collect(),
            );
        }
        store
    }

    /// Every write after the first `writes` fails.
    pub fn fail_after_writes(mut self, writes: usize) -> Self {
        self.fail_after_writes = Some(writes);
        self
    }

    pub fn tasks(&self, doc_id: &str) -> Vec<Task> {
        self.load_tasks(doc_id).unwrap_or_default()
    }

    pub fn task(&self, doc_id: &str, task_id: &str) -> Option<Task> {
        self.tasks(doc_id).into_iter().find(|task| task.id == task_id)
    }

    pub fn runs(&self) -> Vec<RunRecord> {
        self.state.lock().expect("store lock").runs.clone()
    }

    pub fn attempt_logs(&self) -> Vec<AttemptLog> {
        self.state
            .lock()
            .expect("store lock")
            .attempt_logs
            .iter()
            .map(|(_, log)| log.clone())
            .collect()
    }

    fn write<T>(&self, apply: impl FnOnce(&mut MemoryState) -> T) -> Result<T> {
        let mut state = self.state.lock().expect("store lock");
        if self.fail_after_writes.is_some_and(|limit| state.writes >= limit) {
            return Err(anyhow!("disk full"));
        }
        state.writes += 1;
        Ok(apply(&mut state))
    }
}

impl RunStore for MemoryStore {
    fn save_document(&self, record: &DocumentRecord, body: &str) -> Result<()> {
        self.write(|state| {
            state
                .documents
                .insert(record.id.clone(), (record.clone(), body.to_string()));
        })
    }

    fn load_document(&self, doc_id: &str) -> Result<(DocumentRecord, String)> {
        self.state
            .lock()
            .expect("store lock")
            .documents
            .get(doc_id)
            .cloned()
            .ok_or_else(|| anyhow!("unknown document '{doc_id}'"))
    }

    fn save_tasks(&self, doc_id: &str, tasks: &[Task]) -> Result<()> {
        self.write(|state| {
            state.tasks.insert(
                doc_id.to_string(),
                tasks
                    .iter()
                    .map(|task| (task.sequence, task.clone()))
                    .collect(),
            );
        })
    }

    fn save_task(&self, doc_id: &str, task: &Task) -> Result<()> {
        self.write(|state| {
            state
                .tasks
                .entry(doc_id.to_string())
                .or_default()
                .insert(task.sequence, task.clone());
        })
    }

    fn load_tasks(&self, doc_id: &str) -> Result<Vec<Task>> {
        self.state
            .lock()
            .expect("store lock")
            .tasks
            .get(doc_id)
            .map(|tasks| tasks.values().cloned().collect())
            .ok_or_else(|| anyhow!("no tasks for document '{doc_id}'"))
    }

    fn save_run(&self, run: &RunRecord) -> Result<()> {
        self.write(|state| {
            match state.runs.iter_mut().find(|existing| existing.id == run.id) {
                Some(existing) => *existing = run.clone(),
                None => state.runs.push(run.clone()),
            }
        })
    }

    fn load_run(&self, run_id: &str) -> Result<RunRecord> {
        self.runs()
            .into_iter()
            .find(|run| run.id == run_id)
            .ok_or_else(|| anyhow!("unknown run '{run_id}'"))
    }

    fn latest_run(&self, doc_id: &str) -> Result<Option<RunRecord>> {
        Ok(self
            .runs()
            .into_iter()
            .filter(|run| run.doc_id == doc_id)
            .next_back())
    }

    fn list_runs(&self) -> Result<Vec<RunSummary>> {
        Ok(self.runs().iter().map(RunRecord::summary).collect())
    }

    fn append_progress(&self, run_id: &str, entry: &str) -> Result<()> {
        self.write(|state| {
            state
                .progress
                .entry(run_id.to_string())
                .or_default()
                .push_str(entry);
        })
    }

    fn read_progress(&self, run_id: &str) -> Result<String> {
        Ok(self
            .state
            .lock()
            .expect("store lock")
            .progress
            .get(run_id)
            .cloned()
            .unwrap_or_default())
    }

    fn save_attempt_log(&self, run_id: &str, log: &AttemptLog) -> Result<()> {
        self.write(|state| {
            state.attempt_logs.push((run_id.to_string(), log.clone()));
        })
    }
}
