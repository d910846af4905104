//! Persistence for documents, task sets, runs and attempt logs under `.taskpilot/`.
//!
//! Layout:
//! - `docs/<doc_id>/document.md`, `docs/<doc_id>/meta.json`
//! - `docs/<doc_id>/tasks/<task_id>.json`
//! - `runs/<run_id>/run.json`, `runs/<run_id>/progress.md`
//! - `runs/<run_id>/attempts/<task_id>/<n>/{prompt.md,agent.log,gates.log,meta.json}`
//! - `runs/index.json`
//!
//! Every record is replaced whole (temp file + rename) so a concurrent reader
//! never sees a partial write.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::core::types::RunMode;
use crate::task::{Task, TaskAttempt, TaskStatus};

pub const STATE_DIR: &str = ".taskpilot";
const ID_CHARSET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";
const ID_SUFFIX_LEN: usize = 6;

/// A generated implementation document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: String,
    pub title: String,
    pub description: String,
    pub created_at: DateTime<Utc>,
}

/// Overall state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    /// Every task in scope completed or was skipped, none failed.
    Completed,
    /// Finished with at least one failed task.
    Failed,
    Aborted,
    /// Cut short by the iteration cap or a stall.
    Stopped,
}

impl RunStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Aborted => "aborted",
            RunStatus::Stopped => "stopped",
        }
    }

    /// A run in this state is only resumed with `force`.
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }
}

/// Final state of one task in a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOutcome {
    pub task_id: String,
    pub status: TaskStatus,
    pub attempts: u32,
}

impl TaskOutcome {
    pub fn of(task: &Task) -> Self {
        Self {
            task_id: task.id.clone(),
            status: task.status,
            attempts: task.attempts.len() as u32,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub doc_id: String,
    pub status: RunStatus,
    pub mode: RunMode,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub original_branch: Option<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub outcomes: Vec<TaskOutcome>,
}

impl RunRecord {
    pub fn new(doc_id: &str, mode: RunMode) -> Self {
        let started_at = Utc::now();
        Self {
            id: new_run_id(started_at),
            doc_id: doc_id.to_string(),
            status: RunStatus::Running,
            mode,
            branch: None,
            original_branch: None,
            started_at,
            finished_at: None,
            outcomes: Vec::new(),
        }
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            id: self.id.clone(),
            doc_id: self.doc_id.clone(),
            status: self.status,
            started_at: self.started_at,
        }
    }
}

/// Index entry for listing runs without loading each record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub id: String,
    pub doc_id: String,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
}

/// Artifacts of one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttemptLog {
    pub task_id: String,
    pub prompt: String,
    pub agent_output: String,
    pub gate_report: String,
    pub attempt: TaskAttempt,
}

/// Storage collaborator. Implementations must be safe to share with worker threads.
pub trait RunStore: Send + Sync {
    fn save_document(&self, record: &DocumentRecord, body: &str) -> Result<()>;
    fn load_document(&self, doc_id: &str) -> Result<(DocumentRecord, String)>;

    /// Replace the whole task set of a document.
    fn save_tasks(&self, doc_id: &str, tasks: &[Task]) -> Result<()>;
    /// Replace one task record.
    fn save_task(&self, doc_id: &str, task: &Task) -> Result<()>;
    /// Task set ordered by sequence.
    fn load_tasks(&self, doc_id: &str) -> Result<Vec<Task>>;

    /// Write a run record and its index entry.
    fn save_run(&self, run: &RunRecord) -> Result<()>;
    fn load_run(&self, run_id: &str) -> Result<RunRecord>;
    /// Most recently started run of a document.
    fn latest_run(&self, doc_id: &str) -> Result<Option<RunRecord>>;
    fn list_runs(&self) -> Result<Vec<RunSummary>>;

    fn append_progress(&self, run_id: &str, entry: &str) -> Result<()>;
    /// Full progress log; empty when nothing was appended yet.
    fn read_progress(&self, run_id: &str) -> Result<String>;

    fn save_attempt_log(&self, run_id: &str, log: &AttemptLog) -> Result<()>;
}

/// `doc_<random6>`
pub fn new_document_id() -> String {
    format!("doc_{}", random_suffix())
}

/// `run_<yyyymmddHHMMSS>_<random6>`
pub fn new_run_id(now: DateTime<Utc>) -> String {
    format!("run_{}_{}", now.format("%Y%m%d%H%M%S"), random_suffix())
}

fn random_suffix() -> String {
    let mut rng = rand::thread_rng();
    (0..ID_SUFFIX_LEN)
        .map(|_| ID_CHARSET[rng.gen_range(0..ID_CHARSET.len())] as char)
        .collect()
}

/// File-backed store rooted at a `.taskpilot/` directory.
pub struct FileStore {
    root: PathBuf,
    index_lock: Mutex<()>,
}

impl FileStore {
    /// Store for the project at `project_root`.
    pub fn for_project(project_root: &Path) -> Self {
        Self::new(project_root.join(STATE_DIR))
    }

    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            index_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn doc_dir(&self, doc_id: &str) -> PathBuf {
        self.root.join("docs").join(doc_id)
    }

    fn tasks_dir(&self, doc_id: &str) -> PathBuf {
        self.doc_dir(doc_id).join("tasks")
    }

    fn run_dir(&self, run_id: &str) -> PathBuf {
        self.root.join("runs").join(run_id)
    }

    fn index_path(&self) -> PathBuf {
        self.root.join("runs").join("index.json")
    }

    fn read_index(&self) -> Result<Vec<RunSummary>> {
        let path = self.index_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        read_json(&path)
    }
}

impl RunStore for FileStore {
    fn save_document(&self, record: &DocumentRecord, body: &str) -> Result<()> {
        let dir = self.doc_dir(&record.id);
        write_atomic(&dir.join("document.md"), body)?;
        write_json(&dir.join("meta.json"), record)
    }

    fn load_document(&self, doc_id: &str) -> Result<(DocumentRecord, String)> {
        let dir = self.doc_dir(doc_id);
        if !dir.exists() {
            return Err(anyhow!("unknown document '{doc_id}'"));
        }
        let record = read_json(&dir.join("meta.json"))?;
        let body_path = dir.join("document.md");
        let body = fs::read_to_string(&body_path)
            .with_context(|| format!("read document {}", body_path.display()))?;
        Ok((record, body))
    }

    #[instrument(skip_all, fields(doc_id = doc_id, tasks = tasks.len()))]
    fn save_tasks(&self, doc_id: &str, tasks: &[Task]) -> Result<()> {
        let dir = self.tasks_dir(doc_id);
        if dir.exists() {
            for entry in fs::read_dir(&dir).with_context(|| format!("list {}", dir.display()))? {
                let path = entry?.path();
                if path.extension().is_some_and(|ext| ext == "json") {
                    fs::remove_file(&path)
                        .with_context(|| format!("remove stale task {}", path.display()))?;
                }
            }
        }
        for task in tasks {
            self.save_task(doc_id, task)?;
        }
        Ok(())
    }

    fn save_task(&self, doc_id: &str, task: &Task) -> Result<()> {
        debug!(doc_id, task = %task.id, status = task.status.as_str(), "writing task");
        write_json(&self.tasks_dir(doc_id).join(format!("{}.json", task.id)), task)
    }

    fn load_tasks(&self, doc_id: &str) -> Result<Vec<Task>> {
        let dir = self.tasks_dir(doc_id);
        if !dir.exists() {
            return Err(anyhow!("unknown document '{doc_id}' (no task set)"));
        }
        let mut tasks: Vec<Task> = Vec::new();
        for entry in fs::read_dir(&dir).with_context(|| format!("list {}", dir.display()))? {
            let path = entry?.path();
            if path.extension().is_some_and(|ext| ext == "json") {
                tasks.push(read_json(&path)?);
            }
        }
        tasks.sort_by(|a, b| a.sequence.cmp(&b.sequence).then_with(|| a.id.cmp(&b.id)));
        Ok(tasks)
    }

    #[instrument(skip_all, fields(run_id = %run.id, status = run.status.as_str()))]
    fn save_run(&self, run: &RunRecord) -> Result<()> {
        write_json(&self.run_dir(&run.id).join("run.json"), run)?;
        let _guard = self
            .index_lock
            .lock()
            .map_err(|_| anyhow!("run index lock poisoned"))?;
        let mut index = self.read_index()?;
        match index.iter_mut().find(|entry| entry.id == run.id) {
            Some(entry) => *entry = run.summary(),
            None => index.push(run.summary()),
        }
        write_json(&self.index_path(), &index)
    }

    fn load_run(&self, run_id: &str) -> Result<RunRecord> {
        let path = self.run_dir(run_id).join("run.json");
        if !path.exists() {
            return Err(anyhow!("unknown run '{run_id}'"));
        }
        read_json(&path)
    }

    fn latest_run(&self, doc_id: &str) -> Result<Option<RunRecord>> {
        let latest = self
            .read_index()?
            .into_iter()
            .filter(|entry| entry.doc_id == doc_id)
            .max_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        latest.map(|entry| self.load_run(&entry.id)).transpose()
    }

    fn list_runs(&self) -> Result<Vec<RunSummary>> {
        let mut index = self.read_index()?;
        index.sort_by(|a, b| a.started_at.cmp(&b.started_at).then_with(|| a.id.cmp(&b.id)));
        Ok(index)
    }

    fn append_progress(&self, run_id: &str, entry: &str) -> Result<()> {
        let dir = self.run_dir(run_id);
        fs::create_dir_all(&dir).with_context(|| format!("create directory {}", dir.display()))?;
        let path = dir.join("progress.md");
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open progress log {}", path.display()))?;
        writeln!(file, "{}\n", entry.trim_end())
            .with_context(|| format!("append progress log {}", path.display()))
    }

    fn read_progress(&self, run_id: &str) -> Result<String> {
        let path = self.run_dir(run_id).join("progress.md");
        if !path.exists() {
            return Ok(String::new());
        }
        fs::read_to_string(&path).with_context(|| format!("read progress log {}", path.display()))
    }

    #[instrument(skip_all, fields(run_id = run_id, task = %log.task_id, attempt = log.attempt.attempt_number))]
    fn save_attempt_log(&self, run_id: &str, log: &AttemptLog) -> Result<()> {
        let dir = self
            .run_dir(run_id)
            .join("attempts")
            .join(&log.task_id)
            .join(log.attempt.attempt_number.to_string());
        // Write in a fixed order so partial logs are predictable.
        write_atomic(&dir.join("prompt.md"), &log.prompt)?;
        write_atomic(&dir.join("agent.log"), &log.agent_output)?;
        write_atomic(&dir.join("gates.log"), &log.gate_report)?;
        write_json(&dir.join("meta.json"), &log.attempt)
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)
        .with_context(|| format!("serialize {}", path.display()))?;
    buf.push('\n');
    write_atomic(path, &buf)
}

/// Write `contents` to a sibling temp file, then rename it over `path`.
pub fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let mut tmp_name = path
        .file_name()
        .with_context(|| format!("path missing file name {}", path.display()))?
        .to_os_string();
    tmp_name.push(".tmp");
    let tmp_path = parent.join(tmp_name);
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::AttemptStatus;
    use crate::test_support::{attempt, task, task_with_deps};

    fn store() -> (tempfile::TempDir, FileStore) {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileStore::for_project(temp.path());
        (temp, store)
    }

    #[test]
    fn ids_follow_documented_formats() {
        let doc = new_document_id();
        assert!(doc.starts_with("doc_"));
        assert_eq!(doc.len(), 10);

        let now = DateTime::parse_from_rfc3339("2026-03-04T05:06:07Z")
            .expect("parse")
            .with_timezone(&Utc);
        let run = new_run_id(now);
        assert!(run.starts_with("run_20260304050607_"));
        assert_eq!(run.len(), "run_20260304050607_".len() + 6);
        assert!(run.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_'));
    }

    #[test]
    fn tasks_round_trip_in_sequence_order() {
        let (_temp, store) = store();
        let tasks = vec![task(2), task_with_deps(10, &["task_002"]), task(1)];

        store.save_tasks("doc_a", &tasks).expect("save");
        let loaded = store.load_tasks("doc_a").expect("load");

        let ids: Vec<&str> = loaded.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["task_001", "task_002", "task_010"]);
        assert_eq!(loaded[2], tasks[1]);
    }

    #[test]
    fn save_tasks_replaces_previous_set() {
        let (_temp, store) = store();
        store.save_tasks("doc_a", &[task(1), task(2)]).expect("save");
        store.save_tasks("doc_a", &[task(3)]).expect("save");

        let loaded = store.load_tasks("doc_a").expect("load");
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "task_003");
    }

    #[test]
    fn save_task_replaces_single_record_without_temp_leftovers() {
        let (_temp, store) = store();
        store.save_tasks("doc_a", &[task(1)]).expect("save");
        let mut updated = task(1);
        updated.status = TaskStatus::Completed;
        updated.attempts.push(attempt(1, AttemptStatus::Success));

        store.save_task("doc_a", &updated).expect("save");

        assert_eq!(store.load_tasks("doc_a").expect("load"), vec![updated]);
        let leftovers: Vec<_> = fs::read_dir(store.tasks_dir("doc_a"))
            .expect("read dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.path().to_string_lossy().ends_with(".tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn unknown_document_is_an_error() {
        let (_temp, store) = store();
        assert!(store.load_tasks("doc_missing").is_err());
        assert!(store.load_document("doc_missing").is_err());
    }

    #[test]
    fn documents_round_trip() {
        let (_temp, store) = store();
        let record = DocumentRecord {
            id: "doc_abc123".to_string(),
            title: "Dark mode".to_string(),
            description: "add dark mode".to_string(),
            created_at: Utc::now(),
        };
        store.save_document(&record, "# Dark mode\n").expect("save");

        let (loaded, body) = store.load_document("doc_abc123").expect("load");
        assert_eq!(loaded, record);
        assert_eq!(body, "# Dark mode\n");
    }

    #[test]
    fn runs_are_indexed_and_latest_is_found() {
        let (_temp, store) = store();
        let mut first = RunRecord::new("doc_a", RunMode::Loop);
        first.started_at = DateTime::parse_from_rfc3339("2026-01-01T00:00:00Z")
            .expect("parse")
            .with_timezone(&Utc);
        let second = RunRecord::new("doc_a", RunMode::Team);
        let other = RunRecord::new("doc_b", RunMode::Loop);
        for run in [&first, &second, &other] {
            store.save_run(run).expect("save");
        }
        let mut finished = first.clone();
        finished.status = RunStatus::Failed;
        store.save_run(&finished).expect("update");

        let runs = store.list_runs().expect("list");
        assert_eq!(runs.len(), 3);
        assert_eq!(runs[0].id, first.id);
        assert_eq!(runs[0].status, RunStatus::Failed);

        let latest = store.latest_run("doc_a").expect("latest").expect("some");
        assert_eq!(latest.id, second.id);
        assert!(store.latest_run("doc_c").expect("latest").is_none());
    }

    #[test]
    fn progress_log_appends() {
        let (_temp, store) = store();
        assert_eq!(store.read_progress("run_x").expect("read"), "");
        store.append_progress("run_x", "task_001 completed").expect("append");
        store.append_progress("run_x", "task_002 failed").expect("append");

        let progress = store.read_progress("run_x").expect("read");
        let first = progress.find("task_001").expect("first");
        let second = progress.find("task_002").expect("second");
        assert!(first < second);
    }

    #[test]
    fn attempt_logs_land_in_numbered_dirs() {
        let (_temp, store) = store();
        let log = AttemptLog {
            task_id: "task_001".to_string(),
            prompt: "prompt".to_string(),
            agent_output: "agent".to_string(),
            gate_report: "gates".to_string(),
            attempt: attempt(2, AttemptStatus::Failure),
        };

        store.save_attempt_log("run_x", &log).expect("save");

        let dir = store.run_dir("run_x").join("attempts").join("task_001").join("2");
        assert_eq!(fs::read_to_string(dir.join("prompt.md")).expect("read"), "prompt");
        assert_eq!(fs::read_to_string(dir.join("gates.log")).expect("read"), "gates");
        let meta: TaskAttempt = read_json(&dir.join("meta.json")).expect("meta");
        assert_eq!(meta.attempt_number, 2);
    }
}
