//! Per-task context assembly from the recall service and the run progress log.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::io::process::{ProcessRequest, run_process};
use crate::task::Task;

pub const MAX_QUERIES: usize = 5;
/// `kind` tag marking a recalled note as a previously failed approach.
pub const DEAD_END_KIND: &str = "dead_end";

pub const NO_MEMORIES: &str = "(No relevant memories found)";
pub const NO_DEAD_ENDS: &str = "(No known dead ends)";
pub const NO_PROGRESS: &str = "(No progress recorded yet)";

const RECALL_OUTPUT_LIMIT_BYTES: usize = 1_000_000;

/// One item returned by the recall service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryHit {
    pub id: String,
    pub content: String,
    #[serde(rename = "type", alias = "kind", default)]
    pub kind: String,
    #[serde(default)]
    pub score: f64,
}

impl MemoryHit {
    pub fn is_dead_end(&self) -> bool {
        self.kind == DEAD_END_KIND
    }
}

/// Semantic memory lookup.
pub trait Recall: Send + Sync {
    fn recall(&self, query: &str, limit: usize, threshold: f64) -> Result<Vec<MemoryHit>>;
}

/// Recall disabled: every query returns nothing.
pub struct NoRecall;

impl Recall for NoRecall {
    fn recall(&self, _query: &str, _limit: usize, _threshold: f64) -> Result<Vec<MemoryHit>> {
        Ok(Vec::new())
    }
}

/// Runs `<command> <query> --limit N --threshold T` and parses stdout as a JSON array of hits.
pub struct CommandRecall {
    command: Vec<String>,
    cwd: PathBuf,
    timeout: Duration,
}

impl CommandRecall {
    pub fn new(command: Vec<String>, cwd: &Path, timeout: Duration) -> Result<Self> {
        if command.first().is_none_or(|program| program.trim().is_empty()) {
            return Err(anyhow!("recall command must be a non-empty array"));
        }
        Ok(Self {
            command,
            cwd: cwd.to_path_buf(),
            timeout,
        })
    }
}

impl Recall for CommandRecall {
    #[instrument(skip_all, fields(query = query))]
    fn recall(&self, query: &str, limit: usize, threshold: f64) -> Result<Vec<MemoryHit>> {
        let mut cmd = Command::new(&self.command[0]);
        cmd.args(&self.command[1..])
            .arg(query)
            .arg("--limit")
            .arg(limit.to_string())
            .arg("--threshold")
            .arg(threshold.to_string())
            .current_dir(&self.cwd);
        let mut request = ProcessRequest::new(self.timeout, RECALL_OUTPUT_LIMIT_BYTES);
        request.discard_stderr = true;
        let output = run_process(cmd, &request).context("run recall command")?;
        if !output.success() {
            return Err(anyhow!(
                "recall command exited with {:?} (timed out: {})",
                output.code,
                output.timed_out
            ));
        }
        let trimmed = output.output.trim();
        if trimmed.is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_str(trimmed).context("parse recall output as JSON array")
    }
}

/// Recall tuning shared by every query of a run.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RecallSettings {
    pub limit: usize,
    pub threshold: f64,
}

impl Default for RecallSettings {
    fn default() -> Self {
        Self {
            limit: 5,
            threshold: 0.3,
        }
    }
}

/// Context handed to the prompt composer. Empty parts carry a placeholder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AssembledContext {
    pub recalled: String,
    pub dead_ends: String,
    pub progress: String,
}

impl AssembledContext {
    /// Context with nothing recalled and the given progress text.
    pub fn from_progress(progress: &str) -> Self {
        Self {
            recalled: NO_MEMORIES.to_string(),
            dead_ends: NO_DEAD_ENDS.to_string(),
            progress: progress_or_placeholder(progress),
        }
    }
}

/// Queries for a task: its `context_queries`, then its title, then the
/// basenames of `files_to_modify`. Duplicates and blanks are dropped and the
/// list is capped at [`MAX_QUERIES`].
pub fn build_queries(task: &Task) -> Vec<String> {
    let basenames = task.files_to_modify.iter().map(|path| {
        Path::new(path)
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.clone())
    });
    let candidates = task
        .context_queries
        .iter()
        .cloned()
        .chain(std::iter::once(task.title.clone()))
        .chain(basenames);

    let mut seen = HashSet::new();
    let mut queries = Vec::new();
    for query in candidates {
        let query = query.trim().to_string();
        if query.is_empty() || !seen.insert(query.clone()) {
            continue;
        }
        queries.push(query);
        if queries.len() == MAX_QUERIES {
            break;
        }
    }
    queries
}

/// Gather recalled notes, dead ends and run progress for `task`.
///
/// A failing query is logged and skipped; assembly itself never fails.
#[instrument(skip_all, fields(task = %task.id))]
pub fn assemble_context(
    recall: &dyn Recall,
    settings: RecallSettings,
    task: &Task,
    progress: &str,
) -> AssembledContext {
    let mut seen = HashSet::new();
    let mut hits = Vec::new();
    for query in build_queries(task) {
        match recall.recall(&query, settings.limit, settings.threshold) {
            Ok(found) => {
                debug!(query = %query, hits = found.len(), "recall query finished");
                hits.extend(found.into_iter().filter(|hit| seen.insert(hit.id.clone())));
            }
            Err(err) => warn!(query = %query, err = %format!("{err:#}"), "recall query failed"),
        }
    }

    let (dead_ends, recalled): (Vec<MemoryHit>, Vec<MemoryHit>) =
        hits.into_iter().partition(MemoryHit::is_dead_end);

    AssembledContext {
        recalled: format_hits(&recalled, NO_MEMORIES),
        dead_ends: format_hits(&dead_ends, NO_DEAD_ENDS),
        progress: progress_or_placeholder(progress),
    }
}

fn format_hits(hits: &[MemoryHit], placeholder: &str) -> String {
    if hits.is_empty() {
        return placeholder.to_string();
    }
    hits.iter()
        .map(|hit| {
            let kind = if hit.kind.is_empty() { "note" } else { &hit.kind };
            format!("- [{kind}] {} (score {:.2})", hit.content.trim(), hit.score)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn progress_or_placeholder(progress: &str) -> String {
    if progress.trim().is_empty() {
        NO_PROGRESS.to_string()
    } else {
        progress.to_string()
    }
}
