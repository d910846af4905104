//! Read-only views over stored runs.

use anyhow::{Context, Result};

use crate::io::store::{RunRecord, RunStore, RunSummary};
use crate::task::{Task, TaskStatus};

/// A run record together with the current state of its document's tasks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunStatusReport {
    pub run: RunRecord,
    pub tasks: Vec<Task>,
}

impl RunStatusReport {
    pub fn count(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|task| task.status == status).count()
    }

    /// Human-readable summary, one line per task.
    pub fn render(&self) -> String {
        let run = &self.run;
        let mut out = format!(
            "run {} ({}) for {}: {}\n",
            run.id,
            run.mode.as_str(),
            run.doc_id,
            run.status.as_str()
        );
        out.push_str(&format!("started {}", run.started_at.to_rfc3339()));
        if let Some(finished) = run.finished_at {
            out.push_str(&format!(", finished {}", finished.to_rfc3339()));
        }
        out.push('\n');
        if let Some(branch) = &run.branch {
            out.push_str(&format!("branch {branch}\n"));
        }
        for task in &self.tasks {
            out.push_str(&format!(
                "  {} [{}] {}/{} attempts  {}\n",
                task.id,
                task.status.as_str(),
                task.attempts.len(),
                task.max_attempts,
                task.title
            ));
        }
        out.push_str(&format!(
            "{} completed, {} failed, {} skipped, {} pending\n",
            self.count(TaskStatus::Completed),
            self.count(TaskStatus::Failed),
            self.count(TaskStatus::Skipped),
            self.count(TaskStatus::Pending) + self.count(TaskStatus::InProgress),
        ));
        out
    }
}

/// Every run in the index, oldest first.
pub fn list_runs(store: &dyn RunStore) -> Result<Vec<RunSummary>> {
    store.list_runs().context("read run index")
}

pub fn run_status(store: &dyn RunStore, run_id: &str) -> Result<RunStatusReport> {
    let run = store
        .load_run(run_id)
        .with_context(|| format!("load run {run_id}"))?;
    let tasks = store
        .load_tasks(&run.doc_id)
        .with_context(|| format!("load tasks for {}", run.doc_id))?;
    Ok(RunStatusReport { run, tasks })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::RunMode;
    use crate::io::store::RunStatus;
    use crate::test_support::{MemoryStore, task};

    #[test]
    fn status_joins_run_and_tasks() {
        let mut done = task(1);
        done.status = TaskStatus::Completed;
        let store = MemoryStore::with_tasks("doc_a", vec![done, task(2)]);
        let mut run = RunRecord::new("doc_a", RunMode::Loop);
        run.status = RunStatus::Stopped;
        store.save_run(&run).expect("save run");

        let report = run_status(&store, &run.id).expect("status");

        assert_eq!(report.count(TaskStatus::Completed), 1);
        let text = report.render();
        assert!(text.contains("stopped"));
        assert!(text.contains("task_002 [pending] 0/3 attempts"));
        assert!(text.contains("1 completed, 0 failed, 0 skipped, 1 pending"));
        assert_eq!(list_runs(&store).expect("list").len(), 1);
    }

    #[test]
    fn unknown_run_is_an_error() {
        let err = run_status(&MemoryStore::new(), "run_missing").expect_err("should fail");
        assert!(format!("{err:#}").contains("run_missing"));
    }
}
