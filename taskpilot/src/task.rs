use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a task within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Skipped => "skipped",
        }
    }

    /// True for states no scheduler decision can leave.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Skipped
        )
    }

    /// True when a dependent may treat this dependency as satisfied.
    pub fn satisfies_dependents(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Skipped)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Critical,
    High,
    #[default]
    Medium,
    Low,
}

/// Outcome classification of a single attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Success,
    Failure,
    Blocked,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskAttempt {
    pub attempt_number: u32,
    pub status: AttemptStatus,
    /// Tail of the agent output.
    pub agent_output: String,
    /// Tail of the combined gate output.
    pub gate_output: String,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
}

/// A verification command run after every agent attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QualityGate {
    #[serde(rename = "type")]
    pub kind: String,
    pub command: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub sequence: u32,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default)]
    pub depends_on: BTreeSet<String>,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    #[serde(default)]
    pub files_to_modify: BTreeSet<String>,
    #[serde(default)]
    pub relevant_files: Vec<String>,
    #[serde(default)]
    pub context_queries: Vec<String>,
    #[serde(default)]
    pub attempts: Vec<TaskAttempt>,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

/// Render the stable id for a task sequence number (`task_007`).
pub fn task_id(sequence: u32) -> String {
    format!("task_{sequence:03}")
}

impl Task {
    pub fn new(sequence: u32, title: impl Into<String>, description: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: task_id(sequence),
            sequence,
            title: title.into(),
            description: description.into(),
            status: TaskStatus::Pending,
            priority: Priority::default(),
            depends_on: BTreeSet::new(),
            acceptance_criteria: Vec::new(),
            files_to_modify: BTreeSet::new(),
            relevant_files: Vec::new(),
            context_queries: Vec::new(),
            attempts: Vec::new(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            created_at: now,
            updated_at: now,
        }
    }

    /// Attempts still available before the task is exhausted.
    pub fn remaining_attempts(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts.len() as u32)
    }

    pub fn last_attempt(&self) -> Option<&TaskAttempt> {
        self.attempts.last()
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
