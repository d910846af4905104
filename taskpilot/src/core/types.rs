//! Shared deterministic types for orchestrator core logic.
//!
//! These types define stable contracts between core components. They should not
//! depend on external state or I/O.

use serde::{Deserialize, Serialize};

/// Exit code reported by the agent executor when its timer killed the process.
pub const TIMEOUT_EXIT_CODE: i32 = 124;

/// Marker an agent prints to declare its task impossible as specified.
pub const BLOCKED_MARKER: &str = "<task-blocked>";

/// Scheduling mode for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// One task at a time, in topological order.
    #[default]
    Loop,
    /// Up to `concurrency` tasks at once, subject to dependency and file-conflict rules.
    Team,
}

impl RunMode {
    pub fn as_str(self) -> &'static str {
        match self {
            RunMode::Loop => "loop",
            RunMode::Team => "team",
        }
    }
}

/// Per-run execution options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    pub mode: RunMode,
    /// Only meaningful in team mode.
    pub concurrency: usize,
    pub resume: bool,
    /// Restrict execution to this task id; its dependencies are assumed satisfied.
    pub task_filter: Option<String>,
    pub dry_run: bool,
    /// Safety cap on total attempts started during this run.
    pub max_iterations: u32,
    pub use_branch: bool,
    pub model_override: Option<String>,
    /// Resume even when the previous run ended in a terminal state.
    pub force: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            mode: RunMode::Loop,
            concurrency: 1,
            resume: false,
            task_filter: None,
            dry_run: false,
            max_iterations: 100,
            use_branch: false,
            model_override: None,
            force: false,
        }
    }
}

impl RunConfig {
    /// Number of attempts that may be in flight at once.
    pub fn effective_concurrency(&self) -> usize {
        match self.mode {
            RunMode::Loop => 1,
            RunMode::Team => self.concurrency.max(1),
        }
    }
}

/// Why a run stopped scheduling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStop {
    /// Every task in scope reached a terminal state.
    Finished,
    /// Validation and planning only.
    DryRun,
    Aborted,
    /// `max_iterations` attempts were started.
    IterationLimit,
    /// Pending tasks remain but none can ever be dispatched.
    Stalled,
}

impl RunStop {
    pub fn is_interrupted(self) -> bool {
        matches!(
            self,
            RunStop::Aborted | RunStop::IterationLimit | RunStop::Stalled
        )
    }
}

/// Why a task ended `failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailReason {
    /// The agent declared the task impossible.
    Blocked,
    /// `max_attempts` attempts were used up.
    Exhausted,
}

/// What the orchestrator does after recording an attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttemptDecision {
    Complete,
    Retry,
    Fail(FailReason),
}
