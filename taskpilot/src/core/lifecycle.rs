//! Orchestrator-owned task state transitions.
//!
//! Only these functions change `status` and `attempts`. Every transition is
//! monotonic except the `in_progress -> pending` reset used on resume and the
//! bounded `pending -> in_progress` retry cycle.

use std::collections::{BTreeSet, HashMap, VecDeque};

use crate::core::types::{AttemptDecision, BLOCKED_MARKER, FailReason};
use crate::task::{AttemptStatus, Task, TaskAttempt, TaskStatus};

/// Move a pending task to `in_progress` and return the number of the attempt
/// about to start.
pub fn begin_attempt(task: &mut Task) -> Result<u32, String> {
    if task.status != TaskStatus::Pending {
        return Err(format!(
            "task '{}' cannot start from status {}",
            task.id,
            task.status.as_str()
        ));
    }
    if task.remaining_attempts() == 0 {
        return Err(format!(
            "task '{}' has no attempts left ({} of {})",
            task.id,
            task.attempts.len(),
            task.max_attempts
        ));
    }
    task.status = TaskStatus::InProgress;
    task.touch();
    Ok(task.attempts.len() as u32 + 1)
}

/// True if the agent explicitly declared the task impossible.
pub fn declares_blocked(agent_output: &str) -> bool {
    agent_output.contains(BLOCKED_MARKER)
}

/// Classify one attempt from executor and gate results.
pub fn classify_attempt(
    agent_succeeded: bool,
    timed_out: bool,
    gates_passed: bool,
    agent_output: &str,
) -> AttemptStatus {
    if agent_succeeded && gates_passed {
        AttemptStatus::Success
    } else if declares_blocked(agent_output) {
        AttemptStatus::Blocked
    } else if timed_out {
        AttemptStatus::Timeout
    } else {
        AttemptStatus::Failure
    }
}

/// Append `attempt` to an in-progress task and apply the retry policy.
///
/// - success: `completed`
/// - blocked: `failed` regardless of remaining budget
/// - otherwise: back to `pending` while attempts remain, else `failed`
pub fn record_attempt(task: &mut Task, attempt: TaskAttempt) -> Result<AttemptDecision, String> {
    if task.status != TaskStatus::InProgress {
        return Err(format!(
            "task '{}' is {} while recording an attempt",
            task.id,
            task.status.as_str()
        ));
    }
    if task.remaining_attempts() == 0 {
        return Err(format!(
            "task '{}' would exceed max_attempts {}",
            task.id, task.max_attempts
        ));
    }

    let status = attempt.status;
    task.attempts.push(attempt);
    let decision = match status {
        AttemptStatus::Success => AttemptDecision::Complete,
        AttemptStatus::Blocked => AttemptDecision::Fail(FailReason::Blocked),
        AttemptStatus::Failure | AttemptStatus::Timeout if task.remaining_attempts() > 0 => {
            AttemptDecision::Retry
        }
        AttemptStatus::Failure | AttemptStatus::Timeout => {
            AttemptDecision::Fail(FailReason::Exhausted)
        }
    };
    task.status = match decision {
        AttemptDecision::Complete => TaskStatus::Completed,
        AttemptDecision::Retry => TaskStatus::Pending,
        AttemptDecision::Fail(_) => TaskStatus::Failed,
    };
    task.touch();
    Ok(decision)
}

/// Return an `in_progress` task to `pending` without recording an attempt.
///
/// Used when an attempt was aborted or could not be started.
pub fn release_attempt(task: &mut Task) {
    if task.status == TaskStatus::InProgress {
        task.status = TaskStatus::Pending;
        task.touch();
    }
}

/// Crash recovery: reset every `in_progress` task to `pending`, keeping its attempts.
///
/// Returns the ids that were reset.
pub fn reset_interrupted(tasks: &mut [Task]) -> Vec<String> {
    let mut reset = Vec::new();
    for task in tasks.iter_mut() {
        if task.status == TaskStatus::InProgress {
            task.status = TaskStatus::Pending;
            task.touch();
            reset.push(task.id.clone());
        }
    }
    reset
}

/// Mark every non-terminal task that transitively depends on a failed task as `skipped`.
///
/// Returns the ids that were skipped, in discovery order.
pub fn propagate_failures(tasks: &mut [Task]) -> Vec<String> {
    let mut dependents: HashMap<&str, Vec<usize>> = HashMap::new();
    for (idx, task) in tasks.iter().enumerate() {
        for dep in &task.depends_on {
            dependents.entry(dep.as_str()).or_default().push(idx);
        }
    }

    let mut queue: VecDeque<usize> = tasks
        .iter()
        .enumerate()
        .filter(|(_, task)| task.status == TaskStatus::Failed)
        .map(|(idx, _)| idx)
        .collect();
    let mut reached = BTreeSet::new();
    let mut order = Vec::new();
    while let Some(idx) = queue.pop_front() {
        let Some(children) = dependents.get(tasks[idx].id.as_str()) else {
            continue;
        };
        for &child in children {
            if reached.insert(child) {
                order.push(child);
                queue.push_back(child);
            }
        }
    }

    let mut skipped = Vec::new();
    for idx in order {
        let task = &mut tasks[idx];
        if task.status == TaskStatus::Pending {
            task.status = TaskStatus::Skipped;
            task.touch();
            skipped.push(task.id.clone());
        }
    }
    skipped
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{attempt, task, task_with_deps};

    fn started(mut t: Task) -> Task {
        begin_attempt(&mut t).expect("begin");
        t
    }

    #[test]
    fn begin_attempt_requires_pending_and_budget() {
        let mut t = task(1);
        assert_eq!(begin_attempt(&mut t), Ok(1));
        assert_eq!(t.status, TaskStatus::InProgress);
        assert!(begin_attempt(&mut t).is_err());

        let mut exhausted = task(2);
        exhausted.max_attempts = 0;
        assert!(begin_attempt(&mut exhausted).is_err());
    }

    #[test]
    fn classify_prefers_success_then_blocked_then_timeout() {
        assert_eq!(
            classify_attempt(true, false, true, "<task-blocked>"),
            AttemptStatus::Success
        );
        assert_eq!(
            classify_attempt(true, false, false, "cannot do <task-blocked> reason"),
            AttemptStatus::Blocked
        );
        assert_eq!(
            classify_attempt(false, true, false, "partial"),
            AttemptStatus::Timeout
        );
        assert_eq!(
            classify_attempt(false, false, true, "oops"),
            AttemptStatus::Failure
        );
    }

    #[test]
    fn success_completes_task() {
        let mut t = started(task(1));
        let decision = record_attempt(&mut t, attempt(1, AttemptStatus::Success)).expect("record");
        assert_eq!(decision, AttemptDecision::Complete);
        assert_eq!(t.status, TaskStatus::Completed);
    }

    #[test]
    fn failures_retry_until_budget_is_used() {
        let mut t = task(1);
        t.max_attempts = 3;
        for n in 1..=2 {
            begin_attempt(&mut t).expect("begin");
            let decision =
                record_attempt(&mut t, attempt(n, AttemptStatus::Failure)).expect("record");
            assert_eq!(decision, AttemptDecision::Retry);
            assert_eq!(t.status, TaskStatus::Pending);
        }
        begin_attempt(&mut t).expect("begin");
        let decision = record_attempt(&mut t, attempt(3, AttemptStatus::Timeout)).expect("record");
        assert_eq!(decision, AttemptDecision::Fail(FailReason::Exhausted));
        assert_eq!(t.status, TaskStatus::Failed);
        assert_eq!(t.attempts.len(), 3);
        assert!(begin_attempt(&mut t).is_err());
    }

    #[test]
    fn blocked_fails_immediately_with_budget_left() {
        let mut t = started(task(1));
        t.max_attempts = 5;
        let decision = record_attempt(&mut t, attempt(1, AttemptStatus::Blocked)).expect("record");
        assert_eq!(decision, AttemptDecision::Fail(FailReason::Blocked));
        assert_eq!(t.status, TaskStatus::Failed);
        assert_eq!(t.attempts.len(), 1);
    }

    #[test]
    fn record_attempt_rejects_non_running_task() {
        let mut t = task(1);
        assert!(record_attempt(&mut t, attempt(1, AttemptStatus::Success)).is_err());
        assert!(t.attempts.is_empty());
    }

    #[test]
    fn reset_interrupted_keeps_attempts() {
        let mut t = started(task(1));
        t.attempts.push(attempt(1, AttemptStatus::Failure));
        let before = t.attempts.clone();
        let mut tasks = vec![t, task(2)];

        let reset = reset_interrupted(&mut tasks);

        assert_eq!(reset, vec!["task_001".to_string()]);
        assert_eq!(tasks[0].status, TaskStatus::Pending);
        assert_eq!(tasks[0].attempts, before);
        assert_eq!(tasks[1].status, TaskStatus::Pending);
    }

    #[test]
    fn failure_skips_transitive_dependents_only() {
        let mut failed = task(1);
        failed.status = TaskStatus::Failed;
        let mut tasks = vec![
            failed,
            task_with_deps(2, &["task_001"]),
            task_with_deps(3, &["task_002"]),
            task(4),
            task_with_deps(5, &["task_004"]),
        ];

        let skipped = propagate_failures(&mut tasks);

        assert_eq!(skipped, vec!["task_002".to_string(), "task_003".to_string()]);
        assert_eq!(tasks[1].status, TaskStatus::Skipped);
        assert_eq!(tasks[2].status, TaskStatus::Skipped);
        assert_eq!(tasks[3].status, TaskStatus::Pending);
        assert_eq!(tasks[4].status, TaskStatus::Pending);
    }
}
