//! Semantic invariants on a loaded task set.

use crate::task::{Task, TaskStatus};

/// Check per-task invariants not covered by graph validation:
/// - `max_attempts > 0`
/// - `attempts <= max_attempts`
/// - attempt numbers run `1..=n` in order
/// - an exhausted task is not left `pending`
pub fn validate_task_invariants(tasks: &[Task]) -> Vec<String> {
    let mut errors = Vec::new();
    for task in tasks {
        if task.max_attempts == 0 {
            errors.push(format!("{}: max_attempts must be > 0", task.id));
        }

        let used = task.attempts.len() as u32;
        if used > task.max_attempts {
            errors.push(format!(
                "{}: attempts {} exceeds max_attempts {}",
                task.id, used, task.max_attempts
            ));
        }

        for (i, attempt) in task.attempts.iter().enumerate() {
            let expected = i as u32 + 1;
            if attempt.attempt_number != expected {
                errors.push(format!(
                    "{}: attempt #{} recorded as attempt_number {}",
                    task.id, expected, attempt.attempt_number
                ));
            }
        }

        if task.max_attempts > 0 && used >= task.max_attempts && task.status == TaskStatus::Pending
        {
            errors.push(format!(
                "{}: attempts exhausted but status is still pending",
                task.id
            ));
        }
    }
    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::AttemptStatus;
    use crate::test_support::{attempt, task};

    #[test]
    fn fresh_tasks_are_valid() {
        assert!(validate_task_invariants(&[task(1), task(2)]).is_empty());
    }

    #[test]
    fn reports_attempt_overflow_and_numbering() {
        let mut t = task(1);
        t.max_attempts = 1;
        t.status = TaskStatus::Failed;
        t.attempts.push(attempt(1, AttemptStatus::Failure));
        t.attempts.push(attempt(3, AttemptStatus::Failure));

        let errors = validate_task_invariants(&[t]);
        assert!(errors.iter().any(|err| err.contains("exceeds max_attempts")));
        assert!(errors.iter().any(|err| err.contains("attempt_number 3")));
    }

    #[test]
    fn reports_exhausted_pending_task() {
        let mut t = task(1);
        t.max_attempts = 1;
        t.attempts.push(attempt(1, AttemptStatus::Failure));

        let errors = validate_task_invariants(&[t]);
        assert!(errors.iter().any(|err| err.contains("exhausted")));
    }

    #[test]
    fn reports_zero_max_attempts() {
        let mut t = task(1);
        t.max_attempts = 0;
        let errors = validate_task_invariants(&[t]);
        assert!(errors.iter().any(|err| err.contains("max_attempts must be > 0")));
    }
}
