//! Typed errors callers need to tell apart.
//!
//! They travel inside `anyhow::Error`; recover them with
//! `err.downcast_ref::<RunError>()`.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RunError {
    /// The task set or request is unusable; nothing was executed.
    #[error("validation failed:\n  - {}", .0.join("\n  - "))]
    Validation(Vec<String>),

    /// Persistence failed mid-run; task state on disk may be stale.
    #[error("storage failure: {0:#}")]
    Storage(anyhow::Error),

    #[error("run {run_id} already ended as {status}; pass --force to resume it anyway")]
    ResumeRefused { run_id: String, status: String },
}

impl RunError {
    pub fn validation(message: impl Into<String>) -> Self {
        RunError::Validation(vec![message.into()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_lists_every_error() {
        let err = RunError::Validation(vec!["cycle at task_001".into(), "dangling".into()]);
        let text = err.to_string();
        assert!(text.contains("cycle at task_001"));
        assert!(text.contains("dangling"));
    }

    #[test]
    fn typed_error_survives_anyhow() {
        let err: anyhow::Error = RunError::validation("bad").into();
        let err = err.context("load tasks");
        assert!(matches!(
            err.downcast_ref::<RunError>(),
            Some(RunError::Validation(_))
        ));
    }
}
