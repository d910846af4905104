//! Stable exit codes for taskpilot CLI commands.

/// Command succeeded; for `run`, every task in scope completed or was skipped.
pub const OK: i32 = 0;
/// Invalid task set, config or arguments, or a storage failure.
pub const INVALID: i32 = 1;
/// The run finished but at least one task ended `failed`.
pub const TASKS_FAILED: i32 = 2;
/// The run was aborted, hit its iteration cap, or stalled.
pub const INTERRUPTED: i32 = 3;
