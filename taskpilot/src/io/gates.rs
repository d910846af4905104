//! Quality gate runner: verification commands run after every agent attempt.

use std::path::Path;
use std::process::Command;
use std::time::Duration;

use anyhow::Result;
use tracing::{info, instrument, warn};

use crate::io::process::{ProcessRequest, run_process};
use crate::task::QualityGate;

pub const DEFAULT_GATE_TIMEOUT: Duration = Duration::from_secs(10 * 60);
pub const DEFAULT_GATE_OUTPUT_LIMIT_BYTES: usize = 100_000;

/// Outcome of one gate command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateResult {
    pub kind: String,
    pub command: String,
    pub passed: bool,
    pub output: String,
}

impl GateResult {
    fn failed(gate: &QualityGate, output: impl Into<String>) -> Self {
        Self {
            kind: gate.kind.clone(),
            command: gate.command.clone(),
            passed: false,
            output: output.into(),
        }
    }
}

pub trait GateRunner: Send + Sync {
    /// Run a single gate in `cwd`. `Err` means the command could not be run.
    fn run_gate(&self, gate: &QualityGate, cwd: &Path) -> Result<GateResult>;
}

/// Runs each gate as `sh -c <command>` with a per-gate timeout.
pub struct ShellGateRunner {
    pub timeout: Duration,
    pub output_limit_bytes: usize,
}

impl Default for ShellGateRunner {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_GATE_TIMEOUT,
            output_limit_bytes: DEFAULT_GATE_OUTPUT_LIMIT_BYTES,
        }
    }
}

impl GateRunner for ShellGateRunner {
    #[instrument(skip_all, fields(gate = %gate.kind))]
    fn run_gate(&self, gate: &QualityGate, cwd: &Path) -> Result<GateResult> {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(&gate.command).current_dir(cwd);
        let output = run_process(
            cmd,
            &ProcessRequest::new(self.timeout, self.output_limit_bytes),
        )?;
        let passed = output.success();
        if !passed {
            warn!(command = %gate.command, exit_code = ?output.code, timed_out = output.timed_out, "gate failed");
        }
        Ok(GateResult {
            kind: gate.kind.clone(),
            command: gate.command.clone(),
            passed,
            output: output.output,
        })
    }
}

/// Run every gate, never short-circuiting, so all failures are reported together.
///
/// A gate that cannot be started counts as failed with the error as its output.
pub fn run_gates(runner: &dyn GateRunner, gates: &[QualityGate], cwd: &Path) -> Vec<GateResult> {
    let results: Vec<GateResult> = gates
        .iter()
        .map(|gate| match runner.run_gate(gate, cwd) {
            Ok(result) => result,
            Err(err) => {
                warn!(gate = %gate.kind, err = %format!("{err:#}"), "gate could not run");
                GateResult::failed(gate, format!("failed to run gate: {err:#}"))
            }
        })
        .collect();
    let passed = results.iter().filter(|r| r.passed).count();
    info!(passed, total = results.len(), "gates finished");
    results
}

pub fn all_passed(results: &[GateResult]) -> bool {
    results.iter().all(|r| r.passed)
}

/// Render gate results as one text block, failures first.
pub fn format_gate_report(results: &[GateResult]) -> String {
    if results.is_empty() {
        return "(no quality gates configured)\n".to_string();
    }
    let mut ordered: Vec<&GateResult> = results.iter().collect();
    ordered.sort_by_key(|r| r.passed);
    let mut buf = String::new();
    for result in ordered {
        let verdict = if result.passed { "PASS" } else { "FAIL" };
        buf.push_str(&format!(
            "=== {} [{}] $ {} ===\n",
            result.kind, verdict, result.command
        ));
        buf.push_str(result.output.trim_end());
        buf.push_str("\n\n");
    }
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;

    fn gate(kind: &str, command: &str) -> QualityGate {
        QualityGate {
            kind: kind.to_string(),
            command: command.to_string(),
        }
    }

    struct FlakyRunner;

    impl GateRunner for FlakyRunner {
        fn run_gate(&self, gate: &QualityGate, _cwd: &Path) -> Result<GateResult> {
            if gate.kind == "broken" {
                return Err(anyhow!("spawn failed"));
            }
            Ok(GateResult {
                kind: gate.kind.clone(),
                command: gate.command.clone(),
                passed: gate.kind != "lint",
                output: format!("{} output", gate.kind),
            })
        }
    }

    #[test]
    fn every_gate_runs_even_after_a_failure() {
        let temp = tempfile::tempdir().expect("tempdir");
        let gates = vec![
            gate("lint", "x"),
            gate("broken", "y"),
            gate("test", "z"),
        ];

        let results = run_gates(&FlakyRunner, &gates, temp.path());

        assert_eq!(results.len(), 3);
        assert!(!results[0].passed);
        assert!(!results[1].passed);
        assert!(results[1].output.contains("spawn failed"));
        assert!(results[2].passed);
        assert!(!all_passed(&results));
    }

    #[test]
    fn report_lists_failures_first() {
        let results = vec![
            GateResult {
                kind: "test".into(),
                command: "cargo test".into(),
                passed: true,
                output: "ok".into(),
            },
            GateResult {
                kind: "lint".into(),
                command: "cargo clippy".into(),
                passed: false,
                output: "warning: unused".into(),
            },
        ];
        let report = format_gate_report(&results);
        let lint = report.find("lint [FAIL]").expect("lint section");
        let test = report.find("test [PASS]").expect("test section");
        assert!(lint < test);
    }

    #[test]
    fn no_gates_means_pass() {
        assert!(all_passed(&[]));
        assert!(format_gate_report(&[]).contains("no quality gates"));
    }

    #[cfg(unix)]
    #[test]
    fn shell_runner_reports_exit_status_and_output() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = ShellGateRunner::default();

        let ok = runner
            .run_gate(&gate("check", "echo fine"), temp.path())
            .expect("run");
        assert!(ok.passed);
        assert!(ok.output.contains("fine"));

        let bad = runner
            .run_gate(&gate("check", "echo broken >&2; exit 1"), temp.path())
            .expect("run");
        assert!(!bad.passed);
        assert!(bad.output.contains("broken"));
    }

    #[cfg(unix)]
    #[test]
    fn shell_runner_times_out() {
        let temp = tempfile::tempdir().expect("tempdir");
        let runner = ShellGateRunner {
            timeout: Duration::from_millis(200),
            output_limit_bytes: 1_000,
        };
        let result = runner
            .run_gate(&gate("slow", "sleep 5"), temp.path())
            .expect("run");
        assert!(!result.passed);
        assert!(result.output.contains("timed out"));
    }
}
