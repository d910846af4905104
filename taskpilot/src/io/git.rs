//! Git adapter for run branches and codebase listings.
//!
//! Branch handling is a pluggable collaborator ([`VersionControl`]) so the
//! orchestrator can be tested without a repository.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

/// Branch operations the orchestrator needs when `use_branch` is set.
pub trait VersionControl: Send + Sync {
    fn current_branch(&self) -> Result<String>;
    /// Create `branch` at HEAD and check it out, or check it out if it already exists.
    fn create_and_checkout(&self, branch: &str) -> Result<()>;
    /// Check out `original_branch` again.
    fn restore(&self, original_branch: &str) -> Result<()>;
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// True if the working directory is inside a git work tree.
    pub fn is_repo(&self) -> bool {
        self.run(&["rev-parse", "--is-inside-work-tree"])
            .is_ok_and(|out| out.status.success())
    }

    /// Check whether a local branch exists.
    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let status = self
            .run(&[
                "show-ref",
                "--verify",
                "--quiet",
                &format!("refs/heads/{branch}"),
            ])?
            .status;
        Ok(status.success())
    }

    /// Tracked files, at most `limit` of them, plus how many were left out.
    pub fn ls_files(&self, limit: usize) -> Result<(Vec<String>, usize)> {
        let out = self.run_capture(&["ls-files"])?;
        Ok(cap_lines(&out, limit))
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

impl VersionControl for Git {
    /// Return the current branch name (errors on detached HEAD).
    #[instrument(skip_all)]
    fn current_branch(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            warn!("detached HEAD detected");
            return Err(anyhow!("detached HEAD (refuse to use a run branch)"));
        }
        debug!(branch = %name, "current branch");
        Ok(name)
    }

    #[instrument(skip_all, fields(branch))]
    fn create_and_checkout(&self, branch: &str) -> Result<()> {
        if self.branch_exists(branch)? {
            debug!(branch, "checking out existing run branch");
            self.run_checked(&["checkout", branch])?;
        } else {
            debug!(branch, "creating and checking out run branch");
            self.run_checked(&["checkout", "-b", branch])?;
        }
        Ok(())
    }

    #[instrument(skip_all, fields(branch = original_branch))]
    fn restore(&self, original_branch: &str) -> Result<()> {
        debug!("restoring original branch");
        self.run_checked(&["checkout", original_branch])?;
        Ok(())
    }
}

fn cap_lines(out: &str, limit: usize) -> (Vec<String>, usize) {
    let mut lines: Vec<String> = out
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect();
    let omitted = lines.len().saturating_sub(limit);
    lines.truncate(limit);
    (lines, omitted)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn git_available() -> bool {
        Command::new("git")
            .arg("--version")
            .output()
            .is_ok_and(|out| out.status.success())
    }

    fn init_repo(dir: &Path) -> Git {
        let git = Git::new(dir);
        git.run_checked(&["init", "-q", "-b", "main"]).expect("init");
        std::fs::write(dir.join("README.md"), "hello\n").expect("write");
        git.run_checked(&["add", "README.md"]).expect("add");
        git.run_checked(&[
            "-c",
            "user.name=taskpilot",
            "-c",
            "user.email=taskpilot@example.com",
            "commit",
            "-q",
            "-m",
            "init",
        ])
        .expect("commit");
        git
    }

    #[test]
    fn cap_lines_reports_omitted_count() {
        let (lines, omitted) = cap_lines("a\n\nb\nc\n", 2);
        assert_eq!(lines, vec!["a", "b"]);
        assert_eq!(omitted, 1);
    }

    #[test]
    fn run_branch_is_created_then_reused_and_restored() {
        if !git_available() {
            return;
        }
        let temp = tempfile::tempdir().expect("tempdir");
        let git = init_repo(temp.path());
        assert!(git.is_repo());
        assert_eq!(git.current_branch().expect("branch"), "main");

        git.create_and_checkout("taskpilot/run_1").expect("create");
        assert_eq!(git.current_branch().expect("branch"), "taskpilot/run_1");

        git.restore("main").expect("restore");
        git.create_and_checkout("taskpilot/run_1").expect("reuse");
        assert_eq!(git.current_branch().expect("branch"), "taskpilot/run_1");

        let (files, omitted) = git.ls_files(10).expect("ls-files");
        assert_eq!(files, vec!["README.md"]);
        assert_eq!(omitted, 0);
    }

    #[test]
    fn plain_directory_is_not_a_repo() {
        if !git_available() {
            return;
        }
        let temp = tempfile::tempdir().expect("tempdir");
        assert!(!Git::new(temp.path()).is_repo());
    }
}
