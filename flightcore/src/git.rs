//! Git service boundary and subprocess implementation.
//!
//! The core invokes git through a narrow trait so tests can substitute a
//! recording double. The subprocess implementation retries transient
//! failures (index locks, racing processes) with exponential backoff.

use std::path::{Path, PathBuf};
use std::process::Command;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{FlightError, FlightResult};

/// Retry attempts for transient git failures
const DEFAULT_MAX_RETRIES: u32 = 3;

/// Base delay between retries in milliseconds
const RETRY_BASE_DELAY_MS: u64 = 100;

/// Result of a commit attempt
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    pub message: String,
}

/// Result of a hard reset
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResetResult {
    pub success: bool,
    pub message: String,
}

/// Narrow git interface borrowed by the coordinator
pub trait GitService: Send + Sync {
    /// Whether the working directory is inside a git repository
    fn is_git_repo(&self) -> bool;

    /// Stage everything and commit
    fn commit(&self, message: &str) -> FlightResult<CommitResult>;

    /// Create a tag pointing at a ref
    fn tag(&self, name: &str, reference: &str) -> FlightResult<()>;

    /// Hard-reset the working tree to a ref
    fn reset_hard(&self, reference: &str) -> FlightResult<ResetResult>;

    /// Current branch name
    fn current_branch(&self) -> FlightResult<String>;

    /// Current HEAD commit hash (short)
    fn head_commit(&self) -> FlightResult<String>;
}

/// `git` subprocess implementation
pub struct ProcessGit {
    working_dir: PathBuf,
    max_retries: u32,
}

impl ProcessGit {
    /// Service for a working directory
    pub fn new(working_dir: impl AsRef<Path>) -> Self {
        Self {
            working_dir: working_dir.as_ref().to_path_buf(),
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    fn run_git(&self, args: &[&str]) -> FlightResult<String> {
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.working_dir)
            .output()
            .map_err(|e| FlightError::git("execute", e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(FlightError::git(args.join(" "), stderr.to_string()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    /// Retry transient failures with exponential backoff: 100ms, 200ms, ...
    fn run_git_with_retry(&self, args: &[&str]) -> FlightResult<String> {
        let mut attempt = 0;
        loop {
            match self.run_git(args) {
                Ok(output) => return Ok(output),
                Err(e) if e.is_retryable() && attempt < self.max_retries => {
                    let delay = RETRY_BASE_DELAY_MS * (1 << attempt);
                    debug!(attempt, delay_ms = delay, "Retrying git command");
                    std::thread::sleep(std::time::Duration::from_millis(delay));
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn has_uncommitted_changes(&self) -> FlightResult<bool> {
        Ok(!self.run_git(&["status", "--porcelain"])?.is_empty())
    }
}

impl GitService for ProcessGit {
    fn is_git_repo(&self) -> bool {
        self.run_git(&["rev-parse", "--git-dir"]).is_ok()
    }

    fn commit(&self, message: &str) -> FlightResult<CommitResult> {
        self.run_git_with_retry(&["add", "-A"])?;
        if !self.has_uncommitted_changes()? {
            return Ok(CommitResult {
                success: false,
                hash: None,
                message: "Nothing to commit".to_string(),
            });
        }
        self.run_git_with_retry(&["commit", "-m", message])?;
        let hash = self.head_commit()?;
        Ok(CommitResult {
            success: true,
            hash: Some(hash),
            message: message.to_string(),
        })
    }

    fn tag(&self, name: &str, reference: &str) -> FlightResult<()> {
        self.run_git_with_retry(&["tag", "-f", name, reference])?;
        Ok(())
    }

    fn reset_hard(&self, reference: &str) -> FlightResult<ResetResult> {
        // Verify the ref exists before destroying anything
        self.run_git(&["cat-file", "-e", &format!("{reference}^{{commit}}")])?;
        self.run_git_with_retry(&["reset", "--hard", reference])?;
        Ok(ResetResult {
            success: true,
            message: format!("Reset to {reference}"),
        })
    }

    fn current_branch(&self) -> FlightResult<String> {
        self.run_git(&["rev-parse", "--abbrev-ref", "HEAD"])
    }

    fn head_commit(&self) -> FlightResult<String> {
        self.run_git(&["rev-parse", "--short", "HEAD"])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn setup_repo() -> (tempfile::TempDir, ProcessGit) {
        let dir = tempdir().unwrap();
        let run = |args: &[&str]| {
            Command::new("git")
                .args(args)
                .current_dir(dir.path())
                .output()
                .unwrap()
        };
        run(&["init"]);
        run(&["config", "user.email", "test@test.com"]);
        run(&["config", "user.name", "Test"]);
        std::fs::write(dir.path().join("README.md"), "# Test").unwrap();
        run(&["add", "."]);
        run(&["commit", "-m", "Initial commit"]);

        let git = ProcessGit::new(dir.path());
        (dir, git)
    }

    #[test]
    fn test_is_git_repo() {
        let (_dir, git) = setup_repo();
        assert!(git.is_git_repo());

        let plain = tempdir().unwrap();
        assert!(!ProcessGit::new(plain.path()).is_git_repo());
    }

    #[test]
    fn test_commit_and_head() {
        let (dir, git) = setup_repo();
        std::fs::write(dir.path().join("feature.txt"), "content").unwrap();

        let result = git.commit("[fly] WP-1: feature").unwrap();
        assert!(result.success);
        assert!(result.hash.is_some());
        assert_eq!(git.head_commit().unwrap(), result.hash.unwrap());
    }

    #[test]
    fn test_commit_nothing_to_commit() {
        let (_dir, git) = setup_repo();
        let result = git.commit("[fly] empty").unwrap();
        assert!(!result.success);
        assert!(result.message.contains("Nothing to commit"));
    }

    #[test]
    fn test_tag_and_reset() {
        let (dir, git) = setup_repo();
        let initial = git.head_commit().unwrap();
        git.tag("wp-1", &initial).unwrap();

        std::fs::write(dir.path().join("new.txt"), "changes").unwrap();
        git.commit("[fly] WP-1: changes").unwrap();
        assert_ne!(git.head_commit().unwrap(), initial);

        let reset = git.reset_hard("wp-1").unwrap();
        assert!(reset.success);
        assert_eq!(git.head_commit().unwrap(), initial);
        assert!(!dir.path().join("new.txt").exists());
    }

    #[test]
    fn test_reset_to_unknown_ref_fails() {
        let (_dir, git) = setup_repo();
        assert!(git.reset_hard("does-not-exist").is_err());
    }

    #[test]
    fn test_current_branch() {
        let (_dir, git) = setup_repo();
        assert!(!git.current_branch().unwrap().is_empty());
    }
}
