//! Git operations scoped to the project directory.
//!
//! Thin wrappers over the `git` binary. Failures surface as
//! [`CoreError::GitFailure`] with the command's stderr attached verbatim.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use chrono::{DateTime, Utc};
use tokio::process::Command;
use tracing::debug;

use ariana_types::CoreError;
use ariana_wire::CommitInfo;

/// Git command runner bound to one working directory.
#[derive(Debug, Clone)]
pub struct GitContext {
    dir: PathBuf,
}

impl GitContext {
    /// Bind to a working directory.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The bound working directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Run a git subcommand, capturing stdout. Non-zero exit becomes
    /// `GitFailure` with stderr attached.
    pub async fn run(&self, args: &[&str]) -> Result<String, CoreError> {
        debug!(?args, dir = %self.dir.display(), "git");
        let output = Command::new("git")
            .args(args)
            .current_dir(&self.dir)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| CoreError::GitFailure {
                operation: args.first().unwrap_or(&"git").to_string(),
                stderr: e.to_string(),
            })?;

        if output.status.success() {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        } else {
            Err(CoreError::GitFailure {
                operation: args.first().unwrap_or(&"git").to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            })
        }
    }

    /// Like [`run`](Self::run) but tolerates failure, returning None.
    pub async fn try_run(&self, args: &[&str]) -> Option<String> {
        self.run(args).await.ok()
    }

    /// Configure the local repo's author identity.
    pub async fn configure_identity(&self, name: &str, email: &str) -> Result<(), CoreError> {
        self.run(&["config", "user.name", name]).await?;
        self.run(&["config", "user.email", email]).await?;
        Ok(())
    }

    /// Check out a branch, force-creating it. Falls back to `--orphan` when
    /// the repo has no HEAD (fresh or empty clone).
    pub async fn checkout_branch(&self, branch: &str) -> Result<(), CoreError> {
        if self.head_sha().await.is_some() {
            self.run(&["checkout", "-B", branch]).await?;
        } else {
            self.run(&["checkout", "--orphan", branch]).await?;
        }
        Ok(())
    }

    /// The current HEAD sha, when one exists.
    pub async fn head_sha(&self) -> Option<String> {
        self.try_run(&["rev-parse", "HEAD"])
            .await
            .map(|s| s.trim().to_string())
    }

    /// Stage everything and commit. Returns None when the tree was clean.
    pub async fn commit_all(&self, message: &str) -> Result<Option<CommitInfo>, CoreError> {
        self.run(&["add", "-A"]).await?;
        let staged = self.try_run(&["diff", "--cached", "--quiet"]).await;
        if staged.is_some() {
            // Exit 0 from `diff --cached --quiet` means nothing staged.
            return Ok(None);
        }
        self.run(&["commit", "-m", message]).await?;
        self.last_commit().await
    }

    /// Latest commit on HEAD with its line stats, None on an unborn branch.
    pub async fn last_commit(&self) -> Result<Option<CommitInfo>, CoreError> {
        let Some(sha) = self.head_sha().await else {
            return Ok(None);
        };
        let raw = self
            .run(&["log", "-1", "--format=%H%x00%s%x00%cI"])
            .await?;
        let mut parts = raw.trim().split('\u{0}');
        let sha = parts.next().unwrap_or(&sha).to_string();
        let message = parts.next().unwrap_or_default().to_string();
        let timestamp = parts
            .next()
            .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
            .map(|t| t.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        let (additions, deletions) = self.commit_stats(&sha).await;
        Ok(Some(CommitInfo {
            sha,
            message,
            timestamp,
            additions,
            deletions,
        }))
    }

    /// Added/deleted line counts of a commit from `--numstat`.
    async fn commit_stats(&self, sha: &str) -> (u64, u64) {
        let Some(raw) = self
            .try_run(&["show", "--numstat", "--format=", sha])
            .await
        else {
            return (0, 0);
        };
        let mut additions = 0;
        let mut deletions = 0;
        for line in raw.lines() {
            let mut cols = line.split_whitespace();
            // Binary files report "-" in both columns.
            if let (Some(a), Some(d)) = (cols.next(), cols.next()) {
                additions += a.parse::<u64>().unwrap_or(0);
                deletions += d.parse::<u64>().unwrap_or(0);
            }
        }
        (additions, deletions)
    }

    /// Push the branch to origin; returns the pushed tip.
    pub async fn push(&self, branch: &str, force: bool) -> Result<String, CoreError> {
        let mut args = vec!["push", "origin", branch];
        if force {
            args.push("--force");
        }
        self.run(&args).await?;
        self.head_sha().await.ok_or_else(|| CoreError::GitFailure {
            operation: "push".to_string(),
            stderr: "no HEAD after push".to_string(),
        })
    }

    /// Newest-first commit history of HEAD.
    pub async fn history(&self, limit: usize) -> Result<Vec<CommitInfo>, CoreError> {
        if self.head_sha().await.is_none() {
            return Ok(Vec::new());
        }
        let count = format!("-{limit}");
        let raw = self
            .run(&["log", &count, "--format=%H%x00%s%x00%cI"])
            .await?;
        let mut commits = Vec::new();
        for line in raw.lines() {
            let mut parts = line.split('\u{0}');
            let (Some(sha), Some(message), Some(timestamp)) =
                (parts.next(), parts.next(), parts.next())
            else {
                continue;
            };
            commits.push(CommitInfo {
                sha: sha.to_string(),
                message: message.to_string(),
                timestamp: DateTime::parse_from_rfc3339(timestamp)
                    .map(|t| t.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
                additions: 0,
                deletions: 0,
            });
        }
        Ok(commits)
    }

    /// Full diff of the agent's work since the given base commit.
    pub async fn diff_since(&self, base_sha: &str) -> Result<String, CoreError> {
        self.run(&["diff", base_sha, "HEAD"]).await
    }

    /// Uncommitted changes in the working tree.
    pub async fn pending_diff(&self) -> Result<String, CoreError> {
        self.run(&["diff", "HEAD"]).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn init_repo(dir: &Path) -> GitContext {
        let git = GitContext::new(dir);
        git.run(&["init", "-b", "main"]).await.unwrap();
        git.configure_identity("Test", "test@example.com").await.unwrap();
        git
    }

    #[tokio::test]
    async fn commit_all_reports_stats() {
        let dir = tempdir().unwrap();
        let git = init_repo(dir.path()).await;
        tokio::fs::write(dir.path().join("a.txt"), "one\ntwo\nthree\n")
            .await
            .unwrap();

        let commit = git.commit_all("add a.txt").await.unwrap().unwrap();
        assert_eq!(commit.message, "add a.txt");
        assert_eq!(commit.additions, 3);
        assert_eq!(commit.deletions, 0);
    }

    #[tokio::test]
    async fn clean_tree_commits_nothing() {
        let dir = tempdir().unwrap();
        let git = init_repo(dir.path()).await;
        tokio::fs::write(dir.path().join("a.txt"), "x").await.unwrap();
        git.commit_all("first").await.unwrap();

        assert!(git.commit_all("empty").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn checkout_orphan_on_unborn_head() {
        let dir = tempdir().unwrap();
        let git = init_repo(dir.path()).await;
        // No commit yet: HEAD is unborn, -B would fail.
        git.checkout_branch("feature/x").await.unwrap();
        let branch = git.run(&["branch", "--show-current"]).await.unwrap();
        assert_eq!(branch.trim(), "feature/x");
    }

    #[tokio::test]
    async fn history_is_newest_first() {
        let dir = tempdir().unwrap();
        let git = init_repo(dir.path()).await;
        for name in ["one", "two"] {
            tokio::fs::write(dir.path().join(name), name).await.unwrap();
            git.commit_all(name).await.unwrap();
        }
        let history = git.history(10).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].message, "two");
    }

    #[tokio::test]
    async fn failure_attaches_stderr() {
        let dir = tempdir().unwrap();
        let git = GitContext::new(dir.path());
        let err = git.run(&["log"]).await.unwrap_err();
        match err {
            CoreError::GitFailure { operation, stderr } => {
                assert_eq!(operation, "log");
                assert!(!stderr.is_empty());
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
