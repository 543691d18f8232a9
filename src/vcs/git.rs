use anyhow::{Context, Result, anyhow};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::cmd::Cmd;

use super::Vcs;

/// Git-backed implementation of the [`Vcs`] trait
#[derive(Debug, Default, Clone, Copy)]
pub struct GitVcs;

impl GitVcs {
    pub fn new() -> Self {
        Self
    }
}

fn path_str(path: &Path) -> Result<&str> {
    path.to_str()
        .ok_or_else(|| anyhow!("Invalid path: {}", path.display()))
}

impl Vcs for GitVcs {
    fn create_worktree(&self, repo: &Path, path: &Path, branch: &str) -> Result<()> {
        Cmd::new("git")
            .workdir(repo)
            .args(&["worktree", "add", "-b", branch, path_str(path)?])
            .run()
            .context("Failed to create worktree")?;
        Ok(())
    }

    fn remove_worktree(&self, repo: &Path, path: &Path, branch: &str) {
        let path = path.to_string_lossy();
        if let Err(e) = Cmd::new("git")
            .workdir(repo)
            .args(&["worktree", "remove", "--force", &path])
            .run()
        {
            debug!(error = %e, path = %path, "git:worktree remove failed");
        }
        if let Err(e) = Cmd::new("git")
            .workdir(repo)
            .args(&["branch", "-D", branch])
            .run()
        {
            debug!(error = %e, branch, "git:branch delete failed");
        }
    }

    fn list_worktrees(&self, repo: &Path) -> Result<Vec<(PathBuf, String)>> {
        let list = Cmd::new("git")
            .workdir(repo)
            .args(&["worktree", "list", "--porcelain"])
            .run_and_capture_stdout()
            .context("Failed to list worktrees")?;
        Ok(parse_worktree_list_porcelain(&list))
    }

    fn status_porcelain(&self, worktree: &Path) -> Result<String> {
        Cmd::new("git")
            .workdir(worktree)
            .args(&["status", "--porcelain"])
            .run_and_capture_stdout()
            .context("Failed to read worktree status")
    }

    fn commit_all(&self, worktree: &Path, message: &str) -> Result<()> {
        Cmd::new("git")
            .workdir(worktree)
            .args(&["add", "-A"])
            .run()
            .context("Failed to stage changes")?;
        Cmd::new("git")
            .workdir(worktree)
            .args(&["commit", "-m", message])
            .run()
            .context("Failed to commit changes")?;
        Ok(())
    }

    fn current_branch(&self, repo: &Path) -> Result<String> {
        Cmd::new("git")
            .workdir(repo)
            .args(&["rev-parse", "--abbrev-ref", "HEAD"])
            .run_and_capture_stdout()
            .context("Failed to determine the current branch")
    }

    fn count_commits_between(&self, repo: &Path, base: &str, head: &str) -> Result<usize> {
        let range = format!("{}..{}", base, head);
        let count = Cmd::new("git")
            .workdir(repo)
            .args(&["rev-list", "--count", &range])
            .run_and_capture_stdout()
            .with_context(|| format!("Failed to count commits in {}", range))?;
        count
            .parse()
            .with_context(|| format!("Unexpected commit count '{}'", count))
    }

    fn merge_branch(&self, repo: &Path, branch: &str, message: &str) -> Result<()> {
        Cmd::new("git")
            .workdir(repo)
            .args(&["merge", branch, "-m", message])
            .run()?;
        Ok(())
    }

    fn diff(&self, worktree: &Path) -> Result<String> {
        Cmd::new("git")
            .workdir(worktree)
            .arg("diff")
            .run_and_capture_stdout()
            .context("Failed to diff worktree")
    }
}

/// Parse the output of `git worktree list --porcelain`
fn parse_worktree_list_porcelain(output: &str) -> Vec<(PathBuf, String)> {
    let mut worktrees = Vec::new();
    for block in output.trim().split("\n\n") {
        let mut path: Option<PathBuf> = None;
        let mut branch: Option<String> = None;

        for line in block.lines() {
            if let Some(p) = line.strip_prefix("worktree ") {
                path = Some(PathBuf::from(p));
            } else if let Some(b) = line.strip_prefix("branch refs/heads/") {
                branch = Some(b.to_string());
            } else if line.trim() == "detached" {
                branch = Some("(detached)".to_string());
            }
        }

        if let (Some(p), Some(b)) = (path, branch) {
            worktrees.push((p, b));
        }
    }
    worktrees
}
