//! Version-control layer backing each sandbox with its own worktree and branch.

mod git;

use anyhow::Result;
use std::path::{Path, PathBuf};

use crate::config;

pub use self::git::GitVcs;

/// Prefix of every sandbox branch
pub const BRANCH_PREFIX: &str = "sandcastle";

/// Branch backing the sandbox `name`
pub fn branch_name(name: &str) -> String {
    format!("{}/{}", BRANCH_PREFIX, name)
}

/// Worktree directory backing the sandbox `name`
pub fn worktree_path(project_dir: &Path, name: &str) -> PathBuf {
    config::worktrees_dir(project_dir).join(name)
}

/// Trait encapsulating the version-control operations sandcastles needs.
///
/// Every call runs the underlying tool as a subprocess and blocks until it exits.
pub trait Vcs: Send + Sync {
    /// Create a worktree at `path` on a new branch `branch` forked from HEAD
    fn create_worktree(&self, repo: &Path, path: &Path, branch: &str) -> Result<()>;

    /// Remove a worktree and delete its branch, ignoring failures
    fn remove_worktree(&self, repo: &Path, path: &Path, branch: &str);

    /// List all worktrees as (path, branch) pairs
    fn list_worktrees(&self, repo: &Path) -> Result<Vec<(PathBuf, String)>>;

    /// Compact per-file status of a worktree (`status --porcelain`)
    fn status_porcelain(&self, worktree: &Path) -> Result<String>;

    /// Stage everything in a worktree and commit it with `message`
    fn commit_all(&self, worktree: &Path, message: &str) -> Result<()>;

    /// Branch currently checked out in `repo`
    fn current_branch(&self, repo: &Path) -> Result<String>;

    /// Number of commits reachable from `head` but not from `base`
    fn count_commits_between(&self, repo: &Path, base: &str, head: &str) -> Result<usize>;

    /// Merge `branch` into the current branch of `repo`
    fn merge_branch(&self, repo: &Path, branch: &str, message: &str) -> Result<()>;

    /// Uncommitted changes of a worktree as a unified diff
    fn diff(&self, worktree: &Path) -> Result<String>;
}

/// Recover sandbox names from a worktree listing, keeping only worktrees that
/// live under the project's sandbox worktree directory.
pub fn sandbox_names_from_worktrees(
    project_dir: &Path,
    worktrees: &[(PathBuf, String)],
) -> Vec<String> {
    let prefix = config::worktrees_dir(project_dir);
    let canonical_prefix = prefix.canonicalize().ok();
    worktrees
        .iter()
        .filter(|(path, _)| {
            path.starts_with(&prefix)
                || canonical_prefix
                    .as_ref()
                    .is_some_and(|p| path.starts_with(p))
        })
        .filter_map(|(path, _)| {
            path.file_name()
                .map(|name| name.to_string_lossy().to_string())
        })
        .collect()
}
