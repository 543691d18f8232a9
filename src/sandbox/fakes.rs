//! In-memory runtime and version control used to drive the manager in tests.

use anyhow::{Result, anyhow, bail};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Mutex, MutexGuard};

use crate::runtime::{BuildSpec, ContainerRuntime, ContainerState, ExecOptions, RunSpec};
use crate::vcs::Vcs;

#[derive(Default)]
struct RuntimeState {
    containers: BTreeMap<String, ContainerState>,
    ports: BTreeMap<String, BTreeMap<String, String>>,
    next_id: u64,
    fail_build: bool,
    fail_run: bool,
    fail_inspect: bool,
    fail_exec: Vec<String>,
    calls: Vec<String>,
    execs: Vec<String>,
    copies: Vec<(String, String)>,
    runs: Vec<RunSpec>,
}

#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<RuntimeState>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, RuntimeState> {
        self.state.lock().unwrap()
    }

    pub fn add_container(&self, name: &str) {
        self.set_state(name, ContainerState::Running);
    }

    pub fn set_state(&self, name: &str, state: ContainerState) {
        self.state().containers.insert(name.to_string(), state);
    }

    /// Simulate a container removed behind the tool's back
    pub fn forget_container(&self, name: &str) {
        self.state().containers.remove(name);
    }

    pub fn has_container(&self, name: &str) -> bool {
        self.state().containers.contains_key(name)
    }

    pub fn set_ports(&self, name: &str, ports: &[(&str, &str)]) {
        let ports = ports
            .iter()
            .map(|(c, h)| (c.to_string(), h.to_string()))
            .collect();
        self.state().ports.insert(name.to_string(), ports);
    }

    pub fn fail_build(&self) {
        self.state().fail_build = true;
    }

    pub fn fail_run(&self) {
        self.state().fail_run = true;
    }

    pub fn fail_inspect(&self, fail: bool) {
        self.state().fail_inspect = fail;
    }

    /// Fail every exec whose command line contains `needle`
    pub fn fail_exec_matching(&self, needle: &str) {
        self.state().fail_exec.push(needle.to_string());
    }

    /// Lifecycle calls as `<verb> <target>`
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }

    /// Exec calls as `<container>: <command line>`
    pub fn exec_log(&self) -> Vec<String> {
        self.state().execs.clone()
    }

    /// Copies as (host path, `<container>:<path>`)
    pub fn copies(&self) -> Vec<(String, String)> {
        self.state().copies.clone()
    }

    pub fn runs(&self) -> Vec<RunSpec> {
        self.state().runs.clone()
    }
}

impl ContainerRuntime for FakeRuntime {
    fn build_image(&self, spec: &BuildSpec) -> Result<()> {
        let mut state = self.state();
        state.calls.push(format!("build {}", spec.image));
        if state.fail_build {
            bail!("failed to solve: process \"/bin/sh -c apt-get install\" did not complete");
        }
        Ok(())
    }

    fn run_container(&self, spec: &RunSpec) -> Result<String> {
        let mut state = self.state();
        state.calls.push(format!("run {}", spec.name));
        state.runs.push(spec.clone());
        if state.fail_run {
            bail!("docker: Error response from daemon: port is already allocated");
        }
        state
            .containers
            .insert(spec.name.clone(), ContainerState::Running);
        state.next_id += 1;
        Ok(format!("{:012x}", state.next_id))
    }

    fn stop_container(&self, name: &str) -> Result<()> {
        let mut state = self.state();
        state.calls.push(format!("stop {}", name));
        match state.containers.get_mut(name) {
            Some(container) => {
                *container = ContainerState::Exited;
                Ok(())
            }
            None => Err(anyhow!("Error: No such container: {}", name)),
        }
    }

    fn remove_container(&self, name: &str) -> Result<()> {
        let mut state = self.state();
        state.calls.push(format!("rm {}", name));
        state
            .containers
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| anyhow!("Error: No such container: {}", name))
    }

    fn inspect_state(&self, name: &str) -> Result<Option<ContainerState>> {
        let state = self.state();
        if state.fail_inspect {
            bail!("Cannot connect to the Docker daemon");
        }
        Ok(state.containers.get(name).cloned())
    }

    fn port_mappings(&self, name: &str) -> Result<BTreeMap<String, String>> {
        Ok(self.state().ports.get(name).cloned().unwrap_or_default())
    }

    fn exec(&self, name: &str, _options: ExecOptions<'_>, command: &[&str]) -> Result<String> {
        let mut state = self.state();
        if !state.containers.contains_key(name) {
            bail!("Error: No such container: {}", name);
        }
        let line = command.join(" ");
        state.execs.push(format!("{}: {}", name, line));
        if state.fail_exec.iter().any(|needle| line.contains(needle.as_str())) {
            bail!("exit status 1: {}", line);
        }
        Ok(String::new())
    }

    fn copy_into(&self, host_path: &Path, name: &str, container_path: &str) -> Result<()> {
        let mut state = self.state();
        state.copies.push((
            host_path.display().to_string(),
            format!("{}:{}", name, container_path),
        ));
        Ok(())
    }

    fn interactive_command(&self, name: &str, command: &[&str]) -> Command {
        let mut cmd = Command::new("fake-runtime");
        cmd.args(["exec", "-it", name]).args(command);
        cmd
    }
}

#[derive(Default)]
struct VcsState {
    worktrees: BTreeMap<PathBuf, String>,
    dirty: BTreeSet<PathBuf>,
    commits_ahead: BTreeMap<String, usize>,
    fail_create: bool,
    fail_commit: bool,
    merge_conflict: bool,
    calls: Vec<String>,
}

#[derive(Default)]
pub struct FakeVcs {
    state: Mutex<VcsState>,
}

impl FakeVcs {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, VcsState> {
        self.state.lock().unwrap()
    }

    pub fn add_worktree(&self, path: PathBuf, branch: &str) {
        self.state().worktrees.insert(path, branch.to_string());
    }

    pub fn has_worktree(&self, path: &Path) -> bool {
        self.state().worktrees.contains_key(path)
    }

    pub fn mark_dirty(&self, worktree: &Path) {
        self.state().dirty.insert(worktree.to_path_buf());
    }

    pub fn add_commits(&self, branch: &str, count: usize) {
        *self
            .state()
            .commits_ahead
            .entry(branch.to_string())
            .or_default() += count;
    }

    pub fn fail_create(&self) {
        self.state().fail_create = true;
    }

    pub fn fail_commit(&self) {
        self.state().fail_commit = true;
    }

    pub fn merge_conflict(&self) {
        self.state().merge_conflict = true;
    }

    /// Mutating calls as `<verb> <target>`
    pub fn calls(&self) -> Vec<String> {
        self.state().calls.clone()
    }
}

impl Vcs for FakeVcs {
    fn create_worktree(&self, _repo: &Path, path: &Path, branch: &str) -> Result<()> {
        let mut state = self.state();
        state.calls.push(format!("worktree add {}", branch));
        if state.fail_create {
            bail!("fatal: a branch named '{}' already exists", branch);
        }
        state.worktrees.insert(path.to_path_buf(), branch.to_string());
        Ok(())
    }

    fn remove_worktree(&self, _repo: &Path, path: &Path, branch: &str) {
        let mut state = self.state();
        state.calls.push(format!("worktree remove {}", branch));
        state.worktrees.remove(path);
    }

    fn list_worktrees(&self, _repo: &Path) -> Result<Vec<(PathBuf, String)>> {
        Ok(self
            .state()
            .worktrees
            .iter()
            .map(|(path, branch)| (path.clone(), branch.clone()))
            .collect())
    }

    fn status_porcelain(&self, worktree: &Path) -> Result<String> {
        if self.state().dirty.contains(worktree) {
            Ok(" M src/login.rs".to_string())
        } else {
            Ok(String::new())
        }
    }

    fn commit_all(&self, worktree: &Path, message: &str) -> Result<()> {
        let mut state = self.state();
        state.calls.push(format!("commit {}", message));
        if state.fail_commit {
            bail!("fatal: Unable to create '.git/index.lock': File exists.");
        }
        state.dirty.remove(worktree);
        let branch = state
            .worktrees
            .get(worktree)
            .cloned()
            .ok_or_else(|| anyhow!("not a worktree: {}", worktree.display()))?;
        *state.commits_ahead.entry(branch).or_default() += 1;
        Ok(())
    }

    fn current_branch(&self, _repo: &Path) -> Result<String> {
        Ok("main".to_string())
    }

    fn count_commits_between(&self, _repo: &Path, _base: &str, head: &str) -> Result<usize> {
        Ok(self.state().commits_ahead.get(head).copied().unwrap_or(0))
    }

    fn merge_branch(&self, _repo: &Path, branch: &str, _message: &str) -> Result<()> {
        let mut state = self.state();
        state.calls.push(format!("merge {}", branch));
        if state.merge_conflict {
            bail!("CONFLICT (content): Merge conflict in src/login.rs");
        }
        state.commits_ahead.remove(branch);
        Ok(())
    }

    fn diff(&self, worktree: &Path) -> Result<String> {
        if self.state().dirty.contains(worktree) {
            Ok("diff --git a/src/login.rs b/src/login.rs\n".to_string())
        } else {
            Ok(String::new())
        }
    }
}
