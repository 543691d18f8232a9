use anyhow::{Context, Result, anyhow};
use regex::Regex;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, LazyLock, Mutex, MutexGuard};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

use crate::agent;
use crate::config::{self, Config, ContainerRuntimeKind};
use crate::multiplexer;
use crate::runtime::{
    self, BuildSpec, ContainerRuntime, ContainerState, DockerRuntime, RunSpec, WORKSPACE_PATH,
    container_name,
};
use crate::state::{Fleet, StateStore};
use crate::vcs::{self, GitVcs, Vcs};

use super::provision;
use super::types::{Sandbox, SandboxError, Status};

static NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9-]*$").unwrap());

const DOCKER_SOCKET: &str = "/var/run/docker.sock";
const API_KEY_VAR: &str = "ANTHROPIC_API_KEY";

/// Reject names that cannot seed a container, branch and directory name
pub fn validate_name(name: &str) -> Result<(), SandboxError> {
    if NAME_RE.is_match(name) {
        Ok(())
    } else {
        Err(SandboxError::InvalidName(name.to_string()))
    }
}

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

#[derive(Default)]
struct Inner {
    fleet: Fleet,
    /// Names whose create is in flight; reserved so a second create fails fast
    pending: HashSet<String>,
}

/// Owns the fleet of one project and sequences every operation on it.
///
/// The fleet lock is held for map mutations and for the read-merge-write of
/// the state file only. Subprocess calls run unlocked.
pub struct Manager {
    project_dir: PathBuf,
    config: Config,
    runtime: Arc<dyn ContainerRuntime>,
    vcs: Arc<dyn Vcs>,
    store: StateStore,
    home_dir: Option<PathBuf>,
    inner: Mutex<Inner>,
}

/// Releases a create reservation however the create ends
struct Reservation<'a> {
    manager: &'a Manager,
    name: &'a str,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        self.manager.lock().pending.remove(self.name);
    }
}

impl Manager {
    /// Manager for `project_dir` with the fleet loaded from its state file.
    /// An unreadable state file is an error.
    pub fn new(
        project_dir: PathBuf,
        config: Config,
        runtime: Arc<dyn ContainerRuntime>,
        vcs: Arc<dyn Vcs>,
    ) -> Result<Self> {
        let store = StateStore::for_project(&project_dir);
        let fleet = store.load()?;
        debug!(project = %project_dir.display(), count = fleet.len(), "manager:loaded state");
        Ok(Self {
            project_dir,
            config,
            runtime,
            vcs,
            store,
            home_dir: home::home_dir(),
            inner: Mutex::new(Inner {
                fleet,
                pending: HashSet::new(),
            }),
        })
    }

    /// Manager driving git and the configured container runtime
    pub fn for_project(project_dir: PathBuf, config: Config) -> Result<Self> {
        let kind: ContainerRuntimeKind = config.defaults.runtime();
        which::which(kind.binary()).with_context(|| {
            format!(
                "Container runtime '{}' not found in PATH; install it or set defaults.runtime in {}/{}",
                kind.binary(),
                config::DIR,
                config::CONFIG_FILE
            )
        })?;
        Self::new(
            project_dir,
            config,
            Arc::new(DockerRuntime::new(kind)),
            Arc::new(GitVcs::new()),
        )
    }

    /// Override the host home directory agent files are seeded from
    pub fn with_home_dir(mut self, home_dir: Option<PathBuf>) -> Self {
        self.home_dir = home_dir;
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Read-merge-write the fleet. Failures are logged, never returned.
    fn persist(&self, inner: &mut Inner) {
        let runtime = self.runtime.as_ref();
        match self.store.save_merged(&mut inner.fleet, |sandbox| {
            container_exists(runtime, &sandbox.name)
        }) {
            Ok(adopted) if !adopted.is_empty() => {
                info!(adopted = ?adopted, "manager:adopted sandboxes from other instances");
            }
            Ok(_) => {}
            Err(e) => warn!(
                path = %self.store.path().display(),
                error = %e,
                "manager:failed to save state"
            ),
        }
    }

    /// Provision a sandbox and add it to the fleet as `Running`.
    ///
    /// `progress` receives a label as each phase starts. Worktree, image and
    /// container failures roll back what was created; configuration and
    /// session failures are logged and the sandbox is still returned.
    pub fn create(&self, name: &str, task: &str, progress: &dyn Fn(&str)) -> Result<Sandbox> {
        validate_name(name)?;
        {
            let mut inner = self.lock();
            if inner.fleet.contains_key(name) || inner.pending.contains(name) {
                return Err(SandboxError::AlreadyExists(name.to_string()).into());
            }
            inner.pending.insert(name.to_string());
        }
        let _reservation = Reservation {
            manager: self,
            name,
        };

        info!(sandbox = name, "create:start");
        let report = |phase: &str| {
            debug!(sandbox = name, phase, "create:phase");
            progress(phase);
        };

        let branch = vcs::branch_name(name);
        let worktree = vcs::worktree_path(&self.project_dir, name);
        let container = container_name(name);

        report("Creating worktree...");
        if let Some(parent) = worktree.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        self.vcs
            .create_worktree(&self.project_dir, &worktree, &branch)
            .with_context(|| format!("Failed to create worktree for '{}'", name))?;

        report("Building image (may take a minute on first run)...");
        if let Err(e) = self.runtime.build_image(&self.build_spec()) {
            self.vcs.remove_worktree(&self.project_dir, &worktree, &branch);
            return Err(e.context("Image build failed"));
        }

        report("Starting container...");
        let container_id = match self.runtime.run_container(&self.run_spec(name, &worktree)) {
            Ok(id) => id,
            Err(e) => {
                // `run` can leave a created-but-not-started container behind
                if let Err(rm) = self.runtime.remove_container(&container) {
                    debug!(container = %container, error = %rm, "create:no container to roll back");
                }
                self.vcs.remove_worktree(&self.project_dir, &worktree, &branch);
                return Err(e.context("Container start failed"));
            }
        };
        info!(sandbox = name, container_id = %container_id, "create:container started");

        let failed = provision::configure(
            self.runtime.as_ref(),
            &container,
            &self.project_dir,
            &self.config.defaults,
            self.home_dir.as_deref(),
            &report,
        );
        if failed > 0 {
            warn!(sandbox = name, failed, "create:some configuration steps failed");
        }

        report("Starting tmux session...");
        if let Err(e) = multiplexer::start_session(self.runtime.as_ref(), &container, name) {
            warn!(sandbox = name, error = %e, "create:session start failed");
        }

        let ports = self.observe_ports(&container).unwrap_or_default();

        let sandbox = Sandbox {
            name: name.to_string(),
            container_id,
            status: Status::Running,
            task: task.to_string(),
            branch,
            worktree_path: worktree,
            ports,
            created_at: now_nanos(),
        };

        {
            let mut inner = self.lock();
            inner.fleet.insert(name.to_string(), sandbox.clone());
            self.persist(&mut inner);
        }
        info!(sandbox = name, "create:done");
        Ok(sandbox)
    }

    fn build_spec(&self) -> BuildSpec {
        let uid = unsafe { libc::getuid() };
        let gid = unsafe { libc::getgid() };
        BuildSpec {
            image: self.config.image_name(),
            dockerfile: self.config.image.dockerfile_path().to_string(),
            context_dir: self.project_dir.clone(),
            build_args: vec![
                ("HOST_UID".to_string(), uid.to_string()),
                ("HOST_GID".to_string(), gid.to_string()),
            ],
        }
    }

    fn run_spec(&self, name: &str, worktree: &Path) -> RunSpec {
        let defaults = &self.config.defaults;

        // The worktree's .git file points into the main repository
        let git_dir = self.project_dir.join(".git").display().to_string();
        let mut volumes = vec![
            format!("{}:{}", worktree.display(), WORKSPACE_PATH),
            format!("{}:{}", git_dir, git_dir),
        ];
        let mut group_add = Vec::new();
        if defaults.docker_socket {
            volumes.push(format!("{}:{}", DOCKER_SOCKET, DOCKER_SOCKET));
            match fs::metadata(DOCKER_SOCKET) {
                Ok(meta) => group_add.push(meta.gid().to_string()),
                Err(e) => warn!(error = %e, "create:cannot read docker socket group"),
            }
        }
        volumes.extend(defaults.mounts.iter().cloned());

        let mut env = Vec::new();
        if std::env::var(API_KEY_VAR).is_ok_and(|key| !key.is_empty()) {
            env.push(API_KEY_VAR.to_string());
        }
        env.extend(defaults.env.iter().map(|(k, v)| format!("{}={}", k, v)));

        RunSpec {
            name: container_name(name),
            image: self.config.image_name(),
            volumes,
            group_add,
            host_network: defaults.is_host_network(),
            publish: defaults.ports.clone(),
            env,
            command: vec!["sleep".to_string(), "infinity".to_string()],
        }
    }

    /// Current port map of a container, or `None` if it could not be queried
    fn observe_ports(&self, container: &str) -> Option<BTreeMap<String, String>> {
        if self.config.defaults.is_host_network() {
            return Some(runtime::identity_ports(&self.config.defaults.ports));
        }
        match self.runtime.port_mappings(container) {
            Ok(ports) => Some(ports),
            Err(e) => {
                warn!(container, error = %e, "manager:port query failed");
                None
            }
        }
    }

    /// Tear down the container and worktree of `name`, then drop its entry.
    ///
    /// Teardown is best-effort; the entry is removed even if it fails.
    pub fn destroy(&self, name: &str) -> Result<()> {
        let sandbox = self
            .get(name)
            .ok_or_else(|| SandboxError::NotFound(name.to_string()))?;
        let container = container_name(name);
        info!(sandbox = name, "destroy:start");

        if let Err(e) = self.runtime.stop_container(&container) {
            debug!(container = %container, error = %e, "destroy:stop failed");
        }
        if let Err(e) = self.runtime.remove_container(&container) {
            debug!(container = %container, error = %e, "destroy:remove failed");
        }
        self.vcs
            .remove_worktree(&self.project_dir, &sandbox.worktree_path, &sandbox.branch);

        let mut inner = self.lock();
        inner.fleet.remove(name);
        self.persist(&mut inner);
        info!(sandbox = name, "destroy:done");
        Ok(())
    }

    /// Flag `name` as being torn down. Returns false for an unknown name.
    pub fn mark_stopping(&self, name: &str) -> bool {
        match self.lock().fleet.get_mut(name) {
            Some(sandbox) => {
                sandbox.status = Status::Stopping;
                true
            }
            None => false,
        }
    }

    /// Snapshot of the fleet, oldest first
    pub fn list(&self) -> Vec<Sandbox> {
        let mut sandboxes: Vec<Sandbox> = self.lock().fleet.values().cloned().collect();
        sandboxes.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.name.cmp(&b.name))
        });
        sandboxes
    }

    pub fn get(&self, name: &str) -> Option<Sandbox> {
        self.lock().fleet.get(name).cloned()
    }

    fn require(&self, name: &str) -> Result<Sandbox> {
        self.get(name)
            .ok_or_else(|| SandboxError::NotFound(name.to_string()).into())
    }

    /// Align the fleet with the runtime: drop entries whose container is
    /// gone, translate states and refresh ports. Writes state only on change.
    pub fn reconcile(&self) -> Result<()> {
        let names: Vec<String> = self.lock().fleet.keys().cloned().collect();

        let mut observed = Vec::with_capacity(names.len());
        for name in names {
            let container = container_name(&name);
            match self.runtime.inspect_state(&container) {
                Ok(None) => observed.push((name, None)),
                Ok(Some(state)) => {
                    let status = Status::from_container_state(&state);
                    let ports = if status == Status::Running {
                        self.observe_ports(&container)
                    } else {
                        None
                    };
                    observed.push((name, Some((status, ports))));
                }
                Err(e) => {
                    warn!(sandbox = %name, error = %e, "reconcile:inspect failed, keeping entry");
                }
            }
        }

        let mut inner = self.lock();
        let mut changed = false;
        for (name, observation) in observed {
            let Some((status, ports)) = observation else {
                if inner.fleet.remove(&name).is_some() {
                    info!(sandbox = %name, "reconcile:container gone, dropping entry");
                    changed = true;
                }
                continue;
            };
            let Some(sandbox) = inner.fleet.get_mut(&name) else {
                continue;
            };
            if sandbox.status == Status::Stopping {
                continue;
            }
            if sandbox.status != status {
                debug!(sandbox = %name, from = %sandbox.status, to = %status, "reconcile:status changed");
                sandbox.status = status;
                changed = true;
            }
            if let Some(ports) = ports
                && sandbox.ports != ports
            {
                sandbox.ports = ports;
                changed = true;
            }
        }

        if changed {
            self.persist(&mut inner);
        }
        Ok(())
    }

    /// Periodic refresh: adopt sandboxes another instance wrote to disk,
    /// then poll the runtime. `Stopping` entries are left alone.
    pub fn refresh_statuses(&self) {
        let on_disk = match self.store.load() {
            Ok(fleet) => Some(fleet),
            Err(e) => {
                warn!(error = %e, "refresh:cannot read state file");
                None
            }
        };

        let names: Vec<String> = {
            let mut inner = self.lock();
            if let Some(disk) = &on_disk {
                for (name, sandbox) in disk {
                    if !inner.fleet.contains_key(name) && !inner.pending.contains(name) {
                        debug!(sandbox = %name, "refresh:adopting sandbox from disk");
                        inner.fleet.insert(name.clone(), sandbox.clone());
                    }
                }
            }
            inner
                .fleet
                .iter()
                .filter(|(_, sandbox)| sandbox.status != Status::Stopping)
                .map(|(name, _)| name.clone())
                .collect()
        };

        let observed: Vec<(String, Result<Option<ContainerState>>)> = names
            .into_iter()
            .map(|name| {
                let state = self.runtime.inspect_state(&container_name(&name));
                (name, state)
            })
            .collect();

        let mut inner = self.lock();
        for (name, state) in observed {
            let Some(sandbox) = inner.fleet.get_mut(&name) else {
                continue;
            };
            if sandbox.status == Status::Stopping {
                continue;
            }
            match state {
                Ok(Some(state)) => sandbox.status = Status::from_container_state(&state),
                Ok(None) => {
                    let still_listed = on_disk
                        .as_ref()
                        .is_none_or(|disk| disk.contains_key(&name));
                    if still_listed {
                        sandbox.status = Status::Stopped;
                    } else {
                        debug!(sandbox = %name, "refresh:destroyed elsewhere, dropping");
                        inner.fleet.remove(&name);
                    }
                }
                Err(e) => warn!(sandbox = %name, error = %e, "refresh:inspect failed"),
            }
        }
    }

    /// Destroy every sandbox that is neither running nor being created.
    /// Returns the number destroyed.
    pub fn cleanup_stopped(&self) -> usize {
        let names: Vec<String> = self
            .lock()
            .fleet
            .values()
            .filter(|sandbox| !matches!(sandbox.status, Status::Running | Status::Creating))
            .map(|sandbox| sandbox.name.clone())
            .collect();
        self.destroy_each(names)
    }

    /// Destroy every known sandbox. Returns the number destroyed.
    pub fn destroy_all(&self) -> usize {
        let names: Vec<String> = self.lock().fleet.keys().cloned().collect();
        self.destroy_each(names)
    }

    fn destroy_each(&self, names: Vec<String>) -> usize {
        let mut destroyed = 0;
        for name in names {
            match self.destroy(&name) {
                Ok(()) => destroyed += 1,
                // Removed concurrently
                Err(e) => debug!(sandbox = %name, error = %e, "destroy:skipped"),
            }
        }
        destroyed
    }

    /// Merge the sandbox branch into the project's current branch, committing
    /// pending worktree changes first. Returns a one-line summary.
    pub fn merge(&self, name: &str) -> Result<String> {
        let sandbox = self.require(name)?;

        let status = self.vcs.status_porcelain(&sandbox.worktree_path)?;
        if !status.trim().is_empty() {
            info!(sandbox = name, "merge:auto-committing changes");
            self.vcs
                .commit_all(
                    &sandbox.worktree_path,
                    &format!("WIP from sandcastle {}", name),
                )
                .with_context(|| format!("Auto-commit in sandbox '{}' failed", name))?;
        }

        let current = self.vcs.current_branch(&self.project_dir)?;
        let ahead = self
            .vcs
            .count_commits_between(&self.project_dir, &current, &sandbox.branch)?;
        if ahead == 0 {
            return Ok(format!(
                "[{}] Nothing to merge: no new commits on {}",
                name, sandbox.branch
            ));
        }

        self.vcs
            .merge_branch(
                &self.project_dir,
                &sandbox.branch,
                &format!("Merge sandcastle {}", name),
            )
            .with_context(|| format!("Merging {} into {} failed", sandbox.branch, current))?;
        info!(sandbox = name, commits = ahead, into = %current, "merge:done");

        let noun = if ahead == 1 { "commit" } else { "commits" };
        Ok(format!(
            "[{}] Merged {} {} from {} into {}",
            name, ahead, noun, sandbox.branch, current
        ))
    }

    /// Uncommitted changes in the sandbox worktree
    pub fn diff(&self, name: &str) -> Result<String> {
        let sandbox = self.require(name)?;
        self.vcs.diff(&sandbox.worktree_path)
    }

    /// Command attaching the terminal to the sandbox session
    pub fn connect_command(&self, name: &str) -> Result<Command> {
        self.require(name)?;
        Ok(multiplexer::attach_command(
            self.runtime.as_ref(),
            &container_name(name),
        ))
    }

    /// Re-seed agent credentials and settings into a running sandbox.
    /// Returns the number of steps that failed.
    pub fn refresh_credentials(&self, name: &str) -> Result<usize> {
        self.require(name)?;
        let home = self
            .home_dir
            .as_deref()
            .ok_or_else(|| anyhow!("Cannot determine the home directory"))?;
        let failed = provision::seed_credentials(self.runtime.as_ref(), &container_name(name), home);
        info!(sandbox = name, failed, "credentials:refreshed");
        Ok(failed)
    }

    /// Type the agent command into the session of a freshly created sandbox
    pub fn launch_agent(&self, sandbox: &Sandbox) -> Result<()> {
        agent::launch(
            self.runtime.as_ref(),
            &container_name(&sandbox.name),
            self.config.defaults.agent(),
            &sandbox.task,
        )
    }

    /// Sandbox worktrees on disk that no fleet entry accounts for
    pub fn orphaned_worktrees(&self) -> Result<Vec<String>> {
        let worktrees = self.vcs.list_worktrees(&self.project_dir)?;
        let names = vcs::sandbox_names_from_worktrees(&self.project_dir, &worktrees);
        let inner = self.lock();
        Ok(names
            .into_iter()
            .filter(|name| !inner.fleet.contains_key(name) && !inner.pending.contains(name))
            .collect())
    }

    /// Remove orphaned worktrees and their branches. Returns the names pruned.
    pub fn prune_orphans(&self) -> Result<Vec<String>> {
        let orphans = self.orphaned_worktrees()?;
        for name in &orphans {
            info!(sandbox = %name, "cleanup:pruning orphaned worktree");
            self.vcs.remove_worktree(
                &self.project_dir,
                &vcs::worktree_path(&self.project_dir, name),
                &vcs::branch_name(name),
            );
        }
        Ok(orphans)
    }
}

/// Whether the runtime confirms the container of `name` exists.
/// A failed probe counts as absent.
fn container_exists(runtime: &dyn ContainerRuntime, name: &str) -> bool {
    match runtime.inspect_state(&container_name(name)) {
        Ok(state) => state.is_some(),
        Err(e) => {
            warn!(sandbox = name, error = %e, "manager:cannot confirm container");
            false
        }
    }
}
