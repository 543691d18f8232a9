pub mod cleanup;
pub mod connect;
pub mod create;
pub mod diff;
pub mod list;
pub mod merge;
pub mod reconcile;
pub mod refresh;
pub mod stop;

use anyhow::{Context, Result, anyhow};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::info;

use crate::config::{self, Config};
use crate::sandbox::{Bridge, Event, Manager};
use crate::spinner::PhaseSpinner;

/// How often a waiting command polls the background bridge
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Locate the project, load its config and build a manager whose fleet has
/// been reconciled against the container runtime.
pub fn open_manager() -> Result<Arc<Manager>> {
    let cwd = std::env::current_dir().context("Failed to get current directory")?;
    let root = config::find_project_root(&cwd).ok_or_else(|| {
        anyhow!(
            "Not inside a sandcastles project: no {}/{} found in this directory or its parents",
            config::DIR,
            config::CONFIG_FILE
        )
    })?;
    let config = Config::load(&root)?;
    let manager = Manager::for_project(root, config)?;
    manager.reconcile()?;
    info!(count = manager.list().len(), "manager:ready");
    Ok(Arc::new(manager))
}

/// Poll `bridge` until every operation it started has reported back,
/// mirroring the latest create phase on `spinner`.
pub fn wait_for_events(bridge: &mut Bridge, spinner: &PhaseSpinner, name: &str) -> Vec<Event> {
    let mut events = Vec::new();
    while bridge.outstanding() > 0 {
        events.extend(bridge.poll());
        if let Some(phase) = bridge.phase(name) {
            spinner.phase(phase);
        }
        if bridge.outstanding() > 0 {
            thread::sleep(POLL_INTERVAL);
        }
    }
    events
}

/// Resolve a sandbox name from the argument, or from the current directory
/// when it lies inside a sandbox worktree.
pub fn resolve_name(arg: Option<&str>) -> Result<String> {
    match arg {
        Some(name) => Ok(name.to_string()),
        None => {
            let cwd = std::env::current_dir().context("Failed to get current directory")?;
            resolve_name_from_path(&cwd)
        }
    }
}

/// Find the closest `.sandcastles/worktrees/<name>` ancestor of `path`.
/// Separated for testability.
fn resolve_name_from_path(path: &Path) -> Result<String> {
    let components: Vec<&str> = path
        .components()
        .filter_map(|c| c.as_os_str().to_str())
        .collect();

    components
        .windows(3)
        .rev()
        .find(|w| w[0] == config::DIR && w[1] == config::WORKTREE_DIR)
        .map(|w| w[2].to_string())
        .ok_or_else(|| {
            anyhow!("Not inside a sandbox worktree; pass the sandbox name explicitly")
        })
}
