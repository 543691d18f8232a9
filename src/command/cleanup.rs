use anyhow::Result;

use crate::sandbox::Manager;
use crate::spinner;

/// Destroy sandboxes that are no longer running and prune worktrees left
/// behind by interrupted runs.
pub fn run(manager: &Manager) -> Result<()> {
    manager.refresh_statuses();
    let destroyed = spinner::with_spinner("Removing stopped sandboxes", || {
        Ok(manager.cleanup_stopped())
    })?;
    let pruned = manager.prune_orphans()?;

    println!("Removed {} stopped sandbox(es)", destroyed);
    if !pruned.is_empty() {
        println!("Pruned orphaned worktree(s): {}", pruned.join(", "));
    }
    Ok(())
}
