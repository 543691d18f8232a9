use anyhow::Result;

use crate::sandbox::Manager;

/// The manager reconciles on startup; running it again confirms the
/// state file is settled and reports what is tracked.
pub fn run(manager: &Manager) -> Result<()> {
    manager.reconcile()?;
    let count = manager.list().len();
    println!("✔ {} sandbox(es) tracked", count);

    let orphans = manager.orphaned_worktrees()?;
    if !orphans.is_empty() {
        println!(
            "{} orphaned worktree(s): {} (remove with 'sc cleanup')",
            orphans.len(),
            orphans.join(", ")
        );
    }
    Ok(())
}
