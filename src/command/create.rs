use anyhow::Result;
use console::style;
use std::sync::Arc;

use crate::sandbox::{self, Bridge, Event, Manager, Sandbox};
use crate::spinner::PhaseSpinner;

pub fn run(manager: Arc<Manager>, name: &str, task: &str) -> Result<()> {
    sandbox::validate_name(name)?;

    let mut bridge = Bridge::new(manager);
    let pb = PhaseSpinner::start(name, "queued");
    bridge.start_create(name, task);

    for event in super::wait_for_events(&mut bridge, &pb, name) {
        let Event::Created { result, .. } = event else {
            continue;
        };
        match result {
            Ok(sandbox) => {
                pb.succeed(&format!("Sandbox {} is running", name));
                print_summary(&sandbox);
            }
            Err(e) => {
                pb.fail(&format!("Sandbox {} failed", name));
                return Err(e);
            }
        }
    }
    Ok(())
}

fn print_summary(sandbox: &Sandbox) {
    println!("  {} {}", style("branch").dim(), sandbox.branch);
    println!(
        "  {} {}",
        style("worktree").dim(),
        sandbox.worktree_path.display()
    );
    for (container, host) in &sandbox.ports {
        println!("  {} {} -> localhost:{}", style("port").dim(), container, host);
    }
    println!();
    println!(
        "Attach with {} (detach with ctrl-b d)",
        style(format!("sc connect {}", sandbox.name)).bold().cyan()
    );
}
