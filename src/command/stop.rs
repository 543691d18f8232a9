use anyhow::{Result, bail};
use std::sync::Arc;

use crate::sandbox::{Bridge, Event, Manager, SandboxError};
use crate::spinner::PhaseSpinner;

pub fn run(manager: Arc<Manager>, name: Option<&str>, all: bool) -> Result<()> {
    let mut bridge = Bridge::new(manager);

    let label = if all {
        let count = bridge.start_destroy_all();
        if count == 0 {
            println!("No sandboxes to stop");
            return Ok(());
        }
        format!("Stopping {} sandbox(es)", count)
    } else {
        let name = super::resolve_name(name)?;
        if !bridge.start_destroy(&name) {
            return Err(SandboxError::NotFound(name).into());
        }
        format!("Stopping {}", name)
    };

    let pb = PhaseSpinner::start(&label, "tearing down");
    for event in super::wait_for_events(&mut bridge, &pb, "") {
        match event {
            Event::Destroyed { name, result } => {
                if let Err(e) = result {
                    pb.fail(&label);
                    bail!("Failed to stop {}: {:#}", name, e);
                }
                pb.succeed(&format!("Stopped {}", name));
            }
            Event::AllDestroyed { count } => {
                pb.succeed(&format!("Stopped {} sandbox(es)", count));
            }
            Event::Created { .. } => {}
        }
    }
    Ok(())
}
