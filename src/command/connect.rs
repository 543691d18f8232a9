use anyhow::{Context, Result, bail};
use tracing::info;

use crate::sandbox::Manager;

pub fn run(manager: &Manager, name: Option<&str>) -> Result<()> {
    let name = super::resolve_name(name)?;
    let mut command = manager.connect_command(&name)?;

    println!("Connecting to {}... (detach with ctrl-b d)", name);
    info!(sandbox = %name, "connect:attaching");
    let status = command
        .status()
        .with_context(|| format!("Failed to attach to {}", name))?;
    if !status.success() {
        bail!(
            "Session of {} exited with code {}",
            name,
            status.code().unwrap_or(-1)
        );
    }
    Ok(())
}
