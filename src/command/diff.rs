use anyhow::Result;

use crate::sandbox::Manager;

pub fn run(manager: &Manager, name: Option<&str>) -> Result<()> {
    let name = super::resolve_name(name)?;
    let diff = manager.diff(&name)?;
    if diff.trim().is_empty() {
        println!("No uncommitted changes in {}", name);
    } else {
        println!("{}", diff);
    }
    Ok(())
}
