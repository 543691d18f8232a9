use anyhow::Result;

use crate::sandbox::Manager;

pub fn run(manager: &Manager, name: Option<&str>) -> Result<()> {
    let name = super::resolve_name(name)?;
    let failed = manager.refresh_credentials(&name)?;
    if failed == 0 {
        println!("✔ Refreshed credentials in {}", name);
    } else {
        println!(
            "Refreshed credentials in {} with {} failed step(s); see the log for details",
            name, failed
        );
    }
    Ok(())
}
