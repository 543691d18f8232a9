use anyhow::Result;

use crate::sandbox::Manager;
use crate::spinner;

pub fn run(manager: &Manager, name: Option<&str>) -> Result<()> {
    let name = super::resolve_name(name)?;
    let summary = spinner::with_spinner(&format!("Merging {}", name), || manager.merge(&name))?;
    println!("{}", summary);
    Ok(())
}
