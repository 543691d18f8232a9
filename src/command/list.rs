use std::collections::BTreeMap;

use anyhow::Result;
use console::style;
use tabled::{
    Table, Tabled,
    settings::{Padding, Style, object::Columns},
};

use crate::sandbox::{Manager, Status};

/// Longest task text shown before truncating
const TASK_WIDTH: usize = 40;

#[derive(Tabled)]
struct SandboxRow {
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "STATUS")]
    status: String,
    #[tabled(rename = "BRANCH")]
    branch: String,
    #[tabled(rename = "PORTS")]
    ports: String,
    #[tabled(rename = "TASK")]
    task: String,
}

fn format_status(status: Status) -> String {
    let label = style(status.as_str());
    match status {
        Status::Running => label.green(),
        Status::Creating | Status::Stopping => label.yellow(),
        Status::Stopped => label.dim(),
        Status::Error => label.red(),
    }
    .to_string()
}

fn format_ports(ports: &BTreeMap<String, String>) -> String {
    if ports.is_empty() {
        return "-".to_string();
    }
    ports
        .iter()
        .map(|(container, host)| format!("{}->{}", container, host))
        .collect::<Vec<_>>()
        .join(", ")
}

fn format_task(task: &str) -> String {
    if task.is_empty() {
        return "-".to_string();
    }
    if task.chars().count() <= TASK_WIDTH {
        return task.to_string();
    }
    let truncated: String = task.chars().take(TASK_WIDTH - 1).collect();
    format!("{}…", truncated)
}

pub fn run(manager: &Manager) -> Result<()> {
    let sandboxes = manager.list();
    if sandboxes.is_empty() {
        println!("No sandboxes. Create one with 'sc create <name> [task]'");
        return Ok(());
    }

    let rows: Vec<SandboxRow> = sandboxes
        .into_iter()
        .map(|sandbox| SandboxRow {
            status: format_status(sandbox.status),
            ports: format_ports(&sandbox.ports),
            task: format_task(&sandbox.task),
            name: sandbox.name,
            branch: sandbox.branch,
        })
        .collect();

    let mut table = Table::new(rows);
    table
        .with(Style::blank())
        .modify(Columns::new(0..5), Padding::new(0, 1, 0, 0));

    println!("{table}");
    Ok(())
}
