//! tmux session driver for the multiplexer running inside each sandbox.
//!
//! Every sandbox hosts a single detached session; the agent is typed into it
//! and the user attaches to it from the host terminal.

use anyhow::{Context, Result};
use std::process::Command;
use tracing::{debug, warn};

use crate::runtime::{ContainerRuntime, ExecOptions};

/// Name of the session started in every sandbox container
pub const SESSION: &str = "main";

/// Start the detached session and label its status bar with the sandbox name.
///
/// Only a failure to start the session is returned; status bar styling is cosmetic.
pub fn start_session(runtime: &dyn ContainerRuntime, container: &str, name: &str) -> Result<()> {
    runtime
        .exec(
            container,
            ExecOptions::detached(),
            &["tmux", "new-session", "-d", "-s", SESSION],
        )
        .context("Failed to start tmux session")?;
    debug!(container, "tmux:session started");

    let status_left = format!(" sandcastle: {} ", name);
    let options: [&[&str]; 3] = [
        &["tmux", "set", "-t", SESSION, "status-left", &status_left],
        &["tmux", "set", "-t", SESSION, "status-right", " ctrl-b d to exit "],
        &["tmux", "set", "-t", SESSION, "status-left-length", "40"],
    ];
    for option in options {
        if let Err(e) = runtime.exec(container, ExecOptions::default(), option) {
            warn!(container, error = %e, "tmux:status bar option failed");
            break;
        }
    }
    Ok(())
}

/// Type `keys` into the session followed by Enter
pub fn send_keys(runtime: &dyn ContainerRuntime, container: &str, keys: &str) -> Result<()> {
    runtime
        .exec(
            container,
            ExecOptions::default(),
            &["tmux", "send-keys", "-t", SESSION, keys, "Enter"],
        )
        .with_context(|| format!("Failed to send keys to {}", container))?;
    Ok(())
}

/// Interactive command attaching the host terminal to the session
pub fn attach_command(runtime: &dyn ContainerRuntime, container: &str) -> Command {
    runtime.interactive_command(container, &["tmux", "attach-session", "-t", SESSION])
}
