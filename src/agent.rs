//! Automatic launch of the coding agent inside a sandbox session.

use anyhow::Result;
use std::thread;
use std::time::Duration;
use tracing::info;

use crate::multiplexer;
use crate::runtime::ContainerRuntime;

/// Time given to a freshly started session before keys are typed into it
pub const SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Command line typed into the session: the bare agent, or the agent with the
/// task as a single-quoted initial prompt the shell passes through verbatim.
pub fn launch_line(agent: &str, task: &str) -> String {
    if task.is_empty() {
        agent.to_string()
    } else {
        format!("{} {}", agent, shell_quote(task))
    }
}

fn shell_quote(text: &str) -> String {
    format!("'{}'", text.replace('\'', "'\\''"))
}

/// Start `agent` in the session of `container`.
///
/// Callers treat failure as non-fatal: the sandbox stays usable by hand.
pub fn launch(runtime: &dyn ContainerRuntime, container: &str, agent: &str, task: &str) -> Result<()> {
    thread::sleep(SETTLE_DELAY);
    let line = launch_line(agent, task);
    multiplexer::send_keys(runtime, container, &line)?;
    info!(container, agent, "agent:launched");
    Ok(())
}
