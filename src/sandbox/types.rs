use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

use crate::runtime::ContainerState;

/// Lifecycle status of a sandbox.
///
/// `Creating` and `Stopping` are asserted locally; the runtime has no notion
/// of a container being torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Creating,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl Status {
    /// Translate a runtime state word into a sandbox status
    pub fn from_container_state(state: &ContainerState) -> Self {
        match state {
            ContainerState::Running => Status::Running,
            ContainerState::Exited | ContainerState::Dead => Status::Stopped,
            ContainerState::Created | ContainerState::Restarting => Status::Creating,
            _ => Status::Error,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Creating => "creating",
            Status::Running => "running",
            Status::Stopping => "stopping",
            Status::Stopped => "stopped",
            Status::Error => "error",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One managed unit: a worktree on its own branch plus the container it is mounted in
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sandbox {
    pub name: String,
    /// Truncated runtime id of the backing container
    pub container_id: String,
    pub status: Status,
    #[serde(default)]
    pub task: String,
    pub branch: String,
    pub worktree_path: PathBuf,
    /// Container port -> host port
    #[serde(default)]
    pub ports: BTreeMap<String, String>,
    /// Nanoseconds since the Unix epoch
    pub created_at: u64,
}

/// Validation failures, returned before any side effect
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SandboxError {
    #[error("sandbox '{0}' already exists")]
    AlreadyExists(String),

    #[error("sandbox '{0}' not found")]
    NotFound(String),

    #[error(
        "invalid sandbox name '{0}': use letters, digits and hyphens, starting with a letter or digit"
    )]
    InvalidName(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(Status::from_container_state(&ContainerState::Running), Status::Running);
        assert_eq!(Status::from_container_state(&ContainerState::Exited), Status::Stopped);
        assert_eq!(Status::from_container_state(&ContainerState::Dead), Status::Stopped);
        assert_eq!(Status::from_container_state(&ContainerState::Created), Status::Creating);
        assert_eq!(
            Status::from_container_state(&ContainerState::Restarting),
            Status::Creating
        );
        assert_eq!(Status::from_container_state(&ContainerState::Paused), Status::Error);
        assert_eq!(
            Status::from_container_state(&ContainerState::Other("weird".to_string())),
            Status::Error
        );
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&Status::Stopping).unwrap(), "\"stopping\"");
        let parsed: Status = serde_json::from_str("\"running\"").unwrap();
        assert_eq!(parsed, Status::Running);
    }
}
