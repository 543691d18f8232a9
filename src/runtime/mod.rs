//! Container runtime driver.
//!
//! Sandboxes are backed by docker (or podman) containers driven through the
//! runtime's CLI. The textual output of that CLI is the only query interface,
//! so this module also owns the parsing of state words and port listings.

mod docker;

use anyhow::Result;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;

pub use docker::DockerRuntime;

/// Path inside every container where the sandbox worktree is mounted
pub const WORKSPACE_PATH: &str = "/workspace";

/// Lifecycle state reported by `inspect`, as one of the runtime's state words
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerState {
    Created,
    Running,
    Paused,
    Restarting,
    Removing,
    Exited,
    Dead,
    Other(String),
}

impl ContainerState {
    pub fn parse(word: &str) -> Self {
        match word.trim() {
            "created" => ContainerState::Created,
            "running" => ContainerState::Running,
            "paused" => ContainerState::Paused,
            "restarting" => ContainerState::Restarting,
            "removing" => ContainerState::Removing,
            "exited" => ContainerState::Exited,
            "dead" => ContainerState::Dead,
            other => ContainerState::Other(other.to_string()),
        }
    }
}

/// Arguments for building the shared project image
#[derive(Debug, Clone, PartialEq)]
pub struct BuildSpec {
    pub image: String,
    pub dockerfile: String,
    pub context_dir: PathBuf,
    pub build_args: Vec<(String, String)>,
}

/// Arguments for creating and starting a sandbox container
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSpec {
    pub name: String,
    pub image: String,
    /// Bind mounts in `-v` syntax, in the order they are passed
    pub volumes: Vec<String>,
    pub group_add: Vec<String>,
    pub host_network: bool,
    /// Container ports published on an ephemeral host port
    pub publish: Vec<u16>,
    /// `KEY` (passthrough) or `KEY=VALUE` entries
    pub env: Vec<String>,
    pub command: Vec<String>,
}

impl RunSpec {
    /// Render the `run` subcommand arguments
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            self.name.clone(),
        ];
        for volume in &self.volumes {
            args.push("-v".to_string());
            args.push(volume.clone());
        }
        for group in &self.group_add {
            args.push("--group-add".to_string());
            args.push(group.clone());
        }
        if self.host_network {
            args.push("--network".to_string());
            args.push("host".to_string());
        } else {
            for port in &self.publish {
                args.push("-p".to_string());
                args.push(format!("0:{}", port));
            }
        }
        for var in &self.env {
            args.push("-e".to_string());
            args.push(var.clone());
        }
        args.push(self.image.clone());
        args.extend(self.command.iter().cloned());
        args
    }
}

/// Options for running a command inside a container
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecOptions<'a> {
    pub user: Option<&'a str>,
    /// Fire-and-forget: return as soon as the command is started
    pub detach: bool,
    pub stdin: Option<&'a [u8]>,
}

impl<'a> ExecOptions<'a> {
    pub fn as_root() -> Self {
        Self {
            user: Some("root"),
            ..Default::default()
        }
    }

    pub fn detached() -> Self {
        Self {
            detach: true,
            ..Default::default()
        }
    }

    pub fn with_stdin(stdin: &'a [u8]) -> Self {
        Self {
            stdin: Some(stdin),
            ..Default::default()
        }
    }
}

/// Trait encapsulating the container runtime operations sandcastles needs.
///
/// Implementations must be Send + Sync to allow sharing via Arc<dyn ContainerRuntime>.
pub trait ContainerRuntime: Send + Sync {
    /// Build (or rebuild from cache) the project image
    fn build_image(&self, spec: &BuildSpec) -> Result<()>;

    /// Create and start a container, returning its truncated id
    fn run_container(&self, spec: &RunSpec) -> Result<String>;

    fn stop_container(&self, name: &str) -> Result<()>;

    fn remove_container(&self, name: &str) -> Result<()>;

    /// Lifecycle state of a container, or `None` if no such container exists
    fn inspect_state(&self, name: &str) -> Result<Option<ContainerState>>;

    /// Published ports as container port -> host port
    fn port_mappings(&self, name: &str) -> Result<BTreeMap<String, String>>;

    /// Run a command inside a running container, returning its stdout
    fn exec(&self, name: &str, options: ExecOptions<'_>, command: &[&str]) -> Result<String>;

    /// Copy a host file or directory into a container
    fn copy_into(&self, host_path: &Path, name: &str, container_path: &str) -> Result<()>;

    /// Interactive command that takes over the host terminal
    fn interactive_command(&self, name: &str, command: &[&str]) -> Command;
}

/// Container backing the sandbox `name`
pub fn container_name(name: &str) -> String {
    format!("sc-{}", name)
}

/// Parse `port` output: one `<containerPort>/<proto> -> <hostAddress>:<hostPort>` per line.
pub fn parse_port_mappings(output: &str) -> BTreeMap<String, String> {
    let mut ports = BTreeMap::new();
    for line in output.lines() {
        let Some((container_side, host_side)) = line.trim().split_once(" -> ") else {
            continue;
        };
        let container_port = container_side
            .split_once('/')
            .map_or(container_side, |(port, _)| port);
        // rsplit so IPv6 host addresses like [::]:49321 parse too
        if let Some((_, host_port)) = host_side.rsplit_once(':')
            && !container_port.is_empty()
            && !host_port.is_empty()
        {
            ports
                .entry(container_port.to_string())
                .or_insert_with(|| host_port.to_string());
        }
    }
    ports
}

/// Identity port mapping used when the container shares the host network
pub fn identity_ports(ports: &[u16]) -> BTreeMap<String, String> {
    ports
        .iter()
        .map(|p| (p.to_string(), p.to_string()))
        .collect()
}
