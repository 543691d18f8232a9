//! Docker/Podman implementation of the container runtime driver.

use anyhow::{Context, Result};
use std::collections::BTreeMap;
use std::path::Path;
use std::process::Command;
use tracing::{debug, info};

use crate::cmd::Cmd;
use crate::config::ContainerRuntimeKind;

use super::{BuildSpec, ContainerRuntime, ContainerState, ExecOptions, RunSpec, parse_port_mappings};

/// Length the runtime's full container id is truncated to
const SHORT_ID_LEN: usize = 12;

/// Drives the docker (or podman, which shares the CLI surface) binary
#[derive(Debug, Clone, Copy)]
pub struct DockerRuntime {
    binary: &'static str,
}

impl DockerRuntime {
    pub fn new(kind: ContainerRuntimeKind) -> Self {
        Self {
            binary: kind.binary(),
        }
    }
}

/// Whether a runtime diagnostic means the container simply does not exist
fn is_missing_container(message: &str) -> bool {
    message.to_lowercase().contains("no such")
}

fn short_id(full: &str) -> String {
    full.trim().chars().take(SHORT_ID_LEN).collect()
}

impl ContainerRuntime for DockerRuntime {
    fn build_image(&self, spec: &BuildSpec) -> Result<()> {
        let build_args: Vec<String> = spec
            .build_args
            .iter()
            .map(|(key, value)| format!("{}={}", key, value))
            .collect();

        let mut args: Vec<&str> = vec!["build", "-q"];
        for arg in &build_args {
            args.push("--build-arg");
            args.push(arg);
        }
        args.extend(["-t", &spec.image, "-f", &spec.dockerfile, "."]);

        info!(image = %spec.image, dockerfile = %spec.dockerfile, "runtime:build start");
        Cmd::new(self.binary)
            .workdir(&spec.context_dir)
            .args(&args)
            .run()
            .with_context(|| format!("{} build failed", self.binary))?;
        info!(image = %spec.image, "runtime:build done");
        Ok(())
    }

    fn run_container(&self, spec: &RunSpec) -> Result<String> {
        let args = spec.to_args();
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let id = Cmd::new(self.binary)
            .args(&args)
            .run_and_capture_stdout()
            .with_context(|| format!("{} run failed", self.binary))?;
        Ok(short_id(&id))
    }

    fn stop_container(&self, name: &str) -> Result<()> {
        Cmd::new(self.binary).args(&["stop", name]).run()?;
        Ok(())
    }

    fn remove_container(&self, name: &str) -> Result<()> {
        Cmd::new(self.binary).args(&["rm", name]).run()?;
        Ok(())
    }

    fn inspect_state(&self, name: &str) -> Result<Option<ContainerState>> {
        match Cmd::new(self.binary)
            .args(&["inspect", "-f", "{{.State.Status}}", name])
            .run_and_capture_stdout()
        {
            Ok(word) => Ok(Some(ContainerState::parse(&word))),
            Err(e) if is_missing_container(&e.to_string()) => {
                debug!(container = name, "runtime:inspect no such container");
                Ok(None)
            }
            Err(e) => Err(e).with_context(|| format!("Failed to inspect container {}", name)),
        }
    }

    fn port_mappings(&self, name: &str) -> Result<BTreeMap<String, String>> {
        let output = Cmd::new(self.binary)
            .args(&["port", name])
            .run_and_capture_stdout()
            .with_context(|| format!("Failed to query ports of {}", name))?;
        Ok(parse_port_mappings(&output))
    }

    fn exec(&self, name: &str, options: ExecOptions<'_>, command: &[&str]) -> Result<String> {
        let mut args: Vec<&str> = vec!["exec"];
        if options.detach {
            args.push("-d");
        }
        if options.stdin.is_some() {
            args.push("-i");
        }
        if let Some(user) = options.user {
            args.push("--user");
            args.push(user);
        }
        args.push(name);
        args.extend_from_slice(command);

        let mut cmd = Cmd::new(self.binary).args(&args);
        if let Some(input) = options.stdin {
            cmd = cmd.stdin(input);
        }
        cmd.run_and_capture_stdout()
    }

    fn copy_into(&self, host_path: &Path, name: &str, container_path: &str) -> Result<()> {
        let source = host_path.to_string_lossy();
        let target = format!("{}:{}", name, container_path);
        Cmd::new(self.binary)
            .args(&["cp", &source, &target])
            .run()
            .with_context(|| format!("Failed to copy {} into {}", source, target))?;
        Ok(())
    }

    fn interactive_command(&self, name: &str, command: &[&str]) -> Command {
        let mut cmd = Command::new(self.binary);
        cmd.args(["exec", "-it", name]).args(command);
        cmd
    }
}
