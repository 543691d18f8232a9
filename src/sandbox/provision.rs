//! Best-effort configuration of a freshly started sandbox container.
//!
//! Agent credentials and preferences are seeded from the host, the workspace
//! is pre-trusted, and project setup commands run. Every step may fail on its
//! own; failures are logged and counted, never returned, since a partially
//! configured sandbox is still usable by hand.

use anyhow::{Context, Result};
use serde_json::{Map, Value, json};
use std::fs;
use std::io::Write;
use std::path::Path;
use tracing::{debug, warn};

use crate::cmd::Cmd;
use crate::config::Defaults;
use crate::runtime::{ContainerRuntime, ExecOptions, WORKSPACE_PATH};

/// Home directory of the unprivileged user inside sandbox images
pub const CONTAINER_HOME: &str = "/home/sandcastle";
const CONTAINER_CLAUDE_DIR: &str = "/home/sandcastle/.claude";
const CONTAINER_OWNER: &str = "sandcastle:sandcastle";

/// Agent environment directories copied when `claude_env` is enabled
const ENV_DIRS: [&str; 2] = ["skills", "plugins"];

/// Collects failures of independent best-effort steps
struct Steps<'a> {
    container: &'a str,
    failed: usize,
}

impl<'a> Steps<'a> {
    fn new(container: &'a str) -> Self {
        Self {
            container,
            failed: 0,
        }
    }

    fn attempt(&mut self, step: &str, result: Result<()>) {
        if let Err(e) = result {
            let error = format!("{:#}", e);
            warn!(container = self.container, step, error = %error, "provision:step failed");
            self.failed += 1;
        }
    }
}

/// Run every configuration step against `container`, reporting phase labels
/// through `progress`. Returns the number of steps that failed.
pub fn configure(
    runtime: &dyn ContainerRuntime,
    container: &str,
    project_dir: &Path,
    defaults: &Defaults,
    home: Option<&Path>,
    progress: &dyn Fn(&str),
) -> usize {
    let mut steps = Steps::new(container);

    progress("Configuring Claude Code...");
    steps.attempt(
        "claude dir",
        exec(runtime, container, &["mkdir", "-p", CONTAINER_CLAUDE_DIR]),
    );
    if let Some(home) = home {
        seed_agent_files(runtime, &mut steps, home);
    }

    if defaults.claude_env
        && let Some(home) = home
    {
        progress("Copying Claude environment (skills, plugins)...");
        copy_agent_environment(runtime, &mut steps, home, project_dir);
    }

    let preferences = home
        .map(|h| read_json_object(&h.join(".claude.json")))
        .unwrap_or_default();
    steps.attempt(
        "preferences",
        copy_json(
            runtime,
            container,
            &patch_preferences(preferences),
            &format!("{}/.claude.json", CONTAINER_HOME),
        ),
    );

    steps.attempt(
        "git https",
        exec(
            runtime,
            container,
            &[
                "git",
                "config",
                "--global",
                "url.https://github.com/.insteadOf",
                "git@github.com:",
            ],
        ),
    );

    if !defaults.setup.is_empty() {
        progress("Running setup commands...");
        for command in &defaults.setup {
            steps.attempt(command, exec(runtime, container, &["bash", "-c", command]));
        }
    }

    debug!(container, failed = steps.failed, "provision:configured");
    steps.failed
}

/// Re-copy credentials and settings into a running container.
/// Returns the number of steps that failed.
pub fn seed_credentials(runtime: &dyn ContainerRuntime, container: &str, home: &Path) -> usize {
    let mut steps = Steps::new(container);
    steps.attempt(
        "claude dir",
        exec(runtime, container, &["mkdir", "-p", CONTAINER_CLAUDE_DIR]),
    );
    seed_agent_files(runtime, &mut steps, home);
    steps.failed
}

/// Settings (patched to skip permission prompts) and credentials
fn seed_agent_files(runtime: &dyn ContainerRuntime, steps: &mut Steps<'_>, home: &Path) {
    let container = steps.container;
    let host_dir = home.join(".claude");

    let settings = patch_settings(read_json_object(&host_dir.join("settings.json")));
    steps.attempt(
        "settings",
        copy_json(
            runtime,
            container,
            &settings,
            &format!("{}/settings.json", CONTAINER_CLAUDE_DIR),
        ),
    );

    let credentials = host_dir.join(".credentials.json");
    if credentials.is_file() {
        steps.attempt(
            "credentials",
            copy_owned(
                runtime,
                container,
                &credentials,
                &format!("{}/.credentials.json", CONTAINER_CLAUDE_DIR),
            ),
        );
    }
}

fn copy_agent_environment(
    runtime: &dyn ContainerRuntime,
    steps: &mut Steps<'_>,
    home: &Path,
    project_dir: &Path,
) {
    let container = steps.container;
    let host_dir = home.join(".claude");

    for dir in ENV_DIRS {
        if !host_dir.join(dir).is_dir() {
            continue;
        }
        steps.attempt(dir, copy_dereferenced(runtime, container, &host_dir, dir));
        let target = format!("{}/{}", CONTAINER_CLAUDE_DIR, dir);
        steps.attempt(
            dir,
            exec_root(runtime, container, &["chown", "-R", CONTAINER_OWNER, &target]),
        );
    }

    let installed = host_dir.join("plugins").join("installed_plugins.json");
    if installed.is_file() {
        let mut plugins = read_json_object(&installed);
        let rewritten = rewrite_plugin_paths(&mut plugins, &project_dir.to_string_lossy());
        debug!(container, rewritten, "provision:plugin paths rewritten");
        steps.attempt(
            "installed plugins",
            copy_json(
                runtime,
                container,
                &plugins,
                &format!("{}/plugins/installed_plugins.json", CONTAINER_CLAUDE_DIR),
            ),
        );
    }

    // Plugin metadata stores absolute host paths; make them resolve in the container
    let host_claude = host_dir.to_string_lossy().to_string();
    if host_claude != CONTAINER_CLAUDE_DIR {
        let home = home.to_string_lossy();
        steps.attempt(
            "claude dir link",
            exec_root(runtime, container, &["mkdir", "-p", &home]).and_then(|_| {
                exec_root(
                    runtime,
                    container,
                    &["ln", "-sfn", CONTAINER_CLAUDE_DIR, &host_claude],
                )
            }),
        );
    }
}

/// Copy `host_dir/<dir>` into the container with symlinks resolved, falling
/// back to a plain copy (symlinks left as-is) when the tar pipe fails.
fn copy_dereferenced(
    runtime: &dyn ContainerRuntime,
    container: &str,
    host_dir: &Path,
    dir: &str,
) -> Result<()> {
    let archive = Cmd::new("tar")
        .args(&["-chf", "-", "-C", &host_dir.to_string_lossy(), dir])
        .run()
        .map(|output| output.stdout);

    let piped = archive.and_then(|bytes| {
        runtime
            .exec(
                container,
                ExecOptions::with_stdin(&bytes),
                &["tar", "-xf", "-", "-C", CONTAINER_CLAUDE_DIR],
            )
            .map(|_| ())
    });

    if let Err(e) = piped {
        warn!(container, dir, error = %e, "provision:tar copy failed, falling back to plain copy");
        runtime.copy_into(
            &host_dir.join(dir),
            container,
            &format!("{}/{}", CONTAINER_CLAUDE_DIR, dir),
        )?;
    }
    Ok(())
}

fn exec(runtime: &dyn ContainerRuntime, container: &str, command: &[&str]) -> Result<()> {
    runtime.exec(container, ExecOptions::default(), command)?;
    Ok(())
}

fn exec_root(runtime: &dyn ContainerRuntime, container: &str, command: &[&str]) -> Result<()> {
    runtime.exec(container, ExecOptions::as_root(), command)?;
    Ok(())
}

/// Copy a host file into the container and hand it to the sandbox user
fn copy_owned(
    runtime: &dyn ContainerRuntime,
    container: &str,
    host_path: &Path,
    container_path: &str,
) -> Result<()> {
    runtime.copy_into(host_path, container, container_path)?;
    exec_root(runtime, container, &["chown", CONTAINER_OWNER, container_path])
}

/// Write `value` to a temp file on the host and copy it into the container
fn copy_json(
    runtime: &dyn ContainerRuntime,
    container: &str,
    value: &Map<String, Value>,
    container_path: &str,
) -> Result<()> {
    let mut file = tempfile::NamedTempFile::new().context("Failed to create temp file")?;
    serde_json::to_writer_pretty(&mut file, value).context("Failed to serialize JSON")?;
    file.flush().context("Failed to flush temp file")?;
    copy_owned(runtime, container, file.path(), container_path)
}

/// Read a JSON object from `path`; anything missing or malformed reads as empty
pub fn read_json_object(path: &Path) -> Map<String, Value> {
    fs::read_to_string(path)
        .ok()
        .and_then(|contents| serde_json::from_str::<Value>(&contents).ok())
        .and_then(|value| match value {
            Value::Object(map) => Some(map),
            _ => None,
        })
        .unwrap_or_default()
}

/// Default the agent to bypassing permission prompts
pub fn patch_settings(mut settings: Map<String, Value>) -> Map<String, Value> {
    settings.insert("defaultMode".to_string(), json!("bypassPermissions"));
    settings
}

/// Mark onboarding complete and pre-trust the workspace
pub fn patch_preferences(mut preferences: Map<String, Value>) -> Map<String, Value> {
    preferences.insert("hasCompletedOnboarding".to_string(), json!(true));

    let projects = preferences
        .entry("projects")
        .or_insert_with(|| json!({}));
    if !projects.is_object() {
        *projects = json!({});
    }
    if let Value::Object(projects) = projects {
        projects.insert(
            WORKSPACE_PATH.to_string(),
            json!({
                "allowedTools": [],
                "hasTrustDialogAccepted": true,
                "hasCompletedProjectOnboarding": true,
            }),
        );
    }
    preferences
}

/// Rewrite plugin install `projectPath`s at or below `project_dir` to the
/// container workspace. Returns the number of paths rewritten.
pub fn rewrite_plugin_paths(installed: &mut Map<String, Value>, project_dir: &str) -> usize {
    let Some(Value::Object(plugins)) = installed.get_mut("plugins") else {
        return 0;
    };

    let mut rewritten = 0;
    for installs in plugins.values_mut() {
        let Value::Array(installs) = installs else {
            continue;
        };
        for install in installs.iter_mut() {
            let Some(Value::String(path)) = install.get_mut("projectPath") else {
                continue;
            };
            let Some(rest) = path.strip_prefix(project_dir) else {
                continue;
            };
            if rest.is_empty() || rest.starts_with('/') {
                *path = format!("{}{}", WORKSPACE_PATH, rest);
                rewritten += 1;
            }
        }
    }
    rewritten
}
