use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Per-project directory holding config, state and worktrees
pub const DIR: &str = ".sandcastles";
pub const CONFIG_FILE: &str = "config.yaml";
pub const STATE_FILE: &str = "state.json";
pub const WORKTREE_DIR: &str = "worktrees";
const DEFAULT_DOCKERFILE: &str = ".sandcastles/Dockerfile";

/// Container runtime used to build and run sandboxes
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContainerRuntimeKind {
    /// Docker (default)
    #[default]
    Docker,
    /// Podman
    Podman,
}

impl ContainerRuntimeKind {
    pub fn binary(&self) -> &'static str {
        match self {
            ContainerRuntimeKind::Docker => "docker",
            ContainerRuntimeKind::Podman => "podman",
        }
    }
}

/// Image build settings
#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq)]
pub struct ImageConfig {
    /// Base image the generated Dockerfile starts from
    #[serde(default)]
    pub base: String,

    /// Dockerfile path, relative to the project root
    #[serde(default)]
    pub dockerfile: String,

    /// Extra distro packages baked into the image
    #[serde(default)]
    pub packages: Vec<String>,
}

impl ImageConfig {
    /// Dockerfile to build, defaulting to the one generated at init
    pub fn dockerfile_path(&self) -> &str {
        if self.dockerfile.is_empty() {
            DEFAULT_DOCKERFILE
        } else {
            &self.dockerfile
        }
    }
}

/// Defaults applied to every sandbox of the project
#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq)]
pub struct Defaults {
    /// The agent command launched inside the session (e.g. "claude")
    #[serde(default)]
    pub agent: Option<String>,

    /// Container ports published to the host
    #[serde(default)]
    pub ports: Vec<u16>,

    /// Extra environment variables for the container
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Extra bind mounts in `host:container[:opts]` form
    #[serde(default)]
    pub mounts: Vec<String>,

    /// Network mode; "host" shares the host network namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,

    /// Mount the host docker socket into the container
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub docker_socket: bool,

    /// Copy the host agent environment (skills, plugins) into the container
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub claude_env: bool,

    /// Shell commands run inside the container after it starts
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub setup: Vec<String>,

    /// Container runtime. Default: docker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<ContainerRuntimeKind>,
}

impl Defaults {
    pub fn is_host_network(&self) -> bool {
        self.network.as_deref() == Some("host")
    }

    pub fn agent(&self) -> &str {
        self.agent.as_deref().unwrap_or("claude")
    }

    pub fn runtime(&self) -> ContainerRuntimeKind {
        self.runtime.unwrap_or_default()
    }
}

/// Project configuration, read from `.sandcastles/config.yaml`
#[derive(Debug, Deserialize, Serialize, Default, Clone, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub version: String,

    /// Project name; seeds the shared image name
    #[serde(default)]
    pub project: String,

    #[serde(default)]
    pub language: String,

    #[serde(default)]
    pub image: ImageConfig,

    #[serde(default)]
    pub defaults: Defaults,
}

impl Config {
    /// Load the config of the project rooted at `project_dir`.
    pub fn load(project_dir: &Path) -> Result<Self> {
        let path = config_path(project_dir);
        debug!(path = %path.display(), "config:reading file");
        let contents = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config at {}", path.display()))?;
        let config: Config = serde_yaml::from_str(&contents)
            .map_err(|e| anyhow!("Failed to parse config at {}: {}", path.display(), e))?;
        debug!(project = %config.project, runtime = ?config.defaults.runtime(), "config:loaded");
        Ok(config)
    }

    /// Write this config into `project_dir`, creating the sandcastles dir if needed.
    #[cfg(test)]
    pub fn save(&self, project_dir: &Path) -> Result<()> {
        let dir = project_dir.join(DIR);
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        let data = serde_yaml::to_string(self).context("Failed to serialize config")?;
        fs::write(config_path(project_dir), data).context("Failed to write config")?;
        Ok(())
    }

    pub fn exists(project_dir: &Path) -> bool {
        config_path(project_dir).exists()
    }

    /// Name of the image shared by every sandbox of this project
    pub fn image_name(&self) -> String {
        format!("sc-{}", self.project)
    }
}

pub fn config_path(project_dir: &Path) -> PathBuf {
    project_dir.join(DIR).join(CONFIG_FILE)
}

pub fn state_path(project_dir: &Path) -> PathBuf {
    project_dir.join(DIR).join(STATE_FILE)
}

pub fn worktrees_dir(project_dir: &Path) -> PathBuf {
    project_dir.join(DIR).join(WORKTREE_DIR)
}

/// Find the project root by walking up from `start_dir` to the nearest
/// directory holding `.sandcastles/config.yaml`.
pub fn find_project_root(start_dir: &Path) -> Option<PathBuf> {
    let mut dir = start_dir
        .canonicalize()
        .unwrap_or_else(|_| start_dir.to_path_buf());
    loop {
        if Config::exists(&dir) {
            debug!(root = %dir.display(), "config:found project root");
            return Some(dir);
        }
        if !dir.pop() {
            return None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Config {
        Config {
            version: "1".to_string(),
            project: "test-project".to_string(),
            language: "go".to_string(),
            image: ImageConfig {
                base: "ubuntu:24.04".to_string(),
                dockerfile: ".sandcastles/Dockerfile".to_string(),
                packages: vec!["golang-go".to_string()],
            },
            defaults: Defaults {
                agent: Some("claude".to_string()),
                ports: vec![8080],
                ..Default::default()
            },
        }
    }

    #[test]
    fn save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = sample();
        cfg.save(dir.path()).unwrap();

        let loaded = Config::load(dir.path()).unwrap();
        assert_eq!(loaded, cfg);
        assert_eq!(loaded.image_name(), "sc-test-project");
    }

    #[test]
    fn exists_after_save() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!Config::exists(dir.path()));
        sample().save(dir.path()).unwrap();
        assert!(Config::exists(dir.path()));
    }

    #[test]
    fn defaults_apply_for_missing_keys() {
        let cfg: Config = serde_yaml::from_str("project: demo\n").unwrap();
        assert_eq!(cfg.defaults.agent(), "claude");
        assert_eq!(cfg.defaults.runtime(), ContainerRuntimeKind::Docker);
        assert!(!cfg.defaults.is_host_network());
        assert!(cfg.defaults.ports.is_empty());
        assert_eq!(cfg.image.dockerfile_path(), ".sandcastles/Dockerfile");
    }

    #[test]
    fn host_network_and_podman() {
        let yaml = "project: demo\ndefaults:\n  network: host\n  runtime: podman\n  ports: [3000]\n";
        let cfg: Config = serde_yaml::from_str(yaml).unwrap();
        assert!(cfg.defaults.is_host_network());
        assert_eq!(cfg.defaults.runtime().binary(), "podman");
    }

    #[test]
    fn find_project_root_from_subdir() {
        let dir = tempfile::tempdir().unwrap();
        sample().save(dir.path()).unwrap();
        let nested = dir.path().join("src").join("deep");
        fs::create_dir_all(&nested).unwrap();

        let root = find_project_root(&nested).unwrap();
        assert_eq!(root, dir.path().canonicalize().unwrap());
    }

    #[test]
    fn load_reports_parse_errors() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join(DIR)).unwrap();
        fs::write(config_path(dir.path()), "defaults: [not, a, map]").unwrap();
        let err = Config::load(dir.path()).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config"));
    }
}
