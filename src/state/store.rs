use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::config;
use crate::sandbox::Sandbox;

/// Sandboxes keyed by name
pub type Fleet = BTreeMap<String, Sandbox>;

/// On-disk document: `{"sandboxes": {name: Sandbox}}`
#[derive(Debug, Default, Serialize, Deserialize)]
struct StateFile {
    #[serde(default)]
    sandboxes: Fleet,
}

/// JSON file holding the fleet of one project
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    /// Store at the fixed location inside `project_dir`
    pub fn for_project(project_dir: &Path) -> Self {
        Self::new(config::state_path(project_dir))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read the fleet from disk. A missing file is an empty fleet; an
    /// unparseable one is an error.
    pub fn load(&self) -> Result<Fleet> {
        let contents = match fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "state:no file, starting empty");
                return Ok(Fleet::new());
            }
            Err(e) => {
                return Err(e)
                    .with_context(|| format!("Failed to read state at {}", self.path.display()));
            }
        };
        let file: StateFile = serde_json::from_str(&contents)
            .with_context(|| format!("Corrupt state file at {}", self.path.display()))?;
        Ok(file.sandboxes)
    }

    /// Write `fleet` as the whole content of the state file
    pub fn save(&self, fleet: &Fleet) -> Result<()> {
        let parent = self.path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
        let data = serde_json::to_string_pretty(&StateFileRef { sandboxes: fleet })
            .context("Failed to serialize state")?;

        // Each writer gets its own sibling temp file, renamed over the target
        let mut tmp = NamedTempFile::new_in(parent)
            .with_context(|| format!("Failed to create temp file in {}", parent.display()))?;
        tmp.write_all(data.as_bytes())
            .with_context(|| format!("Failed to write {}", tmp.path().display()))?;
        tmp.persist(&self.path)
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        debug!(path = %self.path.display(), count = fleet.len(), "state:saved");
        Ok(())
    }

    /// Read-merge-write: re-read the file, adopt every on-disk entry missing
    /// from `fleet` for which `still_exists` holds, then write the result.
    ///
    /// Returns the names adopted into `fleet`. A corrupt file on disk has
    /// nothing to contribute and is overwritten.
    pub fn save_merged(
        &self,
        fleet: &mut Fleet,
        mut still_exists: impl FnMut(&Sandbox) -> bool,
    ) -> Result<Vec<String>> {
        let on_disk = self.load().unwrap_or_else(|e| {
            warn!(error = %e, "state:unreadable file will be overwritten");
            Fleet::new()
        });

        let mut adopted = Vec::new();
        for (name, sandbox) in on_disk {
            if fleet.contains_key(&name) {
                continue;
            }
            if still_exists(&sandbox) {
                info!(sandbox = %name, "state:adopting sandbox from disk");
                fleet.insert(name.clone(), sandbox);
                adopted.push(name);
            } else {
                debug!(sandbox = %name, "state:dropping disk entry without container");
            }
        }

        self.save(fleet)?;
        Ok(adopted)
    }
}

/// Borrowing twin of [`StateFile`] so saving does not clone the fleet
#[derive(Serialize)]
struct StateFileRef<'a> {
    sandboxes: &'a Fleet,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::Status;

    fn sandbox(name: &str, created_at: u64) -> Sandbox {
        Sandbox {
            name: name.to_string(),
            container_id: format!("{:0>12}", created_at),
            status: Status::Running,
            task: format!("task for {}", name),
            branch: format!("sandcastle/{}", name),
            worktree_path: PathBuf::from(format!("/repo/.sandcastles/worktrees/{}", name)),
            ports: BTreeMap::from([("3000".to_string(), "49321".to_string())]),
            created_at,
        }
    }

    fn store_in(dir: &Path) -> StateStore {
        StateStore::for_project(dir)
    }

    #[test]
    fn missing_file_is_empty_fleet() {
        let dir = tempfile::tempdir().unwrap();
        let fleet = store_in(dir.path()).load().unwrap();
        assert!(fleet.is_empty());
    }

    #[test]
    fn corrupt_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs::write(store.path(), "{not json").unwrap();
        let err = store.load().unwrap_err();
        assert!(err.to_string().contains("Corrupt state file"));
    }

    #[test]
    fn save_then_load_preserves_every_field() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let mut fleet = Fleet::new();
        for (i, name) in ["a", "b", "c"].iter().enumerate() {
            fleet.insert(name.to_string(), sandbox(name, 1_000 + i as u64));
        }
        fleet.get_mut("b").unwrap().status = Status::Stopped;
        fleet.get_mut("c").unwrap().task = String::new();

        store.save(&fleet).unwrap();
        let loaded = store.load().unwrap();
        assert_eq!(loaded, fleet);
    }

    #[test]
    fn file_layout_is_keyed_by_name() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        let fleet = Fleet::from([("a".to_string(), sandbox("a", 1))]);
        store.save(&fleet).unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(raw["sandboxes"]["a"]["status"], "running");
        assert_eq!(raw["sandboxes"]["a"]["branch"], "sandcastle/a");
    }

    #[test]
    fn concurrent_writers_never_lose_a_save() {
        let dir = tempfile::tempdir().unwrap();
        let writers: Vec<_> = ["a", "b"]
            .into_iter()
            .map(|name| {
                let store = store_in(dir.path());
                let fleet = Fleet::from([(name.to_string(), sandbox(name, 1))]);
                std::thread::spawn(move || {
                    (0..200).filter(|_| store.save(&fleet).is_err()).count()
                })
            })
            .collect();

        for writer in writers {
            assert_eq!(writer.join().unwrap(), 0);
        }
        let store = store_in(dir.path());
        assert_eq!(store.load().unwrap().len(), 1);
        let leftovers = fs::read_dir(store.path().parent().unwrap())
            .unwrap()
            .filter(|entry| entry.as_ref().unwrap().path() != store.path())
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn merge_adopts_disk_entries_whose_container_exists() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        store
            .save(&Fleet::from([("b".to_string(), sandbox("b", 2))]))
            .unwrap();

        let mut memory = Fleet::from([("a".to_string(), sandbox("a", 1))]);
        let adopted = store.save_merged(&mut memory, |_| true).unwrap();

        assert_eq!(adopted, vec!["b".to_string()]);
        let on_disk = store.load().unwrap();
        assert!(on_disk.contains_key("a"));
        assert!(on_disk.contains_key("b"));
        assert_eq!(on_disk.len(), 2);
    }

    #[test]
    fn merge_skips_disk_entries_whose_container_is_gone() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        store
            .save(&Fleet::from([
                ("b".to_string(), sandbox("b", 2)),
                ("gone".to_string(), sandbox("gone", 3)),
            ]))
            .unwrap();

        let mut memory = Fleet::from([("a".to_string(), sandbox("a", 1))]);
        store
            .save_merged(&mut memory, |sb| sb.name != "gone")
            .unwrap();

        let on_disk = store.load().unwrap();
        assert_eq!(on_disk.keys().collect::<Vec<_>>(), vec!["a", "b"]);
    }

    #[test]
    fn merge_keeps_memory_version_of_shared_entries() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        store
            .save(&Fleet::from([("a".to_string(), sandbox("a", 1))]))
            .unwrap();

        let mut memory = Fleet::from([("a".to_string(), sandbox("a", 1))]);
        memory.get_mut("a").unwrap().status = Status::Stopped;
        store.save_merged(&mut memory, |_| true).unwrap();

        assert_eq!(store.load().unwrap()["a"].status, Status::Stopped);
    }

    #[test]
    fn merge_overwrites_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = store_in(dir.path());
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs::write(store.path(), "garbage").unwrap();

        let mut memory = Fleet::from([("a".to_string(), sandbox("a", 1))]);
        store.save_merged(&mut memory, |_| true).unwrap();
        assert_eq!(store.load().unwrap().len(), 1);
    }
}
