//! Per-entity on-disk state.
//!
//! Every sandbox and container owns two directories:
//!
//! ```text
//! <root>/containers/<id>/        persistent: config.json, state.json,
//!                                metadata.json, checkpoint/
//! <run_root>/containers/<id>/    runtime: the OCI bundle handed to the
//!                                runtime binary
//! ```
//!
//! `state.json` is written with a unique temp file + rename so readers
//! never observe a partial file. The persistent tree is the durable
//! record: startup rehydration is a scan of `<root>/containers/`.

use crate::config::Config;
use crate::constants::{CONFIG_FILE, CONTAINERS_DIR, ID_LEN, STATE_FILE};
use crate::error::{Error, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Allocates and resolves per-entity directories.
pub struct ContainerStorage {
    root: PathBuf,
    run_root: PathBuf,
}

impl ContainerStorage {
    /// Creates the storage roots if needed.
    pub fn new(config: &Config) -> Result<Self> {
        let root = config.root.join(CONTAINERS_DIR);
        let run_root = config.run_root.join(CONTAINERS_DIR);
        fs::create_dir_all(&root)?;
        fs::create_dir_all(&run_root)?;
        info!(
            "container storage at {} (run: {})",
            root.display(),
            run_root.display()
        );
        Ok(Self { root, run_root })
    }

    /// Persistent directory of an entity.
    pub fn container_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    /// Runtime (bundle) directory of an entity.
    pub fn run_dir(&self, id: &str) -> PathBuf {
        self.run_root.join(id)
    }

    pub fn config_path(&self, id: &str) -> PathBuf {
        self.container_dir(id).join(CONFIG_FILE)
    }

    pub fn state_path(&self, id: &str) -> PathBuf {
        self.container_dir(id).join(STATE_FILE)
    }

    /// Creates both directories for a new entity.
    pub fn create_entity_dirs(&self, id: &str) -> Result<(PathBuf, PathBuf)> {
        let dir = self.container_dir(id);
        let run = self.run_dir(id);
        fs::create_dir_all(&dir)?;
        fs::create_dir_all(&run)?;
        debug!("allocated directories for {id}");
        Ok((dir, run))
    }

    /// Deletes both directories. Missing directories are fine.
    pub fn delete_entity_dirs(&self, id: &str) -> Result<()> {
        for dir in [self.container_dir(id), self.run_dir(id)] {
            match fs::remove_dir_all(&dir) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Lists entity ids present on disk (the rehydration scan).
    ///
    /// Only directory names shaped like entity ids are returned; anything
    /// else in the tree is ignored.
    pub fn list_entity_ids(&self) -> Result<Vec<String>> {
        let mut ids = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.len() == ID_LEN && name.chars().all(|c| c.is_ascii_hexdigit()) {
                ids.push(name.to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}

// =============================================================================
// Atomic JSON Files
// =============================================================================

/// Writes a JSON value with temp-file + rename semantics.
///
/// The temp file name is unique per write so concurrent writers of the
/// same path cannot corrupt each other; the final rename is atomic and
/// the last writer wins.
pub fn atomic_write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let data = serde_json::to_vec(value)?;
    let temp_name = format!("tmp.{}", uuid::Uuid::new_v4());
    let temp_path = path.with_extension(temp_name);
    fs::write(&temp_path, &data)?;
    fs::rename(&temp_path, path).map_err(|e| {
        let _ = fs::remove_file(&temp_path);
        Error::Io(e)
    })?;
    Ok(())
}

/// Reads a JSON value from a file.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let data = fs::read(path)?;
    Ok(serde_json::from_slice(&data)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn storage() -> (tempfile::TempDir, ContainerStorage) {
        let temp = tempfile::tempdir().unwrap();
        let config = Config::with_roots(temp.path().join("lib"), temp.path().join("run"));
        let storage = ContainerStorage::new(&config).unwrap();
        (temp, storage)
    }

    #[test]
    fn test_entity_dir_lifecycle() {
        let (_temp, storage) = storage();
        let id = "a".repeat(ID_LEN);
        let (dir, run) = storage.create_entity_dirs(&id).unwrap();
        assert!(dir.is_dir());
        assert!(run.is_dir());

        storage.delete_entity_dirs(&id).unwrap();
        assert!(!dir.exists());
        assert!(!run.exists());
        // Deleting again is fine.
        storage.delete_entity_dirs(&id).unwrap();
    }

    #[test]
    fn test_scan_only_returns_id_shaped_dirs() {
        let (_temp, storage) = storage();
        let id = "b".repeat(ID_LEN);
        storage.create_entity_dirs(&id).unwrap();
        fs::create_dir_all(storage.container_dir("junk")).unwrap();
        fs::write(storage.root.join("stray-file"), b"x").unwrap();

        assert_eq!(storage.list_entity_ids().unwrap(), vec![id]);
    }

    #[test]
    fn test_atomic_json_roundtrip() {
        let temp = tempfile::tempdir().unwrap();
        let path = temp.path().join("state.json");
        let mut value = HashMap::new();
        value.insert("status".to_string(), "running".to_string());

        atomic_write_json(&path, &value).unwrap();
        let back: HashMap<String, String> = read_json(&path).unwrap();
        assert_eq!(back, value);

        // No temp files left behind.
        let leftovers: Vec<_> = fs::read_dir(temp.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains("tmp."))
            .collect();
        assert!(leftovers.is_empty());
    }
}
