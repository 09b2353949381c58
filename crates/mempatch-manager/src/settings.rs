//! Manager settings: a flat JSON document of dotted keys to strings,
//! loaded and saved explicitly. Missing keys read as empty, so callers can
//! treat every setting as optional with a sensible default.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use tracing::debug;

use mempatch_common::error::Result;

#[derive(Debug, Default)]
pub struct SettingsStore {
    path: Option<PathBuf>,
    values: BTreeMap<String, String>,
}

impl SettingsStore {
    /// An empty, unbacked store (used by tests and one-shot tools).
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a settings file, creating an empty store if it does not exist
    /// yet. `save` writes back to the same path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let values = match std::fs::read_to_string(path) {
            Ok(content) => serde_json::from_str(&content)?,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(error) => return Err(error.into()),
        };
        debug!(path = %path.display(), entries = values.len(), "settings loaded");
        Ok(Self {
            path: Some(path.to_path_buf()),
            values,
        })
    }

    pub fn get(&self, key: &str) -> &str {
        self.values.get(key).map(String::as_str).unwrap_or("")
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.values.insert(key.into(), value.into());
    }

    pub fn remove(&mut self, key: &str) {
        self.values.remove(key);
    }

    /// Persist to the backing file; a store without one saves nowhere.
    pub fn save(&self) -> Result<()> {
        if let Some(path) = &self.path {
            self.save_to(path)?;
        }
        Ok(())
    }

    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(&self.values)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> PathBuf {
        let mut path = std::env::temp_dir();
        path.push(format!("mempatch-settings-{}-{}", std::process::id(), name));
        path
    }

    #[test]
    fn test_missing_keys_read_empty() {
        let store = SettingsStore::new();
        assert_eq!(store.get("manager.codegen.objects_path"), "");
    }

    #[test]
    fn test_set_get_remove() {
        let mut store = SettingsStore::new();
        store.set("core.library", "libmempatch_core.so");
        assert_eq!(store.get("core.library"), "libmempatch_core.so");
        store.remove("core.library");
        assert_eq!(store.get("core.library"), "");
    }

    #[test]
    fn test_save_and_reload() {
        let path = temp_path("reload.json");
        let mut store = SettingsStore::open(&path).unwrap();
        store.set("hooks.on_frame.checksum", "12345");
        store.set("manager.target.program", "/usr/bin/target");
        store.save().unwrap();

        let reloaded = SettingsStore::open(&path).unwrap();
        assert_eq!(reloaded.get("hooks.on_frame.checksum"), "12345");
        assert_eq!(reloaded.get("manager.target.program"), "/usr/bin/target");

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_open_missing_file_is_empty() {
        let store = SettingsStore::open(temp_path("never-created.json")).unwrap();
        assert_eq!(store.get("anything"), "");
    }
}
