//! File-backed key/value storage.
//!
//! Values are JSON files in a data directory, one file per key. The default
//! directory is the platform config directory:
//!   - Linux: `~/.config/connectsuite/`
//!   - macOS: `~/Library/Application Support/connectsuite/`
//!   - Windows: `%APPDATA%\connectsuite\`

use std::path::{Path, PathBuf};

use serde::{de::DeserializeOwned, Serialize};

const APP_DIR: &str = "connectsuite";

#[derive(Debug, Clone)]
pub struct Storage {
    dir: PathBuf,
}

impl Storage {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Storage rooted at the platform config directory, if one exists.
    pub fn platform_default() -> Option<Self> {
        Some(Self::new(dirs::config_dir()?.join(APP_DIR)))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Save a value. Returns `true` if the write succeeded.
    pub fn save<T: Serialize>(&self, key: &str, value: &T) -> bool {
        match serde_json::to_string(value) {
            Ok(json) => self.save_raw(key, &json),
            Err(e) => {
                crate::log_error!("storage: failed to serialize '{}': {}", key, e);
                false
            }
        }
    }

    /// Load a value. Returns `None` if the key doesn't exist or
    /// deserialization fails.
    pub fn load<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let json = self.load_raw(key)?;
        match serde_json::from_str(&json) {
            Ok(value) => Some(value),
            Err(e) => {
                crate::log_warn!("storage: ignoring unreadable '{}': {}", key, e);
                None
            }
        }
    }

    /// Delete a value. Returns `true` if the key is gone afterwards; a key
    /// that never existed counts as removed.
    pub fn remove(&self, key: &str) -> bool {
        let Some(path) = self.file_path(key) else {
            return true;
        };
        match std::fs::remove_file(&path) {
            Ok(()) => true,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
            Err(e) => {
                crate::log_warn!("storage: failed to remove {}: {}", path.display(), e);
                false
            }
        }
    }

    pub fn exists(&self, key: &str) -> bool {
        self.file_path(key).is_some_and(|p| p.exists())
    }

    fn ensure_dir(&self) -> Option<&Path> {
        if !self.dir.exists() {
            std::fs::create_dir_all(&self.dir).ok()?;
        }
        Some(&self.dir)
    }

    fn file_path(&self, key: &str) -> Option<PathBuf> {
        // Sanitize key to be a valid filename
        let safe_key = key.replace(['/', '\\', ':', '*', '?', '"', '<', '>', '|'], "_");
        if safe_key.is_empty() {
            return None;
        }
        Some(self.dir.join(format!("{}.json", safe_key)))
    }

    fn save_raw(&self, key: &str, value: &str) -> bool {
        if self.ensure_dir().is_none() {
            return false;
        }
        let Some(path) = self.file_path(key) else {
            return false;
        };
        std::fs::write(path, value).is_ok()
    }

    fn load_raw(&self, key: &str) -> Option<String> {
        let path = self.file_path(key)?;
        std::fs::read_to_string(path).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Sample {
        token: String,
    }

    #[test]
    fn save_load_remove() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = Storage::new(tmp.path().join("nested"));
        let value = Sample { token: "abc".into() };

        assert!(storage.save("session", &value));
        assert!(storage.exists("session"));
        assert_eq!(storage.load::<Sample>("session"), Some(value));

        assert!(storage.remove("session"));
        assert!(!storage.exists("session"));
        assert_eq!(storage.load::<Sample>("session"), None);
        assert!(storage.remove("session"));
    }

    #[test]
    fn failed_remove_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = Storage::new(tmp.path());
        std::fs::create_dir(tmp.path().join("session.json")).unwrap();

        assert!(!storage.remove("session"));
        assert!(storage.exists("session"));
        assert_eq!(storage.dir(), tmp.path());
    }

    #[test]
    fn unreadable_value_loads_as_none() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = Storage::new(tmp.path());
        std::fs::write(tmp.path().join("session.json"), "{not json").unwrap();
        assert_eq!(storage.load::<Sample>("session"), None);
    }

    #[test]
    fn keys_are_sanitized() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = Storage::new(tmp.path());
        assert!(storage.save("a/b:c", &1u32));
        assert!(tmp.path().join("a_b_c.json").exists());
    }
}
