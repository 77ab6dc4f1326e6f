//! On-disk configuration document.
//!
//! A single small JSON file in the user's config directory holds
//! everything cloudtun persists (currently the command history). Writes
//! go through a temp file and an atomic rename so a crash mid-write never
//! corrupts the document.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use directories::BaseDirs;
use serde::{Deserialize, Serialize};

const STORE_FILE: &str = "store.json";

/// The persisted document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    #[serde(default)]
    pub history: History,
}

/// History section of the document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct History {
    #[serde(default)]
    pub commands: Vec<String>,
}

/// Handle to the config document on disk.
#[derive(Debug, Clone)]
pub struct Store {
    dir: PathBuf,
}

impl Store {
    /// Open the store in the default config directory
    /// (`$XDG_CONFIG_HOME/cloudtun` or the platform equivalent),
    /// creating the directory and an empty document if needed.
    pub fn open_default() -> Result<Self> {
        let base = BaseDirs::new().context("could not determine a home directory")?;
        Self::open(&base.config_dir().join("cloudtun"))
    }

    /// Open the store in an explicit directory.
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("failed to create config dir {}", dir.display()))?;
        let store = Self {
            dir: dir.to_path_buf(),
        };
        if !store.path().exists() {
            store.write(&Document::default())?;
        }
        Ok(store)
    }

    /// Path of the document file.
    pub fn path(&self) -> PathBuf {
        self.dir.join(STORE_FILE)
    }

    /// Read the whole document.
    pub fn read(&self) -> Result<Document> {
        let path = self.path();
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("invalid JSON in {}", path.display()))
    }

    /// Write the whole document atomically (tmp + rename).
    pub fn write(&self, doc: &Document) -> Result<()> {
        let path = self.path();
        let tmp = path.with_extension("tmp");
        let data = serde_json::to_vec_pretty(doc).context("failed to serialize document")?;
        fs::write(&tmp, data).with_context(|| format!("failed to write {}", tmp.display()))?;
        fs::rename(&tmp, &path).with_context(|| {
            format!(
                "failed to move document into place ({} -> {})",
                tmp.display(),
                path.display()
            )
        })?;
        Ok(())
    }

    /// Copy the current document to a timestamped backup file.
    ///
    /// Returns the backup path, or `None` when there is no document yet.
    pub fn backup(&self) -> Result<Option<PathBuf>> {
        let path = self.path();
        if !path.exists() {
            return Ok(None);
        }
        let stamp = chrono::Utc::now().timestamp();
        let backup = self.dir.join(format!("store-{stamp}.json"));
        fs::copy(&path, &backup)
            .with_context(|| format!("failed to back up to {}", backup.display()))?;
        Ok(Some(backup))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_creates_an_empty_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        assert_eq!(store.read().unwrap(), Document::default());
    }

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();

        let doc = Document {
            history: History {
                commands: vec!["--proxy-type=sql".to_string()],
            },
        };
        store.write(&doc).unwrap();
        assert_eq!(store.read().unwrap(), doc);
    }

    #[test]
    fn write_leaves_no_temp_file_behind() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        store.write(&Document::default()).unwrap();

        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.path().extension().is_some_and(|ext| ext == "tmp"))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn backup_copies_the_document() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();

        let backup = store.backup().unwrap().unwrap();
        assert!(backup.exists());
        assert_ne!(backup, store.path());
    }

    #[test]
    fn missing_sections_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::open(dir.path()).unwrap();
        fs::write(store.path(), "{}").unwrap();
        assert_eq!(store.read().unwrap(), Document::default());
    }
}
