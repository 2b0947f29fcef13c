//! Hash store: SHA-256 digests of the files this controller last wrote.
//!
//! Persists a [`HashStoreFile`] JSON document at `<state_dir>/hashes.json`.
//! Saves use a `.tmp` sibling and rename.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{io_err, SyncError};

/// Target path string -> last written SHA-256 hex digest.
pub type HashStore = BTreeMap<String, String>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct HashStoreFile {
    pub synced_at: DateTime<Utc>,
    #[serde(default)]
    pub files: HashStore,
}

impl Default for HashStoreFile {
    fn default() -> Self {
        Self {
            synced_at: Utc::now(),
            files: HashStore::new(),
        }
    }
}

/// Load the store at `path`. A missing file is an empty store.
pub fn load_at(path: &Path) -> Result<HashStoreFile, SyncError> {
    if !path.exists() {
        return Ok(HashStoreFile::default());
    }
    let contents = std::fs::read_to_string(path).map_err(|e| io_err(path, e))?;
    serde_json::from_str(&contents).map_err(|e| SyncError::Json {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Save `store` to `path` atomically, creating the parent directory.
pub fn save_at(path: &Path, store: &HashStoreFile) -> Result<(), SyncError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir).map_err(|e| io_err(dir, e))?;
    }

    let json = serde_json::to_string_pretty(store).map_err(|e| SyncError::Json {
        path: path.to_path_buf(),
        source: e,
    })?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, &json).map_err(|e| io_err(&tmp, e))?;
    if let Err(e) = std::fs::rename(&tmp, path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(io_err(path, e));
    }
    Ok(())
}
