//! Client-local key/value storage
//!
//! A JSON file mapping fixed keys (`code_verifier`, `session`) to values. It
//! is the one place sign-in state survives the trip out to the identity
//! provider and back, and across client restarts. Writes go through a temp
//! file + rename so a crash never leaves a torn file, and a tokio Mutex
//! serializes writers.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

type Entries = BTreeMap<String, serde_json::Value>;

/// File-backed storage shared by the redirect initiator, the callback
/// handler and the session store.
pub struct LocalStorage {
    path: PathBuf,
    entries: Mutex<Entries>,
}

impl LocalStorage {
    /// Open the storage file, creating it as `{}` if it doesn't exist.
    pub async fn open(path: PathBuf) -> Result<Self> {
        let entries = if path.exists() {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .map_err(|e| Error::Io(format!("reading storage file: {e}")))?;
            let entries: Entries = serde_json::from_str(&contents)
                .map_err(|e| Error::StorageParse(format!("parsing storage file: {e}")))?;
            info!(path = %path.display(), keys = entries.len(), "opened local storage");
            entries
        } else {
            info!(path = %path.display(), "storage file not found, starting empty");
            let entries = Entries::new();
            write_atomic(&path, &entries).await?;
            entries
        };

        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    /// Read and decode the value under `key`.
    ///
    /// A value that no longer decodes into `T` (older layout, hand edit) is
    /// reported as absent rather than failing the caller.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        let entries = self.entries.lock().await;
        let value = entries.get(key)?.clone();
        match serde_json::from_value(value) {
            Ok(decoded) => Some(decoded),
            Err(e) => {
                warn!(key, error = %e, "ignoring undecodable storage entry");
                None
            }
        }
    }

    /// Store `value` under `key`, replacing whatever was there, and persist.
    ///
    /// Returns true when an earlier value was overwritten.
    pub async fn set<T: Serialize>(&self, key: &str, value: &T) -> Result<bool> {
        let value = serde_json::to_value(value)
            .map_err(|e| Error::StorageParse(format!("serializing {key}: {e}")))?;
        let mut entries = self.entries.lock().await;
        let replaced = entries.insert(key.to_string(), value).is_some();
        debug!(key, replaced, "stored entry");
        write_atomic(&self.path, &entries).await?;
        Ok(replaced)
    }

    /// Remove `key` and persist. Returns true if it was present.
    pub async fn remove(&self, key: &str) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        if entries.remove(key).is_none() {
            return Ok(false);
        }
        debug!(key, "removed entry");
        write_atomic(&self.path, &entries).await?;
        Ok(true)
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.entries.lock().await.contains_key(key)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Write the entries to `path` atomically with 0600 permissions, since the
/// file holds tokens and the pending verifier.
async fn write_atomic(path: &Path, entries: &Entries) -> Result<()> {
    let json = serde_json::to_string_pretty(entries)
        .map_err(|e| Error::StorageParse(format!("serializing storage: {e}")))?;

    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    let tmp_path = dir.join(format!(".storage.tmp.{}", std::process::id()));

    tokio::fs::write(&tmp_path, json.as_bytes())
        .await
        .map_err(|e| Error::Io(format!("writing temp storage file: {e}")))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&tmp_path, perms)
            .await
            .map_err(|e| Error::Io(format!("setting storage file permissions: {e}")))?;
    }

    tokio::fs::rename(&tmp_path, path)
        .await
        .map_err(|e| Error::Io(format!("renaming temp storage file: {e}")))?;

    debug!(path = %path.display(), "persisted local storage");
    Ok(())
}
