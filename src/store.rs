//! Key-value persistence for credentials, the active relay and membership
//! snapshots.

use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::{Path, PathBuf},
    sync::Mutex,
};

use sha1::{Digest, Sha1};
use tracing::warn;

use crate::error::{Error, Result};

/// Hex private key of the logged-in user.
pub const PRIVATE_KEY: &str = "nostr_private_key";
/// URL of the active group relay.
pub const CURRENT_RELAY_URL: &str = "current_relay_url";
/// Prefix of the per-relay joined group snapshots.
pub const JOINED_GROUPS_PREFIX: &str = "joined_groups_";

/// Storage key of the joined group snapshot for `relay_url`.
pub fn joined_groups_key(relay_url: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(relay_url.as_bytes());
    format!("{JOINED_GROUPS_PREFIX}{}", hex::encode(hasher.finalize()))
}

/// String and string-set store consumed by the session.
pub trait KeyValueStore: Send + Sync {
    fn get(&self, key: &str) -> Option<String>;
    fn set(&self, key: &str, value: &str) -> Result<()>;
    fn delete(&self, key: &str) -> Result<()>;
    fn delete_by_prefix(&self, prefix: &str) -> Result<()>;

    /// Read a string set stored as a JSON array. Missing or unparsable values
    /// read as empty.
    fn get_set(&self, key: &str) -> BTreeSet<String> {
        let Some(raw) = self.get(key) else {
            return BTreeSet::new();
        };
        match serde_json::from_str::<Vec<String>>(&raw) {
            Ok(items) => items.into_iter().collect(),
            Err(e) => {
                warn!(key, "discarding unparsable string set: {e}");
                BTreeSet::new()
            }
        }
    }

    fn set_set(&self, key: &str, values: &BTreeSet<String>) -> Result<()> {
        let items: Vec<&String> = values.iter().collect();
        self.set(key, &serde_json::to_string(&items)?)
    }
}

/// Volatile store used by tests and one-shot sessions.
#[derive(Debug, Default)]
pub struct MemoryStore {
    entries: Mutex<BTreeMap<String, String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn keys(&self) -> Vec<String> {
        lock(&self.entries).map(|m| m.keys().cloned().collect()).unwrap_or_default()
    }
}

fn lock<T>(m: &Mutex<T>) -> Result<std::sync::MutexGuard<'_, T>> {
    m.lock().map_err(|_| Error::Storage("store lock poisoned".into()))
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Option<String> {
        lock(&self.entries).ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        lock(&self.entries)?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        lock(&self.entries)?.remove(key);
        Ok(())
    }

    fn delete_by_prefix(&self, prefix: &str) -> Result<()> {
        lock(&self.entries)?.retain(|k, _| !k.starts_with(prefix));
        Ok(())
    }
}

/// Store persisted as a single JSON object on disk, rewritten on every change.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    entries: Mutex<BTreeMap<String, String>>,
}

impl FileStore {
    /// Open `path`, creating parent directories. A missing file starts empty.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let entries = if path.exists() {
            let data = fs::read_to_string(&path)?;
            if data.trim().is_empty() {
                BTreeMap::new()
            } else {
                serde_json::from_str(&data)?
            }
        } else {
            BTreeMap::new()
        };
        Ok(Self {
            path,
            entries: Mutex::new(entries),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn mutate(&self, f: impl FnOnce(&mut BTreeMap<String, String>)) -> Result<()> {
        let mut entries = lock(&self.entries)?;
        f(&mut entries);
        let data = serde_json::to_string_pretty(&*entries)?;
        // replace via a temp file so readers never see a partial write
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, data)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Option<String> {
        lock(&self.entries).ok()?.get(key).cloned()
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.mutate(|m| {
            m.insert(key.to_string(), value.to_string());
        })
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.mutate(|m| {
            m.remove(key);
        })
    }

    fn delete_by_prefix(&self, prefix: &str) -> Result<()> {
        self.mutate(|m| m.retain(|k, _| !k.starts_with(prefix)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn set_of(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn joined_groups_key_is_stable_per_url() {
        let a = joined_groups_key("wss://groups.example.com");
        assert!(a.starts_with(JOINED_GROUPS_PREFIX));
        assert_eq!(a.len(), JOINED_GROUPS_PREFIX.len() + 40);
        assert_eq!(a, joined_groups_key("wss://groups.example.com"));
        assert_ne!(a, joined_groups_key("wss://other.example.com"));
    }

    #[test]
    fn memory_store_sets_and_prefix_delete() {
        let store = MemoryStore::new();
        store.set(PRIVATE_KEY, "aa").unwrap();
        store
            .set_set(&joined_groups_key("wss://a"), &set_of(&["x", "y"]))
            .unwrap();
        store
            .set_set(&joined_groups_key("wss://b"), &set_of(&["z"]))
            .unwrap();
        assert_eq!(store.get_set(&joined_groups_key("wss://a")), set_of(&["x", "y"]));
        store.delete_by_prefix(JOINED_GROUPS_PREFIX).unwrap();
        assert!(store.get_set(&joined_groups_key("wss://b")).is_empty());
        assert_eq!(store.get(PRIVATE_KEY).as_deref(), Some("aa"));
        store.delete(PRIVATE_KEY).unwrap();
        assert!(store.keys().is_empty());
    }

    #[test]
    fn unparsable_set_reads_empty() {
        let store = MemoryStore::new();
        store.set("joined_groups_x", "not json").unwrap();
        assert!(store.get_set("joined_groups_x").is_empty());
    }

    #[test]
    fn file_store_persists_across_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested/store.json");
        {
            let store = FileStore::open(&path).unwrap();
            store.set(CURRENT_RELAY_URL, "wss://r").unwrap();
            store.set_set("joined_groups_a", &set_of(&["g1"])).unwrap();
        }
        let store = FileStore::open(&path).unwrap();
        assert_eq!(store.get(CURRENT_RELAY_URL).as_deref(), Some("wss://r"));
        assert_eq!(store.get_set("joined_groups_a"), set_of(&["g1"]));
        store.delete_by_prefix(JOINED_GROUPS_PREFIX).unwrap();
        let reopened = FileStore::open(&path).unwrap();
        assert!(reopened.get("joined_groups_a").is_none());
    }

    #[test]
    fn file_store_rejects_corrupt_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.json");
        fs::write(&path, "[1,2").unwrap();
        assert!(FileStore::open(&path).is_err());
    }
}
