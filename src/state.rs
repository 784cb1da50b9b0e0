//! Durable per-record state.
//!
//! The file store keeps every [`RecordState`] in one JSON document:
//!
//! ```json
//! {
//!   "version": "1",
//!   "records": {
//!     "home.example.com/A": {
//!       "record": { "domain": "home.example.com", "type": "A", "ttl": 60 },
//!       "last_applied": "203.0.113.7",
//!       "last_applied_at": "2025-01-09T12:00:00Z",
//!       "consecutive_failures": 0
//!     }
//!   }
//! }
//! ```
//!
//! Writes go to a temporary file which is synced and renamed over the
//! previous one, so a crash leaves either the old or the new document.

use crate::error::{DdnsError, Result};
use crate::record::RecordState;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

const STATE_FILE_VERSION: &str = "1";

/// Persistence for [`RecordState`], keyed by `domain/TYPE`.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load every persisted record state. Empty on first run.
    async fn load(&self) -> Result<HashMap<String, RecordState>>;

    /// Durably store one record's state.
    async fn save(&self, state: &RecordState) -> Result<()>;
}

#[derive(Debug, Serialize, Deserialize)]
struct StateFile {
    version: String,
    records: HashMap<String, RecordState>,
}

/// JSON file store with atomic replace and a `.backup` of the last good file.
#[derive(Debug)]
pub struct FileStateStore {
    path: PathBuf,
    // Held for the whole write, which serializes writers.
    records: Mutex<HashMap<String, RecordState>>,
}

impl FileStateStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            records: Mutex::new(HashMap::new()),
        }
    }

    fn sibling(&self, extension: &str) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".");
        name.push(extension);
        self.path.with_file_name(name)
    }

    fn temp_path(&self) -> PathBuf {
        self.sibling("tmp")
    }

    fn backup_path(&self) -> PathBuf {
        self.sibling("backup")
    }

    async fn read_file(path: &Path) -> Result<Option<HashMap<String, RecordState>>> {
        let content = match fs::read(path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(DdnsError::Persistence(format!(
                    "Failed to read {}: {}",
                    path.display(),
                    e
                )))
            }
        };

        let file: StateFile = serde_json::from_slice(&content)?;
        if file.version != STATE_FILE_VERSION {
            tracing::warn!(
                "State file {} has version {}, expected {}; loading anyway",
                path.display(),
                file.version,
                STATE_FILE_VERSION
            );
        }
        Ok(Some(file.records))
    }

    async fn write_file(&self, records: &HashMap<String, RecordState>) -> Result<()> {
        let persistence = |what: &str, path: &Path, e: std::io::Error| {
            DdnsError::Persistence(format!("Failed to {} {}: {}", what, path.display(), e))
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| persistence("create", parent, e))?;
        }

        let json = serde_json::to_vec_pretty(&StateFile {
            version: STATE_FILE_VERSION.to_string(),
            records: records.clone(),
        })?;

        let temp = self.temp_path();
        {
            let mut file = fs::File::create(&temp)
                .await
                .map_err(|e| persistence("create", &temp, e))?;
            file.write_all(&json)
                .await
                .map_err(|e| persistence("write", &temp, e))?;
            file.sync_all()
                .await
                .map_err(|e| persistence("sync", &temp, e))?;
        }

        if fs::try_exists(&self.path).await.unwrap_or(false) {
            if let Err(e) = fs::copy(&self.path, self.backup_path()).await {
                tracing::warn!("Failed to back up state file: {}", e);
            }
        }

        fs::rename(&temp, &self.path)
            .await
            .map_err(|e| persistence("replace", &self.path, e))?;

        #[cfg(unix)]
        self.sync_parent().await;

        tracing::trace!("State written to {}", self.path.display());
        Ok(())
    }
}

impl FileStateStore {
    /// Best effort: make the rename itself durable.
    #[cfg(unix)]
    async fn sync_parent(&self) {
        let parent = match self.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };

        let synced = match fs::File::open(parent).await {
            Ok(dir) => dir.sync_all().await,
            Err(e) => Err(e),
        };
        if let Err(e) = synced {
            tracing::debug!("Failed to sync directory {}: {}", parent.display(), e);
        }
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load(&self) -> Result<HashMap<String, RecordState>> {
        let loaded = match Self::read_file(&self.path).await {
            Ok(Some(records)) => records,
            Ok(None) => {
                tracing::info!("No state at {}, starting fresh", self.path.display());
                HashMap::new()
            }
            Err(DdnsError::Serialization(e)) => {
                tracing::warn!(
                    "State file {} is corrupted ({}), trying backup",
                    self.path.display(),
                    e
                );
                match Self::read_file(&self.backup_path()).await {
                    Ok(Some(records)) => {
                        tracing::info!("Recovered {} record(s) from backup", records.len());
                        records
                    }
                    Ok(None) | Err(_) => {
                        tracing::error!("No usable backup, starting with empty state");
                        HashMap::new()
                    }
                }
            }
            Err(e) => return Err(e),
        };

        tracing::debug!("Loaded state for {} record(s)", loaded.len());
        *self.records.lock().await = loaded.clone();
        Ok(loaded)
    }

    async fn save(&self, state: &RecordState) -> Result<()> {
        let mut records = self.records.lock().await;
        let previous = records.insert(state.key(), state.clone());

        if let Err(e) = self.write_file(&records).await {
            // Keep memory in line with disk so a later save rewrites both.
            match previous {
                Some(prev) => records.insert(state.key(), prev),
                None => records.remove(&state.key()),
            };
            return Err(e);
        }
        Ok(())
    }
}

/// Non-durable store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStateStore {
    records: Mutex<HashMap<String, RecordState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-populate, as if loaded from a previous run.
    pub fn with_states(states: impl IntoIterator<Item = RecordState>) -> Self {
        Self {
            records: Mutex::new(states.into_iter().map(|s| (s.key(), s)).collect()),
        }
    }

    pub async fn get(&self, key: &str) -> Option<RecordState> {
        self.records.lock().await.get(key).cloned()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self) -> Result<HashMap<String, RecordState>> {
        Ok(self.records.lock().await.clone())
    }

    async fn save(&self, state: &RecordState) -> Result<()> {
        self.records.lock().await.insert(state.key(), state.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{ManagedRecord, RecordType};
    use chrono::Utc;
    use std::net::IpAddr;
    use tempfile::tempdir;

    fn applied(domain: &str, ip: &str) -> RecordState {
        let mut state = RecordState::new(ManagedRecord::new(domain, RecordType::A));
        state.confirm(ip.parse::<IpAddr>().unwrap(), Utc::now());
        state
    }

    #[tokio::test]
    async fn test_first_run_is_empty() {
        let dir = tempdir().unwrap();
        let store = FileStateStore::new(dir.path().join("state.json"));
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_then_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        let store = FileStateStore::new(&path);
        store.load().await.unwrap();
        store.save(&applied("example.com", "1.1.1.1")).await.unwrap();
        store.save(&applied("www.example.com", "1.1.1.1")).await.unwrap();

        let reopened = FileStateStore::new(&path);
        let records = reopened.load().await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(
            records["example.com/A"].last_applied,
            Some("1.1.1.1".parse().unwrap())
        );
        assert!(!store.temp_path().exists());
    }

    #[tokio::test]
    async fn test_corrupted_file_falls_back_to_backup() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");

        let store = FileStateStore::new(&path);
        store.save(&applied("example.com", "1.1.1.1")).await.unwrap();
        store.save(&applied("example.com", "1.1.1.2")).await.unwrap();
        assert!(store.backup_path().exists());

        fs::write(&path, b"{ not json").await.unwrap();

        let records = FileStateStore::new(&path).load().await.unwrap();
        assert_eq!(
            records["example.com/A"].last_applied,
            Some("1.1.1.1".parse().unwrap())
        );
    }

    #[tokio::test]
    async fn test_undecodable_bytes_fall_back_to_backup() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");

        let store = FileStateStore::new(&path);
        store.save(&applied("example.com", "1.1.1.1")).await.unwrap();
        store.save(&applied("example.com", "1.1.1.2")).await.unwrap();

        fs::write(&path, [0xff, 0xfe, 0x00, 0x7b]).await.unwrap();

        let records = FileStateStore::new(&path).load().await.unwrap();
        assert_eq!(
            records["example.com/A"].last_applied,
            Some("1.1.1.1".parse().unwrap())
        );
    }

    #[tokio::test]
    async fn test_repeated_saves_replace_in_place() {
        let dir = tempdir().unwrap();
        let store = FileStateStore::new(dir.path().join("state.json"));

        for ip in ["1.1.1.1", "1.1.1.2", "1.1.1.3"] {
            store.save(&applied("example.com", ip)).await.unwrap();
        }

        let records = FileStateStore::new(dir.path().join("state.json"))
            .load()
            .await
            .unwrap();
        assert_eq!(
            records["example.com/A"].last_applied,
            Some("1.1.1.3".parse().unwrap())
        );
        assert!(!store.temp_path().exists());
    }

    #[tokio::test]
    async fn test_corrupted_without_backup_starts_empty() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        fs::write(&path, b"garbage").await.unwrap();

        let records = FileStateStore::new(&path).load().await.unwrap();
        assert!(records.is_empty());
    }

    #[tokio::test]
    async fn test_failed_write_reports_persistence_error() {
        let dir = tempdir().unwrap();
        // A directory where the file should be makes the rename fail.
        let path = dir.path().join("state.json");
        std::fs::create_dir_all(path.join("occupied")).unwrap();

        let store = FileStateStore::new(&path);
        let err = store
            .save(&applied("example.com", "1.1.1.1"))
            .await
            .unwrap_err();
        assert!(matches!(err, DdnsError::Persistence(_)));
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryStateStore::with_states([applied("example.com", "1.1.1.1")]);
        assert_eq!(store.load().await.unwrap().len(), 1);

        store.save(&applied("example.com", "1.1.1.2")).await.unwrap();
        assert_eq!(
            store.get("example.com/A").await.unwrap().last_applied,
            Some("1.1.1.2".parse().unwrap())
        );
    }
}
