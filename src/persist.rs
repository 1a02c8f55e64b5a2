//! User-data persistence.
//!
//! The core treats storage as a best-effort key-value store keyed by user
//! id: one snapshot of conversations, folders and settings per user.
//! Writes are debounced on the trailing edge so a streaming response does
//! not cause one write per chunk.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;

use crate::config::Settings;
use crate::types::{Conversation, Folder};

/// Everything stored for one user.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct UserData {
    #[serde(default)]
    pub conversations: Vec<Conversation>,
    #[serde(default)]
    pub folders: Vec<Folder>,
    #[serde(default)]
    pub settings: Option<Settings>,
}

#[async_trait]
pub trait UserDataStore: Send + Sync {
    async fn get(&self, user_id: &str) -> Result<Option<UserData>>;
    async fn put(&self, user_id: &str, snapshot: &UserData) -> Result<()>;
}

// --- JSON file store ---

/// Stores each user's snapshot as `<dir>/<user_id>.json`.
///
/// Writes go through one temp file per user and are serialized, so
/// overlapping `put`s never interleave.
pub struct FileStore {
    dir: PathBuf,
    write_lock: Mutex<()>,
}

impl FileStore {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            dir,
            write_lock: Mutex::new(()),
        }
    }

    fn path_for(&self, user_id: &str) -> PathBuf {
        let safe: String = user_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{}.json", safe))
    }
}

#[async_trait]
impl UserDataStore for FileStore {
    async fn get(&self, user_id: &str) -> Result<Option<UserData>> {
        let path = self.path_for(user_id);
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(None);
        }
        let content = tokio::fs::read_to_string(&path)
            .await
            .with_context(|| format!("Cannot read {}", path.display()))?;
        match serde_json::from_str(&content) {
            Ok(data) => Ok(Some(data)),
            Err(err) => {
                // move it aside so the next write cannot destroy it
                let aside = path.with_extension("json.corrupt");
                tokio::fs::rename(&path, &aside)
                    .await
                    .with_context(|| format!("Failed to move aside {}", path.display()))?;
                Err(anyhow::Error::new(err).context(format!(
                    "Corrupt user data in {}, kept as {}",
                    path.display(),
                    aside.display()
                )))
            }
        }
    }

    async fn put(&self, user_id: &str, snapshot: &UserData) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("Failed to create {}", self.dir.display()))?;
        let path = self.path_for(user_id);
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(snapshot)?;
        tokio::fs::write(&tmp, json)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to replace {}", path.display()))?;
        Ok(())
    }
}

// --- In-memory store ---

/// Keeps snapshots in memory only (`--ephemeral`).
#[derive(Default)]
pub struct MemoryStore {
    data: Mutex<HashMap<String, UserData>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UserDataStore for MemoryStore {
    async fn get(&self, user_id: &str) -> Result<Option<UserData>> {
        Ok(self.data.lock().await.get(user_id).cloned())
    }

    async fn put(&self, user_id: &str, snapshot: &UserData) -> Result<()> {
        self.data
            .lock()
            .await
            .insert(user_id.to_string(), snapshot.clone());
        Ok(())
    }
}

// --- Debouncer ---

/// Trailing-edge debounce: every `touch` pushes the deadline out by `delay`.
#[derive(Debug)]
pub struct Debouncer {
    delay: Duration,
    deadline: Option<Instant>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            deadline: None,
        }
    }

    pub fn touch(&mut self) {
        self.deadline = Some(Instant::now() + self.delay);
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Clear the pending deadline; returns whether one was set.
    pub fn take(&mut self) -> bool {
        self.deadline.take().is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_file_store_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().join("data"));
        assert!(store.get("alice").await.unwrap().is_none());

        let mut data = UserData::default();
        data.conversations.push(Conversation::new("Tides"));
        data.folders.push(Folder::new("Research"));
        data.settings = Some(Settings::default());
        store.put("alice", &data).await.unwrap();

        let loaded = store.get("alice").await.unwrap().unwrap();
        assert_eq!(loaded, data);
    }

    #[tokio::test]
    async fn test_file_store_sanitizes_user_id() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().to_path_buf());
        store.put("../evil", &UserData::default()).await.unwrap();
        assert!(dir.path().join("___evil.json").exists());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_file_store_concurrent_puts() {
        let dir = tempfile::tempdir().unwrap();
        let store = std::sync::Arc::new(FileStore::new(dir.path().to_path_buf()));
        let mut big = UserData::default();
        for i in 0..200 {
            let mut conv = Conversation::new(format!("conversation {}", i));
            conv.messages.push(crate::types::Message::user("x".repeat(500), i));
            big.conversations.push(conv);
        }

        for _ in 0..20 {
            let (a, b) = tokio::join!(
                tokio::spawn({
                    let store = store.clone();
                    let big = big.clone();
                    async move { store.put("u", &big).await }
                }),
                tokio::spawn({
                    let store = store.clone();
                    let big = big.clone();
                    async move { store.put("u", &big).await }
                }),
            );
            a.unwrap().unwrap();
            b.unwrap().unwrap();
            assert_eq!(store.get("u").await.unwrap().unwrap(), big);
        }
    }

    #[tokio::test]
    async fn test_corrupt_file_is_moved_aside() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::new(dir.path().to_path_buf());
        let path = dir.path().join("alice.json");
        std::fs::write(&path, "{ not json").unwrap();

        let err = store.get("alice").await.unwrap_err();
        assert!(format!("{:#}", err).contains("Corrupt user data"));
        assert!(!path.exists());
        let aside = dir.path().join("alice.json.corrupt");
        assert_eq!(std::fs::read_to_string(&aside).unwrap(), "{ not json");

        store.put("alice", &UserData::default()).await.unwrap();
        assert!(store.get("alice").await.unwrap().is_some());
        assert_eq!(std::fs::read_to_string(&aside).unwrap(), "{ not json");
    }

    #[tokio::test]
    async fn test_memory_store() {
        let store = MemoryStore::new();
        store.put("u", &UserData::default()).await.unwrap();
        assert!(store.get("u").await.unwrap().is_some());
        assert!(store.get("v").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_debouncer_trailing_edge() {
        let mut debouncer = Debouncer::new(Duration::from_millis(50));
        assert!(debouncer.deadline().is_none());
        debouncer.touch();
        let first = debouncer.deadline().unwrap();
        tokio::time::sleep(Duration::from_millis(5)).await;
        debouncer.touch();
        assert!(debouncer.deadline().unwrap() > first);
        assert!(debouncer.take());
        assert!(!debouncer.take());
    }
}
