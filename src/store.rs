use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::StoreError;

pub type UserId = u64;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    #[serde(default, rename = "sessionkey")]
    pub session_key: String,
    #[serde(default)]
    pub username: String,
    #[serde(default = "default_scrobble")]
    pub scrobble: bool,
}

fn default_scrobble() -> bool {
    true
}

impl Default for UserRecord {
    fn default() -> Self {
        Self {
            session_key: String::new(),
            username: String::new(),
            scrobble: default_scrobble(),
        }
    }
}

/// Persistent per-user key-value store. Unknown users load as a default record.
#[async_trait]
pub trait UserStore: Send + Sync {
    async fn load_user_record(&self, user_id: UserId) -> Result<UserRecord, StoreError>;
    async fn save_user_record(&self, user_id: UserId, record: &UserRecord)
    -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    records: DashMap<UserId, UserRecord>,
    offline: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates the backing store going away; every call fails until reset.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    pub fn record(&self, user_id: UserId) -> Option<UserRecord> {
        self.records.get(&user_id).map(|entry| entry.clone())
    }

    fn check_online(&self) -> Result<(), StoreError> {
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store is offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl UserStore for MemoryStore {
    async fn load_user_record(&self, user_id: UserId) -> Result<UserRecord, StoreError> {
        self.check_online()?;
        Ok(self.record(user_id).unwrap_or_default())
    }

    async fn save_user_record(
        &self,
        user_id: UserId,
        record: &UserRecord,
    ) -> Result<(), StoreError> {
        self.check_online()?;
        self.records.insert(user_id, record.clone());
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct UserFile {
    #[serde(default)]
    users: BTreeMap<UserId, UserRecord>,
}

#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn list_records(&self) -> Result<Vec<(UserId, UserRecord)>, StoreError> {
        let _guard = self.lock.lock().await;
        let file = self.read_file().await?;
        Ok(file.users.into_iter().collect())
    }

    async fn read_file(&self) -> Result<UserFile, StoreError> {
        let raw = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(UserFile::default());
            }
            Err(err) => {
                return Err(StoreError::Unavailable(format!(
                    "Failed reading {}: {err}",
                    self.path.display()
                )));
            }
        };
        serde_json::from_str(&raw).map_err(|err| {
            StoreError::Unavailable(format!("Failed parsing {}: {err}", self.path.display()))
        })
    }

    async fn write_file(&self, file: &UserFile) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|err| {
                StoreError::Unavailable(format!("Failed creating {}: {err}", parent.display()))
            })?;
        }
        let serialized = serde_json::to_string_pretty(file)
            .map_err(|err| StoreError::Unavailable(format!("Failed serializing users: {err}")))?;
        tokio::fs::write(&self.path, format!("{serialized}\n"))
            .await
            .map_err(|err| {
                StoreError::Unavailable(format!("Failed writing {}: {err}", self.path.display()))
            })
    }
}

#[async_trait]
impl UserStore for JsonFileStore {
    async fn load_user_record(&self, user_id: UserId) -> Result<UserRecord, StoreError> {
        let _guard = self.lock.lock().await;
        let file = self.read_file().await?;
        Ok(file.users.get(&user_id).cloned().unwrap_or_default())
    }

    async fn save_user_record(
        &self,
        user_id: UserId,
        record: &UserRecord,
    ) -> Result<(), StoreError> {
        let _guard = self.lock.lock().await;
        let mut file = self.read_file().await?;
        file.users.insert(user_id, record.clone());
        self.write_file(&file).await
    }
}
