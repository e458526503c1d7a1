//! Registry (C2): durable, concurrency-safe map from episode identifier to download
//! state. The filesystem remains the authority on *presence*; the registry is the
//! authority on *status*.

use crate::constants::filesystem::{DEFAULT_DIR_PERMISSIONS, DEFAULT_FILE_PERMISSIONS};
use crate::model::EpisodeId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::sync::RwLock;

#[cfg(unix)]
async fn chmod(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(metadata) = tokio::fs::metadata(path).await {
        let mut perms = metadata.permissions();
        perms.set_mode(mode);
        let _ = tokio::fs::set_permissions(path, perms).await;
    }
}

#[cfg(not(unix))]
async fn chmod(_path: &Path, _mode: u32) {}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to read registry file: {0}")]
    Read(#[source] std::io::Error),
    #[error("failed to write registry file: {0}")]
    Write(#[source] std::io::Error),
    #[error("malformed registry file: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Status {
    Queued,
    Downloading,
    /// Reserved: no transitions currently enter or leave this state (open question).
    Paused,
    Completed,
    Failed,
    Cancelled,
    Unknown,
}

impl Default for Status {
    fn default() -> Self {
        Status::Unknown
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadRecord {
    #[serde(rename = "episodeID")]
    pub episode_id: EpisodeId,
    pub status: Status,
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub speed: u64,
    #[serde(default, rename = "bytesDownloaded")]
    pub bytes_downloaded: u64,
    #[serde(default, rename = "totalBytes")]
    pub total_bytes: u64,
    #[serde(default, rename = "retryCount")]
    pub retry_count: u32,
    #[serde(default, rename = "lastError")]
    pub last_error: String,
    #[serde(rename = "startTime")]
    pub start_time: DateTime<Utc>,
    /// Estimated remaining duration, in nanoseconds.
    #[serde(default, rename = "estimatedTime")]
    pub estimated_time_ns: u64,
}

impl DownloadRecord {
    pub fn new(episode_id: EpisodeId) -> Self {
        Self {
            episode_id,
            status: Status::Queued,
            progress: 0.0,
            speed: 0,
            bytes_downloaded: 0,
            total_bytes: 0,
            retry_count: 0,
            last_error: String::new(),
            start_time: Utc::now(),
            estimated_time_ns: 0,
        }
    }
}

/// A progress snapshot broadcast to observers; same shape as `DownloadRecord`.
pub type ProgressEvent = DownloadRecord;

#[derive(Debug, Serialize, Deserialize)]
struct RegistryFile {
    downloads: HashMap<String, DownloadRecord>,
    config: crate::config::Config,
    version: u32,
}

pub struct Registry {
    path: PathBuf,
    records: RwLock<HashMap<String, DownloadRecord>>,
    config: RwLock<crate::config::Config>,
}

impl Registry {
    pub fn new(path: PathBuf, config: crate::config::Config) -> Self {
        Self {
            path,
            records: RwLock::new(HashMap::new()),
            config: RwLock::new(config),
        }
    }

    pub async fn load(path: PathBuf, default_config: crate::config::Config) -> Result<Self, RegistryError> {
        if !path.exists() {
            let registry = Self::new(path, default_config);
            registry.save().await?;
            return Ok(registry);
        }
        let content = tokio::fs::read_to_string(&path).await.map_err(RegistryError::Read)?;
        let file: RegistryFile = serde_json::from_str(&content)?;
        Ok(Self {
            path,
            records: RwLock::new(file.downloads),
            config: RwLock::new(file.config),
        })
    }

    pub async fn save(&self) -> Result<(), RegistryError> {
        let file = RegistryFile {
            downloads: self.records.read().await.clone(),
            config: self.config.read().await.clone(),
            version: 1,
        };
        let json = serde_json::to_string_pretty(&file)?;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(RegistryError::Write)?;
            chmod(parent, DEFAULT_DIR_PERMISSIONS).await;
        }
        let tmp_path = self.path.with_extension("tmp");
        tokio::fs::write(&tmp_path, json).await.map_err(RegistryError::Write)?;
        tokio::fs::rename(&tmp_path, &self.path).await.map_err(RegistryError::Write)?;
        chmod(&self.path, DEFAULT_FILE_PERMISSIONS).await;
        Ok(())
    }

    pub async fn set_status(&self, id: &EpisodeId, status: Status) {
        if id.as_str().is_empty() {
            return;
        }
        let mut records = self.records.write().await;
        let record = records
            .entry(id.as_str().to_string())
            .or_insert_with(|| DownloadRecord::new(id.clone()));
        record.status = status;
    }

    pub async fn update_progress(&self, event: ProgressEvent) {
        let mut records = self.records.write().await;
        records.insert(event.episode_id.as_str().to_string(), event);
    }

    pub async fn get(&self, id: &EpisodeId) -> Option<DownloadRecord> {
        self.records.read().await.get(id.as_str()).cloned()
    }

    pub async fn get_all(&self) -> Vec<DownloadRecord> {
        self.records.read().await.values().cloned().collect()
    }

    pub async fn remove(&self, id: &EpisodeId) {
        self.records.write().await.remove(id.as_str());
    }

    pub async fn is_downloaded(&self, id: &EpisodeId) -> bool {
        matches!(
            self.records.read().await.get(id.as_str()).map(|r| r.status),
            Some(Status::Completed)
        )
    }

    pub async fn is_downloading(&self, id: &EpisodeId) -> bool {
        matches!(
            self.records.read().await.get(id.as_str()).map(|r| r.status),
            Some(Status::Queued) | Some(Status::Downloading)
        )
    }

    pub async fn get_config(&self) -> crate::config::Config {
        self.config.read().await.clone()
    }

    pub async fn set_config(&self, config: crate::config::Config) {
        *self.config.write().await = config;
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn episode_id() -> EpisodeId {
        EpisodeId::from_raw("abc123abc123abc1")
    }

    #[tokio::test]
    async fn set_status_upserts_record() {
        let registry = Registry::new(PathBuf::from("/tmp/unused-registry.json"), Config::default());
        let id = episode_id();
        registry.set_status(&id, Status::Downloading).await;
        let record = registry.get(&id).await.unwrap();
        assert_eq!(record.status, Status::Downloading);
    }

    #[tokio::test]
    async fn empty_id_is_ignored() {
        let registry = Registry::new(PathBuf::from("/tmp/unused-registry.json"), Config::default());
        let empty = EpisodeId::from_raw("");
        registry.set_status(&empty, Status::Downloading).await;
        assert!(registry.get(&empty).await.is_none());
    }

    #[tokio::test]
    async fn is_downloading_true_for_queued_and_downloading() {
        let registry = Registry::new(PathBuf::from("/tmp/unused-registry.json"), Config::default());
        let id = episode_id();
        registry.set_status(&id, Status::Queued).await;
        assert!(registry.is_downloading(&id).await);
        registry.set_status(&id, Status::Downloading).await;
        assert!(registry.is_downloading(&id).await);
        registry.set_status(&id, Status::Completed).await;
        assert!(!registry.is_downloading(&id).await);
    }

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("registry.json");
        let registry = Registry::new(path.clone(), Config::default());
        let id = episode_id();
        registry.set_status(&id, Status::Completed).await;
        registry.save().await.unwrap();

        let reloaded = Registry::load(path, Config::default()).await.unwrap();
        let record = reloaded.get(&id).await.unwrap();
        assert_eq!(record.status, Status::Completed);
    }

    #[tokio::test]
    async fn get_returns_defensive_copy() {
        let registry = Registry::new(PathBuf::from("/tmp/unused-registry.json"), Config::default());
        let id = episode_id();
        registry.set_status(&id, Status::Downloading).await;
        let mut copy = registry.get(&id).await.unwrap();
        copy.status = Status::Failed;
        let still_downloading = registry.get(&id).await.unwrap();
        assert_eq!(still_downloading.status, Status::Downloading);
    }
}
