//! Configuration store (C1): tunables for the download engine and storage cleaner.

use crate::constants::filesystem::{DEFAULT_DIR_PERMISSIONS, DEFAULT_FILE_PERMISSIONS};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[cfg(unix)]
fn chmod(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(metadata) = std::fs::metadata(path) {
        let mut perms = metadata.permissions();
        perms.set_mode(mode);
        let _ = std::fs::set_permissions(path, perms);
    }
}

#[cfg(not(unix))]
fn chmod(_path: &Path, _mode: u32) {}

#[cfg(unix)]
async fn chmod_async(path: &Path, mode: u32) {
    use std::os::unix::fs::PermissionsExt;
    if let Ok(metadata) = tokio::fs::metadata(path).await {
        let mut perms = metadata.permissions();
        perms.set_mode(mode);
        let _ = tokio::fs::set_permissions(path, perms).await;
    }
}

#[cfg(not(unix))]
async fn chmod_async(_path: &Path, _mode: u32) {}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Read(#[source] std::io::Error),
    #[error("failed to write config file: {0}")]
    Write(#[source] std::io::Error),
    #[error("malformed config file: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("unable to determine a usable config directory")]
    NoConfigDir,
}

/// Download engine and cleaner tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub max_size_gb: u32,
    pub max_episodes_per_podcast: u32,
    pub auto_cleanup: bool,
    pub cleanup_days: u32,
    pub max_concurrent_downloads: usize,
    pub download_path: String,

    // MP3 compatibility options (finalize-time tagging, §4.6/§4.8)
    pub embed_id3_metadata: bool,
    pub download_artwork: bool,
    pub max_id3_comment: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_size_gb: 5,
            max_episodes_per_podcast: 10,
            auto_cleanup: true,
            cleanup_days: 30,
            max_concurrent_downloads: 3,
            download_path: String::new(),
            embed_id3_metadata: true,
            download_artwork: true,
            max_id3_comment: 200,
        }
    }
}

impl Config {
    /// Load from `path`, writing out defaults if the file does not exist yet.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            let content = std::fs::read_to_string(path).map_err(ConfigError::Read)?;
            let config: Config = serde_json::from_str(&content)?;
            Ok(config)
        } else {
            let config = Config::default();
            config.save(path)?;
            Ok(config)
        }
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(ConfigError::Write)?;
            chmod(parent, DEFAULT_DIR_PERMISSIONS);
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).map_err(ConfigError::Write)?;
        chmod(path, DEFAULT_FILE_PERMISSIONS);
        Ok(())
    }

    /// Default location for the config file under the platform config directory.
    pub fn default_config_path() -> Result<PathBuf, ConfigError> {
        let dirs = ProjectDirs::from("", "", "podcast-tui").ok_or(ConfigError::NoConfigDir)?;
        Ok(dirs.config_dir().join("download-config.json"))
    }

    /// Resolve the effective download root: explicit `download_path`, else
    /// `<music dir>/Podcasts`, else `<configDir>/downloads`.
    pub fn download_root(&self) -> Result<PathBuf, ConfigError> {
        if !self.download_path.is_empty() {
            return Ok(PathBuf::from(&self.download_path));
        }
        if let Some(user_dirs) = directories::UserDirs::new() {
            if let Some(audio_dir) = user_dirs.audio_dir() {
                return Ok(audio_dir.join("Podcasts"));
            }
        }
        let dirs = ProjectDirs::from("", "", "podcast-tui").ok_or(ConfigError::NoConfigDir)?;
        Ok(dirs.config_dir().join("downloads"))
    }

    /// Ensure the download root and its `temp/` staging directory exist.
    pub async fn ensure_dirs(&self) -> Result<PathBuf, ConfigError> {
        let root = self.download_root()?;
        tokio::fs::create_dir_all(root.join("temp"))
            .await
            .map_err(ConfigError::Write)?;
        chmod_async(&root, DEFAULT_DIR_PERMISSIONS).await;
        chmod_async(&root.join("temp"), DEFAULT_DIR_PERMISSIONS).await;
        Ok(root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.max_size_gb, 5);
        assert_eq!(config.max_episodes_per_podcast, 10);
        assert_eq!(config.max_concurrent_downloads, 3);
        assert!(config.auto_cleanup);
        assert_eq!(config.cleanup_days, 30);
        assert!(config.embed_id3_metadata);
        assert!(config.download_artwork);
        assert_eq!(config.max_id3_comment, 200);
    }

    #[test]
    fn round_trips_through_json() {
        let config = Config::default();
        let json = serde_json::to_string_pretty(&config).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(config, back);
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("download-config.json");
        let original = Config {
            max_size_gb: 2,
            ..Config::default()
        };
        original.save(&path).unwrap();
        let loaded = Config::load(&path).unwrap();
        assert_eq!(original, loaded);
    }

    #[test]
    fn load_creates_defaults_when_missing() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("download-config.json");
        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded, Config::default());
        assert!(path.exists());
    }

    #[test]
    fn explicit_download_path_wins() {
        let config = Config {
            download_path: "/srv/podcasts".to_string(),
            ..Config::default()
        };
        assert_eq!(config.download_root().unwrap(), PathBuf::from("/srv/podcasts"));
    }
}
