//! Storage manager / cleaner (C5): usage, age, and per-podcast-count cleanup phases.
//!
//! Receives the `Registry` and `Config` directly rather than holding a back-reference
//! to the `Manager` — there is no cyclic dependency between this component and C4.

use crate::model::Podcast;
use crate::registry::Registry;
use chrono::Utc;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CleanError {
    #[error("io error walking download root: {0}")]
    Io(#[source] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct StorageStats {
    #[serde(rename = "totalBytes")]
    pub total_bytes: u64,
    #[serde(rename = "totalGB")]
    pub total_gb: f64,
    #[serde(rename = "limitBytes")]
    pub limit_bytes: u64,
    #[serde(rename = "limitGB")]
    pub limit_gb: f64,
    #[serde(rename = "usagePercent")]
    pub usage_percent: f64,
    #[serde(rename = "episodeCount")]
    pub episode_count: usize,
}

pub struct StorageManager {
    root: PathBuf,
}

impl StorageManager {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Walk `root`, summing file sizes and excluding anything under `temp/` or with a
    /// `.tmp` extension. A missing root yields zero usage, not an error.
    pub async fn compute_usage(&self) -> Result<u64, CleanError> {
        if !self.root.exists() {
            return Ok(0);
        }
        let mut total = 0u64;
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let mut entries = match tokio::fs::read_dir(&dir).await {
                Ok(entries) => entries,
                Err(err) => return Err(CleanError::Io(err)),
            };
            while let Some(entry) = entries.next_entry().await.map_err(CleanError::Io)? {
                let path = entry.path();
                if path == self.root.join("temp") {
                    continue;
                }
                let file_type = entry.file_type().await.map_err(CleanError::Io)?;
                if file_type.is_dir() {
                    stack.push(path);
                } else if path.extension().and_then(|e| e.to_str()) != Some("tmp") {
                    if let Ok(meta) = entry.metadata().await {
                        total += meta.len();
                    }
                }
            }
        }
        Ok(total)
    }

    pub async fn stats(&self, registry: &Registry) -> Result<StorageStats, CleanError> {
        let config = registry.get_config().await;
        let total_bytes = self.compute_usage().await?;
        let limit_bytes = config.max_size_gb as u64 * 1024 * 1024 * 1024;
        let usage_percent = if limit_bytes > 0 {
            total_bytes as f64 / limit_bytes as f64
        } else {
            0.0
        };
        Ok(StorageStats {
            total_bytes,
            total_gb: total_bytes as f64 / (1024.0 * 1024.0 * 1024.0),
            limit_bytes,
            limit_gb: config.max_size_gb as f64,
            usage_percent,
            episode_count: registry.get_all().await.len(),
        })
    }

    /// Run the three cleanup phases in order, mutating `podcasts` in place and
    /// removing the corresponding registry records. Returns the number of episodes
    /// removed.
    pub async fn run_cleanup(&self, podcasts: &mut [Podcast], registry: &Registry) -> Result<usize, CleanError> {
        let config = registry.get_config().await;
        let mut removed = 0;

        if config.auto_cleanup {
            removed += self.usage_cleanup(podcasts, registry, &config).await?;
        }
        if config.cleanup_days > 0 {
            removed += self.age_cleanup(podcasts, registry, config.cleanup_days).await?;
        }
        if config.max_episodes_per_podcast > 0 {
            removed += self
                .per_podcast_cleanup(podcasts, registry, config.max_episodes_per_podcast as usize)
                .await?;
        }

        Ok(removed)
    }

    async fn usage_cleanup(
        &self,
        podcasts: &mut [Podcast],
        registry: &Registry,
        config: &crate::config::Config,
    ) -> Result<usize, CleanError> {
        let limit_bytes = config.max_size_gb as u64 * 1024 * 1024 * 1024;
        if limit_bytes == 0 {
            return Ok(0);
        }

        let mut usage = self.compute_usage().await?;
        if (usage as f64) < 0.8 * limit_bytes as f64 {
            return Ok(0);
        }

        let now = Utc::now();
        let mut candidates: Vec<(usize, usize, f64)> = Vec::new();
        for (pi, podcast) in podcasts.iter().enumerate() {
            for (ei, episode) in podcast.episodes.iter().enumerate() {
                if !episode.downloaded || episode.local_path.is_none() {
                    continue;
                }
                let days_since_download = episode
                    .downloaded_at
                    .map(|t| (now - t).num_days() as f64)
                    .unwrap_or(0.0);
                let recency_term = match episode.last_played {
                    None => 1000.0,
                    Some(played) => (now - played).num_days() as f64 * 0.5,
                };
                let size_mb = episode.download_size as f64 / (1024.0 * 1024.0);
                let priority = days_since_download * 0.1 + recency_term + size_mb * 0.01;
                candidates.push((pi, ei, priority));
            }
        }
        candidates.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap());

        let mut removed = 0;
        for (pi, ei, _) in candidates {
            if (usage as f64) < 0.8 * limit_bytes as f64 {
                break;
            }
            let episode = &mut podcasts[pi].episodes[ei];
            let size = episode.download_size;
            if remove_episode_file(episode).await {
                registry.remove(&episode.id).await;
                usage = usage.saturating_sub(size);
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn age_cleanup(
        &self,
        podcasts: &mut [Podcast],
        registry: &Registry,
        cleanup_days: u32,
    ) -> Result<usize, CleanError> {
        let cutoff = Utc::now() - chrono::Duration::days(cleanup_days as i64);
        let mut removed = 0;
        for podcast in podcasts.iter_mut() {
            for episode in podcast.episodes.iter_mut() {
                if !episode.downloaded {
                    continue;
                }
                let reference_time = episode.last_played.or(episode.downloaded_at);
                let is_stale = match reference_time {
                    Some(t) => t < cutoff,
                    None => false,
                };
                if is_stale && remove_episode_file(episode).await {
                    registry.remove(&episode.id).await;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }

    async fn per_podcast_cleanup(
        &self,
        podcasts: &mut [Podcast],
        registry: &Registry,
        limit: usize,
    ) -> Result<usize, CleanError> {
        let mut removed = 0;
        for podcast in podcasts.iter_mut() {
            let mut downloaded_indices: Vec<usize> = podcast
                .episodes
                .iter()
                .enumerate()
                .filter(|(_, e)| e.downloaded)
                .map(|(i, _)| i)
                .collect();

            if downloaded_indices.len() <= limit {
                continue;
            }

            downloaded_indices.sort_by_key(|&i| sort_key_never_played_first(&podcast.episodes[i]));

            let excess = downloaded_indices.len() - limit;
            for &idx in downloaded_indices.iter().take(excess) {
                let episode = &mut podcast.episodes[idx];
                if remove_episode_file(episode).await {
                    registry.remove(&episode.id).await;
                    removed += 1;
                }
            }
        }
        Ok(removed)
    }
}

fn sort_key_never_played_first(episode: &crate::model::Episode) -> (i64, i64) {
    match episode.last_played {
        Some(played) => (1, played.timestamp()),
        None => (0, episode.downloaded_at.map(|t| t.timestamp()).unwrap_or(0)),
    }
}

/// Remove the audio file and best-effort sidecar metadata, clearing download fields.
/// Returns `true` unless the audio file exists and fails to delete.
async fn remove_episode_file(episode: &mut crate::model::Episode) -> bool {
    let Some(path) = episode.local_path.clone() else {
        clear_download_fields(episode);
        return true;
    };

    let removed = tokio::fs::remove_file(&path).await;
    if removed.is_err() && Path::new(&path).exists() {
        if let Err(err) = removed {
            log::warn!("failed to remove {path}: {err}");
        }
        return false;
    }

    let sidecar = format!("{path}.json");
    let _ = tokio::fs::remove_file(sidecar).await;
    clear_download_fields(episode);
    true
}

fn clear_download_fields(episode: &mut crate::model::Episode) {
    episode.downloaded = false;
    episode.local_path = None;
    episode.download_size = 0;
    episode.downloaded_at = None;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::model::{Episode, EpisodeId, Podcast};
    use chrono::Duration;

    fn episode(id: &str, downloaded_days_ago: i64, last_played_days_ago: Option<i64>, size_mb: u64, path: Option<String>) -> Episode {
        let now = Utc::now();
        Episode {
            id: EpisodeId::from_raw(id),
            title: id.to_string(),
            audio_url: format!("https://cdn.example/{id}.mp3"),
            published: now,
            downloaded: true,
            local_path: path,
            download_size: size_mb * 1024 * 1024,
            downloaded_at: Some(now - Duration::days(downloaded_days_ago)),
            last_played: last_played_days_ago.map(|d| now - Duration::days(d)),
        }
    }

    #[tokio::test]
    async fn per_podcast_cleanup_keeps_recently_played_removes_never_played() {
        let dir = tempfile::TempDir::new().unwrap();
        for name in ["a.mp3", "b.mp3", "c.mp3", "d.mp3"] {
            tokio::fs::write(dir.path().join(name), b"x").await.unwrap();
        }

        let mut podcasts = vec![Podcast {
            title: "P".into(),
            feed_url: "https://feed.example/p".into(),
            image_url: None,
            episodes: vec![
                episode("a", 4, Some(4), 1, Some(dir.path().join("a.mp3").to_string_lossy().to_string())),
                episode("b", 2, Some(2), 1, Some(dir.path().join("b.mp3").to_string_lossy().to_string())),
                episode("c", 5, None, 1, Some(dir.path().join("c.mp3").to_string_lossy().to_string())),
                episode("d", 1, Some(1), 1, Some(dir.path().join("d.mp3").to_string_lossy().to_string())),
            ],
        }];

        let config = Config { max_episodes_per_podcast: 2, auto_cleanup: false, cleanup_days: 0, ..Config::default() };
        let registry = Registry::new(dir.path().join("registry.json"), config);
        let manager = StorageManager::new(dir.path().to_path_buf());

        let removed = manager.run_cleanup(&mut podcasts, &registry).await.unwrap();
        assert_eq!(removed, 2);

        let downloaded_titles: Vec<_> = podcasts[0]
            .episodes
            .iter()
            .filter(|e| e.downloaded)
            .map(|e| e.title.clone())
            .collect();
        assert_eq!(downloaded_titles, vec!["b", "d"]);
    }

    #[tokio::test]
    async fn age_cleanup_removes_stale_never_played() {
        let dir = tempfile::TempDir::new().unwrap();
        tokio::fs::write(dir.path().join("old.mp3"), b"x").await.unwrap();

        let mut podcasts = vec![Podcast {
            title: "P".into(),
            feed_url: "https://feed.example/p".into(),
            image_url: None,
            episodes: vec![episode(
                "old",
                40,
                None,
                1,
                Some(dir.path().join("old.mp3").to_string_lossy().to_string()),
            )],
        }];

        let config = Config { cleanup_days: 30, auto_cleanup: false, max_episodes_per_podcast: 0, ..Config::default() };
        let registry = Registry::new(dir.path().join("registry.json"), config);
        let manager = StorageManager::new(dir.path().to_path_buf());

        let removed = manager.run_cleanup(&mut podcasts, &registry).await.unwrap();
        assert_eq!(removed, 1);
        assert!(!podcasts[0].episodes[0].downloaded);
    }

    #[tokio::test]
    async fn missing_root_yields_zero_usage() {
        let manager = StorageManager::new(PathBuf::from("/nonexistent/root/for/test"));
        assert_eq!(manager.compute_usage().await.unwrap(), 0);
    }
}
