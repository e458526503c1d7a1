//! The data contract this crate operates on: plain `Episode`/`Podcast` values and the
//! deterministic fingerprint identifier derived from them.
//!
//! Persisting these values long-term is the embedding application's job (see
//! [`crate::subscription::SubscriptionPersister`]); this crate only mutates the
//! download-attached fields in place and hands the values back.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Stable identifier for an episode: the first 16 hex characters of
/// `SHA-256(podcast_url || '\0' || episode_url || '\0' || publish_timestamp)`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EpisodeId(String);

impl EpisodeId {
    pub fn new(podcast_url: &str, episode_url: &str, published: DateTime<Utc>) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(podcast_url.as_bytes());
        hasher.update(b"\0");
        hasher.update(episode_url.as_bytes());
        hasher.update(b"\0");
        hasher.update(published.timestamp().to_string().as_bytes());
        let digest = hasher.finalize();
        let hex = digest.iter().map(|b| format!("{:02x}", b)).collect::<String>();
        Self(hex[..16].to_string())
    }

    /// Wrap an already-computed fingerprint, e.g. when loading from the registry.
    pub fn from_raw(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EpisodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// An episode as known to the outer application, with the download-attached fields
/// this crate reads and mutates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Episode {
    pub id: EpisodeId,
    pub title: String,
    pub audio_url: String,
    pub published: DateTime<Utc>,

    #[serde(default)]
    pub downloaded: bool,
    #[serde(default)]
    pub local_path: Option<String>,
    #[serde(default)]
    pub download_size: u64,
    #[serde(default)]
    pub downloaded_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_played: Option<DateTime<Utc>>,
}

impl Episode {
    pub fn new(title: impl Into<String>, audio_url: impl Into<String>, published: DateTime<Utc>, podcast_url: &str) -> Self {
        let title = title.into();
        let audio_url = audio_url.into();
        let id = EpisodeId::new(podcast_url, &audio_url, published);
        Self {
            id,
            title,
            audio_url,
            published,
            downloaded: false,
            local_path: None,
            download_size: 0,
            downloaded_at: None,
            last_played: None,
        }
    }

    /// True only when the status flag agrees with the filesystem: mirrors the
    /// teacher's `Episode::is_downloaded` double-check.
    pub fn is_downloaded_on_disk(&self) -> bool {
        self.downloaded
            && self
                .local_path
                .as_ref()
                .is_some_and(|p| std::path::Path::new(p).is_file())
    }
}

/// A podcast as known to the outer application.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Podcast {
    pub title: String,
    pub feed_url: String,
    #[serde(default)]
    pub image_url: Option<String>,
    pub episodes: Vec<Episode>,
}

impl Podcast {
    pub fn downloaded_episodes(&self) -> impl Iterator<Item = &Episode> {
        self.episodes.iter().filter(|e| e.downloaded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(secs: i64) -> DateTime<Utc> {
        DateTime::from_timestamp(secs, 0).unwrap()
    }

    #[test]
    fn fingerprint_is_deterministic() {
        let a = EpisodeId::new("https://feed.example/p", "https://cdn.example/e1.mp3", ts(100));
        let b = EpisodeId::new("https://feed.example/p", "https://cdn.example/e1.mp3", ts(100));
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 16);
    }

    #[test]
    fn fingerprint_differs_for_distinct_episodes() {
        let a = EpisodeId::new("https://feed.example/p", "https://cdn.example/e1.mp3", ts(100));
        let b = EpisodeId::new("https://feed.example/p", "https://cdn.example/e2.mp3", ts(100));
        assert_ne!(a, b);
    }

    #[test]
    fn is_downloaded_on_disk_requires_both_flag_and_file() {
        let mut ep = Episode::new("Ep 1", "https://cdn.example/e1.mp3", ts(1), "https://feed.example/p");
        assert!(!ep.is_downloaded_on_disk());
        ep.downloaded = true;
        ep.local_path = Some("/nonexistent/path.mp3".into());
        assert!(!ep.is_downloaded_on_disk());
    }
}
