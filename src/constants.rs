//! Module-organized constants for the download engine and storage cleaner, trimmed
//! to what this crate actually drives.

use std::time::Duration;

/// Network-related constants
pub mod network {
    use super::*;

    /// Per-attempt connect timeout.
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

    /// Per-attempt request timeout.
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

    /// Maximum number of redirects to follow.
    pub const MAX_REDIRECTS: usize = 10;

    /// User agent string for HTTP requests against podcast hosts.
    pub const USER_AGENT: &str = "Mozilla/5.0 (X11; Linux i686; rv:141.0) Gecko/20100101 Firefox/141.0";
}

/// File system-related constants
pub mod filesystem {
    /// Maximum podcast directory name length (cross-platform safe).
    pub const MAX_PODCAST_DIR_LEN: usize = 255;

    /// Maximum episode filename length, reserving room for the `.mp3` suffix.
    pub const MAX_EPISODE_NAME_LEN: usize = 251;

    /// Default permissions for created directories. Only applied on Unix targets;
    /// the value itself is platform-independent so callers don't need to cfg-gate
    /// the constant, only the `set_mode` call that consumes it.
    pub const DEFAULT_DIR_PERMISSIONS: u32 = 0o755;

    /// Default permissions for created files (Unix only, see above).
    pub const DEFAULT_FILE_PERMISSIONS: u32 = 0o644;

    /// Temporary file suffix used for atomic config/registry writes.
    pub const TEMP_FILE_SUFFIX: &str = ".tmp";
}

/// Download scheduling constants
pub mod downloads {
    /// Default number of concurrent downloads.
    pub const DEFAULT_CONCURRENT_DOWNLOADS: usize = 3;

    /// Minimum number of concurrent downloads (must be at least 1).
    pub const MIN_CONCURRENT_DOWNLOADS: usize = 1;

    /// Number of retries after the first attempt (6 total attempts).
    pub const MAX_RETRIES: u32 = 5;

    /// Backoff cap in seconds between retries.
    pub const MAX_BACKOFF_SECS: u64 = 16;

    /// Progress callback throttle interval (~4 Hz).
    pub const PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

    /// Bounded admission queue capacity.
    pub const QUEUE_CAPACITY: usize = 100;

    /// Bounded progress broadcast channel capacity.
    pub const PROGRESS_CHANNEL_CAPACITY: usize = 100;
}

/// Storage cleanup constants
pub mod storage {
    /// Default number of days to keep downloaded episodes before age-based cleanup.
    pub const DEFAULT_CLEANUP_DAYS: u32 = 30;

    /// Default per-podcast downloaded-episode cap.
    pub const DEFAULT_MAX_EPISODES_PER_PODCAST: u32 = 10;

    /// Default total storage cap in gigabytes.
    pub const DEFAULT_MAX_SIZE_GB: u32 = 5;

    /// Usage-based cleanup triggers at this fraction of the size cap.
    pub const USAGE_TRIGGER_FRACTION: f64 = 0.8;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constants_are_internally_consistent() {
        assert!(network::REQUEST_TIMEOUT > network::CONNECT_TIMEOUT);
        assert!(network::MAX_REDIRECTS > 0);
        assert!(!network::USER_AGENT.is_empty());

        assert!(downloads::MIN_CONCURRENT_DOWNLOADS > 0);
        assert!(downloads::DEFAULT_CONCURRENT_DOWNLOADS >= downloads::MIN_CONCURRENT_DOWNLOADS);
        assert!(downloads::MAX_RETRIES > 0);
        assert!(downloads::QUEUE_CAPACITY > 0);

        assert_eq!(filesystem::MAX_PODCAST_DIR_LEN, 255);
        assert!(filesystem::MAX_EPISODE_NAME_LEN < filesystem::MAX_PODCAST_DIR_LEN);

        assert!(storage::USAGE_TRIGGER_FRACTION > 0.0 && storage::USAGE_TRIGGER_FRACTION < 1.0);
        assert!(storage::DEFAULT_MAX_SIZE_GB > 0);
    }
}
