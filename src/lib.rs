//! Concurrent download, durable registry, and priority-ranked storage cleanup for a
//! terminal podcast client.
//!
//! This crate is the background engine an outer application (TUI, CLI, daemon)
//! embeds — it renders nothing and owns no subscription storage of its own. See
//! [`Manager`] for the entry point.

pub mod cleaner;
pub mod config;
pub mod constants;
pub mod fetcher;
pub mod manager;
pub mod model;
pub mod naming;
pub mod registry;
pub mod subscription;
pub mod tagging;

pub use cleaner::{CleanError, StorageManager, StorageStats};
pub use config::{Config, ConfigError};
pub use fetcher::{FetchError, Fetcher};
pub use manager::{DownloadRequest, Manager, ManagerError};
pub use model::{Episode, EpisodeId, Podcast};
pub use registry::{DownloadRecord, ProgressEvent, Registry, RegistryError, Status};
pub use subscription::SubscriptionPersister;
