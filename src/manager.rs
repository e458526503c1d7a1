//! Manager (C4): bounded worker pool, admission control, retry/backoff, progress
//! fan-out, and reconciliation between the registry and the filesystem.

use crate::cleaner::{CleanError, StorageManager, StorageStats};
use crate::constants::downloads::{MAX_RETRIES, PROGRESS_CHANNEL_CAPACITY, QUEUE_CAPACITY};
use crate::constants::filesystem::DEFAULT_DIR_PERMISSIONS;
use crate::fetcher::{FetchError, Fetcher};
use crate::model::{Episode, EpisodeId, Podcast};
use crate::naming::{episode_filename, podcast_dir_name};
use crate::registry::{ProgressEvent, Registry, Status};
use crate::subscription::SubscriptionPersister;
use crate::tagging;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const PERSIST_INTERVAL: Duration = Duration::from_secs(10);

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
pub enum ManagerError {
    #[error("manager is already running")]
    AlreadyRunning,
    #[error("manager is not running")]
    NotRunning,
    #[error("episode is already downloading or queued")]
    AlreadyInProgress,
    #[error("episode is already downloaded")]
    AlreadyDownloaded,
    #[error("download queue is full")]
    QueueFull,
    #[error(transparent)]
    Registry(#[from] crate::registry::RegistryError),
    #[error(transparent)]
    Config(#[from] crate::config::ConfigError),
    #[error("failed to build http client: {0}")]
    Fetch(#[from] FetchError),
    #[error("failed to prepare download directory: {0}")]
    Io(#[source] std::io::Error),
    #[error(transparent)]
    Clean(#[from] CleanError),
    #[error("failed to persist subscriptions: {0}")]
    Persist(#[source] Box<dyn std::error::Error + Send + Sync>),
}

/// What the caller wants downloaded; episode/podcast metadata the worker needs to
/// name the file, derive the fingerprint, and (optionally) tag the finished file.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub episode_id: EpisodeId,
    pub episode_title: String,
    pub audio_url: String,
    pub published: DateTime<Utc>,
    pub podcast_title: String,
    pub podcast_image_url: Option<String>,
}

struct DownloadTask {
    request: DownloadRequest,
    #[allow(dead_code)] // extension point per the spec's open question on task priority
    priority: i32,
    cancel: CancellationToken,
}

struct ActiveTask {
    cancel: CancellationToken,
    temp_filename: String,
}

pub struct Manager {
    root: PathBuf,
    registry: Arc<Registry>,
    fetcher: Arc<Fetcher>,
    cleaner: StorageManager,
    queue_tx: Mutex<mpsc::Sender<DownloadTask>>,
    progress_tx: broadcast::Sender<ProgressEvent>,
    active: Mutex<HashMap<String, ActiveTask>>,
    completed_paths: Mutex<HashMap<String, PathBuf>>,
    running: Mutex<bool>,
    stop_token: Mutex<Option<CancellationToken>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Manager {
    pub fn new(root: PathBuf, registry: Arc<Registry>) -> Result<Arc<Self>, ManagerError> {
        let fetcher = Arc::new(Fetcher::new()?);
        let cleaner = StorageManager::new(root.clone());
        // Placeholder channel; `start()` creates a fresh pair each time it runs so a
        // stop()-then-start() cycle never reuses an already-drained receiver.
        let (queue_tx, queue_rx) = mpsc::channel(QUEUE_CAPACITY);
        drop(queue_rx);
        let (progress_tx, _) = broadcast::channel(PROGRESS_CHANNEL_CAPACITY);
        Ok(Arc::new(Self {
            root,
            registry,
            fetcher,
            cleaner,
            queue_tx: Mutex::new(queue_tx),
            progress_tx,
            active: Mutex::new(HashMap::new()),
            completed_paths: Mutex::new(HashMap::new()),
            running: Mutex::new(false),
            stop_token: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
        }))
    }

    pub async fn start(self: &Arc<Self>) -> Result<(), ManagerError> {
        let mut running = self.running.lock().await;
        if *running {
            return Err(ManagerError::AlreadyRunning);
        }

        let config = self.registry.get_config().await;
        tokio::fs::create_dir_all(self.root.join("temp")).await.map_err(ManagerError::Io)?;
        chmod(&self.root, DEFAULT_DIR_PERMISSIONS).await;
        chmod(&self.root.join("temp"), DEFAULT_DIR_PERMISSIONS).await;

        self.reset_stuck_downloads().await;

        let stop_token = CancellationToken::new();
        let (queue_tx, mut rx) = mpsc::channel(QUEUE_CAPACITY);
        *self.queue_tx.lock().await = queue_tx;

        let concurrency = config.max_concurrent_downloads.max(1);
        let mut handles = Vec::with_capacity(concurrency + 1);

        // A single dequeue loop hands tasks to a bounded pool of in-flight workers via
        // a semaphore, avoiding N separate receivers on one mpsc channel.
        let semaphore = Arc::new(tokio::sync::Semaphore::new(concurrency));
        let self_clone = Arc::clone(self);
        let dispatch_stop = stop_token.clone();
        let dispatch_handle = tokio::spawn(async move {
            loop {
                let task = tokio::select! {
                    _ = dispatch_stop.cancelled() => break,
                    task = rx.recv() => match task {
                        Some(task) => task,
                        None => break,
                    },
                };
                let permit = match Arc::clone(&semaphore).acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };
                let worker_self = Arc::clone(&self_clone);
                tokio::spawn(async move {
                    worker_self.run_task(task).await;
                    drop(permit);
                });
            }
        });
        handles.push(dispatch_handle);

        let persist_registry = Arc::clone(&self.registry);
        let persist_stop = stop_token.clone();
        let persist_handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(PERSIST_INTERVAL);
            loop {
                tokio::select! {
                    _ = persist_stop.cancelled() => break,
                    _ = interval.tick() => {
                        if let Err(err) = persist_registry.save().await {
                            log::warn!("periodic registry save failed: {err}");
                        }
                    }
                }
            }
        });
        handles.push(persist_handle);

        *self.workers.lock().await = handles;
        *self.stop_token.lock().await = Some(stop_token);
        *running = true;
        Ok(())
    }

    pub async fn stop(self: &Arc<Self>) -> Result<(), ManagerError> {
        let mut running = self.running.lock().await;
        if !*running {
            return Err(ManagerError::NotRunning);
        }

        if let Some(token) = self.stop_token.lock().await.take() {
            token.cancel();
        }
        for (_, active) in self.active.lock().await.drain() {
            active.cancel.cancel();
        }

        let handles = std::mem::take(&mut *self.workers.lock().await);
        for handle in handles {
            let _ = handle.await;
        }

        self.registry.save().await?;
        *running = false;
        Ok(())
    }

    pub async fn enqueue(&self, request: DownloadRequest) -> Result<(), ManagerError> {
        self.enqueue_with_priority(request, 0).await
    }

    pub async fn enqueue_with_priority(&self, request: DownloadRequest, priority: i32) -> Result<(), ManagerError> {
        if !*self.running.lock().await {
            return Err(ManagerError::NotRunning);
        }
        if self.registry.is_downloaded(&request.episode_id).await {
            return Err(ManagerError::AlreadyDownloaded);
        }
        if self.registry.is_downloading(&request.episode_id).await {
            return Err(ManagerError::AlreadyInProgress);
        }

        self.registry.set_status(&request.episode_id, Status::Queued).await;
        let cancel = CancellationToken::new();
        let temp_filename = episode_filename(&request.episode_title, &request.episode_id);
        self.active.lock().await.insert(
            request.episode_id.as_str().to_string(),
            ActiveTask { cancel: cancel.clone(), temp_filename },
        );

        let task = DownloadTask { request, priority, cancel };
        self.queue_tx.lock().await.try_send(task).map_err(|_| ManagerError::QueueFull)
    }

    pub async fn cancel(&self, id: &EpisodeId) {
        if let Some(active) = self.active.lock().await.remove(id.as_str()) {
            active.cancel.cancel();
            self.fetcher.cleanup_temp(&self.root.join("temp"), &active.temp_filename).await;
        }
        self.registry.set_status(id, Status::Cancelled).await;
    }

    pub async fn get_progress(&self, id: &EpisodeId) -> Option<ProgressEvent> {
        self.registry.get(id).await
    }

    pub async fn get_all(&self) -> Vec<ProgressEvent> {
        self.registry.get_all().await
    }

    /// True if the registry says `completed` and the file genuinely exists. A
    /// completed record whose cached path isn't known (e.g. right after the process
    /// restarted and a download finished in a previous run) falls back to a bounded
    /// probe of `root`'s immediate subdirectories rather than trusting the registry
    /// status alone, so a file deleted out-of-band is never reported as downloaded.
    pub async fn is_downloaded(&self, id: &EpisodeId) -> bool {
        let Some(record) = self.registry.get(id).await else {
            return false;
        };
        if record.status != Status::Completed {
            return false;
        }

        if let Some(path) = self.completed_paths.lock().await.get(id.as_str()).cloned() {
            if tokio::fs::metadata(&path).await.is_ok() {
                return true;
            }
        }
        self.probe_for_completed_file(id).await
    }

    /// Bounded filesystem probe: descends one level into `root` (skipping `temp/`)
    /// looking for the episode's fallback filename, the name the sanitizer in
    /// `naming.rs` falls back to when a title sanitizes to empty. This deliberately
    /// does not walk the whole tree — only the known deterministic fallback path.
    async fn probe_for_completed_file(&self, id: &EpisodeId) -> bool {
        let Ok(mut entries) = tokio::fs::read_dir(&self.root).await else {
            return false;
        };
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.file_name().and_then(|n| n.to_str()) == Some("temp") {
                continue;
            }
            let candidate = path.join(format!("{}.mp3", id.as_str()));
            if tokio::fs::metadata(&candidate).await.is_ok() {
                return true;
            }
        }
        false
    }

    /// Reconcile a specific episode against the filesystem: repairs both the registry
    /// and the episode value when they disagree with what's actually on disk, and
    /// promotes an on-disk-but-untracked file to completed.
    pub async fn is_episode_downloaded(&self, episode: &mut Episode, podcast_title: &str) -> bool {
        let claimed = episode.downloaded || self.registry.is_downloaded(&episode.id).await;

        if claimed {
            let on_disk = episode
                .local_path
                .as_ref()
                .is_some_and(|p| std::path::Path::new(p).is_file());
            if on_disk {
                if let Some(path) = &episode.local_path {
                    self.completed_paths
                        .lock()
                        .await
                        .insert(episode.id.as_str().to_string(), PathBuf::from(path));
                }
                return true;
            }
            episode.downloaded = false;
            episode.local_path = None;
            episode.download_size = 0;
            self.registry.remove(&episode.id).await;
            self.completed_paths.lock().await.remove(episode.id.as_str());
            return false;
        }

        let candidate = self
            .root
            .join(podcast_dir_name(podcast_title))
            .join(episode_filename(&episode.title, &episode.id));
        if let Ok(meta) = tokio::fs::metadata(&candidate).await {
            episode.downloaded = true;
            episode.local_path = Some(candidate.to_string_lossy().to_string());
            episode.download_size = meta.len();
            self.registry.set_status(&episode.id, Status::Completed).await;
            self.completed_paths
                .lock()
                .await
                .insert(episode.id.as_str().to_string(), candidate);
            return true;
        }

        false
    }

    /// Removes a record from the registry without touching the filesystem — the
    /// caller's responsibility if the backing file should go too.
    pub async fn remove_from_registry(&self, id: &EpisodeId) {
        self.registry.remove(id).await;
        self.completed_paths.lock().await.remove(id.as_str());
    }

    /// Runs the storage cleanup phases (§4.5) over `podcasts`, then persists the
    /// mutated list via `persister` — the Manager never owns subscription storage.
    pub async fn trigger_cleanup<P: SubscriptionPersister>(
        &self,
        podcasts: &mut [Podcast],
        persister: &P,
    ) -> Result<usize, ManagerError> {
        let removed = self.cleaner.run_cleanup(podcasts, &self.registry).await?;
        persister
            .save_all(podcasts)
            .await
            .map_err(|err| ManagerError::Persist(Box::new(err)))?;
        Ok(removed)
    }

    pub async fn get_storage_stats(&self) -> Result<StorageStats, ManagerError> {
        Ok(self.cleaner.stats(&self.registry).await?)
    }

    pub fn subscribe_progress(&self) -> broadcast::Receiver<ProgressEvent> {
        self.progress_tx.subscribe()
    }

    pub fn download_root(&self) -> &std::path::Path {
        &self.root
    }

    async fn reset_stuck_downloads(&self) {
        for record in self.registry.get_all().await {
            if matches!(record.status, Status::Queued | Status::Downloading) {
                self.registry.set_status(&record.episode_id, Status::Failed).await;
            }
        }
    }

    async fn run_task(&self, task: DownloadTask) {
        let id = task.request.episode_id.clone();
        let podcast_dir = podcast_dir_name(&task.request.podcast_title);
        let filename = episode_filename(&task.request.episode_title, &id);
        let final_dir = self.root.join(&podcast_dir);
        let temp_dir = self.root.join("temp");

        // Progress ticks for this episode are pushed onto an unbounded queue and
        // drained by this single task, in send order, so two ticks from the same
        // download can never race each other into the registry or the broadcast.
        let (update_tx, mut update_rx) = mpsc::unbounded_channel::<ProgressEvent>();
        let drain_registry = Arc::clone(&self.registry);
        let drain_progress_tx = self.progress_tx.clone();
        let drain_handle = tokio::spawn(async move {
            while let Some(event) = update_rx.recv().await {
                drain_registry.update_progress(event.clone()).await;
                let _ = drain_progress_tx.send(event);
            }
        });

        let start_time = Utc::now();
        let mut attempt = 0u32;
        let outcome = loop {
            self.registry.set_status(&id, Status::Downloading).await;
            self.update_retry_count(&id, attempt).await;

            let config = self.registry.get_config().await;
            let max_comment = config.max_id3_comment;

            let callback_id = id.clone();
            let callback_tx = update_tx.clone();
            let on_progress = Box::new(move |downloaded: u64, total: u64, speed: u64| {
                let progress = if total > 0 { downloaded as f64 / total as f64 } else { 0.0 };
                let eta_ns = if speed > 0 && total > downloaded {
                    ((total - downloaded) as f64 / speed as f64 * 1_000_000_000.0) as u64
                } else {
                    0
                };
                let mut event = crate::registry::DownloadRecord::new(callback_id.clone());
                event.status = Status::Downloading;
                event.progress = progress;
                event.speed = speed;
                event.bytes_downloaded = downloaded;
                event.total_bytes = total;
                event.estimated_time_ns = eta_ns;
                event.start_time = start_time;
                let _ = callback_tx.send(event);
            });

            let result = self
                .fetcher
                .download(&task.request.audio_url, &temp_dir, &final_dir, &filename, &task.cancel, on_progress)
                .await;

            match result {
                Ok((path, size)) => {
                    if config.embed_id3_metadata || config.download_artwork {
                        self.finalize_tags(&path, &task.request, max_comment, config.download_artwork).await;
                    }
                    break Ok((path, size));
                }
                Err(FetchError::Cancelled) => break Err(FetchError::Cancelled),
                Err(err) if attempt >= MAX_RETRIES => break Err(err),
                Err(err) => {
                    log::warn!("attempt {attempt} failed for {}: {err}", task.request.episode_title);
                    let backoff = Duration::from_secs(1u64 << attempt.min(4)); // min(2^(k-1), 16) for k=attempt+1
                    tokio::select! {
                        _ = task.cancel.cancelled() => break Err(FetchError::Cancelled),
                        _ = tokio::time::sleep(backoff) => {}
                    }
                    attempt += 1;
                    continue;
                }
            }
        };

        drop(update_tx);
        let _ = drain_handle.await;

        self.active.lock().await.remove(id.as_str());

        match outcome {
            Ok((path, size)) => {
                let mut record = crate::registry::DownloadRecord::new(id.clone());
                record.status = Status::Completed;
                record.progress = 1.0;
                record.bytes_downloaded = size;
                record.total_bytes = size;
                record.start_time = start_time;
                self.registry.update_progress(record.clone()).await;
                let _ = self.progress_tx.send(record);
                self.completed_paths.lock().await.insert(id.as_str().to_string(), path);
            }
            Err(FetchError::Cancelled) => {
                self.registry.set_status(&id, Status::Cancelled).await;
            }
            Err(err) => {
                let mut record = self.registry.get(&id).await.unwrap_or_else(|| crate::registry::DownloadRecord::new(id.clone()));
                record.status = Status::Failed;
                record.last_error = err.to_string();
                self.registry.update_progress(record.clone()).await;
                let _ = self.progress_tx.send(record);
            }
        }
    }

    async fn update_retry_count(&self, id: &EpisodeId, attempt: u32) {
        if let Some(mut record) = self.registry.get(id).await {
            record.retry_count = attempt;
            self.registry.update_progress(record).await;
        }
    }

    async fn finalize_tags(&self, path: &std::path::Path, request: &DownloadRequest, max_comment: usize, download_artwork: bool) {
        let podcast = crate::model::Podcast {
            title: request.podcast_title.clone(),
            feed_url: String::new(),
            image_url: request.podcast_image_url.clone(),
            episodes: Vec::new(),
        };
        let episode = Episode {
            id: request.episode_id.clone(),
            title: request.episode_title.clone(),
            audio_url: request.audio_url.clone(),
            published: request.published,
            downloaded: true,
            local_path: Some(path.to_string_lossy().to_string()),
            download_size: 0,
            downloaded_at: Some(Utc::now()),
            last_played: None,
        };
        tagging::embed_id3_metadata(path, &podcast, &episode, max_comment);
        if download_artwork {
            tagging::embed_artwork(path, &podcast, self.fetcher.http_client()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn request(server_uri: &str, name: &str) -> DownloadRequest {
        DownloadRequest {
            episode_id: EpisodeId::from_raw(name),
            episode_title: name.to_string(),
            audio_url: format!("{server_uri}/{name}.mp3"),
            published: Utc::now(),
            podcast_title: "Test Podcast".to_string(),
            podcast_image_url: None,
        }
    }

    async fn manager_with_root(root: PathBuf) -> Arc<Manager> {
        let registry = Arc::new(Registry::new(root.join("registry.json"), Config::default()));
        Manager::new(root, registry).unwrap()
    }

    #[tokio::test]
    async fn successful_download_completes_and_writes_file() {
        let server = MockServer::start().await;
        let body = vec![9u8; 1024];
        Mock::given(method("GET"))
            .and(path("/ep1.mp3"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(body.clone()))
            .mount(&server)
            .await;

        let dir = tempfile::TempDir::new().unwrap();
        let manager = manager_with_root(dir.path().to_path_buf()).await;
        manager.start().await.unwrap();

        let req = request(&server.uri(), "ep1");
        let id = req.episode_id.clone();
        manager.enqueue(req).await.unwrap();

        let mut completed = false;
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if let Some(record) = manager.get_progress(&id).await {
                if record.status == Status::Completed {
                    completed = true;
                    break;
                }
            }
        }
        assert!(completed, "download did not complete in time");
        manager.stop().await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_enqueue_is_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/dup.mp3"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(200)).set_body_bytes(vec![1u8; 10]))
            .mount(&server)
            .await;

        let dir = tempfile::TempDir::new().unwrap();
        let manager = manager_with_root(dir.path().to_path_buf()).await;
        manager.start().await.unwrap();

        let req = request(&server.uri(), "dup");
        manager.enqueue(req.clone()).await.unwrap();
        let second = manager.enqueue(req).await;
        assert!(matches!(second, Err(ManagerError::AlreadyInProgress)));
        manager.stop().await.unwrap();
    }
}
