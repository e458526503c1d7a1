//! Fetcher (C3): single-file HTTP download with throttled progress, write-to-temp-
//! then-rename finalization, and cooperative cancellation.

use crate::constants::{
    downloads::PROGRESS_INTERVAL,
    filesystem::{DEFAULT_DIR_PERMISSIONS, DEFAULT_FILE_PERMISSIONS},
    network,
};
use futures_util::StreamExt;
use std::path::{Path, PathBuf};
use std::time::Instant;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

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
pub enum FetchError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("server returned status {0}")]
    BadStatus(reqwest::StatusCode),
    #[error("io error: {0}")]
    Io(#[source] std::io::Error),
    #[error("download cancelled")]
    Cancelled,
}

/// Progress callback: `(bytes_downloaded, total_bytes (0 if unknown), speed_bytes_per_sec)`.
pub type ProgressCallback<'a> = Box<dyn FnMut(u64, u64, u64) + Send + 'a>;

pub struct Fetcher {
    client: reqwest::Client,
}

impl Fetcher {
    pub fn new() -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .timeout(network::REQUEST_TIMEOUT)
            .connect_timeout(network::CONNECT_TIMEOUT)
            .redirect(reqwest::redirect::Policy::limited(network::MAX_REDIRECTS))
            .user_agent(network::USER_AGENT)
            .build()?;
        Ok(Self { client })
    }

    /// The underlying HTTP client, reused by the finalize-time artwork fetch so it
    /// shares the same connection pool and `User-Agent`.
    pub fn http_client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Best-effort content-length probe; `None` when the server doesn't report one.
    pub async fn probe_size(&self, url: &str) -> Option<u64> {
        let response = self.client.get(url).send().await.ok()?;
        response.content_length()
    }

    /// Stream `url` into `temp_dir/filename`, then atomically rename into
    /// `final_dir/filename` on success. Returns the final path and byte count.
    pub async fn download(
        &self,
        url: &str,
        temp_dir: &Path,
        final_dir: &Path,
        filename: &str,
        cancel: &CancellationToken,
        mut on_progress: ProgressCallback<'_>,
    ) -> Result<(PathBuf, u64), FetchError> {
        let response = self.client.get(url).send().await?;
        let response = response.error_for_status().map_err(|e| {
            e.status()
                .map(FetchError::BadStatus)
                .unwrap_or_else(|| FetchError::Http(e))
        })?;

        let total = response.content_length().unwrap_or(0);
        let temp_path = temp_dir.join(filename);

        tokio::fs::create_dir_all(temp_dir).await.map_err(FetchError::Io)?;
        chmod(temp_dir, DEFAULT_DIR_PERMISSIONS).await;
        let mut file = tokio::fs::File::create(&temp_path).await.map_err(FetchError::Io)?;

        let mut stream = response.bytes_stream();
        let mut downloaded: u64 = 0;
        let mut last_report = Instant::now();
        let mut window_start = Instant::now();
        let mut window_bytes: u64 = 0;

        loop {
            let next_chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    drop(file);
                    let _ = tokio::fs::remove_file(&temp_path).await;
                    return Err(FetchError::Cancelled);
                }
                chunk = stream.next() => chunk,
            };

            let Some(chunk) = next_chunk else { break };
            let chunk = chunk?;
            file.write_all(&chunk).await.map_err(FetchError::Io)?;
            downloaded += chunk.len() as u64;
            window_bytes += chunk.len() as u64;

            if last_report.elapsed() >= PROGRESS_INTERVAL {
                let elapsed = window_start.elapsed().as_secs_f64().max(0.001);
                let speed = (window_bytes as f64 / elapsed) as u64;
                on_progress(downloaded, total, speed);
                last_report = Instant::now();
                window_start = Instant::now();
                window_bytes = 0;
            }
        }

        file.flush().await.map_err(FetchError::Io)?;
        drop(file);

        on_progress(downloaded, total, 0);

        tokio::fs::create_dir_all(final_dir).await.map_err(FetchError::Io)?;
        chmod(final_dir, DEFAULT_DIR_PERMISSIONS).await;
        let final_path = final_dir.join(filename);
        tokio::fs::rename(&temp_path, &final_path).await.map_err(FetchError::Io)?;
        chmod(&final_path, DEFAULT_FILE_PERMISSIONS).await;

        Ok((final_path, downloaded))
    }

    pub async fn cleanup_temp(&self, temp_dir: &Path, filename: &str) {
        let path = temp_dir.join(filename);
        let _ = tokio::fs::remove_file(path).await;
    }
}
