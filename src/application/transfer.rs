use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::StreamExt;
use reqwest::Client;
use tokio::io::AsyncWriteExt;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::api::download_file_stream;
use crate::domain::{DownloadError, ResourceKey, TransferState};

/// Ceiling for progress while the body size is unknown.
const UNKNOWN_SIZE_CAP: f32 = 0.99;

#[derive(Debug, Clone, Copy)]
pub struct TransferOptions {
    /// Fail with `Timeout` when no data arrives for this long.
    pub idle_timeout: Duration,
    /// Chunk count at which an unknown-size estimate reaches 0.5.
    pub unknown_size_horizon: u32,
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(30),
            unknown_size_horizon: 16,
        }
    }
}

/// One download attempt of a single remote resource into a temp file.
///
/// The unit never retries; every failure is returned to the caller.
pub struct TransferUnit {
    key: ResourceKey,
    client: Client,
    options: TransferOptions,
    state: Mutex<TransferState>,
    cancel: CancellationToken,
}

impl TransferUnit {
    pub fn new(key: ResourceKey, client: Client, options: TransferOptions) -> Self {
        Self {
            key,
            client,
            options,
            state: Mutex::new(TransferState::Idle),
            cancel: CancellationToken::new(),
        }
    }

    pub fn key(&self) -> &ResourceKey {
        &self.key
    }

    pub fn state(&self) -> TransferState {
        self.lock().clone()
    }

    /// Signals the running stream to stop. The partial file is deleted by
    /// `start` before it returns `Cancelled`.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once [`TransferUnit::cancel`] has been called.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Streams `remote_url` into `temp_path`, calling `on_progress` with a
    /// non-decreasing fraction as chunks arrive. Returns the byte count.
    ///
    /// On any error the temp file is removed and the unit ends in `Failed`.
    /// On success the unit stays at `Downloading(1.0)` until the owner
    /// records the final location with [`TransferUnit::complete`].
    pub async fn start<F>(
        &self,
        remote_url: &str,
        temp_path: &Path,
        mut on_progress: F,
    ) -> Result<u64, DownloadError>
    where
        F: FnMut(f32),
    {
        let result = self.run(remote_url, temp_path, &mut on_progress).await;

        if let Err(e) = &result {
            if let Err(io) = tokio::fs::remove_file(temp_path).await {
                if io.kind() != std::io::ErrorKind::NotFound {
                    debug!(key = %self.key, error = %io, "failed to remove partial file");
                }
            }
            self.transition(TransferState::Failed(e.clone()));
        }
        result
    }

    /// Records the terminal success state.
    pub fn complete(&self, local_path: impl Into<std::path::PathBuf>) {
        self.transition(TransferState::Completed(local_path.into()));
    }

    /// Records a failure that happened after the bytes were received.
    pub fn fail(&self, error: DownloadError) {
        self.transition(TransferState::Failed(error));
    }

    async fn run<F>(
        &self,
        remote_url: &str,
        temp_path: &Path,
        on_progress: &mut F,
    ) -> Result<u64, DownloadError>
    where
        F: FnMut(f32),
    {
        let idle = self.options.idle_timeout;

        let (total, mut stream) = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(DownloadError::Cancelled),
            opened = timeout(idle, download_file_stream(&self.client, remote_url)) => {
                opened.map_err(|_| DownloadError::Timeout)??
            }
        };

        let mut file = tokio::fs::File::create(temp_path)
            .await
            .map_err(|e| DownloadError::StorageWrite(format!("Failed to create file: {}", e)))?;

        self.transition(TransferState::Downloading(0.0));
        debug!(key = %self.key, ?total, "transfer accepted");

        let mut received: u64 = 0;
        let mut chunks: u32 = 0;
        let mut last = 0.0f32;

        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(DownloadError::Cancelled),
                next = timeout(idle, stream.next()) => next.map_err(|_| DownloadError::Timeout)?,
            };

            let chunk = match next {
                Some(chunk) => chunk?,
                None => break,
            };

            file.write_all(&chunk)
                .await
                .map_err(|e| DownloadError::StorageWrite(format!("Write error: {}", e)))?;

            received += chunk.len() as u64;
            chunks = chunks.saturating_add(1);

            let fraction = self.fraction(received, total, chunks).max(last);
            if self.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }
            last = fraction;
            self.transition(TransferState::Downloading(fraction));
            on_progress(fraction);
        }

        file.flush()
            .await
            .and(file.sync_all().await)
            .map_err(|e| DownloadError::StorageWrite(format!("Failed to sync file: {}", e)))?;
        drop(file);

        if self.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }
        if last < 1.0 {
            self.transition(TransferState::Downloading(1.0));
            on_progress(1.0);
        }

        debug!(key = %self.key, bytes = received, "transfer finished");
        Ok(received)
    }

    fn fraction(&self, received: u64, total: Option<u64>, chunks: u32) -> f32 {
        match total {
            Some(0) => 1.0,
            Some(total) => (received as f64 / total as f64).min(1.0) as f32,
            None => {
                let horizon = self.options.unknown_size_horizon.max(1) as f32;
                let chunks = chunks as f32;
                (chunks / (chunks + horizon)).min(UNKNOWN_SIZE_CAP)
            }
        }
    }

    fn transition(&self, next: TransferState) {
        let mut state = self.lock();
        if state.is_terminal() {
            return;
        }
        *state = next;
    }

    fn lock(&self) -> MutexGuard<'_, TransferState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
