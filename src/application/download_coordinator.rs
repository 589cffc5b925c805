use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use reqwest::Client;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::entitlement::EntitlementGate;
use super::progress::{ProgressBroadcaster, ProgressEvent, ProgressListener};
use super::transfer::{TransferOptions, TransferUnit};
use crate::api::{ApiClient, Billing, Catalog, TrackMetadata};
use crate::config::DownloaderConfig;
use crate::domain::{
    CacheEntry, DownloadError, DownloadOutcome, DownloadPlan, DownloadRequest, ResourceKey,
    TransferState,
};
use crate::storage::{CacheError, CacheStore};
use crate::utils::resolve_file_name;

#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    pub transfer: TransferOptions,
    /// Extension used when the remote URL has none.
    pub default_extension: String,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            transfer: TransferOptions::default(),
            default_extension: "mp3".to_string(),
        }
    }
}

impl From<&DownloaderConfig> for CoordinatorOptions {
    fn from(config: &DownloaderConfig) -> Self {
        Self {
            transfer: TransferOptions {
                idle_timeout: config.idle_timeout(),
                unknown_size_horizon: config.unknown_size_horizon,
            },
            default_extension: config.default_extension.clone(),
        }
    }
}

struct ActiveTransfer {
    unit: Arc<TransferUnit>,
    outcome: watch::Receiver<Option<DownloadOutcome>>,
}

struct Inner {
    catalog: Arc<dyn Catalog>,
    gate: EntitlementGate,
    cache: Arc<CacheStore>,
    progress: ProgressBroadcaster,
    http: Client,
    options: CoordinatorOptions,
    active: Mutex<HashMap<ResourceKey, ActiveTransfer>>,
}

/// Entry point of the download core.
///
/// `request_download` is idempotent: every call re-evaluates cache,
/// entitlement and in-flight state from scratch, so retrying is simply
/// calling it again. At most one transfer runs per resource key; later
/// callers for the same key attach to the running one.
#[derive(Clone)]
pub struct DownloadCoordinator {
    inner: Arc<Inner>,
}

impl DownloadCoordinator {
    pub fn new(
        catalog: Arc<dyn Catalog>,
        billing: Arc<dyn Billing>,
        cache: CacheStore,
        http: Client,
        options: CoordinatorOptions,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                catalog,
                gate: EntitlementGate::new(billing),
                cache: Arc::new(cache),
                progress: ProgressBroadcaster::new(),
                http,
                options,
                active: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Wires the HTTP catalog and billing clients and opens the cache
    /// directory named by `config`.
    pub fn from_config(config: &DownloaderConfig) -> Result<Self, CacheError> {
        let api = Arc::new(ApiClient::new(config.api_config()));
        let cache = CacheStore::open(&config.cache_dir)?;
        let http = api.http().clone();
        Ok(Self::new(api.clone(), api, cache, http, config.into()))
    }

    pub fn progress(&self) -> &ProgressBroadcaster {
        &self.inner.progress
    }

    pub fn cache(&self) -> &CacheStore {
        &self.inner.cache
    }

    /// Downloads `request.resource_id` for `request.user_id`, or returns the
    /// cached copy. `listener` receives progress for the transfer this call
    /// starts or attaches to, followed by exactly one terminal event.
    pub async fn request_download(
        &self,
        request: DownloadRequest,
        listener: Option<ProgressListener>,
    ) -> DownloadOutcome {
        let inner = &self.inner;
        let key = ResourceKey::from_resource_id(&request.resource_id);

        if let Some(entry) = inner.cache.get(&key) {
            debug!(%key, "already downloaded");
            return completed(entry, listener.as_ref());
        }

        let description = format!("Download of \"{}\"", request.title);
        let entitlement = match inner
            .gate
            .check(&request.user_id, &request.resource_id, &description)
            .await
        {
            Ok(entitlement) => entitlement,
            Err(error) => {
                warn!(%key, reason = %error.reason_code(), "entitlement check failed");
                return failed(error, listener.as_ref());
            }
        };

        if !entitlement.authorized {
            info!(%key, user_id = %request.user_id, status = %entitlement.status, "download blocked by entitlement");
            let error = DownloadError::EntitlementDenied {
                status: entitlement.status,
                invoice_id: entitlement.invoice_id.unwrap_or_default(),
            };
            return failed(error, listener.as_ref());
        }

        let (mut outcome, started) = {
            let mut active = inner.lock_active();
            if let Some(transfer) = active.get(&key) {
                debug!(%key, "attaching to running transfer");
                if let Some(listener) = listener {
                    inner.progress.subscribe(&key, listener);
                }
                (transfer.outcome.clone(), None)
            } else if let Some(entry) = inner.cache.get(&key) {
                // A transfer for this key finished while we were checking.
                drop(active);
                return completed(entry, listener.as_ref());
            } else {
                let unit = Arc::new(TransferUnit::new(
                    key.clone(),
                    inner.http.clone(),
                    inner.options.transfer,
                ));
                let (tx, rx) = watch::channel(None);

                inner.progress.open(&key);
                if let Some(listener) = listener {
                    inner.progress.subscribe(&key, listener);
                }
                active.insert(
                    key.clone(),
                    ActiveTransfer {
                        unit: unit.clone(),
                        outcome: rx.clone(),
                    },
                );

                info!(%key, user_id = %request.user_id, "starting transfer");
                let registration = Registration {
                    inner: self.inner.clone(),
                    key: key.clone(),
                    tx,
                    outcome: None,
                };
                (rx, Some((registration, unit)))
            }
        };

        // Outside the registry lock: a rejected task drops its registration inline.
        if let Some((registration, unit)) = started {
            tokio::spawn(run_transfer(registration, unit, request));
        }

        wait_outcome(&mut outcome).await
    }

    /// Synchronous cache check.
    pub fn is_downloaded(&self, resource_id: &str) -> bool {
        self.inner
            .cache
            .has(&ResourceKey::from_resource_id(resource_id))
    }

    /// Deletes the local copy. Returns false if nothing was cached.
    pub fn remove_download(&self, resource_id: &str) -> bool {
        let key = ResourceKey::from_resource_id(resource_id);
        let removed = self.inner.cache.remove(&key);
        if removed {
            info!(%key, "removed local copy");
        }
        removed
    }

    /// Cancels the running transfer for `resource_id`, waiting until its
    /// partial file is gone. Returns false if nothing was running.
    pub async fn cancel_download(&self, resource_id: &str) -> bool {
        let key = ResourceKey::from_resource_id(resource_id);
        let running = self
            .inner
            .lock_active()
            .get(&key)
            .map(|t| (t.unit.clone(), t.outcome.clone()));

        let Some((unit, mut outcome)) = running else {
            return false;
        };

        info!(%key, "cancelling transfer");
        unit.cancel();
        wait_outcome(&mut outcome).await;
        true
    }

    /// Current state for `resource_id`: the running attempt if any, else
    /// `Completed` when cached, else `Idle`.
    pub fn transfer_state(&self, resource_id: &str) -> TransferState {
        let key = ResourceKey::from_resource_id(resource_id);
        if let Some(transfer) = self.inner.lock_active().get(&key) {
            return transfer.unit.state();
        }
        match self.inner.cache.get(&key) {
            Some(entry) => TransferState::Completed(entry.local_path),
            None => TransferState::Idle,
        }
    }

    pub fn active_transfers(&self) -> usize {
        self.inner.lock_active().len()
    }

    pub fn list_downloads(&self) -> Vec<CacheEntry> {
        self.inner.cache.list()
    }

    /// Removes the oldest downloads until the cache fits in `max_bytes`.
    pub fn evict_to_budget(&self, max_bytes: u64) -> Vec<ResourceKey> {
        let evicted = self.inner.cache.evict_to_budget(max_bytes);
        if !evicted.is_empty() {
            info!(count = evicted.len(), max_bytes, "evicted downloads");
        }
        evicted
    }
}

impl Inner {
    fn lock_active(&self) -> MutexGuard<'_, HashMap<ResourceKey, ActiveTransfer>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn plan(&self, request: &DownloadRequest, meta: TrackMetadata) -> DownloadPlan {
        let title = if request.title.trim().is_empty() {
            meta.title
        } else {
            request.title.clone()
        };
        let artist = request
            .artist_hint
            .clone()
            .filter(|a| !a.trim().is_empty())
            .or_else(|| Some(meta.artist).filter(|a| !a.trim().is_empty()));

        let extension = url_extension(&meta.url)
            .unwrap_or_else(|| self.options.default_extension.clone());
        let suggested_filename = format!(
            "{}.{}",
            resolve_file_name(&title, artist.as_deref()),
            extension
        );

        DownloadPlan {
            title,
            download_url: meta.url,
            suggested_filename,
        }
    }
}

/// Owns a key's registry slot for the life of its transfer task.
///
/// Dropping it unregisters the key, closes its progress channel and publishes
/// the outcome in one step, so an attaching caller sees either the running
/// transfer or the finished state. A task that ends without recording an
/// outcome, e.g. by panicking, publishes `aborted()`.
struct Registration {
    inner: Arc<Inner>,
    key: ResourceKey,
    tx: watch::Sender<Option<DownloadOutcome>>,
    outcome: Option<DownloadOutcome>,
}

impl Drop for Registration {
    fn drop(&mut self) {
        let outcome = self.outcome.take().unwrap_or_else(|| {
            warn!(key = %self.key, "transfer task ended without an outcome");
            aborted()
        });
        let event = match &outcome {
            DownloadOutcome::Completed { path } => ProgressEvent::Completed(path.clone()),
            DownloadOutcome::Failed { error } => ProgressEvent::Failed(error.clone()),
        };

        let detached = {
            let mut active = self.inner.lock_active();
            active.remove(&self.key);
            let detached = self.inner.progress.detach(&self.key);
            self.tx.send_replace(Some(outcome));
            detached
        };
        detached.deliver(&event);
    }
}

async fn run_transfer(
    mut registration: Registration,
    unit: Arc<TransferUnit>,
    request: DownloadRequest,
) {
    let inner = registration.inner.clone();
    let key = registration.key.clone();
    let result = transfer(&inner, &key, &unit, &request).await;

    match &result {
        Ok(path) => {
            unit.complete(path.clone());
            info!(%key, path = %path.display(), "download completed");
        }
        Err(error) => {
            unit.fail(error.clone());
            warn!(%key, reason = %error.reason_code(), %error, "download failed");
        }
    }

    registration.outcome = Some(DownloadOutcome::from(result));
}

async fn transfer(
    inner: &Inner,
    key: &ResourceKey,
    unit: &TransferUnit,
    request: &DownloadRequest,
) -> Result<PathBuf, DownloadError> {
    let meta = tokio::select! {
        biased;
        _ = unit.cancelled() => return Err(DownloadError::Cancelled),
        meta = inner.catalog.get_resource_metadata(&request.resource_id) => meta?,
    };
    let plan = inner.plan(request, meta);
    debug!(%key, file = %plan.suggested_filename, "resolved download plan");

    let temp_path = inner.cache.temp_path(key);
    let progress = inner.progress.clone();
    let progress_key = key.clone();
    unit.start(&plan.download_url, &temp_path, move |fraction| {
        progress.emit(&progress_key, fraction)
    })
    .await?;

    if unit.is_cancelled() {
        let _ = tokio::fs::remove_file(&temp_path).await;
        return Err(DownloadError::Cancelled);
    }

    let entry = inner
        .cache
        .put(key, &temp_path, &plan.suggested_filename)
        .await?;
    Ok(entry.local_path)
}

async fn wait_outcome(rx: &mut watch::Receiver<Option<DownloadOutcome>>) -> DownloadOutcome {
    match rx.wait_for(Option::is_some).await {
        Ok(outcome) => outcome.clone().unwrap_or_else(aborted),
        Err(_) => aborted(),
    }
}

fn aborted() -> DownloadOutcome {
    DownloadOutcome::Failed {
        error: DownloadError::Network("transfer task ended unexpectedly".to_string()),
    }
}

fn completed(entry: CacheEntry, listener: Option<&ProgressListener>) -> DownloadOutcome {
    if let Some(listener) = listener {
        listener(&ProgressEvent::Completed(entry.local_path.clone()));
    }
    DownloadOutcome::Completed {
        path: entry.local_path,
    }
}

fn failed(error: DownloadError, listener: Option<&ProgressListener>) -> DownloadOutcome {
    if let Some(listener) = listener {
        listener(&ProgressEvent::Failed(error.clone()));
    }
    DownloadOutcome::Failed { error }
}

/// Lowercased extension of the URL's last path segment, if it looks like one.
fn url_extension(raw: &str) -> Option<String> {
    let url = url::Url::parse(raw).ok()?;
    let segment = url.path_segments()?.next_back()?;
    let (stem, ext) = segment.rsplit_once('.')?;
    if stem.is_empty() || ext.is_empty() || ext.len() > 5 {
        return None;
    }
    if !ext.chars().all(|c| c.is_ascii_alphanumeric()) {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}
