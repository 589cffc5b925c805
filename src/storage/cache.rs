use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::domain::{CacheEntry, DownloadError, ResourceKey};
use crate::utils::get_timestamp;

const INDEX_FILE: &str = ".index.json";
const PARTIAL_DIR: &str = ".partial";
const PARTIAL_EXT: &str = "part";

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("Failed to prepare cache directory {path}: {source}")]
    Directory { path: PathBuf, source: io::Error },

    #[error("Failed to write cache index {path}: {source}")]
    Index { path: PathBuf, source: io::Error },
}

#[derive(Serialize, Deserialize, Default)]
struct IndexFile {
    version: u32,
    entries: Vec<CacheEntry>,
}

/// Filesystem-backed record of finished downloads.
///
/// Files only ever appear under their final name through a rename from the
/// partial directory, which lives on the same filesystem, so readers never
/// observe a partially written file. The key to path mapping is persisted in
/// `.index.json` next to the files.
pub struct CacheStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    root: PathBuf,
    partial_dir: PathBuf,
    index_path: PathBuf,
    // Held across the rename and the index write of a commit, so two keys
    // never race for the same final name.
    entries: Mutex<BTreeMap<ResourceKey, CacheEntry>>,
}

impl CacheStore {
    /// Opens (creating if needed) the storage directory.
    ///
    /// Leftover partial files from a previous process are deleted and index
    /// entries whose files have vanished are dropped.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let root = root.into();
        let partial_dir = root.join(PARTIAL_DIR);
        std::fs::create_dir_all(&partial_dir).map_err(|source| CacheError::Directory {
            path: partial_dir.clone(),
            source,
        })?;

        let index_path = root.join(INDEX_FILE);
        let inner = StoreInner {
            entries: Mutex::new(load_index(&index_path)),
            root,
            partial_dir,
            index_path,
        };

        inner.sweep_partials();

        {
            let mut entries = inner.lock();
            let before = entries.len();
            entries.retain(|key, entry| {
                let present = entry.local_path.is_file();
                if !present {
                    warn!(%key, path = %entry.local_path.display(), "dropping cache entry whose file is gone");
                }
                present
            });
            if entries.len() != before {
                inner.persist(&entries).map_err(|source| CacheError::Index {
                    path: inner.index_path.clone(),
                    source,
                })?;
            }
        }

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    /// True iff an entry exists and its file is on disk.
    pub fn has(&self, key: &ResourceKey) -> bool {
        self.get(key).is_some()
    }

    /// Returns the entry for `key`, healing the index if its file was removed
    /// behind our back.
    pub fn get(&self, key: &ResourceKey) -> Option<CacheEntry> {
        let mut entries = self.inner.lock();
        let entry = entries.get(key)?;
        if entry.local_path.is_file() {
            return Some(entry.clone());
        }

        warn!(%key, path = %entry.local_path.display(), "cache entry missing on disk, treating as not downloaded");
        entries.remove(key);
        if let Err(e) = self.inner.persist(&entries) {
            warn!(error = %e, "failed to persist cache index after self-heal");
        }
        None
    }

    /// A fresh temp path for one download attempt of `key`.
    pub fn temp_path(&self, key: &ResourceKey) -> PathBuf {
        self.inner
            .partial_dir
            .join(format!("{}.{}.{}", key, uuid::Uuid::new_v4(), PARTIAL_EXT))
    }

    /// Moves a fully written temp file into the storage directory under
    /// `final_name` and records the mapping.
    ///
    /// The temp file is gone when this returns, whether it succeeded or not.
    /// The move and the index write run on the blocking pool.
    pub async fn put(
        &self,
        key: &ResourceKey,
        temp_path: &Path,
        final_name: &str,
    ) -> Result<CacheEntry, DownloadError> {
        let inner = self.inner.clone();
        let key = key.clone();
        let temp = temp_path.to_path_buf();
        let final_name = final_name.to_string();

        match tokio::task::spawn_blocking(move || inner.commit(&key, &temp, &final_name)).await {
            Ok(result) => result,
            Err(e) => {
                discard(temp_path);
                Err(DownloadError::StorageWrite(format!(
                    "Cache commit task failed: {}",
                    e
                )))
            }
        }
    }

    /// Deletes the file and the mapping. Returns false if nothing existed.
    pub fn remove(&self, key: &ResourceKey) -> bool {
        let mut entries = self.inner.lock();
        let Some(entry) = entries.remove(key) else {
            return false;
        };

        match std::fs::remove_file(&entry.local_path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(%key, error = %e, "failed to delete cached file"),
        }
        if let Err(e) = self.inner.persist(&entries) {
            warn!(error = %e, "failed to persist cache index after removal");
        }
        true
    }

    /// Entries whose files are present, oldest first.
    pub fn list(&self) -> Vec<CacheEntry> {
        let mut list: Vec<CacheEntry> = self
            .inner
            .lock()
            .values()
            .filter(|e| e.local_path.is_file())
            .cloned()
            .collect();
        list.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.key.cmp(&b.key)));
        list
    }

    pub fn total_size(&self) -> u64 {
        self.inner.lock().values().map(|e| e.size_bytes).sum()
    }

    /// Removes the oldest entries until the total size fits `max_bytes`.
    pub fn evict_to_budget(&self, max_bytes: u64) -> Vec<ResourceKey> {
        let mut total = self.total_size();
        let mut evicted = Vec::new();

        for entry in self.list() {
            if total <= max_bytes {
                break;
            }
            if self.remove(&entry.key) {
                total = total.saturating_sub(entry.size_bytes);
                evicted.push(entry.key);
            }
        }

        // Entries listed as missing were never counted by `list`; heal them too.
        let stale: Vec<ResourceKey> = self
            .inner
            .lock()
            .iter()
            .filter(|(_, e)| !e.local_path.is_file())
            .map(|(k, _)| k.clone())
            .collect();
        for key in stale {
            self.get(&key);
        }

        evicted
    }
}

impl StoreInner {
    fn commit(
        &self,
        key: &ResourceKey,
        temp_path: &Path,
        final_name: &str,
    ) -> Result<CacheEntry, DownloadError> {
        let mut entries = self.lock();
        let target = self.target_path(&entries, key, final_name);

        if let Err(e) = std::fs::rename(temp_path, &target) {
            discard(temp_path);
            return Err(DownloadError::StorageWrite(format!(
                "Failed to move {} into cache: {}",
                temp_path.display(),
                e
            )));
        }

        let size_bytes = match std::fs::metadata(&target) {
            Ok(meta) => meta.len(),
            Err(e) => {
                discard(&target);
                return Err(DownloadError::StorageWrite(format!(
                    "Failed to stat {}: {}",
                    target.display(),
                    e
                )));
            }
        };

        let entry = CacheEntry {
            key: key.clone(),
            local_path: target.clone(),
            size_bytes,
            created_at: get_timestamp(),
        };

        let replaced = entries.insert(key.clone(), entry.clone());
        if let Err(e) = self.persist(&entries) {
            match &replaced {
                Some(previous) => entries.insert(key.clone(), previous.clone()),
                None => entries.remove(key),
            };
            discard(&target);
            return Err(DownloadError::StorageWrite(format!(
                "Failed to write cache index: {}",
                e
            )));
        }
        drop(entries);

        if let Some(old) = replaced.filter(|old| old.local_path != target) {
            discard(&old.local_path);
        }

        debug!(%key, path = %target.display(), size_bytes, "cache entry committed");
        Ok(entry)
    }

    /// First free name for `key`: `final_name`, then `<stem>-<key>`, then
    /// `<stem>-<key>-<n>`. A name is free when no other key owns it and no
    /// unindexed file sits there.
    fn target_path(
        &self,
        entries: &BTreeMap<ResourceKey, CacheEntry>,
        key: &ResourceKey,
        final_name: &str,
    ) -> PathBuf {
        let is_free = |path: &Path| match entries.values().find(|e| e.local_path.as_path() == path) {
            Some(owner) => owner.key == *key,
            None => std::fs::symlink_metadata(path).is_err(),
        };

        let candidate = self.root.join(final_name);
        if is_free(candidate.as_path()) {
            return candidate;
        }

        let name = Path::new(final_name);
        let stem = name
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(final_name);
        let ext = name.extension().and_then(|e| e.to_str());

        (1u32..)
            .map(|n| {
                let base = match n {
                    1 => format!("{stem}-{key}"),
                    n => format!("{stem}-{key}-{n}"),
                };
                match ext {
                    Some(ext) => self.root.join(format!("{base}.{ext}")),
                    None => self.root.join(base),
                }
            })
            .find(|path| is_free(path.as_path()))
            .unwrap_or(candidate)
    }

    fn sweep_partials(&self) {
        let Ok(dir) = std::fs::read_dir(&self.partial_dir) else {
            return;
        };
        for entry in dir.flatten() {
            let path = entry.path();
            if path.extension().is_some_and(|e| e == PARTIAL_EXT) {
                debug!(path = %path.display(), "removing leftover partial file");
                let _ = std::fs::remove_file(&path);
            }
        }
    }

    fn persist(&self, entries: &BTreeMap<ResourceKey, CacheEntry>) -> io::Result<()> {
        let index = IndexFile {
            version: 1,
            entries: entries.values().cloned().collect(),
        };
        let json = serde_json::to_vec_pretty(&index).map_err(io::Error::other)?;

        let tmp = self.index_path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.index_path).inspect_err(|_| {
            let _ = std::fs::remove_file(&tmp);
        })
    }

    fn lock(&self) -> MutexGuard<'_, BTreeMap<ResourceKey, CacheEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn load_index(path: &Path) -> BTreeMap<ResourceKey, CacheEntry> {
    let raw = match std::fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return BTreeMap::new(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cache index unreadable, starting empty");
            return BTreeMap::new();
        }
    };

    match serde_json::from_slice::<IndexFile>(&raw) {
        Ok(index) => index
            .entries
            .into_iter()
            .map(|e| (e.key.clone(), e))
            .collect(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cache index corrupt, starting empty");
            BTreeMap::new()
        }
    }
}

fn discard(path: &Path) {
    if let Err(e) = std::fs::remove_file(path) {
        if e.kind() != io::ErrorKind::NotFound {
            warn!(path = %path.display(), error = %e, "failed to delete file");
        }
    }
}
