use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::error::DownloadError;

// Never produced by normalization, so encoded keys cannot meet plain ones.
const ENCODED_SEPARATOR: char = '~';

/// Stable identifier of a downloadable resource.
///
/// Used as the only lookup key into the cache index and the progress map.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceKey(String);

impl ResourceKey {
    /// Derives the key for a catalog resource id.
    ///
    /// An id made only of lowercase ASCII letters, digits, `-` and `_` is its
    /// own key. Any other id is normalized the same way (ASCII lowercased,
    /// everything else turned into `_`) and suffixed with `~` and the hex of
    /// the raw id, so distinct ids never share a key.
    pub fn from_resource_id(resource_id: &str) -> Self {
        let normalized: String = resource_id
            .trim()
            .chars()
            .map(|c| match c {
                'a'..='z' | '0'..='9' | '-' | '_' => c,
                'A'..='Z' => c.to_ascii_lowercase(),
                _ => '_',
            })
            .collect();

        if normalized == resource_id && !normalized.is_empty() {
            return Self(normalized);
        }
        Self(format!(
            "{}{}{}",
            normalized,
            ENCODED_SEPARATOR,
            hex::encode(resource_id)
        ))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Lifecycle of one transfer attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum TransferState {
    Idle,
    Downloading(f32),
    Completed(PathBuf),
    Failed(DownloadError),
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed(_) | Self::Failed(_))
    }
}

/// A fully written file in the managed storage directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: ResourceKey,
    pub local_path: PathBuf,
    pub size_bytes: u64,
    /// Unix timestamp in seconds.
    pub created_at: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntitlementStatus {
    Paid,
    Pending,
    None,
}

impl EntitlementStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Paid => "paid",
            Self::Pending => "pending",
            Self::None => "none",
        }
    }
}

impl fmt::Display for EntitlementStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one entitlement check. Fetched fresh on every attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntitlementResult {
    pub authorized: bool,
    pub invoice_id: Option<String>,
    pub status: EntitlementStatus,
}

/// What a caller of `request_download` wants.
#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub user_id: String,
    pub resource_id: String,
    pub title: String,
    pub artist_hint: Option<String>,
}

impl DownloadRequest {
    pub fn new(
        user_id: impl Into<String>,
        resource_id: impl Into<String>,
        title: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            resource_id: resource_id.into(),
            title: title.into(),
            artist_hint: None,
        }
    }

    pub fn artist(mut self, artist: impl Into<String>) -> Self {
        self.artist_hint = Some(artist.into());
        self
    }
}

/// Everything needed to stream one resource into the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadPlan {
    pub title: String,
    pub download_url: String,
    pub suggested_filename: String,
}

/// Terminal result handed to every caller of `request_download`.
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadOutcome {
    Completed { path: PathBuf },
    Failed { error: DownloadError },
}

impl DownloadOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed { .. })
    }

    pub fn path(&self) -> Option<&PathBuf> {
        match self {
            Self::Completed { path } => Some(path),
            Self::Failed { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&DownloadError> {
        match self {
            Self::Completed { .. } => None,
            Self::Failed { error } => Some(error),
        }
    }

    /// Diagnostic reason code, `None` on success.
    pub fn reason(&self) -> Option<String> {
        self.error().map(DownloadError::reason_code)
    }

    /// Invoice the user has to settle, present only on entitlement denial.
    pub fn invoice_id(&self) -> Option<&str> {
        match self.error() {
            Some(DownloadError::EntitlementDenied { invoice_id, .. }) => Some(invoice_id),
            _ => None,
        }
    }
}

impl From<Result<PathBuf, DownloadError>> for DownloadOutcome {
    fn from(result: Result<PathBuf, DownloadError>) -> Self {
        match result {
            Ok(path) => Self::Completed { path },
            Err(error) => Self::Failed { error },
        }
    }
}
