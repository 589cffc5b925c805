//! Download core for a music catalog client: entitlement-gated, progress
//! tracked transfers into a persistent local cache.

pub mod api;
pub mod application;
pub mod config;
pub mod domain;
pub mod storage;
pub mod utils;

pub use application::{
    CoordinatorOptions, DownloadCoordinator, ProgressBroadcaster, ProgressEvent, ProgressListener,
};
pub use config::DownloaderConfig;
pub use domain::{DownloadError, DownloadOutcome, DownloadRequest, ResourceKey, TransferState};
pub use storage::CacheStore;
