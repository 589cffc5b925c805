pub mod error;
pub mod model;

pub use error::DownloadError;
pub use model::{
    CacheEntry, DownloadOutcome, DownloadPlan, DownloadRequest, EntitlementResult,
    EntitlementStatus, ResourceKey, TransferState,
};
