pub mod download_coordinator;
pub mod entitlement;
pub mod progress;
pub mod transfer;

pub use download_coordinator::{CoordinatorOptions, DownloadCoordinator};
pub use entitlement::EntitlementGate;
pub use progress::{ProgressBroadcaster, ProgressEvent, ProgressListener, Subscription};
pub use transfer::{TransferOptions, TransferUnit};
