use thiserror::Error;

use super::model::EntitlementStatus;

/// Every way a download request can end without a file.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DownloadError {
    #[error("Payment required: invoice {invoice_id} is {status}")]
    EntitlementDenied {
        status: EntitlementStatus,
        invoice_id: String,
    },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Server responded with HTTP {0}")]
    Http(u16),

    #[error("Storage write error: {0}")]
    StorageWrite(String),

    #[error("No data received before the idle timeout")]
    Timeout,

    #[error("Download cancelled")]
    Cancelled,

    #[error("Resource not found in catalog: {0}")]
    NotFound(String),
}

impl DownloadError {
    /// Stable code for diagnostics, e.g. `entitlement:none` or `http:404`.
    pub fn reason_code(&self) -> String {
        match self {
            Self::EntitlementDenied { status, .. } => format!("entitlement:{status}"),
            Self::Network(_) => "network".to_string(),
            Self::Http(status) => format!("http:{status}"),
            Self::StorageWrite(_) => "storage".to_string(),
            Self::Timeout => "timeout".to_string(),
            Self::Cancelled => "cancelled".to_string(),
            Self::NotFound(_) => "not_found".to_string(),
        }
    }

    /// Whether re-invoking `request_download` may succeed without user action.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::EntitlementDenied { .. } | Self::NotFound(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reason_codes() {
        assert_eq!(DownloadError::Http(503).reason_code(), "http:503");
        assert_eq!(DownloadError::Timeout.reason_code(), "timeout");
        assert_eq!(
            DownloadError::StorageWrite("disk full".into()).reason_code(),
            "storage"
        );
        let denied = DownloadError::EntitlementDenied {
            status: EntitlementStatus::Pending,
            invoice_id: "INV-7".into(),
        };
        assert_eq!(denied.reason_code(), "entitlement:pending");
        assert!(!denied.is_retryable());
        assert!(DownloadError::Network("reset".into()).is_retryable());
    }
}
