mod client;
pub mod models;

use async_trait::async_trait;

pub use client::{download_file_stream, ApiClient, ApiError, Result};
pub use models::{ApiConfig, Invoice, InvoiceStatus, TrackMetadata};

/// Remote catalog: resolves a resource id to a streaming URL and metadata.
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn get_resource_metadata(&self, resource_id: &str) -> Result<TrackMetadata>;
}

/// Remote billing service holding one invoice per (user, resource).
#[async_trait]
pub trait Billing: Send + Sync {
    async fn get_invoice(&self, user_id: &str, resource_id: &str) -> Result<Option<Invoice>>;

    /// Creates a pending invoice and returns its id.
    async fn create_invoice(
        &self,
        user_id: &str,
        resource_id: &str,
        description: &str,
    ) -> Result<String>;
}
