use serde::{Deserialize, Serialize};

/// Response from the catalog `/tracks/{id}` endpoint
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TrackMetadata {
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub artist: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InvoiceStatus {
    Paid,
    Pending,
    Canceled,
}

/// Billing record for one (user, resource) pair
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Invoice {
    pub id: String,
    pub status: InvoiceStatus,
}

/// Body of `POST /invoices`
#[derive(Debug, Clone, Serialize)]
pub struct CreateInvoiceRequest<'a> {
    pub user_id: &'a str,
    pub resource_id: &'a str,
    pub description: &'a str,
}

/// Response from `POST /invoices`
#[derive(Debug, Clone, Deserialize)]
pub struct CreateInvoiceResponse {
    pub id: String,
}

/// Configuration for the API client
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub catalog_base_url: String,
    pub billing_base_url: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            catalog_base_url: "http://127.0.0.1:8080".to_string(),
            billing_base_url: "http://127.0.0.1:8080".to_string(),
        }
    }
}
