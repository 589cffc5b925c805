use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use reqwest::{Client, StatusCode};
use thiserror::Error;

use super::models::{
    ApiConfig, CreateInvoiceRequest, CreateInvoiceResponse, Invoice, TrackMetadata,
};
use super::{Billing, Catalog};
use crate::domain::DownloadError;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("HTTP request failed: {0}")]
    RequestError(#[from] reqwest::Error),

    #[error("Server responded with HTTP {0}")]
    Status(u16),

    #[error("Invalid response format: {0}")]
    InvalidResponse(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

pub type Result<T> = std::result::Result<T, ApiError>;

impl From<ApiError> for DownloadError {
    fn from(e: ApiError) -> Self {
        match e {
            ApiError::RequestError(e) if e.is_timeout() => DownloadError::Timeout,
            ApiError::RequestError(e) => match e.status() {
                Some(status) => DownloadError::Http(status.as_u16()),
                None => DownloadError::Network(e.to_string()),
            },
            ApiError::Status(status) => DownloadError::Http(status),
            ApiError::InvalidResponse(msg) => DownloadError::Network(msg),
            ApiError::NotFound(what) => DownloadError::NotFound(what),
        }
    }
}

/// HTTP implementation of both the catalog and billing collaborators.
#[derive(Clone)]
pub struct ApiClient {
    config: ApiConfig,
    client: Client,
}

impl ApiClient {
    pub fn new(config: ApiConfig) -> Self {
        Self::with_client(config, Client::new())
    }

    pub fn with_client(config: ApiConfig, client: Client) -> Self {
        Self { config, client }
    }

    /// The underlying HTTP client, shared with transfers.
    pub fn http(&self) -> &Client {
        &self.client
    }

    fn catalog_url(&self, path: &str) -> String {
        format!("{}{}", self.config.catalog_base_url.trim_end_matches('/'), path)
    }

    fn billing_url(&self, path: &str) -> String {
        format!("{}{}", self.config.billing_base_url.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl Catalog for ApiClient {
    async fn get_resource_metadata(&self, resource_id: &str) -> Result<TrackMetadata> {
        let url = self.catalog_url(&format!("/tracks/{}", urlencode(resource_id)));
        let response = self.client.get(&url).send().await?;

        match response.status() {
            StatusCode::NOT_FOUND => return Err(ApiError::NotFound(resource_id.to_string())),
            status if !status.is_success() => return Err(ApiError::Status(status.as_u16())),
            _ => {}
        }

        response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(format!("JSON decode error: {}", e)))
    }
}

#[async_trait]
impl Billing for ApiClient {
    async fn get_invoice(&self, user_id: &str, resource_id: &str) -> Result<Option<Invoice>> {
        let response = self
            .client
            .get(self.billing_url("/invoices"))
            .query(&[("user", user_id), ("resource", resource_id)])
            .send()
            .await?;

        match response.status() {
            StatusCode::NOT_FOUND => return Ok(None),
            status if !status.is_success() => return Err(ApiError::Status(status.as_u16())),
            _ => {}
        }

        let invoice: Invoice = response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(format!("JSON decode error: {}", e)))?;
        Ok(Some(invoice))
    }

    async fn create_invoice(
        &self,
        user_id: &str,
        resource_id: &str,
        description: &str,
    ) -> Result<String> {
        let response = self
            .client
            .post(self.billing_url("/invoices"))
            .json(&CreateInvoiceRequest {
                user_id,
                resource_id,
                description,
            })
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(ApiError::Status(status.as_u16()));
        }

        let created: CreateInvoiceResponse = response
            .json()
            .await
            .map_err(|e| ApiError::InvalidResponse(format!("JSON decode error: {}", e)))?;
        Ok(created.id)
    }
}

/// Opens a streaming GET on `download_url`.
/// Returns (total_size, stream); total_size is `None` without Content-Length.
pub async fn download_file_stream(
    client: &Client,
    download_url: &str,
) -> Result<(Option<u64>, BoxStream<'static, Result<Bytes>>)> {
    let response = client.get(download_url).send().await?;

    let status = response.status();
    if !status.is_success() {
        return Err(ApiError::Status(status.as_u16()));
    }

    let total_size = response.content_length();
    let stream = response
        .bytes_stream()
        .map_err(ApiError::RequestError)
        .boxed();

    Ok((total_size, stream))
}

fn urlencode(segment: &str) -> String {
    url::form_urlencoded::byte_serialize(segment.as_bytes()).collect()
}
