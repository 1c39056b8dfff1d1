//! Outbound HTTP capability.

use async_trait::async_trait;
use serde_json::Value;

use super::CapabilityError;

/// Fetches JSON documents from external services.
#[async_trait]
pub trait HttpFetcher: Send + Sync {
    async fn get_json(&self, url: &str) -> Result<Value, CapabilityError>;
}

/// reqwest-backed fetcher.
#[derive(Debug, Clone)]
pub struct ReqwestFetcher {
    client: reqwest::Client,
}

impl ReqwestFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpFetcher for ReqwestFetcher {
    async fn get_json(&self, url: &str) -> Result<Value, CapabilityError> {
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(CapabilityError::from_status(status.as_u16(), body));
        }
        Ok(response.json().await?)
    }
}
