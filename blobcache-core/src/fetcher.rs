use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use crate::error::FetchError;
use crate::priority::Variant;
use crate::units::ByteSize;

/// Raw payload returned by one fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedAsset {
    pub payload: Vec<u8>,
}

impl FetchedAsset {
    pub fn new(payload: Vec<u8>) -> Self {
        Self { payload }
    }

    /// Byte count the store accounts for once the payload is cached.
    pub fn size(&self) -> ByteSize {
        ByteSize::from_usize(self.payload.len())
    }
}

/// Performs exactly one network request per call.
///
/// Implementations must not retry, cache or deduplicate; the store owns all
/// of that.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait AssetFetcher: Send + Sync {
    async fn fetch(
        &self,
        key: &str,
        variant: &Variant,
    ) -> Result<FetchedAsset, FetchError>;
}

/// Fetches `{origin}/{key}/{variant}` over HTTP.
#[derive(Debug, Clone)]
pub struct HttpAssetFetcher {
    client: reqwest::Client,
    origin: Url,
}

impl HttpAssetFetcher {
    pub fn new(origin: Url, timeout: Option<Duration>) -> Result<Self, FetchError> {
        let mut builder = reqwest::Client::builder().pool_max_idle_per_host(10);
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        let client = builder
            .build()
            .map_err(|e| FetchError::Client(e.to_string()))?;

        Ok(Self { client, origin })
    }

    pub fn origin(&self) -> &Url {
        &self.origin
    }

    pub fn url_for(&self, key: &str, variant: &Variant) -> String {
        format!(
            "{}/{}/{}",
            self.origin.as_str().trim_end_matches('/'),
            urlencoding::encode(key),
            urlencoding::encode(variant.as_str())
        )
    }
}

#[async_trait]
impl AssetFetcher for HttpAssetFetcher {
    async fn fetch(
        &self,
        key: &str,
        variant: &Variant,
    ) -> Result<FetchedAsset, FetchError> {
        let url = self.url_for(key, variant);
        log::debug!("Fetching asset from URL: {}", url);

        let response = self.client.get(&url).send().await.map_err(|e| {
            FetchError::Transport {
                url: url.clone(),
                message: e.to_string(),
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            log::warn!("Failed to fetch asset: {} - {}", url, status);
            return Err(FetchError::Status {
                status: status.as_u16(),
                url,
            });
        }

        let bytes = response.bytes().await.map_err(|e| FetchError::Transport {
            url: url.clone(),
            message: e.to_string(),
        })?;

        Ok(FetchedAsset::new(bytes.to_vec()))
    }
}
