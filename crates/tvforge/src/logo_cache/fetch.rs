//! HTTP fetch seam for remote logo images.

use anyhow::Result;
use async_trait::async_trait;
use std::time::Duration;

/// A fetched image plus whatever the server claimed about its type.
#[derive(Debug, Clone)]
pub struct FetchedLogo {
    pub bytes: Vec<u8>,
    pub content_type: Option<String>,
}

/// Downloads logo images. Implementations are external collaborators; the
/// store only requires bytes and an optional content type.
#[async_trait]
pub trait LogoFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedLogo>;
}

/// Production fetcher backed by reqwest.
#[derive(Debug, Clone)]
pub struct HttpLogoFetcher {
    client: reqwest::Client,
}

impl HttpLogoFetcher {
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("tvforge/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl LogoFetcher for HttpLogoFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedLogo> {
        let response = self.client.get(url).send().await?.error_for_status()?;

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string());

        let bytes = response.bytes().await?.to_vec();
        if bytes.is_empty() {
            anyhow::bail!("Empty response body from '{url}'");
        }

        Ok(FetchedLogo { bytes, content_type })
    }
}
