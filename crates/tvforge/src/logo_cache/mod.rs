//! Logo caching: content-addressed, dedup-by-normalized-URL storage.

pub mod fetch;
pub mod metadata;
pub mod store;

pub use fetch::{FetchedLogo, HttpLogoFetcher, LogoFetcher};
pub use metadata::{LinkedAsset, LogoMetadata, LogoSource, cache_id_for_url, normalize_url};
pub use store::{CachedLogoStore, LogoCacheStats};

use anyhow::Result;
use async_trait::async_trait;

/// The caching interface the pipeline's logo stage consumes.
#[async_trait]
pub trait LogoCacher: Send + Sync {
    /// Idempotent: returns the existing entry on a hit, fetches and stores
    /// otherwise.
    async fn cache_logo(&self, url: &str) -> Result<LogoMetadata>;

    /// Cheap membership probe against the in-memory index.
    fn contains(&self, url: &str) -> bool;
}
