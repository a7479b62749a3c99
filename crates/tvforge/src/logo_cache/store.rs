//! Content-addressed logo store.
//!
//! Logos live under `logos/{cached,uploaded}/` inside a sandbox, each image
//! file paired with a `<id>.json` metadata sidecar. Cached entries are
//! deduplicated by normalized source URL; a per-id single-flight lock ensures
//! concurrent callers of [`CachedLogoStore::cache_logo`] trigger at most one
//! fetch per identity.

use super::LogoCacher;
use super::fetch::LogoFetcher;
use super::metadata::{
    LinkedAsset, LogoMetadata, LogoSource, cache_id_for_url, extension_for_mime,
    mime_for_extension,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sandboxed_fs::Sandbox;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};
use ulid::Ulid;

const CACHED_DIR: &str = "logos/cached";
const UPLOADED_DIR: &str = "logos/uploaded";

/// Aggregate statistics over stored logos.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LogoCacheStats {
    pub cached_count: usize,
    pub uploaded_count: usize,
    pub total_size_bytes: u64,
}

/// Sandbox-backed [`LogoCacher`] implementation.
pub struct CachedLogoStore {
    sandbox: Sandbox,
    fetcher: Arc<dyn LogoFetcher>,
    /// Ids known to be cached; rebuilt from disk at startup.
    index: RwLock<HashSet<String>>,
    /// Per-id fetch locks so one identity fetches once under concurrency.
    fetch_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl CachedLogoStore {
    /// Open the store, creating the directory layout and rebuilding the
    /// in-memory index from existing metadata sidecars.
    pub async fn open(sandbox: Sandbox, fetcher: Arc<dyn LogoFetcher>) -> Result<Self> {
        sandbox.create_dir_all(CACHED_DIR).await?;
        sandbox.create_dir_all(UPLOADED_DIR).await?;

        let store = Self {
            sandbox,
            fetcher,
            index: RwLock::new(HashSet::new()),
            fetch_locks: Mutex::new(HashMap::new()),
        };
        let scanned = store.scan_logos().await?;
        debug!("Logo store opened cached_entries={}", scanned);
        Ok(store)
    }

    /// Rebuild the cached-id index from metadata sidecars on disk. Returns the
    /// number of cached entries found.
    pub async fn scan_logos(&self) -> Result<usize> {
        let mut ids = HashSet::new();
        for name in self.sandbox.list_files(CACHED_DIR).await? {
            if let Some(id) = name.strip_suffix(".json") {
                ids.insert(id.to_string());
            }
        }
        let count = ids.len();
        *self.index.write().expect("logo index lock poisoned") = ids;
        Ok(count)
    }

    /// All metadata entries whose `last_seen_at` is older than `cutoff`.
    pub async fn get_stale_logos(&self, cutoff: DateTime<Utc>) -> Result<Vec<LogoMetadata>> {
        let mut stale = Vec::new();
        for dir in [CACHED_DIR, UPLOADED_DIR] {
            for name in self.sandbox.list_files(dir).await? {
                if !name.ends_with(".json") {
                    continue;
                }
                match self.read_metadata_file(&format!("{dir}/{name}")).await {
                    Ok(meta) => {
                        if meta.last_seen_at < cutoff {
                            stale.push(meta);
                        }
                    }
                    Err(e) => warn!("Skipping unreadable logo sidecar {}/{}: {}", dir, name, e),
                }
            }
        }
        Ok(stale)
    }

    /// Entry counts and cumulative image size, from metadata sidecars.
    pub async fn get_cache_stats(&self) -> Result<LogoCacheStats> {
        let mut stats = LogoCacheStats::default();
        for dir in [CACHED_DIR, UPLOADED_DIR] {
            for name in self.sandbox.list_files(dir).await? {
                if !name.ends_with(".json") {
                    continue;
                }
                let meta = match self.read_metadata_file(&format!("{dir}/{name}")).await {
                    Ok(meta) => meta,
                    Err(e) => {
                        warn!("Skipping unreadable logo sidecar {}/{}: {}", dir, name, e);
                        continue;
                    }
                };
                match meta.source {
                    LogoSource::Cached => stats.cached_count += 1,
                    LogoSource::Uploaded => stats.uploaded_count += 1,
                }
                stats.total_size_bytes += meta.file_size;
            }
        }
        Ok(stats)
    }

    /// Delete every entry not seen since `cutoff`, then sweep empty
    /// directories. Returns the number of entries removed; individual
    /// deletion failures are logged and skipped.
    pub async fn prune_stale(&self, cutoff: DateTime<Utc>) -> Result<usize> {
        let stale = self.get_stale_logos(cutoff).await?;
        let mut removed = 0usize;
        for meta in stale {
            match self.delete_with_metadata(meta.source, &meta.id).await {
                Ok(()) => removed += 1,
                Err(e) => warn!("Failed to prune stale logo {}: {}", meta.id, e),
            }
        }
        if removed > 0 {
            self.sandbox.cleanup_empty_dirs().await?;
            debug!("Pruned {} stale logos", removed);
        }
        Ok(removed)
    }

    /// Refresh `last_seen_at` on an entry and persist the sidecar.
    pub async fn touch_metadata(&self, source: LogoSource, id: &str) -> Result<LogoMetadata> {
        let mut meta = self.load_metadata(source, id).await?;
        meta.last_seen_at = Utc::now();
        self.save_metadata(&mut meta).await?;
        Ok(meta)
    }

    /// Remove an entry: every linked asset file plus the metadata sidecar.
    pub async fn delete_with_metadata(&self, source: LogoSource, id: &str) -> Result<()> {
        let meta = self.load_metadata(source, id).await?;
        for asset in &meta.linked_assets {
            if let Err(e) = self.sandbox.remove_file(&asset.path).await {
                warn!("Failed to remove linked asset {}: {}", asset.path, e);
            }
        }
        self.sandbox
            .remove_file(&Self::sidecar_path(source, id))
            .await?;

        if source == LogoSource::Cached {
            self.index
                .write()
                .expect("logo index lock poisoned")
                .remove(id);
        }
        Ok(())
    }

    /// Store image bytes with freshly built metadata. For `Cached` the id is
    /// derived from `original_url` (which is then required); for `Uploaded` a
    /// new ULID is minted.
    pub async fn store_with_metadata(
        &self,
        source: LogoSource,
        original_url: Option<&str>,
        bytes: &[u8],
        content_type: Option<&str>,
    ) -> Result<LogoMetadata> {
        let (id, normalized) = match source {
            LogoSource::Cached => {
                let url = original_url
                    .context("original URL is required to store a cached logo")?;
                let (id, normalized) = cache_id_for_url(url)?;
                (id, Some(normalized))
            }
            LogoSource::Uploaded => (Ulid::new().to_string(), None),
        };

        let resolved_type = resolve_content_type(bytes, content_type);
        let extension = extension_for_mime(&resolved_type);
        let image_path = format!("{}/{id}.{extension}", Self::dir(source));
        self.sandbox.write(&image_path, bytes).await?;

        let (width, height) = image_dimensions(bytes);
        let now = Utc::now();
        let mut meta = LogoMetadata {
            id: id.clone(),
            source,
            original_url: original_url.map(str::to_string),
            url_hash: normalized.as_ref().map(|_| id.clone()),
            normalized_url: normalized,
            content_type: resolved_type,
            file_size: bytes.len() as u64,
            width,
            height,
            created_at: now,
            last_seen_at: now,
            source_hint: None,
            linked_assets: Vec::new(),
        };
        self.save_metadata(&mut meta).await?;

        if source == LogoSource::Cached {
            self.index
                .write()
                .expect("logo index lock poisoned")
                .insert(id);
        }
        Ok(meta)
    }

    /// Like [`store_with_metadata`], additionally preserving the unconverted
    /// original bytes as a linked asset.
    ///
    /// [`store_with_metadata`]: Self::store_with_metadata
    pub async fn store_with_metadata_and_original(
        &self,
        source: LogoSource,
        original_url: Option<&str>,
        bytes: &[u8],
        content_type: Option<&str>,
        original_bytes: &[u8],
        original_content_type: &str,
    ) -> Result<LogoMetadata> {
        let mut meta = self
            .store_with_metadata(source, original_url, bytes, content_type)
            .await?;

        let orig_ext = extension_for_mime(original_content_type);
        let orig_path = format!("{}/{}.orig.{orig_ext}", Self::dir(source), meta.id);
        self.sandbox.write(&orig_path, original_bytes).await?;

        // Re-save so the sidecar picks up the original as a linked asset.
        self.save_metadata(&mut meta).await?;
        Ok(meta)
    }

    async fn load_metadata(&self, source: LogoSource, id: &str) -> Result<LogoMetadata> {
        self.read_metadata_file(&Self::sidecar_path(source, id))
            .await
    }

    async fn read_metadata_file(&self, path: &str) -> Result<LogoMetadata> {
        let raw = self.sandbox.read(path).await?;
        serde_json::from_slice(&raw).with_context(|| format!("Corrupt logo sidecar at {path}"))
    }

    /// Persist a sidecar, recomputing `linked_assets` from the files actually
    /// present for this id.
    async fn save_metadata(&self, meta: &mut LogoMetadata) -> Result<()> {
        let dir = Self::dir(meta.source);
        let prefix = format!("{}.", meta.id);
        let mut assets = Vec::new();

        for name in self.sandbox.list_files(dir).await? {
            if !name.starts_with(&prefix) || name.ends_with(".json") {
                continue;
            }
            let path = format!("{dir}/{name}");
            let size = self.sandbox.metadata(&path).await.map(|m| m.len()).unwrap_or(0);
            let extension = name.rsplit('.').next().unwrap_or_default();
            let asset_type = if name.contains(".orig.") { "original" } else { "image" };
            assets.push(LinkedAsset {
                asset_type: asset_type.to_string(),
                path,
                content_type: mime_for_extension(extension).to_string(),
                size,
            });
        }
        meta.linked_assets = assets;

        let json = serde_json::to_vec_pretty(meta)?;
        self.sandbox
            .write(&Self::sidecar_path(meta.source, &meta.id), &json)
            .await?;
        Ok(())
    }

    async fn id_lock(&self, id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.fetch_locks.lock().await;
        locks
            .entry(id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn dir(source: LogoSource) -> &'static str {
        match source {
            LogoSource::Cached => CACHED_DIR,
            LogoSource::Uploaded => UPLOADED_DIR,
        }
    }

    fn sidecar_path(source: LogoSource, id: &str) -> String {
        format!("{}/{id}.json", Self::dir(source))
    }
}

#[async_trait]
impl LogoCacher for CachedLogoStore {
    /// Idempotent fetch-and-store: an existing entry is touched and returned,
    /// otherwise the image is fetched, persisted atomically, and indexed.
    async fn cache_logo(&self, url: &str) -> Result<LogoMetadata> {
        let (id, _normalized) = cache_id_for_url(url)?;

        let lock = self.id_lock(&id).await;
        let _guard = lock.lock().await;

        let sidecar = Self::sidecar_path(LogoSource::Cached, &id);
        if self.sandbox.exists(&sidecar).await? {
            trace!("Logo already cached: {} -> {}", url, id);
            return self.touch_metadata(LogoSource::Cached, &id).await;
        }

        debug!("Downloading logo url={} id={}", url, id);
        let fetched = self
            .fetcher
            .fetch(url)
            .await
            .with_context(|| format!("Failed to download logo from '{url}'"))?;

        self.store_with_metadata(
            LogoSource::Cached,
            Some(url),
            &fetched.bytes,
            fetched.content_type.as_deref(),
        )
        .await
    }

    fn contains(&self, url: &str) -> bool {
        match cache_id_for_url(url) {
            Ok((id, _)) => self
                .index
                .read()
                .expect("logo index lock poisoned")
                .contains(&id),
            Err(_) => false,
        }
    }
}

/// Pick the stored content type: a recognized image MIME from the server wins,
/// otherwise the bytes are sniffed, defaulting to PNG.
fn resolve_content_type(bytes: &[u8], declared: Option<&str>) -> String {
    if let Some(declared) = declared {
        if declared.starts_with("image/") {
            return declared.to_string();
        }
    }
    match image::guess_format(bytes) {
        Ok(format) => format.to_mime_type().to_string(),
        Err(_) => "image/png".to_string(),
    }
}

fn image_dimensions(bytes: &[u8]) -> (Option<u32>, Option<u32>) {
    match image::load_from_memory(bytes) {
        Ok(img) => (Some(img.width()), Some(img.height())),
        Err(_) => (None, None),
    }
}
