//! Logo metadata model and content addressing.
//!
//! Cached logos are addressed by the SHA-256 of their normalized source URL,
//! so the same image referenced through trivially different URLs (scheme,
//! default port, trailing slash, query order) lands on a single cache entry.
//! Uploaded logos get a freshly minted ULID instead.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use url::Url;

/// Where a logo came from; doubles as the storage subdirectory name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum LogoSource {
    Cached,
    Uploaded,
}

/// A file belonging to a logo entry (the image itself, or a preserved
/// original). Paths are sandbox-relative.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkedAsset {
    #[serde(rename = "type")]
    pub asset_type: String,
    pub path: String,
    pub content_type: String,
    pub size: u64,
}

/// Sidecar metadata persisted next to each stored logo.
///
/// For `source = cached`, `id == url_hash == SHA-256(normalized_url)`; for
/// `source = uploaded`, `id` is a ULID. Unknown keys in stored sidecars are
/// tolerated; `linked_assets` is recomputed on every save.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogoMetadata {
    pub id: String,
    pub source: LogoSource,
    #[serde(default)]
    pub original_url: Option<String>,
    #[serde(default)]
    pub normalized_url: Option<String>,
    #[serde(default)]
    pub url_hash: Option<String>,
    pub content_type: String,
    pub file_size: u64,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    #[serde(default)]
    pub source_hint: Option<String>,
    #[serde(default)]
    pub linked_assets: Vec<LinkedAsset>,
}

/// Normalize a URL for identity purposes.
///
/// Lowercases the host, strips default ports 80/443, strips a trailing slash
/// from the path, lexicographically sorts `key=value` query pairs, and drops
/// the scheme entirely (http and https collapse to the same identity).
pub fn normalize_url(raw: &str) -> anyhow::Result<String> {
    let parsed = Url::parse(raw).map_err(|e| anyhow::anyhow!("Invalid URL '{raw}': {e}"))?;

    let mut normalized = String::new();

    if let Some(host) = parsed.host_str() {
        normalized.push_str(&host.to_lowercase());
    }

    if let Some(port) = parsed.port() {
        if port != 80 && port != 443 {
            normalized.push(':');
            normalized.push_str(&port.to_string());
        }
    }

    let mut path = parsed.path().to_string();
    if path.ends_with('/') {
        path.pop();
    }
    normalized.push_str(&path);

    let mut params: Vec<String> = parsed
        .query_pairs()
        .map(|(k, v)| format!("{k}={v}"))
        .collect();
    if !params.is_empty() {
        params.sort();
        normalized.push('?');
        normalized.push_str(&params.join("&"));
    }

    Ok(normalized)
}

/// Derive the content-addressed cache id for a URL.
/// Returns `(id, normalized_url)`.
pub fn cache_id_for_url(raw: &str) -> anyhow::Result<(String, String)> {
    let normalized = normalize_url(raw)?;
    let mut hasher = Sha256::new();
    hasher.update(normalized.as_bytes());
    let id = hex::encode(hasher.finalize());
    Ok((id, normalized))
}

/// File extension for a MIME type, defaulting to `png` for unknown image data.
pub fn extension_for_mime(mime: &str) -> &'static str {
    match mime {
        "image/png" => "png",
        "image/jpeg" => "jpg",
        "image/gif" => "gif",
        "image/webp" => "webp",
        "image/svg+xml" => "svg",
        _ => "png",
    }
}

/// MIME type for a file extension.
pub fn mime_for_extension(extension: &str) -> &'static str {
    match extension.to_lowercase().as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "svg" => "image/svg+xml",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scheme_port_slash_and_query_order_collapse() {
        let (a, _) = cache_id_for_url("http://Example.COM:80/a/?b=2&a=1").unwrap();
        let (b, _) = cache_id_for_url("https://example.com/a?a=1&b=2").unwrap();
        let (c, _) = cache_id_for_url("https://example.com/a/?a=1&b=2").unwrap();
        assert_eq!(a, b);
        assert_eq!(b, c);
    }

    #[test]
    fn path_changes_always_change_identity() {
        let (a, _) = cache_id_for_url("https://example.com/logo.png").unwrap();
        let (b, _) = cache_id_for_url("https://example.com/logo2.png").unwrap();
        let (c, _) = cache_id_for_url("https://example.com/logo.jpg").unwrap();
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn normalized_form_is_scheme_free() {
        let normalized = normalize_url("https://CDN.Example.com:443/img/ch.png?x=1").unwrap();
        assert_eq!(normalized, "cdn.example.com/img/ch.png?x=1");
    }

    #[test]
    fn non_default_port_is_preserved() {
        let normalized = normalize_url("http://example.com:8080/logo.png").unwrap();
        assert_eq!(normalized, "example.com:8080/logo.png");
    }

    #[test]
    fn root_path_strips_to_host_only() {
        assert_eq!(normalize_url("http://example.com/").unwrap(), "example.com");
    }

    #[test]
    fn sidecar_tolerates_unknown_keys() {
        let json = r#"{
            "id": "abc",
            "source": "cached",
            "content_type": "image/png",
            "file_size": 10,
            "created_at": "2025-01-15T12:00:00Z",
            "last_seen_at": "2025-01-15T12:00:00Z",
            "some_future_field": {"nested": true}
        }"#;
        let meta: LogoMetadata = serde_json::from_str(json).unwrap();
        assert_eq!(meta.id, "abc");
        assert_eq!(meta.source, LogoSource::Cached);
        assert!(meta.linked_assets.is_empty());
    }
}
