//! Logo caching stage.
//!
//! Resolves deferred `@logo:<ULID>` references to local API paths, then walks
//! channel logos and program icons collecting unique remote URLs to warm the
//! logo cache with. URLs already pointing at this system's own logo routes are
//! skipped; cache failures are counted, never fatal.

use crate::logo_cache::LogoCacher;
use crate::pipeline::artifacts::{ArtifactType, PipelineArtifact};
use crate::pipeline::error::PipelineError;
use crate::pipeline::state::PipelineState;
use crate::pipeline::traits::{PipelineStage, StageResult};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use ulid::Ulid;

/// Classification of a logo URL for processing decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LogoUrlKind {
    /// `@logo:<ULID>` token, resolved in place rather than fetched.
    Deferred,
    /// One of this system's own logo paths; never fetched.
    LocalReference,
    /// Anything else; cacheable.
    Remote,
}

/// Per-target cache-warming counters.
#[derive(Debug, Default, Clone, Copy)]
struct TargetStats {
    processed: usize,
    with_logos: usize,
    unique_urls: usize,
    already_cached: usize,
    newly_cached: usize,
    errors: usize,
    local_skipped: usize,
}

pub struct LogoCachingStage {
    cacher: Option<Arc<dyn LogoCacher>>,
}

impl LogoCachingStage {
    pub fn new(cacher: Option<Arc<dyn LogoCacher>>) -> Self {
        Self { cacher }
    }

    async fn warm_urls(
        &self,
        cacher: &dyn LogoCacher,
        urls: &[String],
        stats: &mut TargetStats,
        token: &CancellationToken,
    ) -> Result<(), PipelineError> {
        for url in urls {
            if token.is_cancelled() {
                return Err(PipelineError::Cancelled);
            }
            if cacher.contains(url) {
                stats.already_cached += 1;
                trace!("Logo already cached url={}", url);
                continue;
            }
            match cacher.cache_logo(url).await {
                Ok(meta) => {
                    stats.newly_cached += 1;
                    trace!("Cached logo url={} id={}", url, meta.id);
                }
                Err(e) => {
                    stats.errors += 1;
                    warn!("Failed to cache logo url={}: {}", url, e);
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl PipelineStage for LogoCachingStage {
    fn stage_id(&self) -> &'static str {
        "logo_caching"
    }

    fn stage_name(&self) -> &'static str {
        "Logo Caching"
    }

    async fn execute(
        &mut self,
        token: &CancellationToken,
        state: &mut PipelineState,
    ) -> Result<StageResult, PipelineError> {
        let stage_start = Instant::now();
        let channel_count = state.channels.len();
        let program_count = state.programs.len();

        if channel_count == 0 && program_count == 0 {
            return Ok(StageResult::with_message("No channels or programs to process"));
        }

        let Some(cacher) = self.cacher.clone() else {
            debug!("Logo caching stage has no cacher configured");
            return Ok(StageResult {
                records_processed: channel_count + program_count,
                duration: stage_start.elapsed(),
                message: "Logo caching disabled (no cacher configured)".to_string(),
                ..Default::default()
            });
        };

        // Deferred references resolve regardless of the per-proxy cache flags.
        let mut resolved_refs = 0usize;
        for channel in &mut state.channels {
            if let Some(logo) = channel.tvg_logo.as_deref() {
                if let Some(resolved) = resolve_deferred_ref(logo) {
                    channel.tvg_logo = Some(resolved);
                    resolved_refs += 1;
                }
            }
        }
        for program in &mut state.programs {
            if let Some(icon) = program.icon.as_deref() {
                if let Some(resolved) = resolve_deferred_ref(icon) {
                    program.icon = Some(resolved);
                    resolved_refs += 1;
                }
            }
        }
        if resolved_refs > 0 {
            debug!("Resolved {} deferred logo references", resolved_refs);
        }

        let cache_channels = state.proxy.cache_channel_logos;
        let cache_programs = state.proxy.cache_program_logos;
        if !cache_channels && !cache_programs {
            return Ok(StageResult {
                records_processed: channel_count + program_count,
                records_modified: resolved_refs,
                duration: stage_start.elapsed(),
                message: "Logo caching disabled in proxy settings".to_string(),
                ..Default::default()
            });
        }

        let mut channel_stats = TargetStats {
            processed: channel_count,
            ..Default::default()
        };
        let mut program_stats = TargetStats {
            processed: program_count,
            ..Default::default()
        };

        if cache_channels {
            let urls = collect_unique_remote_urls(
                state.channels.iter().filter_map(|c| c.tvg_logo.as_deref()),
                &mut channel_stats,
            );
            self.warm_urls(cacher.as_ref(), &urls, &mut channel_stats, token)
                .await?;
        }

        if cache_programs {
            let urls = collect_unique_remote_urls(
                state.programs.iter().filter_map(|p| p.icon.as_deref()),
                &mut program_stats,
            );
            self.warm_urls(cacher.as_ref(), &urls, &mut program_stats, token)
                .await?;
        }

        let total_new = channel_stats.newly_cached + program_stats.newly_cached;
        let total_hits = channel_stats.already_cached + program_stats.already_cached;
        let total_errors = channel_stats.errors + program_stats.errors;

        info!(
            "Logo caching completed channels={} programs={} unique_urls={} newly_cached={} already_cached={} errors={} local_skipped={} resolved_refs={} duration={}",
            channel_stats.processed,
            program_stats.processed,
            channel_stats.unique_urls + program_stats.unique_urls,
            total_new,
            total_hits,
            total_errors,
            channel_stats.local_skipped + program_stats.local_skipped,
            resolved_refs,
            crate::utils::human_format::format_duration_precise(stage_start.elapsed())
        );

        let artifact = PipelineArtifact::new(ArtifactType::transformed_channels(), self.stage_id())
        .with_record_count(channel_count + program_count)
        .with_metadata("channels_processed", serde_json::json!(channel_stats.processed))
        .with_metadata("channels_with_logos", serde_json::json!(channel_stats.with_logos))
        .with_metadata("channels_unique_urls", serde_json::json!(channel_stats.unique_urls))
        .with_metadata("channels_already_cached", serde_json::json!(channel_stats.already_cached))
        .with_metadata("channels_newly_cached", serde_json::json!(channel_stats.newly_cached))
        .with_metadata("channels_errors", serde_json::json!(channel_stats.errors))
        .with_metadata("channels_local_skipped", serde_json::json!(channel_stats.local_skipped))
        .with_metadata("programs_processed", serde_json::json!(program_stats.processed))
        .with_metadata("programs_with_logos", serde_json::json!(program_stats.with_logos))
        .with_metadata("programs_unique_urls", serde_json::json!(program_stats.unique_urls))
        .with_metadata("programs_already_cached", serde_json::json!(program_stats.already_cached))
        .with_metadata("programs_newly_cached", serde_json::json!(program_stats.newly_cached))
        .with_metadata("programs_errors", serde_json::json!(program_stats.errors))
        .with_metadata("programs_local_skipped", serde_json::json!(program_stats.local_skipped))
        .with_metadata("total_newly_cached", serde_json::json!(total_new))
        .with_metadata("total_already_cached", serde_json::json!(total_hits))
        .with_metadata("total_errors", serde_json::json!(total_errors))
        .with_metadata("deferred_refs_resolved", serde_json::json!(resolved_refs));

        Ok(StageResult {
            artifacts: vec![artifact],
            records_processed: channel_count + program_count,
            records_modified: resolved_refs,
            duration: stage_start.elapsed(),
            message: format!(
                "Cached {total_new} new logos ({total_hits} already cached, {total_errors} errors)"
            ),
        })
    }
}

/// Rewrites a deferred `@logo:<ULID>` token to its local API path. Returns
/// `None` when the input is not a valid deferred reference.
fn resolve_deferred_ref(value: &str) -> Option<String> {
    let rest = value.strip_prefix("@logo:")?;
    if rest.len() == 26 && Ulid::from_string(rest).is_ok() {
        Some(format!("/api/v1/logos/{rest}"))
    } else {
        debug!("Leaving malformed deferred logo reference as-is: {}", value);
        None
    }
}

fn classify_logo_url(url: &str) -> LogoUrlKind {
    if url.starts_with("@logo:") {
        return LogoUrlKind::Deferred;
    }
    // Only scheme-less references to our own routes are unfetchable; a
    // fully-qualified URL containing /logos/ in its path is still remote.
    if url.starts_with("/api/v1/logos/") || url.starts_with("/logos/") {
        return LogoUrlKind::LocalReference;
    }
    LogoUrlKind::Remote
}

/// Classify every present URL, counting skips, and return the unique remote
/// URLs in first-seen order.
fn collect_unique_remote_urls<'a>(
    urls: impl Iterator<Item = &'a str>,
    stats: &mut TargetStats,
) -> Vec<String> {
    let mut unique = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();

    for url in urls {
        if url.is_empty() {
            continue;
        }
        stats.with_logos += 1;
        match classify_logo_url(url) {
            LogoUrlKind::Deferred => {
                trace!("Skipping unresolved deferred reference: {}", url);
            }
            LogoUrlKind::LocalReference => {
                stats.local_skipped += 1;
            }
            LogoUrlKind::Remote => {
                if seen.insert(url) {
                    unique.push(url.to_string());
                }
            }
        }
    }
    stats.unique_urls = unique.len();
    unique
}
