//! Channel load stage.
//!
//! Streams channels from every enabled stream source in priority order,
//! appending them to the run state and building the first-wins TVG id map
//! that later stages use to associate programs with channels.

use crate::pipeline::artifacts::{ArtifactType, PipelineArtifact};
use crate::pipeline::error::PipelineError;
use crate::pipeline::state::PipelineState;
use crate::pipeline::traits::{PipelineStage, StageResult};
use crate::repositories::ChannelRepository;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub struct ChannelLoadStage {
    channel_repo: Arc<dyn ChannelRepository>,
}

impl ChannelLoadStage {
    pub fn new(channel_repo: Arc<dyn ChannelRepository>) -> Self {
        Self { channel_repo }
    }
}

#[async_trait]
impl PipelineStage for ChannelLoadStage {
    fn stage_id(&self) -> &'static str {
        "channel_load"
    }

    fn stage_name(&self) -> &'static str {
        "Channel Load"
    }

    async fn execute(
        &mut self,
        token: &CancellationToken,
        state: &mut PipelineState,
    ) -> Result<StageResult, PipelineError> {
        let stage_start = Instant::now();

        if state.sources.is_empty() {
            return Err(PipelineError::config_error(
                "sources",
                "proxy has no stream sources configured",
            ));
        }

        let sources = state.sources.clone();
        let mut sources_loaded = 0usize;

        let channels = &mut state.channels;
        let channel_map = &mut state.channel_map;

        for source in &sources {
            if !source.enabled {
                debug!(
                    "Skipping disabled stream source source_id={} source_name={}",
                    source.id, source.name
                );
                continue;
            }

            let mut visitor = |channel: crate::models::Channel| {
                if token.is_cancelled() {
                    anyhow::bail!("cancelled");
                }
                if let Some(tvg_id) = channel.tvg_id.as_deref() {
                    if !tvg_id.is_empty() && !channel_map.contains_key(tvg_id) {
                        channel_map.insert(tvg_id.to_string(), channel.clone());
                    }
                }
                channels.push(channel);
                Ok(())
            };

            if let Err(e) = self
                .channel_repo
                .get_by_source_id(&source.id, &mut visitor)
                .await
            {
                if token.is_cancelled() {
                    return Err(PipelineError::Cancelled);
                }
                return Err(PipelineError::stage_error(
                    self.stage_id(),
                    self.stage_name(),
                    anyhow::anyhow!("stream source '{}' failed: {e}", source.name),
                ));
            }
            sources_loaded += 1;
        }

        let loaded = state.channels.len();
        info!(
            "Channel load completed sources={} channels={} tvg_mapped={} duration={}",
            sources_loaded,
            loaded,
            state.channel_map.len(),
            crate::utils::human_format::format_duration_precise(stage_start.elapsed())
        );

        let artifact = PipelineArtifact::new(ArtifactType::raw_channels(), self.stage_id())
            .with_record_count(loaded)
            .with_metadata("sources_loaded", serde_json::json!(sources_loaded));

        Ok(StageResult {
            artifacts: vec![artifact],
            records_processed: loaded,
            records_modified: loaded,
            duration: stage_start.elapsed(),
            message: format!("Loaded {loaded} channels from {sources_loaded} sources"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Channel, Proxy, ProxySource};
    use crate::repositories::InMemoryChannelRepository;
    use std::path::PathBuf;

    fn channel(name: &str, tvg_id: Option<&str>) -> Channel {
        Channel {
            tvg_id: tvg_id.map(str::to_string),
            channel_name: name.to_string(),
            stream_url: format!("http://example.com/{name}"),
            ..Default::default()
        }
    }

    fn proxy(sources: Vec<ProxySource>) -> Proxy {
        Proxy {
            id: "01JGME8BKRTZQ0YVB7NP3XH2DA".to_string(),
            name: "test".to_string(),
            sources,
            epg_sources: vec![],
            filters: vec![],
            output_path: None,
            starting_channel_number: 0,
            numbering_mode: None,
            group_numbering_size: 0,
            cache_channel_logos: false,
            cache_program_logos: false,
        }
    }

    fn source(id: &str, enabled: bool, priority: i32) -> ProxySource {
        ProxySource {
            id: id.to_string(),
            name: id.to_string(),
            enabled,
            priority,
        }
    }

    fn state(proxy: Proxy) -> PipelineState {
        PipelineState::new(proxy, PathBuf::from("/tmp/run"), PathBuf::from("/tmp/out"))
    }

    #[tokio::test]
    async fn fails_without_sources() {
        let repo = Arc::new(InMemoryChannelRepository::new());
        let mut stage = ChannelLoadStage::new(repo);
        let mut state = state(proxy(vec![]));

        let err = stage
            .execute(&CancellationToken::new(), &mut state)
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Configuration { ref field, .. } if field == "sources"));
    }

    #[tokio::test]
    async fn first_wins_across_priority_ordered_sources() {
        let repo = Arc::new(
            InMemoryChannelRepository::new()
                .with_source("primary", vec![channel("BBC One HD", Some("bbc1"))])
                .with_source("backup", vec![channel("BBC One SD", Some("bbc1"))]),
        );
        let mut stage = ChannelLoadStage::new(repo);
        // backup listed first but primary carries higher priority
        let mut state = state(proxy(vec![
            source("backup", true, 5),
            source("primary", true, 1),
        ]));

        let result = stage
            .execute(&CancellationToken::new(), &mut state)
            .await
            .unwrap();
        assert_eq!(result.records_processed, 2);
        assert_eq!(state.channels.len(), 2);
        assert_eq!(state.channel_map["bbc1"].channel_name, "BBC One HD");
    }

    #[tokio::test]
    async fn disabled_sources_are_skipped() {
        let repo = Arc::new(
            InMemoryChannelRepository::new()
                .with_source("on", vec![channel("Kept", None)])
                .with_source("off", vec![channel("Dropped", None)]),
        );
        let mut stage = ChannelLoadStage::new(repo);
        let mut state = state(proxy(vec![source("on", true, 1), source("off", false, 2)]));

        stage
            .execute(&CancellationToken::new(), &mut state)
            .await
            .unwrap();
        assert_eq!(state.channels.len(), 1);
        assert_eq!(state.channels[0].channel_name, "Kept");
    }

    #[tokio::test]
    async fn empty_tvg_ids_do_not_enter_the_map() {
        let repo = Arc::new(InMemoryChannelRepository::new().with_source(
            "src",
            vec![channel("No id", None), channel("Blank id", Some(""))],
        ));
        let mut stage = ChannelLoadStage::new(repo);
        let mut state = state(proxy(vec![source("src", true, 1)]));

        stage
            .execute(&CancellationToken::new(), &mut state)
            .await
            .unwrap();
        assert!(state.channel_map.is_empty());
    }

    #[tokio::test]
    async fn cancellation_aborts_iteration() {
        let repo = Arc::new(InMemoryChannelRepository::new().with_source(
            "src",
            vec![channel("A", None), channel("B", None)],
        ));
        let mut stage = ChannelLoadStage::new(repo);
        let mut state = state(proxy(vec![source("src", true, 1)]));

        let token = CancellationToken::new();
        token.cancel();
        let err = stage.execute(&token, &mut state).await.unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
    }
}
