//! Program load stage.
//!
//! Streams EPG programs from every enabled EPG source, keeping only programs
//! that belong to a loaded channel and have not already ended. A failing
//! source is recorded on the run state and does not abort the stage.

use crate::pipeline::artifacts::{ArtifactType, PipelineArtifact};
use crate::pipeline::error::PipelineError;
use crate::pipeline::state::PipelineState;
use crate::pipeline::traits::{PipelineStage, StageResult};
use crate::repositories::EpgProgramRepository;
use crate::utils::clock::Clock;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Progress is reported after each multiple of this many visited records.
const PROGRESS_RECORD_INTERVAL: usize = 500;

pub struct ProgramLoadStage {
    epg_repo: Arc<dyn EpgProgramRepository>,
    clock: Arc<dyn Clock>,
}

impl ProgramLoadStage {
    pub fn new(epg_repo: Arc<dyn EpgProgramRepository>, clock: Arc<dyn Clock>) -> Self {
        Self { epg_repo, clock }
    }
}

#[async_trait]
impl PipelineStage for ProgramLoadStage {
    fn stage_id(&self) -> &'static str {
        "program_load"
    }

    fn stage_name(&self) -> &'static str {
        "Program Load"
    }

    async fn execute(
        &mut self,
        token: &CancellationToken,
        state: &mut PipelineState,
    ) -> Result<StageResult, PipelineError> {
        let stage_start = Instant::now();

        if state.epg_sources.is_empty() || state.channel_map.is_empty() {
            debug!(
                "Program load short-circuit epg_sources={} mapped_channels={}",
                state.epg_sources.len(),
                state.channel_map.len()
            );
            return Ok(StageResult::with_message(
                "No EPG sources configured or no channels with TVG ids; nothing to do",
            ));
        }

        let required: HashSet<String> = state.channel_map.keys().cloned().collect();
        let now = self.clock.now();
        let sources = state.epg_sources.clone();

        let mut visited = 0usize;
        let mut dropped_unmatched = 0usize;
        let mut dropped_ended = 0usize;
        let mut kept: Vec<crate::models::EpgProgram> = Vec::new();

        for source in &sources {
            if !source.enabled.unwrap_or(true) {
                debug!(
                    "Skipping disabled EPG source source_id={} source_name={}",
                    source.id, source.name
                );
                continue;
            }

            let total = match self.epg_repo.count_by_source_id(&source.id).await {
                Ok(n) => n,
                Err(e) => {
                    warn!(
                        "Failed to count programs for EPG source {}: {}",
                        source.name, e
                    );
                    0
                }
            };

            let mut source_visited = 0usize;
            let mut visitor = |program: crate::models::EpgProgram| {
                if token.is_cancelled() {
                    anyhow::bail!("cancelled");
                }
                visited += 1;
                source_visited += 1;
                if !required.contains(&program.channel_id) {
                    dropped_unmatched += 1;
                } else if program.stop < now {
                    dropped_ended += 1;
                } else {
                    kept.push(program);
                }
                Ok(())
            };

            let iteration = self.epg_repo.get_by_source_id(&source.id, &mut visitor).await;

            if let Err(e) = iteration {
                if token.is_cancelled() {
                    return Err(PipelineError::Cancelled);
                }
                warn!("EPG source {} failed: {}; continuing", source.name, e);
                state.push_error(format!("EPG source '{}' failed: {e}", source.name));
                continue;
            }

            if let Some(progress) = &state.progress {
                // Sources stream synchronously through the visitor, so report
                // at interval granularity once iteration finishes.
                if source_visited >= PROGRESS_RECORD_INTERVAL || total > 0 {
                    let fraction = if total > 0 {
                        (source_visited as f64 / total as f64).clamp(0.0, 1.0)
                    } else {
                        1.0
                    };
                    progress
                        .report(
                            self.stage_id(),
                            fraction,
                            &format!("Scanned {source_visited}/{total} programs from {}", source.name),
                        )
                        .await;
                }
            }
        }

        let kept_count = kept.len();
        state.programs.extend(kept);

        info!(
            "Program load completed visited={} kept={} dropped_unmatched={} dropped_ended={} duration={}",
            visited,
            kept_count,
            dropped_unmatched,
            dropped_ended,
            crate::utils::human_format::format_duration_precise(stage_start.elapsed())
        );

        let artifact = PipelineArtifact::new(ArtifactType::raw_programs(), self.stage_id())
            .with_record_count(kept_count)
            .with_metadata("programs_dropped_unmatched", serde_json::json!(dropped_unmatched))
            .with_metadata("programs_dropped_ended", serde_json::json!(dropped_ended));

        Ok(StageResult {
            artifacts: vec![artifact],
            records_processed: visited,
            records_modified: kept_count,
            duration: stage_start.elapsed(),
            message: format!("Loaded {kept_count} of {visited} programs"),
        })
    }
}
