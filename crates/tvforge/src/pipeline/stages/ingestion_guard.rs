//! Ingestion guard stage.
//!
//! Gates the pipeline behind active source ingestion: while any source is
//! still ingesting, the stage polls at a fixed interval until the activity
//! settles or the wait budget is exhausted. Exhausting the budget fails the
//! run, naming the sources still ingesting.

use crate::config::IngestionGuardSettings;
use crate::ingest::StateChecker;
use crate::pipeline::error::PipelineError;
use crate::pipeline::state::PipelineState;
use crate::pipeline::traits::{PipelineStage, StageResult};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct IngestionGuardStage {
    checker: Option<Arc<dyn StateChecker>>,
    settings: IngestionGuardSettings,
}

impl IngestionGuardStage {
    pub fn new(checker: Option<Arc<dyn StateChecker>>, settings: IngestionGuardSettings) -> Self {
        Self { checker, settings }
    }
}

#[async_trait]
impl PipelineStage for IngestionGuardStage {
    fn stage_id(&self) -> &'static str {
        "ingestion_guard"
    }

    fn stage_name(&self) -> &'static str {
        "Ingestion Guard"
    }

    async fn execute(
        &mut self,
        token: &CancellationToken,
        _state: &mut PipelineState,
    ) -> Result<StageResult, PipelineError> {
        let stage_start = Instant::now();

        let Some(checker) = &self.checker else {
            debug!("Ingestion guard has no state checker; continuing");
            return Ok(StageResult::with_message("Ingestion guard disabled"));
        };
        if !self.settings.enabled {
            return Ok(StageResult::with_message("Ingestion guard disabled"));
        }

        if !checker.is_any_ingesting() {
            debug!("No active ingestion detected; continuing immediately");
            return Ok(StageResult::with_message("No active ingestion"));
        }

        let initial_count = checker.active_ingestion_count();
        info!(
            "Active ingestion detected count={} waiting up to {:?}",
            initial_count, self.settings.max_wait_time
        );

        loop {
            if stage_start.elapsed() >= self.settings.max_wait_time {
                let active: Vec<String> = checker
                    .all_states()
                    .into_iter()
                    .filter(|s| s.phase == crate::ingest::IngestionPhase::Ingesting)
                    .map(|s| s.source_name)
                    .collect();
                warn!(
                    "Ingestion guard timed out after {:?} with {} sources still active",
                    self.settings.max_wait_time,
                    active.len()
                );
                return Err(PipelineError::stage_error(
                    self.stage_id(),
                    self.stage_name(),
                    anyhow::anyhow!(
                        "timed out after {:?} waiting for ingestion to finish; still active: {}",
                        self.settings.max_wait_time,
                        active.join(", ")
                    ),
                ));
            }

            tokio::select! {
                _ = token.cancelled() => return Err(PipelineError::Cancelled),
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
            }

            if !checker.is_any_ingesting() {
                let waited = stage_start.elapsed();
                info!("Ingestion settled after {:?}", waited);
                return Ok(StageResult {
                    records_processed: initial_count,
                    duration: waited,
                    message: format!(
                        "Waited {} for {} active ingestions to finish",
                        crate::utils::human_format::format_duration_precise(waited),
                        initial_count
                    ),
                    ..Default::default()
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::IngestionStateManager;
    use crate::models::Proxy;
    use std::path::PathBuf;
    use std::time::Duration;

    fn settings(poll_ms: u64, max_ms: u64) -> IngestionGuardSettings {
        IngestionGuardSettings {
            enabled: true,
            poll_interval: Duration::from_millis(poll_ms),
            max_wait_time: Duration::from_millis(max_ms),
        }
    }

    fn state() -> PipelineState {
        let proxy = Proxy {
            id: "01JGME8BKRTZQ0YVB7NP3XH2DA".to_string(),
            name: "test".to_string(),
            sources: vec![],
            epg_sources: vec![],
            filters: vec![],
            output_path: None,
            starting_channel_number: 0,
            numbering_mode: None,
            group_numbering_size: 0,
            cache_channel_logos: false,
            cache_program_logos: false,
        };
        PipelineState::new(proxy, PathBuf::from("/tmp/run"), PathBuf::from("/tmp/out"))
    }

    #[tokio::test]
    async fn fast_path_when_nothing_ingesting() {
        let manager = Arc::new(IngestionStateManager::new());
        let mut stage = IngestionGuardStage::new(Some(manager), settings(10, 100));
        let result = stage
            .execute(&CancellationToken::new(), &mut state())
            .await
            .unwrap();
        assert_eq!(result.message, "No active ingestion");
    }

    #[tokio::test]
    async fn disabled_guard_returns_immediately() {
        let manager = Arc::new(IngestionStateManager::new());
        manager.start_ingestion("src", "Provider");
        let mut disabled = settings(10, 100);
        disabled.enabled = false;
        let mut stage = IngestionGuardStage::new(Some(manager), disabled);
        let result = stage
            .execute(&CancellationToken::new(), &mut state())
            .await
            .unwrap();
        assert_eq!(result.message, "Ingestion guard disabled");
    }

    #[tokio::test]
    async fn waits_until_ingestion_clears() {
        let manager = Arc::new(IngestionStateManager::new());
        manager.start_ingestion("src", "Provider");

        let clearer = manager.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(40)).await;
            clearer.complete_ingestion("src");
        });

        let mut stage = IngestionGuardStage::new(Some(manager), settings(10, 2000));
        let result = stage
            .execute(&CancellationToken::new(), &mut state())
            .await
            .unwrap();
        assert_eq!(result.records_processed, 1);
        assert!(result.message.starts_with("Waited"));
    }

    #[tokio::test]
    async fn timeout_fails_naming_active_sources() {
        let manager = Arc::new(IngestionStateManager::new());
        manager.start_ingestion("src", "Stuck Provider");

        let mut stage = IngestionGuardStage::new(Some(manager), settings(10, 50));
        let err = stage
            .execute(&CancellationToken::new(), &mut state())
            .await
            .unwrap_err();
        let text = err.to_string();
        assert!(text.contains("timed out"));
        assert!(text.contains("Stuck Provider"));
    }

    #[tokio::test]
    async fn cancellation_interrupts_the_wait() {
        let manager = Arc::new(IngestionStateManager::new());
        manager.start_ingestion("src", "Provider");

        let token = CancellationToken::new();
        let canceller = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            canceller.cancel();
        });

        let mut stage = IngestionGuardStage::new(Some(manager), settings(1000, 60_000));
        let err = stage.execute(&token, &mut state()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Cancelled));
    }
}
