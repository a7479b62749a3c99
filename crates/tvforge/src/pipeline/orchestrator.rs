//! Pipeline orchestrator.
//!
//! Runs the configured stage sequence against a single mutable run state,
//! with at-most-one execution per proxy id process-wide, a per-run temp
//! directory that is removed on every exit path, fail-fast stage error
//! wrapping, and cleanup of every attempted stage.

use crate::config::IngestionGuardSettings;
use crate::ingest::StateChecker;
use crate::logo_cache::LogoCacher;
use crate::models::Proxy;
use crate::pipeline::error::PipelineError;
use crate::pipeline::state::PipelineState;
use crate::pipeline::traits::{PipelineStage, ProgressReporter, StageResult};
use crate::repositories::{ChannelRepository, EpgProgramRepository};
use crate::utils::clock::Clock;
use sandboxed_fs::Sandbox;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use ulid::Ulid;

/// Process-wide set of proxy ids with an execution in flight.
fn in_flight() -> &'static Mutex<HashSet<String>> {
    static IN_FLIGHT: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();
    IN_FLIGHT.get_or_init(|| Mutex::new(HashSet::new()))
}

/// Releases the single-flight slot on every exit path.
struct SingleFlightGuard {
    proxy_id: String,
}

impl Drop for SingleFlightGuard {
    fn drop(&mut self) {
        in_flight()
            .lock()
            .expect("single-flight lock poisoned")
            .remove(&self.proxy_id);
    }
}

/// Outcome of a full pipeline run.
#[derive(Debug)]
pub struct PipelineResult {
    pub success: bool,
    pub channel_count: usize,
    pub program_count: usize,
    pub duration: Duration,
    pub stage_results: HashMap<String, StageResult>,
    pub errors: Vec<String>,
    pub m3u_path: Option<PathBuf>,
    pub xmltv_path: Option<PathBuf>,
}

/// Dependency bundle for assembling the standard stage sequence. Missing
/// optionals turn the corresponding stage into a no-op.
pub struct StageDependencies {
    pub channel_repo: Arc<dyn ChannelRepository>,
    pub epg_repo: Arc<dyn EpgProgramRepository>,
    pub logo_cacher: Option<Arc<dyn LogoCacher>>,
    pub state_checker: Option<Arc<dyn StateChecker>>,
    pub clock: Arc<dyn Clock>,
    /// Base URL this deployment serves assets from; available to stages that
    /// emit absolute links.
    pub base_url: String,
    pub guard_settings: IngestionGuardSettings,
}

pub struct PipelineOrchestrator {
    stages: Vec<Box<dyn PipelineStage>>,
    temp_sandbox: Sandbox,
    output_sandbox: Sandbox,
    progress: Option<Arc<dyn ProgressReporter>>,
}

impl PipelineOrchestrator {
    /// Create an orchestrator with no stages; callers add their own.
    pub fn new(temp_sandbox: Sandbox, output_sandbox: Sandbox) -> Self {
        Self {
            stages: Vec::new(),
            temp_sandbox,
            output_sandbox,
            progress: None,
        }
    }

    /// Create an orchestrator carrying the standard stage order:
    /// ingestion guard, channel load, program load, filtering, numbering,
    /// logo caching.
    pub fn with_default_stages(
        temp_sandbox: Sandbox,
        output_sandbox: Sandbox,
        deps: StageDependencies,
    ) -> Self {
        let mut orchestrator = Self::new(temp_sandbox, output_sandbox);
        orchestrator.add_stage(Box::new(
            crate::pipeline::stages::IngestionGuardStage::new(
                deps.state_checker,
                deps.guard_settings,
            ),
        ));
        orchestrator.add_stage(Box::new(crate::pipeline::stages::ChannelLoadStage::new(
            deps.channel_repo,
        )));
        orchestrator.add_stage(Box::new(crate::pipeline::stages::ProgramLoadStage::new(
            deps.epg_repo,
            deps.clock,
        )));
        orchestrator.add_stage(Box::new(crate::pipeline::stages::FilteringStage::new()));
        orchestrator.add_stage(Box::new(crate::pipeline::stages::NumberingStage::new()));
        orchestrator.add_stage(Box::new(crate::pipeline::stages::LogoCachingStage::new(
            deps.logo_cacher,
        )));
        orchestrator
    }

    pub fn add_stage(&mut self, stage: Box<dyn PipelineStage>) {
        self.stages.push(stage);
    }

    pub fn set_progress_reporter(&mut self, reporter: Arc<dyn ProgressReporter>) {
        self.progress = Some(reporter);
    }

    /// Execute the pipeline for one proxy.
    ///
    /// Fails immediately with [`PipelineError::AlreadyRunning`] when a run for
    /// the same proxy id is in flight; otherwise creates the run's temp
    /// directory, executes every stage in order, and finalizes the result.
    /// The temp directory is removed and the single-flight slot released on
    /// every exit path.
    pub async fn execute(
        &mut self,
        token: &CancellationToken,
        proxy: Proxy,
    ) -> Result<PipelineResult, PipelineError> {
        let run_start = Instant::now();
        let proxy_id = proxy.id.clone();

        let _flight_guard = {
            let mut running = in_flight().lock().expect("single-flight lock poisoned");
            if !running.insert(proxy_id.clone()) {
                return Err(PipelineError::AlreadyRunning { proxy_id });
            }
            SingleFlightGuard {
                proxy_id: proxy_id.clone(),
            }
        };

        let temp_rel = format!(
            "pipeline-{}-{}",
            proxy_id,
            Ulid::new().to_string().to_lowercase()
        );
        self.temp_sandbox.create_dir_all(&temp_rel).await?;
        let temp_dir = self.temp_sandbox.resolve_path(&temp_rel)?;
        info!(
            "Pipeline execution started proxy_id={} temp_dir={}",
            proxy_id,
            temp_dir.display()
        );

        let mut state = PipelineState::new(
            proxy,
            temp_dir,
            self.output_sandbox.base_dir().to_path_buf(),
        );
        state.progress = self.progress.clone();

        let outcome = self.run_stages(token, &mut state).await;

        if let Err(e) = self.temp_sandbox.remove_all(&temp_rel).await {
            warn!("Failed to remove pipeline temp directory {}: {}", temp_rel, e);
        }

        let stage_results = outcome?;
        let result = self.finalize(&state, stage_results, run_start.elapsed()).await;
        info!(
            "Pipeline execution completed proxy_id={} channels={} programs={} duration={}",
            proxy_id,
            result.channel_count,
            result.program_count,
            crate::utils::human_format::format_duration_precise(result.duration)
        );
        Ok(result)
    }

    /// Execute stages sequentially; cleanup runs for every attempted stage on
    /// both the success and the failure path.
    async fn run_stages(
        &mut self,
        token: &CancellationToken,
        state: &mut PipelineState,
    ) -> Result<HashMap<String, StageResult>, PipelineError> {
        let mut stage_results = HashMap::new();
        let mut attempted = 0usize;
        let mut failure: Option<PipelineError> = None;
        let total = self.stages.len();

        for index in 0..total {
            if token.is_cancelled() {
                warn!("Pipeline cancelled before stage {}/{}", index + 1, total);
                failure = Some(PipelineError::Cancelled);
                break;
            }

            let stage_id = self.stages[index].stage_id();
            let stage_name = self.stages[index].stage_name();
            info!("Executing stage {}/{}: {} ({})", index + 1, total, stage_name, stage_id);

            if let Some(progress) = &self.progress {
                progress.report(stage_id, 0.0, "Starting").await;
            }

            let stage_start = Instant::now();
            attempted += 1;
            let execution = self.stages[index].execute(token, state).await;
            let duration = stage_start.elapsed();

            match execution {
                Ok(mut result) => {
                    result.duration = duration;
                    state.record_artifacts(stage_id, &result.artifacts);
                    if let Some(progress) = &self.progress {
                        progress.report(stage_id, 1.0, "Complete").await;
                    }
                    info!(
                        "Stage {} completed in {} ({})",
                        stage_name,
                        crate::utils::human_format::format_duration_precise(duration),
                        result.message
                    );
                    stage_results.insert(stage_id.to_string(), result);
                }
                Err(e) => {
                    let wrapped = match e {
                        PipelineError::Cancelled => PipelineError::Cancelled,
                        already @ PipelineError::Stage { .. } => already,
                        other => PipelineError::stage_error(stage_id, stage_name, other),
                    };
                    error!("Stage {} failed: {}", stage_name, wrapped);
                    failure = Some(wrapped);
                    break;
                }
            }
        }

        for stage in self.stages.iter_mut().take(attempted) {
            let stage_name = stage.stage_name();
            if let Err(e) = stage.cleanup().await {
                warn!("Stage {} cleanup failed: {}", stage_name, e);
            }
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(stage_results),
        }
    }

    /// Populate the result from the final state and probe the output
    /// directory for published files.
    async fn finalize(
        &self,
        state: &PipelineState,
        stage_results: HashMap<String, StageResult>,
        duration: Duration,
    ) -> PipelineResult {
        let m3u_rel = format!("{}.m3u", state.proxy_id);
        let xmltv_rel = format!("{}.xml", state.proxy_id);

        let m3u_path = match self.output_sandbox.exists(&m3u_rel).await {
            Ok(true) => Some(self.output_sandbox.base_dir().join(&m3u_rel)),
            _ => None,
        };
        let xmltv_path = match self.output_sandbox.exists(&xmltv_rel).await {
            Ok(true) => Some(self.output_sandbox.base_dir().join(&xmltv_rel)),
            _ => None,
        };

        PipelineResult {
            success: true,
            channel_count: state.channel_count(),
            program_count: state.program_count(),
            duration,
            stage_results,
            errors: state.errors.clone(),
            m3u_path,
            xmltv_path,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Proxy;
    use async_trait::async_trait;

    fn proxy(id: &str) -> Proxy {
        Proxy {
            id: id.to_string(),
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
        }
    }

    async fn sandboxes() -> (tempfile::TempDir, Sandbox, Sandbox) {
        let dir = tempfile::tempdir().unwrap();
        let temp = Sandbox::create(dir.path().join("temp")).await.unwrap();
        let output = Sandbox::create(dir.path().join("output")).await.unwrap();
        (dir, temp, output)
    }

    /// Stage that records whether it executed and cleaned up.
    struct ProbeStage {
        executed: Arc<std::sync::atomic::AtomicBool>,
        cleaned: Arc<std::sync::atomic::AtomicBool>,
        delay: Duration,
        fail: bool,
    }

    impl ProbeStage {
        fn new() -> (Self, Arc<std::sync::atomic::AtomicBool>, Arc<std::sync::atomic::AtomicBool>) {
            let executed = Arc::new(std::sync::atomic::AtomicBool::new(false));
            let cleaned = Arc::new(std::sync::atomic::AtomicBool::new(false));
            (
                Self {
                    executed: executed.clone(),
                    cleaned: cleaned.clone(),
                    delay: Duration::ZERO,
                    fail: false,
                },
                executed,
                cleaned,
            )
        }

        fn failing() -> Self {
            let (mut stage, _, _) = Self::new();
            stage.fail = true;
            stage
        }

        fn slow(delay: Duration) -> Self {
            let (mut stage, _, _) = Self::new();
            stage.delay = delay;
            stage
        }
    }

    #[async_trait]
    impl PipelineStage for ProbeStage {
        fn stage_id(&self) -> &'static str {
            "probe"
        }

        fn stage_name(&self) -> &'static str {
            "Probe"
        }

        async fn execute(
            &mut self,
            _token: &CancellationToken,
            _state: &mut PipelineState,
        ) -> Result<StageResult, PipelineError> {
            self.executed.store(true, std::sync::atomic::Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if self.fail {
                return Err(PipelineError::stage_error(
                    "probe",
                    "Probe",
                    anyhow::anyhow!("simulated stage failure"),
                ));
            }
            Ok(StageResult::with_message("ok"))
        }

        async fn cleanup(&mut self) -> Result<(), PipelineError> {
            self.cleaned.store(true, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn successful_run_cleans_temp_and_stages() {
        let (_guard, temp, output) = sandboxes().await;
        let mut orchestrator = PipelineOrchestrator::new(temp.clone(), output);
        let (stage, executed, cleaned) = ProbeStage::new();
        orchestrator.add_stage(Box::new(stage));

        let result = orchestrator
            .execute(&CancellationToken::new(), proxy("01JGMEAAA0000000000000001A"))
            .await
            .unwrap();

        assert!(result.success);
        assert!(executed.load(std::sync::atomic::Ordering::SeqCst));
        assert!(cleaned.load(std::sync::atomic::Ordering::SeqCst));
        // Temp directory was removed.
        let leftovers = std::fs::read_dir(temp.base_dir()).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn stage_failure_wraps_and_still_cleans_temp() {
        let (_guard, temp, output) = sandboxes().await;
        let mut orchestrator = PipelineOrchestrator::new(temp.clone(), output);
        orchestrator.add_stage(Box::new(ProbeStage::failing()));
        let (unreached, executed, _) = ProbeStage::new();
        orchestrator.add_stage(Box::new(unreached));

        let err = orchestrator
            .execute(&CancellationToken::new(), proxy("01JGMEAAA0000000000000002B"))
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Stage { .. }));
        // Fail-fast: the second stage never ran.
        assert!(!executed.load(std::sync::atomic::Ordering::SeqCst));
        let leftovers = std::fs::read_dir(temp.base_dir()).unwrap().count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn cancellation_before_stage_returns_cancelled() {
        let (_guard, temp, output) = sandboxes().await;
        let mut orchestrator = PipelineOrchestrator::new(temp, output);
        let (stage, executed, _) = ProbeStage::new();
        orchestrator.add_stage(Box::new(stage));

        let token = CancellationToken::new();
        token.cancel();
        let err = orchestrator
            .execute(&token, proxy("01JGMEAAA0000000000000003C"))
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::Cancelled));
        assert!(!executed.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn concurrent_same_proxy_executions_single_flight() {
        let proxy_id = "01JGMEAAA0000000000000004D";

        let (_g1, temp1, out1) = sandboxes().await;
        let mut first = PipelineOrchestrator::new(temp1, out1);
        first.add_stage(Box::new(ProbeStage::slow(Duration::from_millis(200))));

        let (_g2, temp2, out2) = sandboxes().await;
        let mut second = PipelineOrchestrator::new(temp2, out2);
        second.add_stage(Box::new(ProbeStage::slow(Duration::from_millis(200))));

        let first_task = tokio::spawn({
            let proxy = proxy(proxy_id);
            async move { first.execute(&CancellationToken::new(), proxy).await }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        let second_result = second.execute(&CancellationToken::new(), proxy(proxy_id)).await;

        assert!(matches!(
            second_result.unwrap_err(),
            PipelineError::AlreadyRunning { .. }
        ));
        assert!(first_task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn slot_is_released_after_completion() {
        let proxy_id = "01JGMEAAA0000000000000005E";
        let (_guard, temp, output) = sandboxes().await;
        let mut orchestrator = PipelineOrchestrator::new(temp, output);
        let (stage, _, _) = ProbeStage::new();
        orchestrator.add_stage(Box::new(stage));

        orchestrator
            .execute(&CancellationToken::new(), proxy(proxy_id))
            .await
            .unwrap();
        // A second run for the same proxy proceeds once the first finished.
        let (stage, _, _) = ProbeStage::new();
        orchestrator.add_stage(Box::new(stage));
        orchestrator
            .execute(&CancellationToken::new(), proxy(proxy_id))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn finalize_picks_up_published_outputs() {
        let proxy_id = "01JGMEAAA0000000000000006F";
        let (_guard, temp, output) = sandboxes().await;
        output
            .write(&format!("{proxy_id}.m3u"), "#EXTM3U\n")
            .await
            .unwrap();

        let mut orchestrator = PipelineOrchestrator::new(temp, output.clone());
        let (stage, _, _) = ProbeStage::new();
        orchestrator.add_stage(Box::new(stage));

        let result = orchestrator
            .execute(&CancellationToken::new(), proxy(proxy_id))
            .await
            .unwrap();
        assert_eq!(
            result.m3u_path,
            Some(output.base_dir().join(format!("{proxy_id}.m3u")))
        );
        assert!(result.xmltv_path.is_none());
    }
}
