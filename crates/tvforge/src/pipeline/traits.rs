//! Core pipeline contracts.

use crate::pipeline::artifacts::PipelineArtifact;
use crate::pipeline::error::PipelineError;
use crate::pipeline::state::PipelineState;
use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Outcome of one stage execution.
#[derive(Debug, Clone, Default)]
pub struct StageResult {
    pub artifacts: Vec<PipelineArtifact>,
    pub records_processed: usize,
    pub records_modified: usize,
    pub duration: Duration,
    pub message: String,
}

impl StageResult {
    pub fn with_message(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Default::default()
        }
    }
}

/// A unit of the pipeline.
///
/// Stages execute sequentially and own the run state exclusively while
/// running. They must return promptly after their next cancellation poll once
/// the token fires. `cleanup` is invoked exactly once per attempted stage,
/// whatever the outcome.
#[async_trait]
pub trait PipelineStage: Send + Sync {
    /// Stable identifier used for artifact keying and error reporting.
    fn stage_id(&self) -> &'static str;

    /// Human-readable name.
    fn stage_name(&self) -> &'static str;

    async fn execute(
        &mut self,
        token: &CancellationToken,
        state: &mut PipelineState,
    ) -> Result<StageResult, PipelineError>;

    async fn cleanup(&mut self) -> Result<(), PipelineError> {
        Ok(())
    }
}

/// Receives progress updates during a run. Fractions are 0.0..=1.0.
#[async_trait]
pub trait ProgressReporter: Send + Sync {
    async fn report(&self, stage_id: &str, fraction: f64, message: &str);
}
