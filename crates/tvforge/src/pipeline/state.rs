//! Shared per-run pipeline state.

use crate::models::{Channel, EpgProgram, EpgSourceRef, Proxy, ProxySource};
use crate::pipeline::artifacts::PipelineArtifact;
use crate::pipeline::traits::ProgressReporter;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// The mutable record threaded through every stage of one run.
///
/// Owned by the orchestrator; each stage receives it as `&mut` and no
/// concurrent reader exists while a stage runs.
pub struct PipelineState {
    pub proxy_id: String,
    pub proxy: Proxy,
    /// Stream sources in effective iteration order (priority, then position).
    pub sources: Vec<ProxySource>,
    /// EPG sources in effective iteration order.
    pub epg_sources: Vec<EpgSourceRef>,
    pub progress: Option<Arc<dyn ProgressReporter>>,
    /// Per-run scratch directory, absolute; removed when the run ends.
    pub temp_dir: PathBuf,
    /// Stable output directory artifacts are published into.
    pub output_dir: PathBuf,
    pub channels: Vec<Channel>,
    pub programs: Vec<EpgProgram>,
    /// First channel seen for each TVG id across priority-ordered sources.
    pub channel_map: HashMap<String, Channel>,
    pub start_time: DateTime<Utc>,
    /// Non-fatal per-item failures accumulated across stages.
    pub errors: Vec<String>,
    /// Artifact lineage keyed by producing stage id, in production order.
    pub artifacts: HashMap<String, Vec<PipelineArtifact>>,
    /// Free-form cross-stage annotations.
    pub metadata: HashMap<String, serde_json::Value>,
}

impl PipelineState {
    pub fn new(proxy: Proxy, temp_dir: PathBuf, output_dir: PathBuf) -> Self {
        let mut sources = proxy.sources.clone();
        sources.sort_by_key(|s| s.priority);
        let mut epg_sources = proxy.epg_sources.clone();
        epg_sources.sort_by_key(|s| s.priority);

        Self {
            proxy_id: proxy.id.clone(),
            proxy,
            sources,
            epg_sources,
            progress: None,
            temp_dir,
            output_dir,
            channels: Vec::new(),
            programs: Vec::new(),
            channel_map: HashMap::new(),
            start_time: Utc::now(),
            errors: Vec::new(),
            artifacts: HashMap::new(),
            metadata: HashMap::new(),
        }
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn program_count(&self) -> usize {
        self.programs.len()
    }

    /// Append artifacts under the producing stage's key, preserving order.
    pub fn record_artifacts(&mut self, stage_id: &str, artifacts: &[PipelineArtifact]) {
        if artifacts.is_empty() {
            return;
        }
        self.artifacts
            .entry(stage_id.to_string())
            .or_default()
            .extend(artifacts.iter().cloned());
    }

    /// Record a non-fatal failure without aborting the run.
    pub fn push_error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }
}
