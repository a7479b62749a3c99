//! Ingestion state tracking.
//!
//! The pipeline's ingestion guard stage consults a [`StateChecker`] to avoid
//! generating artifacts while source ingestion is still writing records. The
//! ingestion subsystem itself lives outside this crate; the process-local
//! [`IngestionStateManager`] tracks whatever that subsystem reports.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;

/// Phase a tracked source is currently in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestionPhase {
    Idle,
    Ingesting,
}

/// Snapshot of one source's ingestion state.
#[derive(Debug, Clone)]
pub struct IngestionState {
    pub source_id: String,
    pub source_name: String,
    pub phase: IngestionPhase,
    pub started_at: Option<DateTime<Utc>>,
}

/// Read-side interface the ingestion guard stage polls.
pub trait StateChecker: Send + Sync {
    fn is_any_ingesting(&self) -> bool;
    fn active_ingestion_count(&self) -> usize;
    fn all_states(&self) -> Vec<IngestionState>;
}

/// Process-local ingestion state registry.
#[derive(Debug, Default)]
pub struct IngestionStateManager {
    states: RwLock<HashMap<String, IngestionState>>,
}

impl IngestionStateManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a source as actively ingesting.
    pub fn start_ingestion(&self, source_id: &str, source_name: &str) {
        let mut states = self.states.write().expect("ingestion state lock poisoned");
        states.insert(
            source_id.to_string(),
            IngestionState {
                source_id: source_id.to_string(),
                source_name: source_name.to_string(),
                phase: IngestionPhase::Ingesting,
                started_at: Some(Utc::now()),
            },
        );
        tracing::debug!("Ingestion started source_id={} source_name={}", source_id, source_name);
    }

    /// Mark a source's ingestion as finished.
    pub fn complete_ingestion(&self, source_id: &str) {
        let mut states = self.states.write().expect("ingestion state lock poisoned");
        if let Some(state) = states.get_mut(source_id) {
            state.phase = IngestionPhase::Idle;
            state.started_at = None;
        }
        tracing::debug!("Ingestion completed source_id={}", source_id);
    }
}

impl StateChecker for IngestionStateManager {
    fn is_any_ingesting(&self) -> bool {
        self.states
            .read()
            .expect("ingestion state lock poisoned")
            .values()
            .any(|s| s.phase == IngestionPhase::Ingesting)
    }

    fn active_ingestion_count(&self) -> usize {
        self.states
            .read()
            .expect("ingestion state lock poisoned")
            .values()
            .filter(|s| s.phase == IngestionPhase::Ingesting)
            .count()
    }

    fn all_states(&self) -> Vec<IngestionState> {
        self.states
            .read()
            .expect("ingestion state lock poisoned")
            .values()
            .cloned()
            .collect()
    }
}
