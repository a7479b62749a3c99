//! Repository seams the pipeline consumes.
//!
//! Repositories stream records to a visitor callback in source-defined order;
//! an error returned by the visitor terminates iteration and propagates. The
//! caller owns cancellation: its visitor polls the token and returns an error
//! to abort. In-memory implementations are provided for tests and dry runs.

use crate::models::{Channel, EpgProgram};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};

/// Visitor invoked once per channel during streaming iteration.
pub type ChannelVisitor<'a> = dyn FnMut(Channel) -> Result<()> + Send + 'a;

/// Visitor invoked once per program during streaming iteration.
pub type EpgProgramVisitor<'a> = dyn FnMut(EpgProgram) -> Result<()> + Send + 'a;

/// Streaming access to ingested channels, keyed by stream source.
#[async_trait]
pub trait ChannelRepository: Send + Sync {
    async fn get_by_source_id(
        &self,
        source_id: &str,
        visitor: &mut ChannelVisitor<'_>,
    ) -> Result<()>;
}

/// Streaming access to ingested EPG programs, keyed by EPG source.
#[async_trait]
pub trait EpgProgramRepository: Send + Sync {
    async fn get_by_source_id(
        &self,
        source_id: &str,
        visitor: &mut EpgProgramVisitor<'_>,
    ) -> Result<()>;

    /// Source cardinality, used for progress denominators.
    async fn count_by_source_id(&self, source_id: &str) -> Result<i64>;
}

/// Ordered in-memory channel repository.
#[derive(Debug, Default)]
pub struct InMemoryChannelRepository {
    by_source: HashMap<String, Vec<Channel>>,
}

impl InMemoryChannelRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(mut self, source_id: impl Into<String>, channels: Vec<Channel>) -> Self {
        self.by_source.insert(source_id.into(), channels);
        self
    }
}

#[async_trait]
impl ChannelRepository for InMemoryChannelRepository {
    async fn get_by_source_id(
        &self,
        source_id: &str,
        visitor: &mut ChannelVisitor<'_>,
    ) -> Result<()> {
        if let Some(channels) = self.by_source.get(source_id) {
            for channel in channels {
                visitor(channel.clone())?;
            }
        }
        Ok(())
    }
}

/// Ordered in-memory EPG program repository. Sources listed via
/// `with_failing_source` error on iteration, for exercising the pipeline's
/// per-source error handling.
#[derive(Debug, Default)]
pub struct InMemoryEpgProgramRepository {
    by_source: HashMap<String, Vec<EpgProgram>>,
    failing_sources: HashSet<String>,
}

impl InMemoryEpgProgramRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_source(mut self, source_id: impl Into<String>, programs: Vec<EpgProgram>) -> Self {
        self.by_source.insert(source_id.into(), programs);
        self
    }

    pub fn with_failing_source(mut self, source_id: impl Into<String>) -> Self {
        self.failing_sources.insert(source_id.into());
        self
    }
}

#[async_trait]
impl EpgProgramRepository for InMemoryEpgProgramRepository {
    async fn get_by_source_id(
        &self,
        source_id: &str,
        visitor: &mut EpgProgramVisitor<'_>,
    ) -> Result<()> {
        if self.failing_sources.contains(source_id) {
            anyhow::bail!("simulated read failure for EPG source {source_id}");
        }
        if let Some(programs) = self.by_source.get(source_id) {
            for program in programs {
                visitor(program.clone())?;
            }
        }
        Ok(())
    }

    async fn count_by_source_id(&self, source_id: &str) -> Result<i64> {
        Ok(self
            .by_source
            .get(source_id)
            .map(|programs| programs.len() as i64)
            .unwrap_or(0))
    }
}
