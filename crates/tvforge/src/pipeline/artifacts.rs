//! Pipeline artifact lineage records.
//!
//! Each stage appends artifacts describing what it produced; the run state
//! keys them by producing stage. Artifacts may reference a file (generated
//! outputs) or stand alone as in-memory lineage (filtered/numbered sets).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use ulid::Ulid;

/// Content an artifact describes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ContentType {
    Channels,
    Programs,
    M3u,
    Xmltv,
}

/// Processing stage the content has reached.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum ProcessingStage {
    Raw,
    Filtered,
    Transformed,
    Numbered,
    Generated,
    Published,
}

/// Content type + processing stage pair identifying what an artifact is.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct ArtifactType {
    pub content: ContentType,
    pub stage: ProcessingStage,
}

impl ArtifactType {
    pub fn new(content: ContentType, stage: ProcessingStage) -> Self {
        Self { content, stage }
    }

    pub fn raw_channels() -> Self {
        Self::new(ContentType::Channels, ProcessingStage::Raw)
    }

    pub fn raw_programs() -> Self {
        Self::new(ContentType::Programs, ProcessingStage::Raw)
    }

    pub fn filtered_channels() -> Self {
        Self::new(ContentType::Channels, ProcessingStage::Filtered)
    }

    pub fn numbered_channels() -> Self {
        Self::new(ContentType::Channels, ProcessingStage::Numbered)
    }

    pub fn transformed_channels() -> Self {
        Self::new(ContentType::Channels, ProcessingStage::Transformed)
    }
}

impl std::fmt::Display for ArtifactType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}_{:?}", self.content, self.stage)
    }
}

/// A lineage record produced by a pipeline stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineArtifact {
    pub id: String,
    pub artifact_type: ArtifactType,
    /// Relative file path, when the artifact references a file.
    #[serde(default)]
    pub file_path: Option<String>,
    /// Stage id of the producing stage.
    pub created_by: String,
    #[serde(default)]
    pub record_count: usize,
    #[serde(default)]
    pub file_size: u64,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl PipelineArtifact {
    pub fn new(artifact_type: ArtifactType, created_by: impl Into<String>) -> Self {
        Self {
            id: Ulid::new().to_string(),
            artifact_type,
            file_path: None,
            created_by: created_by.into(),
            record_count: 0,
            file_size: 0,
            created_at: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_file_path(mut self, path: impl Into<String>) -> Self {
        self.file_path = Some(path.into());
        self
    }

    pub fn with_record_count(mut self, count: usize) -> Self {
        self.record_count = count;
        self
    }

    pub fn with_file_size(mut self, size: u64) -> Self {
        self.file_size = size;
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }
}
