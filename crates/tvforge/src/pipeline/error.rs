//! Pipeline error taxonomy.
//!
//! Fatal conditions get their own variants; non-fatal per-item failures never
//! surface here (they accumulate on the run state instead).

/// Main error type for pipeline operations.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    /// A run for this proxy is already in flight; no side effects occurred.
    #[error("pipeline already running for proxy {proxy_id}")]
    AlreadyRunning { proxy_id: String },

    /// A stage failed; carries the stage identity and the underlying cause.
    #[error("stage '{stage_name}' ({stage_id}) failed: {source}")]
    Stage {
        stage_id: String,
        stage_name: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Invalid or missing proxy configuration, named by field.
    #[error("configuration error in '{field}': {message}")]
    Configuration { field: String, message: String },

    /// The run's cancellation token fired.
    #[error("pipeline execution cancelled")]
    Cancelled,

    /// Sandboxed filesystem operation failed.
    #[error("sandbox error: {0}")]
    Sandbox(#[from] sandboxed_fs::SandboxError),

    /// Plain filesystem operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PipelineError {
    /// Wrap an underlying error with the failing stage's identity.
    pub fn stage_error(
        stage_id: &str,
        stage_name: &str,
        source: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Self {
        PipelineError::Stage {
            stage_id: stage_id.to_string(),
            stage_name: stage_name.to_string(),
            source: source.into(),
        }
    }

    /// Configuration failure helper.
    pub fn config_error(field: &str, message: impl Into<String>) -> Self {
        PipelineError::Configuration {
            field: field.to_string(),
            message: message.into(),
        }
    }
}
