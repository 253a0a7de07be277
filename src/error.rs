//! Error types for the weave design-to-module pipeline.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Pipeline error taxonomy.
///
/// A failing quality report is deliberately not an error value: it is a
/// result carrying errors/warnings, and the run continues with a degraded
/// section.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Invalid input: {0}")]
    InputInvalid(String),

    #[error("No sections detected in design input")]
    NoSectionsDetected,

    #[error("Generation failed (transient): {0}")]
    GenerationTransient(String),

    #[error("Generation failed: {0}")]
    GenerationFatal(String),

    #[error("Backend authentication failed: {0}")]
    BackendAuthFailed(String),

    #[error("Backend rate limit exceeded: {0}")]
    BackendRateLimit(String),

    #[error("Backend request failed: {0}")]
    BackendRequestFailed(String),

    #[error("Module incompatible with schema version {version}: {issue_count} issue(s)")]
    SchemaIncompatible { version: String, issue_count: usize },

    #[error("Run cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Stable label for an error variant, used by recovery statistics and run
/// failure records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    InputInvalid,
    NoSectionsDetected,
    GenerationTransient,
    GenerationFatal,
    BackendAuth,
    BackendRateLimit,
    BackendRequest,
    SchemaIncompatible,
    Cancelled,
    Config,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::InputInvalid => "input_invalid",
            ErrorKind::NoSectionsDetected => "no_sections_detected",
            ErrorKind::GenerationTransient => "generation_transient",
            ErrorKind::GenerationFatal => "generation_fatal",
            ErrorKind::BackendAuth => "backend_auth",
            ErrorKind::BackendRateLimit => "backend_rate_limit",
            ErrorKind::BackendRequest => "backend_request",
            ErrorKind::SchemaIncompatible => "schema_incompatible",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Config => "config",
            ErrorKind::Internal => "internal",
        }
    }
}

impl PipelineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            PipelineError::InputInvalid(_) => ErrorKind::InputInvalid,
            PipelineError::NoSectionsDetected => ErrorKind::NoSectionsDetected,
            PipelineError::GenerationTransient(_) => ErrorKind::GenerationTransient,
            PipelineError::GenerationFatal(_) => ErrorKind::GenerationFatal,
            PipelineError::BackendAuthFailed(_) => ErrorKind::BackendAuth,
            PipelineError::BackendRateLimit(_) => ErrorKind::BackendRateLimit,
            PipelineError::BackendRequestFailed(_) => ErrorKind::BackendRequest,
            PipelineError::SchemaIncompatible { .. } => ErrorKind::SchemaIncompatible,
            PipelineError::Cancelled => ErrorKind::Cancelled,
            PipelineError::Config(_) => ErrorKind::Config,
            PipelineError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Whether retrying the failed operation can reasonably succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::GenerationTransient(_)
                | PipelineError::BackendRateLimit(_)
                | PipelineError::BackendRequestFailed(_)
        )
    }

    /// Human-readable remediation hint attached to failed runs.
    pub fn suggestion(&self) -> &'static str {
        match self.kind() {
            ErrorKind::InputInvalid => {
                "Check that the upload is a PNG/JPEG/GIF/WebP image or an HTML fragment under 10 MB"
            }
            ErrorKind::NoSectionsDetected => {
                "The design contains no recognizable regions; supply a richer asset"
            }
            ErrorKind::GenerationTransient | ErrorKind::BackendRateLimit => {
                "The generative backend is saturated; retry the run later"
            }
            ErrorKind::GenerationFatal => {
                "The backend returned unusable markup; review the section context"
            }
            ErrorKind::BackendAuth => "Verify the backend API credentials",
            ErrorKind::BackendRequest => "Verify the backend endpoint is reachable",
            ErrorKind::SchemaIncompatible => {
                "Align the module's field and content types with the target schema version"
            }
            ErrorKind::Cancelled => "The run was cancelled by the caller",
            ErrorKind::Config => "Fix the pipeline configuration and restart",
            ErrorKind::Internal => "Inspect the logs for the underlying cause",
        }
    }
}

impl From<config::ConfigError> for PipelineError {
    fn from(err: config::ConfigError) -> Self {
        PipelineError::Config(err.to_string())
    }
}
