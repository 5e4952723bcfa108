//! Error kinds surfaced to callers of the orchestrator entry points.

use crate::oracle::OracleError;
use crate::sources::SourceError;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("market not found: {0}")]
    NotFound(String),

    #[error("market not active: {0}")]
    Inactive(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("post source error: {0}")]
    PostSource(String),

    #[error("scoring oracle error: {0}")]
    Oracle(String),

    #[error("store error: {0}")]
    Store(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl PipelineError {
    /// Stable machine-readable kind for report payloads and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::NotFound(_) => "not_found",
            PipelineError::Inactive(_) => "inactive",
            PipelineError::RateLimited(_) => "rate_limited",
            PipelineError::PostSource(_) => "post_source",
            PipelineError::Oracle(_) => "oracle",
            PipelineError::Store(_) => "store",
            PipelineError::InvalidInput(_) => "invalid_input",
            PipelineError::Internal(_) => "internal",
        }
    }

    pub fn is_rate_limited(&self) -> bool {
        matches!(self, PipelineError::RateLimited(_))
    }
}

impl From<SourceError> for PipelineError {
    fn from(e: SourceError) -> Self {
        match e {
            SourceError::RateLimited { .. } => PipelineError::RateLimited(e.to_string()),
            other => PipelineError::PostSource(other.to_string()),
        }
    }
}

impl From<OracleError> for PipelineError {
    fn from(e: OracleError) -> Self {
        PipelineError::Oracle(e.to_string())
    }
}
