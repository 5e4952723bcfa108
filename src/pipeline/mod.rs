//! Ingest → score → compute → snapshot pipeline.

pub mod ingest;
pub mod orchestrator;
pub mod rules;
pub mod scoring;

pub use ingest::IngestSummary;
pub use orchestrator::{Orchestrator, RefreshAllReport, RefreshReport, RefreshStatus};
pub use rules::RuleSyncSummary;

use crate::errors::PipelineError;

/// Store helpers return `anyhow`; at the pipeline boundary they become the
/// store error kind.
pub(crate) fn store_err(e: anyhow::Error) -> PipelineError {
    PipelineError::Store(format!("{e:#}"))
}
