//! Failure taxonomy for pipeline runs.
//!
//! Every variant is recoverable by re-invoking the pipeline. Stage failures
//! leave the artifacts of earlier stages in place so a later run resumes at
//! the first incomplete stage.

use thiserror::Error;

use crate::pipeline::Stage;

/// Result type for orchestrator operations.
pub type PipelineResult<T> = Result<T, PipelineError>;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Source file missing, unreadable, or the name is not acceptable.
    #[error("input error for '{video}': {reason}")]
    Input { video: String, reason: String },

    /// A stage could not complete. Its partial artifacts have been removed.
    #[error("{stage} stage failed: {source:#}")]
    Stage {
        stage: Stage,
        #[source]
        source: anyhow::Error,
    },

    /// The heatmap stage found nothing to aggregate.
    #[error("no detections found for heatmap generation")]
    NoData,

    /// The record store rejected a write after its retry budget.
    #[error("{stage} stage could not persist its record: {source}")]
    Store {
        stage: Stage,
        #[source]
        source: StoreError,
    },

    /// The run finished but the final artifact check disagrees.
    #[error("pipeline incomplete, missing artifacts: {}", missing.join(", "))]
    Incomplete { missing: Vec<&'static str> },

    /// Another run for the same video is still in flight.
    #[error("pipeline already running for '{0}'")]
    AlreadyRunning(String),

    /// A stage panicked. The run is marked failed so it can be retried.
    #[error("pipeline panicked: {0}")]
    Panicked(String),
}

impl PipelineError {
    pub(crate) fn input(video: &str, reason: impl Into<String>) -> Self {
        Self::Input {
            video: video.to_string(),
            reason: reason.into(),
        }
    }

    pub(crate) fn stage(stage: Stage, source: anyhow::Error) -> Self {
        Self::Stage { stage, source }
    }

    /// Short tag used when the failure is embedded in a progress step.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Input { .. } => "input",
            Self::Stage { .. } | Self::NoData => "stage",
            Self::Store { .. } => "store",
            Self::Incomplete { .. } => "consistency",
            Self::AlreadyRunning(_) => "busy",
            Self::Panicked(_) => "panic",
        }
    }
}

/// Record store failure as seen by callers of `upsert`.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store write failed after {attempts} attempts: {source}")]
    Exhausted {
        attempts: u32,
        #[source]
        source: rusqlite::Error,
    },

    #[error("store write failed: {0}")]
    Fatal(#[source] anyhow::Error),
}
