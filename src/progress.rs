//! In-memory pipeline progress, one entry per video.
//!
//! The tracker is created at process start and never persisted. Artifact
//! readiness is recomputed from disk on every read and write, so a restarted
//! process converges on the truth without replaying anything.
//!
//! Locking: a single map lock, held only for the map operation itself.
//! Filesystem checks always run before the lock is taken.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use serde::{Deserialize, Serialize};

use crate::artifacts::{ArtifactLayout, ArtifactPresence};

pub const STEP_NOT_STARTED: &str = "not_started";
pub const STEP_STARTING: &str = "starting";
pub const STEP_COMPLETED: &str = "completed";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    NotStarted,
    Processing,
    Completed,
    Failed,
}

/// Snapshot of one video's pipeline.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineState {
    pub status: Status,
    #[serde(rename = "progress")]
    pub progress_percent: u8,
    #[serde(rename = "step")]
    pub current_step: String,
    #[serde(rename = "files")]
    pub artifacts: ArtifactPresence,
}

impl PipelineState {
    /// Implicit state of a video nobody has touched in this process.
    pub fn not_started(artifacts: ArtifactPresence) -> Self {
        Self {
            status: Status::NotStarted,
            progress_percent: 0,
            current_step: STEP_NOT_STARTED.to_string(),
            artifacts,
        }
    }

    pub fn completed(artifacts: ArtifactPresence) -> Self {
        Self {
            status: Status::Completed,
            progress_percent: 100,
            current_step: STEP_COMPLETED.to_string(),
            artifacts,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, Status::Completed | Status::Failed)
    }
}

/// Outcome of asking to start a run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Admission {
    /// The caller owns the run; the entry now reads `processing`.
    Started(PipelineState),
    /// Another run is in flight; its current state is returned.
    InFlight(PipelineState),
}

pub struct ProgressTracker {
    layout: ArtifactLayout,
    entries: Mutex<HashMap<String, PipelineState>>,
}

impl ProgressTracker {
    pub fn new(layout: ArtifactLayout) -> Self {
        Self {
            layout,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub fn layout(&self) -> &ArtifactLayout {
        &self.layout
    }

    /// Replace the state of `video`. Status is `completed` at 100, otherwise
    /// `processing`.
    pub fn set_progress(&self, video: &str, progress_percent: u8, step: &str) -> PipelineState {
        let percent = progress_percent.min(100);
        let state = PipelineState {
            status: if percent == 100 {
                Status::Completed
            } else {
                Status::Processing
            },
            progress_percent: percent,
            current_step: step.to_string(),
            artifacts: self.layout.presence(video),
        };
        self.entries().insert(video.to_string(), state.clone());
        log::debug!("{}: {}% {}", video, percent, step);
        state
    }

    /// Mark `video` as failed, keeping the last reported percentage.
    pub fn set_failed(&self, video: &str, step: &str) -> PipelineState {
        let artifacts = self.layout.presence(video);
        let mut entries = self.entries();
        let progress_percent = entries
            .get(video)
            .map(|state| state.progress_percent)
            .unwrap_or(0);
        let state = PipelineState {
            status: Status::Failed,
            progress_percent,
            current_step: step.to_string(),
            artifacts,
        };
        entries.insert(video.to_string(), state.clone());
        state
    }

    /// Current state with freshly checked artifacts. Never fails.
    pub fn get_progress(&self, video: &str) -> PipelineState {
        let artifacts = self.layout.presence(video);
        let existing = self.entries().get(video).cloned();
        match existing {
            Some(mut state) => {
                state.artifacts = artifacts;
                state
            }
            None => PipelineState::not_started(artifacts),
        }
    }

    /// Atomically claim the run for `video` unless one is already processing.
    pub fn try_begin(&self, video: &str) -> Admission {
        let artifacts = self.layout.presence(video);
        let mut entries = self.entries();
        if let Some(state) = entries.get(video) {
            if state.status == Status::Processing {
                let mut state = state.clone();
                state.artifacts = artifacts;
                return Admission::InFlight(state);
            }
        }
        let state = PipelineState {
            status: Status::Processing,
            progress_percent: 0,
            current_step: STEP_STARTING.to_string(),
            artifacts,
        };
        entries.insert(video.to_string(), state.clone());
        Admission::Started(state)
    }

    /// Forget the in-memory entry. Disk artifacts are untouched.
    pub fn clear(&self, video: &str) {
        self.entries().remove(video);
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, PipelineState>> {
        // A panic while holding the lock cannot leave the map half-updated.
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
