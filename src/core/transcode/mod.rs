//! Transcode jobs: lifecycle tracking, external encoder, progress estimation.
//!
//! The job state is authoritative and comes from the encoder's exit status.
//! The progress log only ever yields an estimate.

pub mod coordinator;
pub mod encoder;
pub mod progress;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

pub use coordinator::{Coordinator, CoordinatorError, TranscodeStatus};
pub use progress::{ProgressError, TranscodeProgress, compute_progress};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    NotStarted,
    InProgress,
    Done,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Done | JobState::Failed)
    }

    /// NotStarted -> InProgress -> Done, with Failed reachable from any
    /// non-terminal state.
    pub fn can_transition_to(self, next: JobState) -> bool {
        matches!(
            (self, next),
            (JobState::NotStarted, JobState::InProgress)
                | (JobState::NotStarted, JobState::Failed)
                | (JobState::InProgress, JobState::Done)
                | (JobState::InProgress, JobState::Failed)
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TranscodeJob {
    pub upload_id: String,
    /// Distinguishes runs when the same upload is notified twice.
    #[serde(skip)]
    pub run_id: String,
    /// Known once the artifact has been probed.
    pub total_duration_seconds: Option<f64>,
    pub progress_log_path: PathBuf,
    pub state: JobState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}
