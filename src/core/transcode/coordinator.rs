//! Receiving end of the completion notification.
//!
//! For every notified upload the coordinator probes the artifact for its
//! duration, runs the external encoder with a progress log, and records the
//! job's lifecycle from the encoder's exit status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, info_span, warn};
use uuid::Uuid;

use super::encoder::{self, EncoderProcess};
use super::progress::{ProgressError, TranscodeProgress, compute_progress};
use super::{JobState, TranscodeJob};
use crate::config::CoordinatorConfig;

pub const PROGRESS_LOG_NAME: &str = "progress.log";

#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("invalid upload id {0:?}")]
    InvalidUploadId(String),

    #[error("no uploaded artifact for {0}")]
    ArtifactNotFound(String),

    #[error("no transcode job for {0}")]
    JobNotFound(String),

    #[error(transparent)]
    Progress(#[from] ProgressError),
}

/// Answer to a transcode status query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TranscodeStatus {
    pub job_id: String,
    pub state: JobState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Raw marker line the percentage was computed from.
    pub progress: Option<String>,
    pub percentage: Option<f64>,
    pub total_duration_seconds: Option<f64>,
    pub created_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl TranscodeStatus {
    fn new(job: TranscodeJob, estimate: Option<TranscodeProgress>) -> Self {
        let (progress, percentage) = match estimate {
            Some(estimate) => (Some(estimate.progress), Some(estimate.percentage)),
            None => (None, None),
        };
        Self {
            job_id: job.upload_id,
            state: job.state,
            error: job.error,
            progress,
            percentage,
            total_duration_seconds: job.total_duration_seconds,
            created_at: job.created_at,
            finished_at: job.finished_at,
        }
    }
}

/// Upload ids become path components, so only UUID-ish ids are accepted.
pub fn is_valid_upload_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

#[derive(Clone)]
pub struct Coordinator {
    config: Arc<CoordinatorConfig>,
    jobs: Arc<RwLock<HashMap<String, TranscodeJob>>>,
}

impl Coordinator {
    pub fn new(config: CoordinatorConfig) -> Self {
        Self {
            config: Arc::new(config),
            jobs: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Start a transcode job for a finished upload.
    ///
    /// The returned handle completes when the job reaches a terminal state;
    /// callers that only want fire-and-forget may drop it, the job logs its
    /// own outcome. A second notification for the same upload starts a new
    /// run that supersedes the first in the job table.
    pub async fn notify_upload_complete(
        &self,
        upload_id: &str,
    ) -> Result<JoinHandle<()>, CoordinatorError> {
        if !is_valid_upload_id(upload_id) {
            return Err(CoordinatorError::InvalidUploadId(upload_id.to_string()));
        }

        let input = self.config.uploads_dir.join(upload_id);
        if !tokio::fs::try_exists(&input).await.unwrap_or(false) {
            return Err(CoordinatorError::ArtifactNotFound(upload_id.to_string()));
        }

        let output_dir = self.config.output_dir.join(upload_id);
        let progress_log = output_dir.join(PROGRESS_LOG_NAME);
        let run_id = Uuid::now_v7().to_string();

        let job = TranscodeJob {
            upload_id: upload_id.to_string(),
            run_id: run_id.clone(),
            total_duration_seconds: None,
            progress_log_path: progress_log.clone(),
            state: JobState::NotStarted,
            error: None,
            created_at: Utc::now(),
            finished_at: None,
        };

        {
            let mut jobs = self.jobs.write().await;
            if let Some(previous) = jobs.insert(upload_id.to_string(), job) {
                if !previous.state.is_terminal() {
                    warn!(
                        upload_id = %upload_id,
                        "Duplicate completion notification while a run is active, starting another"
                    );
                }
            }
        }

        let run = JobRun {
            upload_id: upload_id.to_string(),
            run_id: run_id.clone(),
            input,
            output_dir,
            progress_log,
        };
        let span = info_span!("transcode", upload_id = %upload_id, run_id = %run_id);
        let coordinator = self.clone();

        Ok(tokio::spawn(
            async move { coordinator.run_job(run).await }.instrument(span),
        ))
    }

    async fn run_job(&self, run: JobRun) {
        info!(input = %run.input.display(), "Transcode job accepted");

        let duration = match encoder::probe_duration(&self.config.probe_program, &run.input).await
        {
            Ok(duration) => duration,
            Err(e) => return self.fail(&run, format!("probe failed: {e:#}")).await,
        };
        self.set_duration(&run, duration).await;

        if let Err(e) = tokio::fs::create_dir_all(&run.output_dir).await {
            return self
                .fail(&run, format!("failed to create output directory: {e}"))
                .await;
        }
        // Start from an empty log so a previous run cannot leak into the estimate.
        match tokio::fs::remove_file(&run.progress_log).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return self
                    .fail(&run, format!("failed to clear progress log: {e}"))
                    .await;
            }
        }

        let args = encoder::render_args(
            &self.config.encoder_args,
            &run.input,
            &run.output_dir,
            &run.progress_log,
        );
        let process = match EncoderProcess::spawn(&self.config.encoder_program, &args) {
            Ok(process) => process,
            Err(e) => return self.fail(&run, format!("{e:#}")).await,
        };

        self.transition(&run, JobState::InProgress, None).await;
        info!(pid = ?process.id(), duration_seconds = duration, "Encoder started");

        match process.wait().await {
            Ok(()) => {
                self.transition(&run, JobState::Done, None).await;
                info!("Transcode job finished");
            }
            Err(e) => self.fail(&run, format!("{e:#}")).await,
        }
    }

    async fn set_duration(&self, run: &JobRun, duration: f64) {
        let mut jobs = self.jobs.write().await;
        if let Some(job) = jobs.get_mut(&run.upload_id) {
            if job.run_id == run.run_id {
                job.total_duration_seconds = Some(duration);
            }
        }
    }

    async fn fail(&self, run: &JobRun, reason: String) {
        error!(error = %reason, "Transcode job failed");
        self.transition(run, JobState::Failed, Some(reason)).await;
    }

    /// Apply a lifecycle change unless the run has been superseded or the
    /// change is not a legal transition.
    async fn transition(&self, run: &JobRun, next: JobState, error: Option<String>) -> bool {
        let mut jobs = self.jobs.write().await;
        let Some(job) = jobs.get_mut(&run.upload_id) else {
            return false;
        };
        if job.run_id != run.run_id {
            debug!(state = ?next, "Ignoring state change from superseded run");
            return false;
        }
        if !job.state.can_transition_to(next) {
            warn!(from = ?job.state, to = ?next, "Rejected job state transition");
            return false;
        }

        job.state = next;
        job.error = error;
        if next.is_terminal() {
            job.finished_at = Some(Utc::now());
        }
        true
    }

    /// Current lifecycle state plus a progress estimate from the log.
    ///
    /// While the encoder runs, log errors (including "no progress yet") are
    /// returned to the caller. Once the job is terminal the estimate is
    /// best-effort and its absence is not an error.
    pub async fn status(&self, job_id: &str) -> Result<TranscodeStatus, CoordinatorError> {
        let job = self
            .jobs
            .read()
            .await
            .get(job_id)
            .cloned()
            .ok_or_else(|| CoordinatorError::JobNotFound(job_id.to_string()))?;

        let estimate = match (job.state, job.total_duration_seconds) {
            (JobState::InProgress, Some(duration)) => {
                Some(compute_progress(&job.progress_log_path, duration).await?)
            }
            (JobState::Done | JobState::Failed, Some(duration)) => {
                compute_progress(&job.progress_log_path, duration).await.ok()
            }
            _ => None,
        };

        Ok(TranscodeStatus::new(job, estimate))
    }

    /// All known jobs, oldest first.
    pub async fn jobs(&self) -> Vec<TranscodeJob> {
        let mut jobs: Vec<TranscodeJob> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by_key(|job| job.created_at);
        jobs
    }

    pub async fn active_count(&self) -> usize {
        self.jobs
            .read()
            .await
            .values()
            .filter(|job| !job.state.is_terminal())
            .count()
    }
}

struct JobRun {
    upload_id: String,
    run_id: String,
    input: PathBuf,
    output_dir: PathBuf,
    progress_log: PathBuf,
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn coordinator(root: &std::path::Path) -> Coordinator {
        Coordinator::new(CoordinatorConfig {
            uploads_dir: root.join("uploads"),
            output_dir: root.join("encoded"),
            ..Default::default()
        })
    }

    #[test]
    fn upload_id_validation() {
        assert!(is_valid_upload_id("0192f0c4-7f3e-7abc-9def-0123456789ab"));
        assert!(!is_valid_upload_id(""));
        assert!(!is_valid_upload_id("../etc/passwd"));
        assert!(!is_valid_upload_id("a/b"));
    }

    #[tokio::test]
    async fn rejects_path_like_ids() {
        let dir = tempdir().unwrap();
        let err = coordinator(dir.path())
            .notify_upload_complete("../secret")
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::InvalidUploadId(_)));
    }

    #[tokio::test]
    async fn missing_artifact_is_reported() {
        let dir = tempdir().unwrap();
        let err = coordinator(dir.path())
            .notify_upload_complete("abc")
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinatorError::ArtifactNotFound(id) if id == "abc"));
    }

    #[tokio::test]
    async fn unknown_job_status() {
        let dir = tempdir().unwrap();
        let err = coordinator(dir.path()).status("nope").await.unwrap_err();
        assert!(matches!(err, CoordinatorError::JobNotFound(_)));
    }
}
