use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::timeout;

use vidpipe::config::CoordinatorConfig;
use vidpipe::core::transcode::{Coordinator, CoordinatorError, JobState, ProgressError};

const PROBE_4S: &str = "#!/bin/sh\necho '{\"format\": {\"duration\": \"4.000000\"}}'\n";
const PROBE_BROKEN: &str = "#!/bin/sh\necho 'no such file' >&2\nexit 1\n";

/// Writes two elapsed markers, ending at 2s of 4s.
const ENCODER_OK: &str = "\
log=\"$1\"
echo 'frame=10' >> \"$log\"
echo 'out_time_ms=1000000' >> \"$log\"
echo 'out_time_ms=2000000' >> \"$log\"
echo 'progress=end' >> \"$log\"
";

const ENCODER_FAILS: &str = "\
echo 'Invalid data found when processing input' >&2
exit 1
";

/// Waits for `$2` to exist before writing anything.
const ENCODER_GATED: &str = "\
log=\"$1\"
while [ ! -f \"$2\" ]; do sleep 0.02; done
echo 'out_time_ms=3000000' >> \"$log\"
";

struct Fixture {
    dir: tempfile::TempDir,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("uploads")).unwrap();
        Self { dir }
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn upload(&self, id: &str) {
        std::fs::write(self.root().join("uploads").join(id), b"not really a video").unwrap();
    }

    fn write(&self, name: &str, body: &str) -> PathBuf {
        let path = self.root().join(name);
        std::fs::write(&path, body).unwrap();
        path
    }

    /// The probe is invoked directly; the encoder runs through `sh` so only
    /// the probe has to be executable.
    fn coordinator(&self, probe: &str, encoder: &str, extra_args: &[&str]) -> Coordinator {
        let probe = self.write("probe.sh", probe);
        std::fs::set_permissions(&probe, std::fs::Permissions::from_mode(0o755)).unwrap();
        let encoder = self.write("encoder.sh", encoder);

        let mut encoder_args = vec![
            encoder.display().to_string(),
            "{progress_log}".to_string(),
        ];
        encoder_args.extend(extra_args.iter().map(|arg| arg.to_string()));

        Coordinator::new(CoordinatorConfig {
            uploads_dir: self.root().join("uploads"),
            output_dir: self.root().join("encoded"),
            encoder_program: "sh".to_string(),
            encoder_args,
            probe_program: probe.display().to_string(),
            ..Default::default()
        })
    }
}

async fn wait_for_state(coordinator: &Coordinator, job_id: &str, state: JobState) {
    timeout(Duration::from_secs(5), async {
        loop {
            let jobs = coordinator.jobs().await;
            if jobs
                .iter()
                .any(|job| job.upload_id == job_id && job.state == state)
            {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timeout waiting for job state");
}

#[tokio::test]
async fn test_successful_job_reports_done_with_estimate() {
    let fixture = Fixture::new();
    fixture.upload("clip-1");
    let coordinator = fixture.coordinator(PROBE_4S, ENCODER_OK, &[]);

    let handle = coordinator.notify_upload_complete("clip-1").await.unwrap();
    timeout(Duration::from_secs(5), handle)
        .await
        .expect("job did not finish")
        .unwrap();

    let status = coordinator.status("clip-1").await.unwrap();
    assert_eq!(status.state, JobState::Done);
    assert_eq!(status.total_duration_seconds, Some(4.0));
    assert_eq!(status.percentage, Some(50.0));
    assert_eq!(status.progress.as_deref(), Some("out_time_ms=2000000"));
    assert!(status.finished_at.is_some());
    assert!(status.error.is_none());
    assert_eq!(coordinator.active_count().await, 0);
}

#[tokio::test]
async fn test_encoder_failure_marks_job_failed() {
    let fixture = Fixture::new();
    fixture.upload("clip-2");
    let coordinator = fixture.coordinator(PROBE_4S, ENCODER_FAILS, &[]);

    let handle = coordinator.notify_upload_complete("clip-2").await.unwrap();
    timeout(Duration::from_secs(5), handle)
        .await
        .expect("job did not finish")
        .unwrap();

    let status = coordinator.status("clip-2").await.unwrap();
    assert_eq!(status.state, JobState::Failed);
    assert!(
        status
            .error
            .as_deref()
            .is_some_and(|e| e.contains("Invalid data")),
        "{:?}",
        status.error
    );
    assert_eq!(status.percentage, None);
}

#[tokio::test]
async fn test_probe_failure_marks_job_failed_without_duration() {
    let fixture = Fixture::new();
    fixture.upload("clip-3");
    let coordinator = fixture.coordinator(PROBE_BROKEN, ENCODER_OK, &[]);

    let handle = coordinator.notify_upload_complete("clip-3").await.unwrap();
    timeout(Duration::from_secs(5), handle)
        .await
        .expect("job did not finish")
        .unwrap();

    let status = coordinator.status("clip-3").await.unwrap();
    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.total_duration_seconds, None);
    assert_eq!(status.percentage, None);
}

#[tokio::test]
async fn test_running_job_without_log_has_no_progress_yet() {
    let fixture = Fixture::new();
    fixture.upload("clip-4");
    let release = fixture.root().join("release");
    let release_arg = release.display().to_string();
    let coordinator = fixture.coordinator(PROBE_4S, ENCODER_GATED, &[release_arg.as_str()]);

    let handle = coordinator.notify_upload_complete("clip-4").await.unwrap();
    wait_for_state(&coordinator, "clip-4", JobState::InProgress).await;

    let err = coordinator.status("clip-4").await.unwrap_err();
    assert!(matches!(
        err,
        CoordinatorError::Progress(ProgressError::NoProgressYet)
    ));
    assert_eq!(coordinator.active_count().await, 1);

    std::fs::write(&release, b"").unwrap();
    timeout(Duration::from_secs(5), handle)
        .await
        .expect("job did not finish")
        .unwrap();

    let status = coordinator.status("clip-4").await.unwrap();
    assert_eq!(status.state, JobState::Done);
    assert_eq!(status.percentage, Some(75.0));
}

#[tokio::test]
async fn test_uncleared_progress_log_fails_the_job() {
    let fixture = Fixture::new();
    fixture.upload("clip-7");
    // A directory where the log belongs cannot be removed as a file.
    std::fs::create_dir_all(fixture.root().join("encoded/clip-7/progress.log/stale")).unwrap();
    let coordinator = fixture.coordinator(PROBE_4S, ENCODER_OK, &[]);

    let handle = coordinator.notify_upload_complete("clip-7").await.unwrap();
    timeout(Duration::from_secs(5), handle)
        .await
        .expect("job did not finish")
        .unwrap();

    let jobs = coordinator.jobs().await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].state, JobState::Failed);
    assert!(
        jobs[0]
            .error
            .as_deref()
            .is_some_and(|e| e.contains("progress log")),
        "{:?}",
        jobs[0].error
    );
}

#[tokio::test]
async fn test_duplicate_notification_supersedes_previous_run() {
    let fixture = Fixture::new();
    fixture.upload("clip-5");
    let coordinator = fixture.coordinator(PROBE_4S, ENCODER_OK, &[]);

    let first = coordinator.notify_upload_complete("clip-5").await.unwrap();
    let second = coordinator.notify_upload_complete("clip-5").await.unwrap();
    for handle in [first, second] {
        timeout(Duration::from_secs(5), handle)
            .await
            .expect("job did not finish")
            .unwrap();
    }

    let jobs = coordinator.jobs().await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].state, JobState::Done);
}

#[tokio::test]
async fn test_notification_for_missing_upload_is_rejected() {
    let fixture = Fixture::new();
    let coordinator = fixture.coordinator(PROBE_4S, ENCODER_OK, &[]);

    let err = coordinator
        .notify_upload_complete("never-uploaded")
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::ArtifactNotFound(_)));
    assert!(coordinator.jobs().await.is_empty());
}
