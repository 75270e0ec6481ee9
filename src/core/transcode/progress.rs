//! Progress estimate from the encoder's `-progress` log.
//!
//! The log is append-only `key=value` lines. Only the elapsed-time marker
//! matters here, and only its last occurrence. Nothing is cached: every
//! query re-reads the file from the start.

use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};

/// Keys carrying cumulative elapsed media time in microseconds. ffmpeg
/// writes both; despite its name `out_time_ms` is microseconds too.
pub const ELAPSED_MARKER_KEYS: [&str; 2] = ["out_time_ms", "out_time_us"];

#[derive(Debug, Error)]
pub enum ProgressError {
    #[error("encoder has not reported progress yet")]
    NoProgressYet,

    #[error("malformed progress line: {0:?}")]
    MalformedProgressLine(String),

    #[error("total duration must be positive, got {0}")]
    InvalidTotalDuration(f64),

    #[error("failed to read progress log {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscodeProgress {
    /// The marker line the estimate was computed from, verbatim.
    pub progress: String,
    pub elapsed_micros: u64,
    /// Not clamped: an encoder overrunning the declared duration reports > 100.
    pub percentage: f64,
}

pub async fn compute_progress(
    log_path: &Path,
    total_duration_seconds: f64,
) -> Result<TranscodeProgress, ProgressError> {
    if !(total_duration_seconds > 0.0 && total_duration_seconds.is_finite()) {
        return Err(ProgressError::InvalidTotalDuration(total_duration_seconds));
    }

    let io_error = |source| ProgressError::Io {
        path: log_path.to_path_buf(),
        source,
    };

    let file = match File::open(log_path).await {
        Ok(file) => file,
        // The encoder creates the log lazily.
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(ProgressError::NoProgressYet),
        Err(e) => return Err(io_error(e)),
    };

    let mut lines = BufReader::new(file).lines();
    let mut last_marker = None;
    while let Some(line) = lines.next_line().await.map_err(io_error)? {
        if is_elapsed_marker(&line) {
            last_marker = Some(line);
        }
    }

    let line = last_marker.ok_or(ProgressError::NoProgressYet)?;
    percentage_from_marker(line.trim_end(), total_duration_seconds)
}

fn is_elapsed_marker(line: &str) -> bool {
    ELAPSED_MARKER_KEYS.iter().any(|key| {
        line.strip_prefix(key)
            .is_some_and(|rest| rest.starts_with('='))
    })
}

fn percentage_from_marker(
    line: &str,
    total_duration_seconds: f64,
) -> Result<TranscodeProgress, ProgressError> {
    let malformed = || ProgressError::MalformedProgressLine(line.to_string());

    let parts: Vec<&str> = line.split('=').collect();
    let [_, value] = parts.as_slice() else {
        return Err(malformed());
    };
    let elapsed: i64 = value.trim().parse().map_err(|_| malformed())?;
    // ffmpeg can report small negative times before the first frame.
    let elapsed_micros = elapsed.max(0) as u64;

    let percentage = elapsed_micros as f64 / (total_duration_seconds * 1_000_000.0) * 100.0;

    Ok(TranscodeProgress {
        progress: line.to_string(),
        elapsed_micros,
        percentage,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn log_with(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[tokio::test]
    async fn last_marker_wins() {
        let log = log_with("out_time_ms=1000000\nout_time_ms=2000000\n");
        let progress = compute_progress(log.path(), 4.0).await.unwrap();
        assert_eq!(progress.percentage, 50.0);
        assert_eq!(progress.elapsed_micros, 2_000_000);
        assert_eq!(progress.progress, "out_time_ms=2000000");
    }

    #[tokio::test]
    async fn other_keys_are_ignored() {
        let log = log_with(
            "frame=10\nfps=25.0\nout_time_us=3000000\nout_time_ms=3000000\n\
             out_time=00:00:03.000000\nspeed=1.0x\nprogress=continue\n",
        );
        let progress = compute_progress(log.path(), 6.0).await.unwrap();
        assert_eq!(progress.percentage, 50.0);
    }

    #[tokio::test]
    async fn empty_log_has_no_progress() {
        let log = log_with("");
        assert!(matches!(
            compute_progress(log.path(), 4.0).await,
            Err(ProgressError::NoProgressYet)
        ));
    }

    #[tokio::test]
    async fn missing_log_has_no_progress() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            compute_progress(&dir.path().join("progress.log"), 4.0).await,
            Err(ProgressError::NoProgressYet)
        ));
    }

    #[tokio::test]
    async fn zero_duration_is_rejected_before_reading() {
        let log = log_with("out_time_ms=1000000\n");
        assert!(matches!(
            compute_progress(log.path(), 0.0).await,
            Err(ProgressError::InvalidTotalDuration(_))
        ));

        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            compute_progress(&dir.path().join("absent.log"), 0.0).await,
            Err(ProgressError::InvalidTotalDuration(_))
        ));
    }

    #[tokio::test]
    async fn malformed_last_marker() {
        for contents in [
            "out_time_ms=1000\nout_time_ms=N/A\n",
            "out_time_ms=1000\nout_time_ms=5=6\n",
            "out_time_ms=\n",
            "out_time_ms=12.5\n",
        ] {
            let log = log_with(contents);
            assert!(
                matches!(
                    compute_progress(log.path(), 4.0).await,
                    Err(ProgressError::MalformedProgressLine(_))
                ),
                "{contents:?}"
            );
        }
    }

    #[tokio::test]
    async fn overrun_is_not_clamped() {
        let log = log_with("out_time_ms=5000000\n");
        let progress = compute_progress(log.path(), 4.0).await.unwrap();
        assert_eq!(progress.percentage, 125.0);
    }

    #[tokio::test]
    async fn crlf_line_endings_parse() {
        let log = log_with("out_time_ms=1000000\r\n");
        let progress = compute_progress(log.path(), 2.0).await.unwrap();
        assert_eq!(progress.percentage, 50.0);
    }

    #[test]
    fn marker_requires_exact_key() {
        assert!(is_elapsed_marker("out_time_ms=1"));
        assert!(is_elapsed_marker("out_time_us=1"));
        assert!(!is_elapsed_marker("out_time=00:00:01"));
        assert!(!is_elapsed_marker("xout_time_ms=1"));
    }
}
