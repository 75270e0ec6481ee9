//! The external encoder and the probe that measures an artifact's duration.
//!
//! Both are opaque programs; this module only builds their command lines,
//! runs them and interprets exit status.

use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;
use std::collections::VecDeque;
use std::path::Path;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::debug;

/// Lines of encoder stderr kept for the failure message.
const STDERR_TAIL_LINES: usize = 8;

/// Substitute `{input}`, `{output_dir}` and `{progress_log}` in each argument.
pub fn render_args(
    template: &[String],
    input: &Path,
    output_dir: &Path,
    progress_log: &Path,
) -> Vec<String> {
    template
        .iter()
        .map(|arg| {
            arg.replace("{input}", &input.display().to_string())
                .replace("{output_dir}", &output_dir.display().to_string())
                .replace("{progress_log}", &progress_log.display().to_string())
        })
        .collect()
}

#[derive(Debug, Deserialize)]
struct ProbeOutput {
    format: ProbeFormat,
}

#[derive(Debug, Deserialize)]
struct ProbeFormat {
    duration: Option<String>,
}

/// Media duration in seconds, read from ffprobe-style JSON
/// (`{"format": {"duration": "39.5"}}`).
pub async fn probe_duration(probe_program: &str, input: &Path) -> Result<f64> {
    let output = Command::new(probe_program)
        .args(["-v", "quiet", "-print_format", "json", "-show_format"])
        .arg(input)
        .stdin(Stdio::null())
        .output()
        .await
        .with_context(|| format!("Failed to run probe program {probe_program}"))?;

    if !output.status.success() {
        bail!("{probe_program} exited with {}", output.status);
    }

    parse_probe_output(&output.stdout)
}

fn parse_probe_output(stdout: &[u8]) -> Result<f64> {
    let probe: ProbeOutput =
        serde_json::from_slice(stdout).context("Failed to parse probe output")?;
    let raw = probe
        .format
        .duration
        .ok_or_else(|| anyhow!("probe output has no duration"))?;
    let duration: f64 = raw
        .trim()
        .parse()
        .with_context(|| format!("Invalid duration {raw:?}"))?;

    if !(duration > 0.0 && duration.is_finite()) {
        bail!("probe reported non-positive duration {duration}");
    }
    Ok(duration)
}

/// A running encoder process.
pub struct EncoderProcess {
    child: Child,
}

impl EncoderProcess {
    pub fn spawn(program: &str, args: &[String]) -> Result<Self> {
        debug!(program, ?args, "Spawning encoder");
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to spawn encoder {program}"))?;
        Ok(Self { child })
    }

    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Wait for exit. A non-zero status is an error carrying the tail of stderr.
    pub async fn wait(mut self) -> Result<()> {
        let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
        if let Some(stderr) = self.child.stderr.take() {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tail.len() == STDERR_TAIL_LINES {
                    tail.pop_front();
                }
                tail.push_back(line);
            }
        }

        let status = self
            .child
            .wait()
            .await
            .context("Failed to wait for encoder")?;

        if status.success() {
            return Ok(());
        }

        let tail: Vec<String> = tail.into_iter().collect();
        if tail.is_empty() {
            bail!("encoder exited with {status}");
        }
        bail!("encoder exited with {status}: {}", tail.join(" | "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholders_are_substituted() {
        let template: Vec<String> = ["-i", "{input}", "-progress", "{progress_log}", "{output_dir}/out.mp4"]
            .into_iter()
            .map(String::from)
            .collect();

        let args = render_args(
            &template,
            Path::new("/videos/abc"),
            Path::new("/videos/encoded/abc"),
            Path::new("/videos/encoded/abc/progress.log"),
        );

        assert_eq!(
            args,
            vec![
                "-i",
                "/videos/abc",
                "-progress",
                "/videos/encoded/abc/progress.log",
                "/videos/encoded/abc/out.mp4"
            ]
        );
    }

    #[test]
    fn probe_output_parsing() {
        let duration = parse_probe_output(br#"{"format": {"duration": "39.500000"}}"#).unwrap();
        assert_eq!(duration, 39.5);

        assert!(parse_probe_output(br#"{"format": {}}"#).is_err());
        assert!(parse_probe_output(br#"{"format": {"duration": "0"}}"#).is_err());
        assert!(parse_probe_output(b"not json").is_err());
    }

    #[tokio::test]
    async fn failed_encoder_reports_stderr_tail() {
        let process = EncoderProcess::spawn(
            "sh",
            &["-c".to_string(), "echo boom >&2; exit 3".to_string()],
        )
        .unwrap();
        let err = process.wait().await.unwrap_err();
        assert!(err.to_string().contains("boom"), "{err}");
    }

    #[tokio::test]
    async fn successful_encoder() {
        let process = EncoderProcess::spawn("sh", &["-c".to_string(), "exit 0".to_string()]).unwrap();
        assert!(process.wait().await.is_ok());
    }

    #[tokio::test]
    async fn missing_program_fails_to_spawn() {
        assert!(EncoderProcess::spawn("/nonexistent/encoder", &[]).is_err());
    }
}
