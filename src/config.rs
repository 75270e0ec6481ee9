//! Layered configuration for the upload server and the transcoding coordinator.
//!
//! Values are resolved lowest to highest from built-in defaults, the TOML file,
//! `VIDPIPE_*` environment variables (nested keys split on `__`) and finally
//! whatever the CLI merges on top.

use anyhow::{Context, Result, bail};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "vidpipe.toml";
pub const ENV_PREFIX: &str = "VIDPIPE_";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub verbose: bool,
    pub json_logs: bool,
    pub ingest: IngestConfig,
    pub web: WebConfig,
    pub notify: NotifyConfig,
    pub coordinator: CoordinatorConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Where uploaded artifacts are written, one file per upload id.
    pub storage_dir: PathBuf,
    /// Case-sensitive suffixes, including the leading dot.
    pub allowed_extensions: Vec<String>,
    pub progress_interval_ms: u64,
    /// Registered uploads whose body never arrives are dropped after this long.
    pub stale_session_secs: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            storage_dir: PathBuf::from("./videos"),
            allowed_extensions: [".mp4", ".mkv", ".flv", ".avi", ".mov"]
                .into_iter()
                .map(String::from)
                .collect(),
            progress_interval_ms: 500,
            stale_session_secs: 300,
        }
    }
}

impl IngestConfig {
    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_session_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub bind: SocketAddr,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 3500)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationChannelType {
    None,
    #[default]
    Rpc,
    Webhook,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub channel: NotificationChannelType,
    /// JSON-RPC address of the transcoding coordinator.
    pub coordinator_addr: SocketAddr,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    pub deadline_secs: u64,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            channel: NotificationChannelType::Rpc,
            coordinator_addr: SocketAddr::from(([127, 0, 0, 1], 50051)),
            webhook_url: None,
            deadline_secs: 15,
        }
    }
}

impl NotifyConfig {
    pub fn deadline(&self) -> Duration {
        Duration::from_secs(self.deadline_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub bind: SocketAddr,
    /// Directory the upload server stores artifacts in.
    pub uploads_dir: PathBuf,
    /// Each job gets `<output_dir>/<upload id>/` holding renditions and `progress.log`.
    pub output_dir: PathBuf,
    pub encoder_program: String,
    /// Supports `{input}`, `{output_dir}` and `{progress_log}` placeholders.
    pub encoder_args: Vec<String>,
    pub probe_program: String,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 50051)),
            uploads_dir: PathBuf::from("./videos"),
            output_dir: PathBuf::from("./videos/encoded"),
            encoder_program: "ffmpeg".to_string(),
            encoder_args: [
                "-hide_banner",
                "-nostats",
                "-y",
                "-i",
                "{input}",
                "-progress",
                "{progress_log}",
                "{output_dir}/output.mp4",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            probe_program: "ffprobe".to_string(),
        }
    }
}

impl AppConfig {
    /// Base figment: defaults, then the TOML file, then the environment.
    ///
    /// A missing config file is not an error.
    pub fn figment(path: Option<&Path>) -> Figment {
        let path = path.unwrap_or_else(|| Path::new(DEFAULT_CONFIG_FILE));
        Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    pub fn load(path: Option<&Path>) -> Result<Self> {
        Self::from_figment(Self::figment(path))
    }

    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: AppConfig = figment
            .extract()
            .context("Failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(ext) = self
            .ingest
            .allowed_extensions
            .iter()
            .find(|ext| !ext.starts_with('.') || ext.len() < 2 || ext[1..].contains(['.', '/']))
        {
            bail!("allowed extension {ext:?} must look like \".mp4\"");
        }
        if self.ingest.stale_session_secs == 0 {
            bail!("ingest.stale_session_secs must be greater than zero");
        }
        if self.ingest.progress_interval_ms == 0 {
            bail!("ingest.progress_interval_ms must be greater than zero");
        }
        if self.notify.deadline_secs == 0 {
            bail!("notify.deadline_secs must be greater than zero");
        }
        if self.notify.channel == NotificationChannelType::Webhook
            && self.notify.webhook_url.as_deref().is_none_or(str::is_empty)
        {
            bail!("notify.webhook_url is required when notify.channel = \"webhook\"");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;

    #[test]
    fn defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.notify.deadline(), Duration::from_secs(15));
        assert_eq!(config.ingest.progress_interval(), Duration::from_millis(500));
        assert!(config.ingest.allowed_extensions.contains(&".mkv".to_string()));
    }

    #[test]
    fn file_and_env_layers_override_defaults() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "vidpipe.toml",
                r#"
                [ingest]
                storage_dir = "/srv/uploads"
                allowed_extensions = [".mp4"]

                [notify]
                deadline_secs = 30
                "#,
            )?;
            jail.set_env("VIDPIPE_NOTIFY__DEADLINE_SECS", "5");
            jail.set_env("VIDPIPE_WEB__BIND", "0.0.0.0:8080");

            let config = AppConfig::load(None).expect("config should load");
            assert_eq!(config.ingest.storage_dir, PathBuf::from("/srv/uploads"));
            assert_eq!(config.ingest.allowed_extensions, vec![".mp4".to_string()]);
            assert_eq!(config.notify.deadline_secs, 5);
            assert_eq!(config.web.bind, "0.0.0.0:8080".parse().unwrap());
            Ok(())
        });
    }

    #[test]
    fn webhook_channel_requires_url() {
        Jail::expect_with(|jail| {
            jail.set_env("VIDPIPE_NOTIFY__CHANNEL", "webhook");
            assert!(AppConfig::load(None).is_err());

            jail.set_env("VIDPIPE_NOTIFY__WEBHOOK_URL", "http://localhost:9000/hook");
            let config = AppConfig::load(None).expect("config should load");
            assert_eq!(config.notify.channel, NotificationChannelType::Webhook);
            Ok(())
        });
    }

    #[test]
    fn rejects_extension_without_dot() {
        let mut config = AppConfig::default();
        config.ingest.allowed_extensions = vec!["mp4".to_string()];
        assert!(config.validate().is_err());

        // Only the last dot of a filename is compared, so these never match.
        for ext in [".tar.gz", "./mp4"] {
            config.ingest.allowed_extensions = vec![ext.to_string()];
            assert!(config.validate().is_err(), "{ext}");
        }
    }

    #[test]
    fn rejects_zero_stale_session_window() {
        let mut config = AppConfig::default();
        config.ingest.stale_session_secs = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("stale_session_secs"), "{err}");
    }
}
