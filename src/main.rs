use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use figment::Figment;
use figment::providers::Serialized;
use serde::Serialize;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use vidpipe::config::AppConfig;
use vidpipe::context::AppContext;
use vidpipe::core::IngestionSink;
use vidpipe::core::transcode::{Coordinator, TranscodeStatus};
use vidpipe::logging::{self, LogConfig};
use vidpipe::rpc::methods::{DAEMON_STATUS, DaemonStatus, TRANSCODE_STATUS};
use vidpipe::rpc::{RpcClient, RpcServer};
use vidpipe::web::{WebServer, WebState};

#[derive(Parser)]
#[command(name = "vidpipe")]
#[command(about = "Video upload ingestion and transcode coordination", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the TOML config file (default: ./vidpipe.toml)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    #[arg(long, short, global = true)]
    verbose: bool,

    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the upload server
    Serve(ServeArgs),
    /// Run the transcoding coordinator
    Coordinator(CoordinatorArgs),
    /// Query a running coordinator
    Status(StatusArgs),
    /// Print the resolved configuration as TOML
    Config,
}

/// Each flag lands in a different config section, so these are merged one
/// key at a time rather than serialized as a whole.
#[derive(Args)]
struct ServeArgs {
    #[arg(long)]
    bind: Option<SocketAddr>,

    #[arg(long)]
    storage_dir: Option<PathBuf>,
}

#[derive(Args, Serialize)]
struct CoordinatorArgs {
    #[serde(skip_serializing_if = "Option::is_none")]
    #[arg(long)]
    bind: Option<SocketAddr>,
}

#[derive(Args)]
struct StatusArgs {
    /// Transcode job to query; omit for coordinator health
    job_id: Option<String>,

    /// Coordinator address (default: notify.coordinator_addr)
    #[arg(long)]
    addr: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(&cli)?;

    logging::init(LogConfig {
        json: config.json_logs,
        verbose: config.verbose,
    });

    match cli.command {
        Commands::Serve(_) => run_server(config).await.context("Upload server failed")?,
        Commands::Coordinator(_) => run_coordinator(config)
            .await
            .context("Coordinator failed")?,
        Commands::Status(args) => run_status(&config, args)
            .await
            .context("Failed to query coordinator")?,
        Commands::Config => print!("{}", toml::to_string_pretty(&config)?),
    }

    Ok(())
}

fn load_config(cli: &Cli) -> Result<AppConfig> {
    let mut figment: Figment = AppConfig::figment(cli.config.as_deref());

    if cli.verbose {
        figment = figment.merge(Serialized::default("verbose", true));
    }
    if cli.json_logs {
        figment = figment.merge(Serialized::default("json_logs", true));
    }

    figment = match &cli.command {
        Commands::Serve(args) => {
            let mut figment = figment;
            if let Some(bind) = args.bind {
                figment = figment.merge(Serialized::default("web.bind", bind));
            }
            if let Some(dir) = &args.storage_dir {
                figment = figment.merge(Serialized::default("ingest.storage_dir", dir));
            }
            figment
        }
        Commands::Coordinator(args) => figment.merge(Serialized::default("coordinator", args)),
        _ => figment,
    };

    AppConfig::from_figment(figment)
}

/// Cancels the returned token on Ctrl-C.
fn shutdown_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
        }
        trigger.cancel();
    });
    token
}

async fn run_server(config: AppConfig) -> Result<()> {
    tokio::fs::create_dir_all(&config.ingest.storage_dir)
        .await
        .with_context(|| {
            format!(
                "Failed to create storage directory {}",
                config.ingest.storage_dir.display()
            )
        })?;

    let ctx = AppContext::new(config);
    match &ctx.notifier {
        Some(notifier) => info!(channel = notifier.name(), "Completion notifications enabled"),
        None => warn!("Completion notifications disabled"),
    }

    let shutdown = shutdown_on_ctrl_c();
    let sink = Arc::new(IngestionSink::from_context(&ctx));
    let sweeper = sink
        .clone()
        .spawn_sweeper(ctx.config.ingest.stale_after(), shutdown.clone());

    let state = WebState {
        sink,
        progress_interval: ctx.config.ingest.progress_interval(),
    };
    let server = WebServer::bind(state, ctx.config.web.bind).await?;
    server.start(shutdown.clone()).await?;

    shutdown.cancel();
    let _ = sweeper.await;
    Ok(())
}

async fn run_coordinator(config: AppConfig) -> Result<()> {
    let coordinator_config = config.coordinator;
    tokio::fs::create_dir_all(&coordinator_config.output_dir)
        .await
        .with_context(|| {
            format!(
                "Failed to create output directory {}",
                coordinator_config.output_dir.display()
            )
        })?;

    let bind = coordinator_config.bind;
    let coordinator = Coordinator::new(coordinator_config);
    let server = RpcServer::bind(coordinator, bind).await?;
    server.start(shutdown_on_ctrl_c()).await
}

async fn run_status(config: &AppConfig, args: StatusArgs) -> Result<()> {
    let client = RpcClient::new(args.addr.unwrap_or(config.notify.coordinator_addr));

    match args.job_id {
        Some(job_id) => {
            let status: TranscodeStatus = client
                .call(
                    TRANSCODE_STATUS,
                    Some(serde_json::json!({ "job_id": job_id })),
                )
                .await?;
            println!("Job:      {}", status.job_id);
            println!("State:    {:?}", status.state);
            match status.percentage {
                Some(percentage) => println!("Progress: {percentage:.1}%"),
                None => println!("Progress: -"),
            }
            if let Some(error) = status.error {
                println!("Error:    {error}");
            }
        }
        None => {
            let status: DaemonStatus = client.call(DAEMON_STATUS, None).await?;
            println!("Coordinator {} at {}", status.version, status.rpc_bind);
            println!("Uptime:      {}s", status.uptime_secs);
            println!("Active jobs: {}", status.active_jobs);
        }
    }
    Ok(())
}
