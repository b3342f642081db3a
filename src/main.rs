use anyhow::Result;
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use xg2g::{
    config::Config,
    metrics::Metrics,
    orchestrator::SessionOrchestrator,
    receiver::{ArtifactRefresher, OpenWebIfClient},
    runner::FfmpegRunnerFactory,
    store::Store,
    upstream::UpstreamFetcher,
    web::{AppState, WebServer},
};

#[derive(Parser)]
#[command(name = "xg2g")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Streaming middleware that fronts OpenWebIF receivers and serves live channels as HLS")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.yaml")]
    config: String,

    /// Listening address, e.g. 0.0.0.0:8088 (overrides config)
    #[arg(short, long, value_name = "ADDR")]
    listen: Option<String>,

    /// Data directory (overrides config)
    #[arg(short, long, value_name = "DIR")]
    data_dir: Option<PathBuf>,

    /// Log level
    #[arg(short = 'L', long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    /// Accept unknown keys in the config file
    #[arg(long)]
    lenient_config: bool,

    /// Validate the configuration and exit
    #[arg(long)]
    check_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("xg2g={}", cli.log_level).into());
    if cli.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    info!("starting xg2g v{}", env!("CARGO_PKG_VERSION"));

    let mut config = Config::load(Path::new(&cli.config), !cli.lenient_config)?;
    if let Some(listen) = cli.listen {
        config.web.listen_addr = listen;
    }
    if let Some(data_dir) = cli.data_dir {
        config.storage.data_dir = data_dir;
    }
    config.validate()?;
    if cli.check_config {
        println!("configuration ok: {}", cli.config);
        return Ok(());
    }

    tokio::fs::create_dir_all(&config.storage.data_dir).await?;
    tokio::fs::create_dir_all(config.storage.hls_root.join("sessions")).await?;

    match xg2g::runner::ffmpeg::ffmpeg_version(&config.runner.ffmpeg_command).await {
        Some(version) => info!(command = %config.runner.ffmpeg_command, %version, "ffmpeg available"),
        None => warn!(
            command = %config.runner.ffmpeg_command,
            "ffmpeg not found; sessions will fail to start"
        ),
    }

    let store = Store::open(&config.storage).await?;
    let metrics = Arc::new(Metrics::new());
    let fetcher = UpstreamFetcher::new(config.upstream.clone(), config.receiver.clone())?;
    let runner_factory = Arc::new(FfmpegRunnerFactory::new(config.runner.clone()));

    let orchestrator = SessionOrchestrator::new(
        config.clone(),
        store.clone(),
        fetcher,
        runner_factory,
        metrics.clone(),
    );

    let shutdown = CancellationToken::new();

    if config.epg.enabled {
        let client = OpenWebIfClient::new(config.receiver.clone())?;
        let refresher = ArtifactRefresher::new(
            client,
            config.storage.data_dir.clone(),
            config.epg.refresh_interval,
        );
        tokio::spawn(refresher.run(shutdown.child_token()));
        info!(interval = ?config.epg.refresh_interval, "artifact refresh scheduled");
    }

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            wait_for_signal().await;
            info!("shutdown signal received");
            shutdown.cancel();
        });
    }

    let state = AppState::new(&config, orchestrator.clone(), store, metrics);
    let server = WebServer::new(&config, state)?;
    server.serve(shutdown.clone()).await?;

    orchestrator.shutdown().await;
    info!("bye");
    Ok(())
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
