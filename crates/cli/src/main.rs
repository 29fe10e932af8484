//! CLI entry point for the upscale worker
//!
//! Loads configuration, runs startup checks, then polls the job store until
//! interrupted.

use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use upscale_worker::{
    new_shared_stats, run_startup_checks, run_status_server, Config, JobPipeline, JobStore,
    PipelineSettings, Scheduler, StatusState, StorageLayout, SystemRunner,
};

/// Upscale Worker - frame-by-frame 4x video upscaling from a file-backed job queue
#[derive(Parser, Debug)]
#[command(name = "upscale-worker")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file; defaults apply when it does not exist
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Storage root holding jobs/, tmp/, outputs/ and uploads/
    #[arg(short, long)]
    storage_root: Option<PathBuf>,

    /// Skip the ffmpeg/ffprobe availability checks. For testing only.
    #[arg(long, default_value = "false")]
    skip_checks: bool,

    /// Do not start the status server
    #[arg(long, default_value = "false")]
    no_server: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "upscale_worker=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let mut config = match Config::load_or_default(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!(config = %args.config.display(), error = %e, "Failed to load configuration");
            return ExitCode::FAILURE;
        }
    };
    if let Some(root) = args.storage_root {
        config.storage.root = root;
    }
    info!(
        config = %args.config.display(),
        storage_root = %config.storage.root.display(),
        "Upscale worker starting"
    );

    let runner = SystemRunner;
    if let Err(e) = run_startup_checks(&config, &runner, args.skip_checks) {
        error!(error = %e, "Startup check failed");
        return ExitCode::FAILURE;
    }

    let store = JobStore::new(StorageLayout::new(&config.storage.root));
    let stats = new_shared_stats();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let server = if config.server.enabled && !args.no_server {
        let state = StatusState {
            store: store.clone(),
            stats: stats.clone(),
        };
        let bind = config.server.bind.clone();
        let rx = shutdown_rx.clone();
        Some(tokio::spawn(async move {
            if let Err(e) = run_status_server(&bind, state, rx).await {
                error!(error = %e, "Status server error");
            }
        }))
    } else {
        None
    };

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Interrupt received, finishing current job before exit");
                let _ = shutdown_tx.send(true);
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for interrupt");
                // Keep the sender alive so the scheduler keeps running.
                std::future::pending::<()>().await;
            }
        }
    });

    let pipeline = JobPipeline::new(store, runner, PipelineSettings::from_config(&config));
    let scheduler = Scheduler::new(pipeline, stats, config.poll_interval());
    scheduler.run(shutdown_rx).await;

    if let Some(server) = server {
        let _ = server.await;
    }

    info!("Upscale worker stopped");
    ExitCode::SUCCESS
}
