//! shmtake: camera to shared-memory frame taker

use std::process::ExitCode;

use clap::Parser;
use color_eyre::eyre::{eyre, WrapErr};
use color_eyre::Result;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use shmtake::capture::{self, FrameSource};
use shmtake::cli::Args;
use shmtake::{AcquisitionLoop, CancellationToken, Config, RunSummary};

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    if let Err(e) = color_eyre::install() {
        eprintln!("failed to install error handler: {}", e);
    }
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&args.log))
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    match run(args).await {
        Ok(summary) => {
            summary.report();
            ExitCode::from(summary.exit_code())
        }
        Err(e) => {
            error!("{:?}", e);
            ExitCode::from(1)
        }
    }
}

async fn run(args: Args) -> Result<RunSummary> {
    info!("shmtake launching...");

    let mut config = Config::load(args.config.as_deref()).wrap_err("loading configuration")?;
    args.apply(&mut config);

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    warn!("Unable to listen for interrupt: {}", e);
                    return;
                }
                if cancel.interrupt() {
                    error!("Second interrupt, exiting without device shutdown");
                    std::process::exit(1);
                }
                info!("Interrupt received, stopping after the current frame (again to force exit)");
            }
        });
    }

    // Scheduling applies to the calling thread, so it runs on the acquisition thread.
    let handle = tokio::task::spawn_blocking(move || -> Result<RunSummary> {
        if config.realtime.enabled {
            let outcome = config.realtime.scheduler().apply();
            info!("Real-time setup: {:?}", outcome);
        }

        let source: Box<dyn FrameSource> =
            capture::open_source(&config.source).wrap_err("opening frame source")?;
        let mut acquisition =
            AcquisitionLoop::setup(source, &config).wrap_err("setting up acquisition")?;

        let summary = acquisition.run(&cancel);
        if let Err(e) = acquisition.shutdown() {
            warn!("Device shutdown failed: {}", e);
        }
        Ok(summary)
    });

    handle
        .await
        .map_err(|e| eyre!("acquisition thread failed: {}", e))?
}
