use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use gpu_keeper::config::{Cli, Commands, KeeperConfig, LoggingConfig, RunArgs};
use gpu_keeper::controller::Controller;
use gpu_keeper::logging;
use gpu_keeper::monitor::{NvmlSource, UtilizationSource};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run(args) => run_daemon(args).await,
        Commands::ShowConfig(args) => show_config(args).await,
        Commands::TestDevices => test_devices(),
    }
}

async fn run_daemon(args: RunArgs) -> Result<()> {
    let wrote_default = !args.config.exists();
    let config = KeeperConfig::load_or_init(&args.config).await?;
    let _guard = logging::init(&config.logging);

    if wrote_default {
        tracing::info!(path = %args.config.display(), "wrote default config file");
    } else {
        tracing::info!(path = %args.config.display(), "loaded config file");
    }
    tracing::info!(
        devices = ?config.target_devices,
        threshold = config.utilization_threshold,
        "starting gpu-keeper daemon"
    );

    let source: Arc<dyn UtilizationSource> = Arc::new(NvmlSource::new()?);

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone())?;

    let mut controller = Controller::new(&config, source, shutdown.clone())?;
    controller.run(shutdown).await;

    tracing::info!("gpu-keeper exited cleanly");
    Ok(())
}

/// Maps termination signals to a single cancellation of the root token.
fn spawn_signal_handler(token: CancellationToken) -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::spawn(async move {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM, initiating graceful shutdown");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT, initiating graceful shutdown");
                }
            }
            token.cancel();
        });
    }
    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received Ctrl+C, initiating graceful shutdown");
                token.cancel();
            }
        });
    }
    Ok(())
}

async fn show_config(args: RunArgs) -> Result<()> {
    let config = KeeperConfig::load_or_init(&args.config).await?;
    print!("{}", serde_yaml::to_string(&config)?);
    Ok(())
}

fn test_devices() -> Result<()> {
    let _guard = logging::init(&LoggingConfig::default());

    let source = NvmlSource::new()?;
    let count = source.device_count();
    tracing::info!("detected {count} device(s)");

    for device in 0..count {
        match source.device_info(device) {
            Some(info) => tracing::info!(
                device,
                name = %info.name,
                memory_total_mb = format_args!("{:.0}", info.memory_total_mb),
                utilization = info.utilization,
                temperature_c = info.temperature_c,
                "device available"
            ),
            None => tracing::warn!(device, "device unavailable"),
        }
    }
    Ok(())
}
