//! prefork - multi-process worker pool supervisor.

use anyhow::{Context, Result};
use clap::Parser;
use prefork::cli::{Cli, Commands, ServeArgs};
use prefork::logging::{self, LogConfig};
use prefork::worker::{EchoHandler, WorkerRuntime};
use prefork::{ManagerConfig, PoolManager};

fn main() {
    let cli = Cli::parse();

    let mut log_config = LogConfig::new().with_level(cli.log_level());
    if let Some(ref format) = cli.log_format {
        if let Ok(format) = format.parse() {
            log_config = log_config.with_format(format);
        }
    }
    if let Some(ref path) = cli.log_file {
        log_config = log_config.with_file(path.clone());
    }
    logging::init(log_config.with_env_overrides());

    match cli.command {
        // Worker mode never returns: the runtime exits the process.
        Commands::Worker(_) => WorkerRuntime::new(EchoHandler).run(),
        Commands::Serve(args) => {
            if let Err(e) = serve(args) {
                eprintln!("error: {:#}", e);
                std::process::exit(1);
            }
        }
    }
}

fn serve(args: ServeArgs) -> Result<()> {
    let config = ManagerConfig::load(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")?;

    runtime.block_on(async {
        let manager = PoolManager::new(config);
        manager.startup().await.context("pool startup failed")?;
        let ticker = manager.start_ticker();
        tracing::info!(pools = manager.pools().len(), "supervisor running, ctrl-c to stop");

        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for shutdown signal")?;
        tracing::info!("shutting down");
        ticker.abort();
        manager.shutdown().await;
        Ok(())
    })
}
