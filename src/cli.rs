//! Command-line interface definitions using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::Level;

/// prefork - multi-process worker pool supervisor
#[derive(Parser, Debug)]
#[command(name = "prefork")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Enable verbose output (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Log format: pretty, compact, json.
    #[arg(long, env = "PREFORK_LOG_FORMAT", global = true)]
    pub log_format: Option<String>,

    /// Log to file (in addition to stderr).
    #[arg(long, env = "PREFORK_LOG_FILE", global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the pool supervisor.
    Serve(ServeArgs),
    /// Run as a worker subprocess (spawned by the supervisor).
    Worker(WorkerArgs),
}

#[derive(clap::Args, Debug)]
pub struct ServeArgs {
    /// Path to the JSON pool configuration.
    #[arg(long, env = "PREFORK_CONFIG")]
    pub config: PathBuf,
}

#[derive(clap::Args, Debug)]
pub struct WorkerArgs {}

impl Cli {
    /// Log level from the verbosity count.
    pub fn log_level(&self) -> Level {
        match self.verbose {
            0 => Level::INFO,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_worker_subcommand() {
        let cli = Cli::try_parse_from(["prefork", "worker"]).unwrap();
        assert!(matches!(cli.command, Commands::Worker(_)));
        assert_eq!(cli.log_level(), Level::INFO);
    }

    #[test]
    fn parses_serve_with_verbosity() {
        let cli =
            Cli::try_parse_from(["prefork", "-vv", "serve", "--config", "/etc/prefork.json"])
                .unwrap();
        assert_eq!(cli.log_level(), Level::TRACE);
        match cli.command {
            Commands::Serve(args) => {
                assert_eq!(args.config, PathBuf::from("/etc/prefork.json"));
            }
            other => panic!("unexpected command: {:?}", other),
        }
    }
}
