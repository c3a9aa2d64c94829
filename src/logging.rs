//! Logging infrastructure for prefork.
//!
//! Both the supervisor and the worker subprocesses log through `tracing`
//! to stderr, which the parent keeps as a text channel (stdout carries
//! binary frames). Format and level come from the CLI or environment.
//!
//! # Environment Variables
//!
//! - `PREFORK_LOG` - Log filter (overrides RUST_LOG)
//! - `PREFORK_LOG_FORMAT` - Output format: pretty, compact, json
//! - `PREFORK_LOG_FILE` - Path to a log file (in addition to stderr)
//! - `RUST_LOG` - Standard Rust log filter (fallback)

use std::path::PathBuf;
use std::str::FromStr;

use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{
    EnvFilter, Registry, fmt,
    layer::{Layer, Layered, SubscriberExt},
    util::SubscriberInitExt,
};

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LogFormat {
    /// Human-readable pretty format (default for development)
    #[default]
    Pretty,
    /// Compact single-line format
    Compact,
    /// JSON format for log aggregation systems
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" | "full" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(format!(
                "Unknown log format: '{}'. Valid options: pretty, compact, json",
                s
            )),
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Base log level (default: INFO)
    pub level: Level,
    /// Log format (default: Pretty)
    pub format: LogFormat,
    /// Path to log file (None = stderr only)
    pub file_path: Option<PathBuf>,
    /// Custom filter string (overrides level if set)
    pub filter: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: Level::INFO,
            format: LogFormat::Pretty,
            file_path: None,
            filter: None,
        }
    }
}

impl LogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_level(mut self, level: Level) -> Self {
        self.level = level;
        self
    }

    pub fn with_format(mut self, format: LogFormat) -> Self {
        self.format = format;
        self
    }

    pub fn with_file(mut self, path: PathBuf) -> Self {
        self.file_path = Some(path);
        self
    }

    pub fn with_filter(mut self, filter: String) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Apply environment variable overrides. CLI arguments take
    /// precedence: an already-set filter is not overridden.
    pub fn with_env_overrides(mut self) -> Self {
        if self.filter.is_none() {
            if let Ok(filter) = std::env::var("PREFORK_LOG") {
                self.filter = Some(filter);
            } else if let Ok(filter) = std::env::var("RUST_LOG") {
                self.filter = Some(filter);
            }
        }

        if let Ok(format) = std::env::var("PREFORK_LOG_FORMAT") {
            if let Ok(f) = format.parse() {
                self.format = f;
            }
        }

        if let Ok(path) = std::env::var("PREFORK_LOG_FILE") {
            self.file_path = Some(PathBuf::from(path));
        }

        self
    }

    fn build_filter(&self) -> EnvFilter {
        if let Some(ref filter) = self.filter {
            EnvFilter::try_new(filter).unwrap_or_else(|_| {
                eprintln!("Warning: Invalid log filter '{}', using default", filter);
                EnvFilter::new(format!("{}", self.level).to_lowercase())
            })
        } else {
            EnvFilter::new(format!("{}", self.level).to_lowercase())
        }
    }
}

/// Initialize the global tracing subscriber.
///
/// Safe to call more than once; subsequent calls are silently ignored.
pub fn init(config: LogConfig) {
    let filter = config.build_filter();

    type FilteredSubscriber = Layered<EnvFilter, Registry>;

    let file_layer: Option<Box<dyn Layer<FilteredSubscriber> + Send + Sync>> =
        config.file_path.as_ref().map(|path| {
            let parent = path.parent().unwrap_or(std::path::Path::new("."));
            let file_name = path
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or("prefork.log");
            let appender = RollingFileAppender::new(Rotation::DAILY, parent, file_name);
            let layer: Box<dyn Layer<FilteredSubscriber> + Send + Sync> =
                Box::new(fmt::layer().with_ansi(false).with_writer(appender));
            layer
        });

    let format_layer: Box<dyn Layer<FilteredSubscriber> + Send + Sync> = match config.format {
        LogFormat::Json => Box::new(fmt::layer().json().with_writer(std::io::stderr)),
        LogFormat::Compact => Box::new(fmt::layer().compact().with_writer(std::io::stderr)),
        LogFormat::Pretty => Box::new(fmt::layer().with_writer(std::io::stderr)),
    };

    let mut layers: Vec<Box<dyn Layer<FilteredSubscriber> + Send + Sync>> = vec![format_layer];
    if let Some(file_layer) = file_layer {
        layers.push(file_layer);
    }

    let result = tracing_subscriber::registry()
        .with(filter)
        .with(layers)
        .try_init();

    // Idempotent: ignore "already initialized".
    let _ = result;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_format_from_str() {
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("full".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert_eq!("compact".parse::<LogFormat>().unwrap(), LogFormat::Compact);
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("invalid".parse::<LogFormat>().is_err());
    }

    #[test]
    fn config_defaults() {
        let config = LogConfig::default();
        assert_eq!(config.level, Level::INFO);
        assert_eq!(config.format, LogFormat::Pretty);
        assert!(config.file_path.is_none());
        assert!(config.filter.is_none());
    }

    #[test]
    fn builder_chain() {
        let config = LogConfig::new()
            .with_level(Level::DEBUG)
            .with_format(LogFormat::Json)
            .with_file(PathBuf::from("/tmp/prefork.log"));
        assert_eq!(config.level, Level::DEBUG);
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.file_path, Some(PathBuf::from("/tmp/prefork.log")));
    }
}
