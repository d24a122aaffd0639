//! Command-line interface for tandemd.
use std::str::FromStr;

use clap::{Parser, Subcommand};
use tracing::level_filters::LevelFilter;

/// Wrapper around `LevelFilter` so clap can parse log levels from either
/// string names ("info", "debug", etc.) or numeric shorthands (0-5).
#[derive(Clone, Copy, Debug)]
pub struct LogLevelArg(LevelFilter);

impl LogLevelArg {
    /// String representation suitable for `RUST_LOG`.
    pub fn as_str(&self) -> &'static str {
        match self.0 {
            LevelFilter::OFF => "off",
            LevelFilter::ERROR => "error",
            LevelFilter::WARN => "warn",
            LevelFilter::INFO => "info",
            LevelFilter::DEBUG => "debug",
            LevelFilter::TRACE => "trace",
        }
    }
}

impl FromStr for LogLevelArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err("log level cannot be empty".into());
        }

        if let Ok(number) = trimmed.parse::<u8>() {
            let level = match number {
                0 => LevelFilter::OFF,
                1 => LevelFilter::ERROR,
                2 => LevelFilter::WARN,
                3 => LevelFilter::INFO,
                4 => LevelFilter::DEBUG,
                5 => LevelFilter::TRACE,
                _ => {
                    return Err(format!(
                        "unsupported log level number '{number}' (expected 0-5)"
                    ));
                }
            };

            return Ok(LogLevelArg(level));
        }

        let lowercase = trimmed.to_ascii_lowercase();
        let level = match lowercase.as_str() {
            "off" => Some(LevelFilter::OFF),
            "error" | "err" => Some(LevelFilter::ERROR),
            "warn" | "warning" => Some(LevelFilter::WARN),
            "info" | "information" => Some(LevelFilter::INFO),
            "debug" => Some(LevelFilter::DEBUG),
            "trace" => Some(LevelFilter::TRACE),
            _ => None,
        }
        .ok_or_else(|| format!("invalid log level '{trimmed}'"))?;

        Ok(LogLevelArg(level))
    }
}

/// Command-line interface for tandemd.
#[derive(Parser)]
#[command(name = "tandemd", version, author)]
#[command(about = "An embedded supervisor for co-located, interdependent services", long_about = None)]
pub struct Cli {
    /// Override the logging verbosity for this invocation only.
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevelArg>,

    /// The command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for tandemd.
#[derive(Subcommand)]
pub enum Commands {
    /// Run the supervisor in the foreground until a termination signal.
    Run {
        /// Path to the configuration file (defaults to `tandemd.yaml`).
        #[arg(short, long, default_value = "tandemd.yaml")]
        config: String,
    },

    /// Validate a configuration and print the resolved start order.
    Check {
        /// Path to the configuration file (defaults to `tandemd.yaml`).
        #[arg(short, long, default_value = "tandemd.yaml")]
        config: String,
    },

    /// Query a running supervisor's aggregate health endpoint.
    ///
    /// Exits 0 while the supervisor reports healthy or degraded, 1 when it
    /// reports unhealthy or cannot be reached.
    Health {
        /// URL of the aggregate health endpoint.
        #[arg(short, long, default_value = "http://127.0.0.1:9096/health")]
        url: String,

        /// Request timeout (e.g. "5s").
        #[arg(short, long, default_value = "10s")]
        timeout: String,
    },
}

/// Parses command-line arguments and returns a `Cli` struct.
pub fn parse_args() -> Cli {
    Cli::parse()
}
