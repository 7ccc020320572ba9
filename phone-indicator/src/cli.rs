//! Command Line Interface and Logging

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use device_bridge::BackendKind;
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;
use tracing_subscriber::{fmt, EnvFilter};

/// Phone indicator command-line interface
#[derive(Parser, Debug)]
#[command(name = "phone-indicator")]
#[command(about = "Show KDE Connect / MConnect device state in the terminal", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Configuration file (default: $XDG_CONFIG_HOME/phone-indicator/config.toml)
    #[arg(short, long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Backend to use instead of the configured one
    #[arg(short, long, value_enum)]
    pub backend: Option<BackendArg>,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Enable JSON structured logging
    #[arg(long)]
    pub json_logs: bool,

    /// Seconds one-shot commands wait for the service and device
    #[arg(short, long, value_name = "SECONDS", default_value = "5")]
    pub timeout: u64,

    #[command(subcommand)]
    pub command: Option<Command>,
}

impl Cli {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    pub fn command(&self) -> Command {
        self.command.clone().unwrap_or(Command::Watch)
    }
}

#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Print device state changes until interrupted (default)
    Watch,

    /// List devices once the service is up
    List,

    /// Ring a device
    Find {
        /// Device id or name
        device: String,
    },

    /// Toggle trust: unpair a trusted device, request pairing otherwise
    Trust {
        /// Device id or name
        device: String,
    },

    /// Open the SMS composer for a device
    Sms {
        /// Device id or name
        device: String,

        /// Phone number or contact to prefill
        recipient: Option<String>,
    },

    /// Open the backend's settings application
    Settings,
}

/// Backend names accepted on the command line
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendArg {
    Kdeconnect,
    Mconnect,
}

impl From<BackendArg> for BackendKind {
    fn from(arg: BackendArg) -> Self {
        match arg {
            BackendArg::Kdeconnect => BackendKind::KdeConnect,
            BackendArg::Mconnect => BackendKind::MConnect,
        }
    }
}

/// Initialize logging to stderr; `RUST_LOG` takes precedence over `--verbose`
pub fn init_logging(cli: &Cli) -> Result<()> {
    let level = if cli.verbose { "debug" } else { "info" };

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .context("Failed to create log filter")?;

    let subscriber = fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);

    if cli.json_logs {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    debug!("Logging initialized: level={}, json={}", level, cli.json_logs);
    Ok(())
}
