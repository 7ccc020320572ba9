mod cli;
mod commands;
mod config;
mod daemon;
mod render;

use anyhow::{bail, Context, Result};
use clap::Parser;
use cli::{Cli, Command};
use config::Config;
use daemon::AutoStart;
use device_bridge::{
    BackendKind, BusNameWatcher, DeviceMonitor, Listeners, SessionEvent, Subscription,
    ZbusConnector,
};
use render::TextIndicator;
use std::path::Path;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use zbus::Connection;

/// Backend chosen by `--backend`, falling back to the configuration
fn backend(cli: &Cli, config: &Config) -> BackendKind {
    cli.backend.map(BackendKind::from).unwrap_or(config.backend)
}

fn print_lines(lines: Vec<String>) {
    for line in lines {
        println!("{}", line);
    }
}

/// A monitor running on its own task
struct RunningMonitor {
    kind: BackendKind,
    stop: Option<oneshot::Sender<()>>,
    task: JoinHandle<DeviceMonitor>,
    restarts: JoinHandle<()>,
    _render: Subscription,
}

impl RunningMonitor {
    async fn start(
        connection: &Connection,
        kind: BackendKind,
        indicator: Arc<TextIndicator>,
        auto_start: Arc<AutoStart>,
    ) -> Result<Self> {
        let watcher = BusNameWatcher::watch(connection, kind.bus_name())
            .await
            .with_context(|| format!("Failed to watch {}", kind.bus_name()))?;
        let mut vanishes = BusNameWatcher::watch(connection, kind.bus_name())
            .await
            .with_context(|| format!("Failed to watch {}", kind.bus_name()))?;

        let restart_connection = connection.clone();
        let restarts = tokio::spawn(async move {
            auto_start
                .restart_on_vanish(&mut vanishes, || {
                    daemon::ensure_running(&restart_connection, kind)
                })
                .await;
        });

        let events = Listeners::new();
        let render = events.subscribe(move |event: &SessionEvent| {
            print_lines(indicator.handle(event));
        });

        let connector = Arc::new(ZbusConnector::new(connection.clone(), kind));
        let mut monitor = DeviceMonitor::new(watcher, connector, events);
        let (stop, shutdown) = oneshot::channel();
        let task = tokio::spawn(async move {
            monitor.run(shutdown).await;
            monitor
        });

        Ok(Self {
            kind,
            stop: Some(stop),
            task,
            restarts,
            _render: render,
        })
    }

    /// Stop the monitor and wait until its session is torn down
    async fn shutdown(mut self) {
        self.restarts.abort();
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Err(e) = (&mut self.task).await {
            warn!("{} monitor task failed: {}", self.kind, e);
        }
    }
}

enum WatchOutcome {
    Quit,
    Reload,
    MonitorEnded,
}

async fn watch(cli: &Cli, config_path: &Path, mut config: Config) -> Result<()> {
    let connection = Connection::session()
        .await
        .context("Failed to connect to session bus")?;
    let mut hangup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;

    let indicator = Arc::new(TextIndicator::new(config.display, config.per_device));
    let auto_start = Arc::new(AutoStart::new(config.start_daemon));

    let mut kind = backend(cli, &config);
    if config.start_daemon {
        if let Err(e) = daemon::ensure_running(&connection, kind).await {
            warn!("Could not start {} daemon: {:#}", kind, e);
        }
    }
    let mut running =
        RunningMonitor::start(&connection, kind, indicator.clone(), auto_start.clone()).await?;

    loop {
        let outcome = tokio::select! {
            _ = tokio::signal::ctrl_c() => WatchOutcome::Quit,
            _ = hangup.recv() => WatchOutcome::Reload,
            _ = &mut running.task => WatchOutcome::MonitorEnded,
        };

        match outcome {
            WatchOutcome::Quit => {
                info!("Received shutdown signal");
                running.shutdown().await;
                return Ok(());
            }
            WatchOutcome::MonitorEnded => {
                error!("{} monitor stopped unexpectedly", kind);
                bail!("Lost connection to the session bus");
            }
            WatchOutcome::Reload => {
                info!("Reloading configuration from {}", config_path.display());
                match Config::load_from(config_path) {
                    Ok(reloaded) => config = reloaded,
                    Err(e) => {
                        warn!("Keeping previous configuration: {:#}", e);
                        continue;
                    }
                }

                let switched_on = auto_start.set_enabled(config.start_daemon);
                indicator.set_per_device(config.per_device);
                print_lines(indicator.set_filter(config.display));
                info!("{} devices visible after reload", indicator.visible().len());

                let next = backend(cli, &config);
                if next == kind {
                    if switched_on {
                        if let Err(e) = daemon::ensure_running(&connection, kind).await {
                            warn!("Could not start {} daemon: {:#}", kind, e);
                        }
                    }
                } else {
                    info!("Switching backend from {} to {}", kind, next);
                    running.shutdown().await;
                    kind = next;
                    if config.start_daemon {
                        if let Err(e) = daemon::ensure_running(&connection, kind).await {
                            warn!("Could not start {} daemon: {:#}", kind, e);
                        }
                    }
                    running = RunningMonitor::start(
                        &connection,
                        kind,
                        indicator.clone(),
                        auto_start.clone(),
                    )
                    .await?;
                }
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    cli::init_logging(&cli).context("Failed to initialize logging")?;

    let config_path = cli.config.clone().unwrap_or_else(Config::default_path);
    let config = Config::load_from(&config_path).context("Failed to load configuration")?;
    let kind = backend(&cli, &config);
    info!("Using {} backend", kind);

    match cli.command() {
        Command::Watch => watch(&cli, &config_path, config).await,
        Command::Settings => daemon::open_settings(kind),
        command => commands::run(&cli, &config, command, kind).await,
    }
}
