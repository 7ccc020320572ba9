//! Backend daemon launching

use anyhow::{Context, Result};
use device_bridge::{BackendKind, BusNameWatcher, NameEvent};
use std::future::Future;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::process::Command;
use tracing::{debug, info, warn};
use zbus::names::BusName;
use zbus::Connection;

/// Whether the backend's bus name currently has an owner
pub async fn is_running(connection: &Connection, kind: BackendKind) -> Result<bool> {
    let dbus = zbus::fdo::DBusProxy::new(connection)
        .await
        .context("Failed to create DBus proxy")?;
    let name = BusName::try_from(kind.bus_name()).context("Invalid bus name")?;
    dbus.name_has_owner(name)
        .await
        .context("Failed to query bus name owner")
}

/// Start `argv` detached from the terminal and reap it in the background
fn launch(argv: &[&str]) -> Result<()> {
    let (program, args) = argv.split_first().context("Empty command")?;

    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .with_context(|| format!("Failed to start {}", program))?;

    let program = program.to_string();
    tokio::spawn(async move {
        match child.wait().await {
            Ok(status) => debug!("{} exited with {}", program, status),
            Err(e) => warn!("Failed to wait for {}: {}", program, e),
        }
    });
    Ok(())
}

/// Launch the backend daemon in the background
pub fn spawn(kind: BackendKind) -> Result<()> {
    launch(kind.daemon_command())?;
    info!("Started {} daemon ({})", kind, kind.daemon_command().join(" "));
    Ok(())
}

/// Launch the backend's settings application
pub fn open_settings(kind: BackendKind) -> Result<()> {
    let argv = kind
        .settings_command()
        .with_context(|| format!("{} has no settings application", kind))?;
    launch(argv)
}

/// Start the daemon unless it already owns its bus name
pub async fn ensure_running(connection: &Connection, kind: BackendKind) -> Result<()> {
    if is_running(connection, kind).await? {
        debug!("{} already running", kind);
        return Ok(());
    }
    spawn(kind)
}

/// The `start_daemon` setting, applied while watching
pub struct AutoStart {
    enabled: AtomicBool,
}

impl AutoStart {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: AtomicBool::new(enabled),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Update the setting; `true` when it was just switched on
    pub fn set_enabled(&self, enabled: bool) -> bool {
        let was_enabled = self.enabled.swap(enabled, Ordering::SeqCst);
        enabled && !was_enabled
    }

    /// Call `launch` each time the watched name loses its owner
    ///
    /// Returns once the watcher ends. `launch` is expected to check for a
    /// new owner itself, since a handover also reports the name as vanished.
    pub async fn restart_on_vanish<F, Fut>(&self, watcher: &mut BusNameWatcher, mut launch: F)
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        while let Some(event) = watcher.next().await {
            if !matches!(event, NameEvent::Vanished) || !self.is_enabled() {
                continue;
            }
            debug!("{} vanished, restarting its daemon", watcher.name());
            if let Err(e) = launch().await {
                warn!("Could not restart daemon for {}: {:#}", watcher.name(), e);
            }
        }
    }
}
