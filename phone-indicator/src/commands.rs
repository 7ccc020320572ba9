//! One-shot Commands
//!
//! `list`, `find`, `trust` and `sms` start a session of their own, wait for
//! the devices to be identified, act, and tear the session down again.

use crate::cli::{Cli, Command};
use crate::config::Config;
use crate::daemon;
use crate::render;
use anyhow::{bail, Context, Result};
use device_bridge::{
    BackendKind, BridgeConnector, BusNameWatcher, DeviceHandle, DeviceSessionManager, Listeners,
    NameEvent, OwnerHandle, ZbusConnector,
};
use std::time::Duration;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};
use zbus::Connection;

/// Extra time given to battery reads after identification, for `list`
const LIST_SETTLE: Duration = Duration::from_millis(250);

pub async fn run(cli: &Cli, config: &Config, command: Command, kind: BackendKind) -> Result<()> {
    let deadline = Instant::now() + cli.timeout();
    let connection = Connection::session()
        .await
        .context("Failed to connect to session bus")?;

    let mut watcher = BusNameWatcher::watch(&connection, kind.bus_name())
        .await
        .context("Failed to watch bus name")?;

    if config.start_daemon {
        if let Err(e) = daemon::ensure_running(&connection, kind).await {
            warn!("Could not start {} daemon: {:#}", kind, e);
        }
    }

    let owner = wait_for_owner(&mut watcher, deadline)
        .await
        .with_context(|| format!("{} did not appear within {}s", kind, cli.timeout))?;

    let connector = ZbusConnector::new(connection, kind);
    let bridge = connector
        .connect(&owner)
        .await
        .context("Failed to connect to bridge")?;

    let mut session = DeviceSessionManager::new(bridge, owner, Listeners::new());
    session
        .start()
        .await
        .with_context(|| format!("Failed to start {} session", kind))?;

    settle(&mut session, deadline, all_identified).await;

    let result = execute(&mut session, config, command).await;

    session.destroy();
    watcher.unwatch();
    result
}

async fn execute(
    session: &mut DeviceSessionManager,
    config: &Config,
    command: Command,
) -> Result<()> {
    match command {
        Command::Watch | Command::Settings => bail!("{:?} does not act on a session", command),
        Command::List => {
            let settle_until = Instant::now() + LIST_SETTLE;
            settle(session, settle_until, |_| false).await;

            let mut shown = 0;
            for id in session.device_ids() {
                let Some(record) = session.device(id).and_then(|d| d.snapshot().ok()) else {
                    continue;
                };
                if config.display.is_visible(&record) {
                    println!("{}", render::describe(&record));
                    shown += 1;
                }
            }
            if shown == 0 {
                println!("No devices");
            }
            Ok(())
        }
        Command::Find { device } => {
            let handle = resolve(session, &device)?;
            handle
                .find_device()
                .await
                .with_context(|| format!("Failed to ring {}", device))?;
            println!("Ringing {}", device);
            Ok(())
        }
        Command::Trust { device } => {
            let handle = resolve(session, &device)?;
            let trusted = handle.snapshot()?.trusted;
            handle
                .toggle_trust()
                .await
                .with_context(|| format!("Failed to change trust for {}", device))?;
            if trusted {
                println!("Unpaired {}", device);
            } else {
                println!("Requested pairing with {}", device);
            }
            Ok(())
        }
        Command::Sms { device, recipient } => {
            let handle = resolve(session, &device)?;
            handle
                .send_message_to(recipient.as_deref().unwrap_or_default())
                .await
                .with_context(|| format!("Failed to open SMS composer for {}", device))?;
            Ok(())
        }
    }
}

async fn wait_for_owner(watcher: &mut BusNameWatcher, deadline: Instant) -> Result<OwnerHandle> {
    loop {
        match timeout_at(deadline, watcher.next()).await {
            Ok(Some(NameEvent::Appeared { owner })) => return Ok(owner),
            Ok(Some(NameEvent::Vanished)) => debug!("{} vanished while waiting", watcher.name()),
            Ok(None) => bail!("Lost connection to the session bus"),
            Err(_) => bail!("Timed out"),
        }
    }
}

/// Step the session until `done` holds or the deadline passes
async fn settle<F>(session: &mut DeviceSessionManager, deadline: Instant, done: F)
where
    F: Fn(&DeviceSessionManager) -> bool,
{
    while !done(session) {
        match timeout_at(deadline, session.step()).await {
            Ok(true) => {}
            Ok(false) | Err(_) => break,
        }
    }
}

fn all_identified(session: &DeviceSessionManager) -> bool {
    session.device_ids().iter().all(|id| {
        session
            .device(id)
            .and_then(|device| device.snapshot().ok())
            .is_some_and(|record| !record.name.is_empty())
    })
}

/// Find a device by id, or else by case-insensitive name
fn resolve(session: &DeviceSessionManager, query: &str) -> Result<DeviceHandle> {
    if let Some(device) = session.device(query) {
        return Ok(device);
    }

    let mut matches = session
        .device_ids()
        .iter()
        .filter_map(|id| session.device(id))
        .filter(|device| {
            device
                .snapshot()
                .is_ok_and(|record| record.name.eq_ignore_ascii_case(query))
        });

    match (matches.next(), matches.next()) {
        (Some(device), None) => Ok(device),
        (Some(_), Some(_)) => bail!("More than one device is named {}", query),
        (None, _) => bail!("No device matches {}", query),
    }
}
