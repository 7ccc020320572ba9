//! Device Session Manager
//!
//! A `DeviceSessionManager` tracks the device set of one backend service
//! instance, from the `appeared` that created it to the `vanished` (or
//! shutdown) that destroys it.
//!
//! ## Lifecycle
//!
//! ```text
//! Uninitialized --start()--> Active --destroy()--> Destroyed
//! ```
//!
//! A destroyed session is never restarted; the monitor builds a new one for
//! the next `appeared`.
//!
//! ## Dispatch
//!
//! The session is driven from one task: `next_input` waits for either a
//! bridge signal or a completed group read, and `handle` applies it. Group
//! reads run on their own tasks so a slow reply never delays signals for
//! other devices.

use crate::bridge::{BridgeSignal, DeviceBridge, SignalStream};
use crate::device::{plugins, DeviceId, GroupPayload, PropertyGroup};
use crate::proxy::{DeviceHandle, DeviceProxy, ReadTicket};
use crate::subscription::{Listeners, Subscription};
use crate::watcher::OwnerHandle;
use crate::{BridgeError, Result};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Active,
    Destroyed,
}

/// Event delivered to presentation code
#[derive(Debug, Clone)]
pub enum SessionEvent {
    SessionStarted { owner: OwnerHandle },
    SessionEnded,
    DeviceAdded { id: DeviceId, device: DeviceHandle },
    DeviceRemoved(DeviceId),
    DeviceChanged { id: DeviceId, group: PropertyGroup },
}

/// One lifetime of the backend service on the bus
#[derive(Debug, Clone)]
pub struct ServiceSession {
    pub owner: OwnerHandle,
    pub created_at: DateTime<Utc>,
}

/// Result of a group read started by the session
#[derive(Debug)]
pub struct ReadOutcome {
    device_id: DeviceId,
    serial: u64,
    group: PropertyGroup,
    ticket: ReadTicket,
    result: Result<GroupPayload>,
}

/// Unit of work for the session's dispatch loop
#[derive(Debug)]
pub enum SessionInput {
    Signal(BridgeSignal),
    ReadCompleted(ReadOutcome),
    /// The bridge's signal stream ended, i.e. the bus connection is gone
    SignalsEnded,
}

struct TrackedDevice {
    proxy: DeviceProxy,
    /// Distinguishes a re-added device from its earlier incarnation
    serial: u64,
    _changes: Subscription,
}

/// Owner of the device proxies of one service session
pub struct DeviceSessionManager {
    bridge: Arc<dyn DeviceBridge>,
    session: ServiceSession,
    state: SessionState,
    devices: HashMap<DeviceId, TrackedDevice>,
    order: Vec<DeviceId>,
    next_serial: u64,
    events: Listeners<SessionEvent>,
    signals: Option<SignalStream>,
    reads_tx: mpsc::UnboundedSender<ReadOutcome>,
    reads_rx: mpsc::UnboundedReceiver<ReadOutcome>,
}

impl DeviceSessionManager {
    pub fn new(
        bridge: Arc<dyn DeviceBridge>,
        owner: OwnerHandle,
        events: Listeners<SessionEvent>,
    ) -> Self {
        let (reads_tx, reads_rx) = mpsc::unbounded_channel();
        Self {
            bridge,
            session: ServiceSession {
                owner,
                created_at: Utc::now(),
            },
            state: SessionState::Uninitialized,
            devices: HashMap::new(),
            order: Vec::new(),
            next_serial: 0,
            events,
            signals: None,
            reads_tx,
            reads_rx,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn session(&self) -> &ServiceSession {
        &self.session
    }

    /// Known device ids, in the order they were added
    pub fn device_ids(&self) -> &[DeviceId] {
        &self.order
    }

    pub fn device(&self, id: &str) -> Option<DeviceHandle> {
        self.devices.get(id).map(|tracked| tracked.proxy.handle())
    }

    /// Subscribe to backend signals, then enumerate devices
    ///
    /// On failure the session is left `Destroyed` without having emitted
    /// anything.
    pub async fn start(&mut self) -> Result<()> {
        match self.state {
            SessionState::Uninitialized => {}
            SessionState::Active => {
                return Err(BridgeError::ProtocolViolation(format!(
                    "session for {} started twice",
                    self.session.owner
                )));
            }
            SessionState::Destroyed => return Err(BridgeError::SessionNotActive),
        }

        // Subscribe before enumerating so no device added in between is lost
        let signals = match self.bridge.subscribe().await {
            Ok(signals) => signals,
            Err(e) => {
                self.state = SessionState::Destroyed;
                return Err(e);
            }
        };

        let ids = match self.bridge.list_devices().await {
            Ok(ids) => ids,
            Err(e) => {
                self.state = SessionState::Destroyed;
                return Err(e);
            }
        };

        self.signals = Some(signals);
        self.state = SessionState::Active;
        info!(
            "{} session started for {} with {} devices",
            self.bridge.kind(),
            self.session.owner,
            ids.len()
        );
        self.events.emit(&SessionEvent::SessionStarted {
            owner: self.session.owner.clone(),
        });

        for id in ids {
            if self.devices.contains_key(&id) {
                warn!("Enumeration listed {} twice", id);
                continue;
            }
            self.add_device(id);
        }
        Ok(())
    }

    /// Wait for the next signal or read result
    ///
    /// Returns `None` once the session is no longer active.
    pub async fn next_input(&mut self) -> Option<SessionInput> {
        if self.state != SessionState::Active {
            return None;
        }

        let input = match self.signals.as_mut() {
            Some(signals) => tokio::select! {
                signal = signals.next() => match signal {
                    Some(signal) => SessionInput::Signal(signal),
                    None => SessionInput::SignalsEnded,
                },
                Some(outcome) = self.reads_rx.recv() => SessionInput::ReadCompleted(outcome),
            },
            None => SessionInput::ReadCompleted(self.reads_rx.recv().await?),
        };
        Some(input)
    }

    /// Apply one input; inputs arriving after destruction are ignored
    pub fn handle(&mut self, input: SessionInput) {
        if self.state != SessionState::Active {
            debug!("Ignoring {:?} for inactive session", input);
            return;
        }

        match input {
            SessionInput::Signal(signal) => self.handle_signal(signal),
            SessionInput::ReadCompleted(outcome) => self.handle_read(outcome),
            SessionInput::SignalsEnded => {
                warn!(
                    "Signal stream from {} ended; treating service as gone",
                    self.session.owner
                );
                self.destroy();
            }
        }
    }

    /// Wait for and apply one input; `false` once the session is inactive
    pub async fn step(&mut self) -> bool {
        match self.next_input().await {
            Some(input) => {
                self.handle(input);
                true
            }
            None => false,
        }
    }

    /// Tear the session down
    ///
    /// Stops intake, fires `DeviceRemoved` for every known device, releases
    /// the proxies, then marks the session destroyed and fires
    /// `SessionEnded`. Calling it again is a no-op.
    pub fn destroy(&mut self) {
        let was_active = match self.state {
            SessionState::Destroyed => return,
            SessionState::Active => true,
            SessionState::Uninitialized => false,
        };

        self.signals = None;
        self.reads_rx.close();

        let ids = std::mem::take(&mut self.order);
        for id in &ids {
            self.events.emit(&SessionEvent::DeviceRemoved(id.clone()));
        }
        for id in &ids {
            if let Some(tracked) = self.devices.remove(id) {
                tracked.proxy.release();
            }
        }

        self.state = SessionState::Destroyed;
        if was_active {
            info!(
                "{} session for {} ended after {}s",
                self.bridge.kind(),
                self.session.owner,
                (Utc::now() - self.session.created_at).num_seconds()
            );
            self.events.emit(&SessionEvent::SessionEnded);
        }
    }

    fn handle_signal(&mut self, signal: BridgeSignal) {
        match signal {
            BridgeSignal::DeviceAdded(id) => {
                if self.devices.contains_key(&id) {
                    self.protocol_violation(format!("device {} added twice", id));
                } else {
                    self.add_device(id);
                }
            }
            BridgeSignal::DeviceRemoved(id) => {
                if self.devices.contains_key(&id) {
                    self.remove_device(&id);
                } else {
                    self.protocol_violation(format!("removal of unknown device {}", id));
                }
            }
            BridgeSignal::PropertyChanged {
                device_id,
                group,
                payload,
            } => {
                if !self.devices.contains_key(&device_id) {
                    self.protocol_violation(format!(
                        "{} change for unknown device {}",
                        group, device_id
                    ));
                    return;
                }
                debug!("{} changed for {}", group, device_id);
                match payload {
                    Some(payload) => self.apply_inline(&device_id, payload),
                    None => self.spawn_read(&device_id, group),
                }
            }
        }
    }

    fn handle_read(&mut self, outcome: ReadOutcome) {
        let Some(tracked) = self.devices.get(&outcome.device_id) else {
            debug!(
                "Discarding {} read for departed device {}",
                outcome.group, outcome.device_id
            );
            return;
        };
        if tracked.serial != outcome.serial {
            debug!(
                "Discarding {} read for earlier instance of {}",
                outcome.group, outcome.device_id
            );
            return;
        }

        match outcome.result {
            Ok(payload) => {
                if tracked.proxy.apply(outcome.ticket, payload) {
                    self.after_apply(&outcome.device_id, outcome.group);
                }
            }
            Err(e) if e.is_transport() => debug!(
                "{} read for {} lost with the service: {}",
                outcome.group, outcome.device_id, e
            ),
            Err(e) => warn!(
                "Keeping cached {} for {}: {}",
                outcome.group, outcome.device_id, e
            ),
        }
    }

    fn apply_inline(&self, device_id: &str, payload: GroupPayload) {
        let group = payload.group();
        let applied = self
            .devices
            .get(device_id)
            .is_some_and(|tracked| tracked.proxy.apply_inline(payload));
        if applied {
            self.after_apply(device_id, group);
        }
    }

    /// A battery plugin that just showed up needs its first reading
    fn after_apply(&self, device_id: &str, group: PropertyGroup) {
        if group != PropertyGroup::Plugins {
            return;
        }
        let needs_battery = self.devices.get(device_id).is_some_and(|tracked| {
            let record = tracked.proxy.snapshot();
            record.has_plugin(plugins::BATTERY) && record.battery().is_none()
        });
        if needs_battery {
            self.spawn_read(device_id, PropertyGroup::Battery);
        }
    }

    fn add_device(&mut self, id: DeviceId) {
        let proxy = DeviceProxy::new(id.clone(), self.bridge.clone());

        let events = self.events.clone();
        let changed_id = id.clone();
        let changes = proxy.on_any_changed(move |group| {
            events.emit(&SessionEvent::DeviceChanged {
                id: changed_id.clone(),
                group,
            });
        });

        let serial = self.next_serial;
        self.next_serial += 1;
        let device = proxy.handle();
        self.devices.insert(
            id.clone(),
            TrackedDevice {
                proxy,
                serial,
                _changes: changes,
            },
        );
        self.order.push(id.clone());

        debug!("Device {} added", id);
        self.events.emit(&SessionEvent::DeviceAdded {
            id: id.clone(),
            device,
        });

        for group in [
            PropertyGroup::Identity,
            PropertyGroup::Status,
            PropertyGroup::Plugins,
        ] {
            self.spawn_read(&id, group);
        }
    }

    fn remove_device(&mut self, id: &str) {
        self.order.retain(|known| known != id);
        debug!("Device {} removed", id);
        self.events.emit(&SessionEvent::DeviceRemoved(id.to_string()));
        if let Some(tracked) = self.devices.remove(id) {
            tracked.proxy.release();
        }
    }

    fn spawn_read(&self, device_id: &str, group: PropertyGroup) {
        let Some(tracked) = self.devices.get(device_id) else {
            return;
        };
        let ticket = tracked.proxy.begin_read(group);
        let serial = tracked.serial;
        let bridge = self.bridge.clone();
        let reads = self.reads_tx.clone();
        let device_id = device_id.to_string();

        tokio::spawn(async move {
            let result = bridge.read_group(&device_id, group).await;
            // The session may be gone; its receiver is closed then
            let _ = reads.send(ReadOutcome {
                device_id,
                serial,
                group,
                ticket,
                result,
            });
        });
    }

    fn protocol_violation(&self, detail: String) {
        let error = BridgeError::ProtocolViolation(detail);
        warn!("Ignoring notification: {}", error);
    }
}

impl Drop for DeviceSessionManager {
    fn drop(&mut self) {
        self.destroy();
    }
}
