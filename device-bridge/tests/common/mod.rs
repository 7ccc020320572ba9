//! Shared test fixtures: an in-memory device bridge and event recorder

#![allow(dead_code)]

use async_trait::async_trait;
use device_bridge::bridge::BridgeConnector;
use device_bridge::device::plugins;
use device_bridge::{
    BackendKind, BatteryState, BridgeError, BridgeSignal, DeviceBridge, DeviceClass, DeviceId,
    DeviceSessionManager, GroupPayload, Listeners, OwnerHandle, PropertyGroup, Result,
    SessionEvent, SignalStream, StatusFlags, Subscription,
};
use futures::channel::mpsc as fmpsc;
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;

/// In-memory stand-in for a bridge service
#[derive(Default)]
pub struct MockBridge {
    devices: Mutex<Vec<DeviceId>>,
    groups: Mutex<HashMap<(DeviceId, PropertyGroup), GroupPayload>>,
    signals: Mutex<Option<fmpsc::UnboundedSender<BridgeSignal>>>,
    read_gate: Mutex<Option<Arc<Semaphore>>>,
    command_gate: Mutex<Option<Arc<Semaphore>>>,
    pub fail_list: AtomicBool,
    pub trust_requests: Mutex<Vec<DeviceId>>,
}

impl MockBridge {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add a trusted, active phone with the given plugins
    pub fn add_phone(&self, id: &str, name: &str, plugin_names: &[&str]) {
        self.devices.lock().unwrap().push(id.to_string());
        self.set(
            id,
            GroupPayload::Identity {
                name: name.to_string(),
                class: DeviceClass::Phone,
            },
        );
        self.set(
            id,
            GroupPayload::Status(StatusFlags {
                active: true,
                trusted: true,
                paired: true,
                allowed: true,
            }),
        );
        self.set(
            id,
            GroupPayload::Plugins(plugin_names.iter().map(|s| s.to_string()).collect()),
        );
    }

    pub fn set_battery(&self, id: &str, level: u8, charging: bool) {
        self.set(id, GroupPayload::Battery(BatteryState { level, charging }));
    }

    /// Value returned by the next reads of the payload's group
    pub fn set(&self, id: &str, payload: GroupPayload) {
        self.groups
            .lock()
            .unwrap()
            .insert((id.to_string(), payload.group()), payload);
    }

    pub fn forget(&self, id: &str, group: PropertyGroup) {
        self.groups.lock().unwrap().remove(&(id.to_string(), group));
    }

    /// Emit a signal on the current subscription
    pub fn emit(&self, signal: BridgeSignal) {
        if let Some(tx) = self.signals.lock().unwrap().as_ref() {
            tx.unbounded_send(signal).unwrap();
        }
    }

    /// End the signal stream as a lost bus connection would
    pub fn drop_signals(&self) {
        self.signals.lock().unwrap().take();
    }

    /// Make reads wait until `release_reads` is called
    pub fn hold_reads(&self) {
        *self.read_gate.lock().unwrap() = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release_reads(&self) {
        if let Some(gate) = self.read_gate.lock().unwrap().take() {
            gate.add_permits(Semaphore::MAX_PERMITS);
        }
    }

    /// Make find and message commands wait until `release_commands` is called
    pub fn hold_commands(&self) {
        *self.command_gate.lock().unwrap() = Some(Arc::new(Semaphore::new(0)));
    }

    pub fn release_commands(&self) {
        if let Some(gate) = self.command_gate.lock().unwrap().take() {
            gate.add_permits(Semaphore::MAX_PERMITS);
        }
    }

    async fn wait_for_command_gate(&self) {
        let gate = self.command_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            let _ = gate.acquire().await.map(|permit| permit.forget());
        }
    }
}

#[async_trait]
impl DeviceBridge for MockBridge {
    fn kind(&self) -> BackendKind {
        BackendKind::KdeConnect
    }

    async fn subscribe(&self) -> Result<SignalStream> {
        let (tx, rx) = fmpsc::unbounded();
        *self.signals.lock().unwrap() = Some(tx);
        Ok(rx.boxed())
    }

    async fn list_devices(&self) -> Result<Vec<DeviceId>> {
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(BridgeError::TransportAbsent("mock list failure".to_string()));
        }
        Ok(self.devices.lock().unwrap().clone())
    }

    async fn read_group(&self, device_id: &str, group: PropertyGroup) -> Result<GroupPayload> {
        let gate = self.read_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            let _ = gate.acquire().await.map(|permit| permit.forget());
        }

        self.groups
            .lock()
            .unwrap()
            .get(&(device_id.to_string(), group))
            .cloned()
            .ok_or_else(|| BridgeError::malformed(device_id, group, "no value"))
    }

    async fn request_trust(&self, device_id: &str) -> Result<()> {
        self.trust_requests.lock().unwrap().push(device_id.to_string());
        Ok(())
    }

    async fn revoke_trust(&self, _device_id: &str) -> Result<()> {
        Ok(())
    }

    async fn find_device(&self, device_id: &str) -> Result<()> {
        self.wait_for_command_gate().await;
        if self
            .groups
            .lock()
            .unwrap()
            .get(&(device_id.to_string(), PropertyGroup::Plugins))
            .is_some_and(|p| matches!(p, GroupPayload::Plugins(names) if names.iter().any(|n| n == plugins::FIND_MY_PHONE)))
        {
            Ok(())
        } else {
            Err(BridgeError::command_failed("find_device", device_id, "no findmyphone plugin"))
        }
    }

    async fn send_message(&self, _device_id: &str, _recipient_hint: &str) -> Result<()> {
        self.wait_for_command_gate().await;
        Ok(())
    }
}

/// Connector handing out the same mock bridge for every owner
pub struct MockConnector {
    pub bridge: Arc<MockBridge>,
    pub owners: Mutex<Vec<OwnerHandle>>,
}

impl MockConnector {
    pub fn new(bridge: Arc<MockBridge>) -> Arc<Self> {
        Arc::new(Self {
            bridge,
            owners: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl BridgeConnector for MockConnector {
    fn kind(&self) -> BackendKind {
        BackendKind::KdeConnect
    }

    async fn connect(&self, owner: &OwnerHandle) -> Result<Arc<dyn DeviceBridge>> {
        self.owners.lock().unwrap().push(owner.clone());
        let bridge: Arc<dyn DeviceBridge> = self.bridge.clone();
        Ok(bridge)
    }
}

/// Records every session event
pub struct Recorder {
    events: Arc<Mutex<Vec<SessionEvent>>>,
    _subscription: Subscription,
}

impl Recorder {
    pub fn attach(listeners: &Listeners<SessionEvent>) -> Self {
        let events = Arc::new(Mutex::new(Vec::new()));
        let store = events.clone();
        let subscription = listeners.subscribe(move |event: &SessionEvent| {
            store.lock().unwrap().push(event.clone());
        });
        Self {
            events,
            _subscription: subscription,
        }
    }

    pub fn events(&self) -> Vec<SessionEvent> {
        self.events.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }

    pub fn added(&self) -> Vec<DeviceId> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                SessionEvent::DeviceAdded { id, .. } => Some(id),
                _ => None,
            })
            .collect()
    }

    pub fn removed(&self) -> Vec<DeviceId> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                SessionEvent::DeviceRemoved(id) => Some(id),
                _ => None,
            })
            .collect()
    }

    pub fn changed(&self, device: &str, group: PropertyGroup) -> usize {
        self.events()
            .iter()
            .filter(|event| {
                matches!(event, SessionEvent::DeviceChanged { id, group: g } if id == device && *g == group)
            })
            .count()
    }

    pub fn ended(&self) -> usize {
        self.events()
            .iter()
            .filter(|event| matches!(event, SessionEvent::SessionEnded))
            .count()
    }
}

/// Step the session until `done` holds
pub async fn drive_until<F>(session: &mut DeviceSessionManager, done: F)
where
    F: Fn(&DeviceSessionManager) -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !done(session) {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        match tokio::time::timeout(remaining, session.step()).await {
            Ok(true) => {}
            Ok(false) => panic!("session became inactive while waiting"),
            Err(_) => panic!("condition not reached in time"),
        }
    }
}

/// Step the session for a short while, processing whatever arrives
pub async fn drain(session: &mut DeviceSessionManager) {
    while let Ok(true) = tokio::time::timeout(Duration::from_millis(50), session.step()).await {}
}
