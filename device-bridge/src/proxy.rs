//! Device Proxy
//!
//! Live, read-through view of one remote device. The owning session holds
//! the `DeviceProxy`; presentation code only ever gets a `DeviceHandle`,
//! which stops working once the session releases the proxy.
//!
//! ## Group Reads
//!
//! Every read of a property group takes a ticket. Tickets increase per
//! group, and a result is applied only when its ticket is newer than the
//! last one applied, so a slow reply can never overwrite a fresher value.

use crate::bridge::DeviceBridge;
use crate::device::{DeviceId, DeviceRecord, GroupPayload, PropertyGroup};
use crate::subscription::{Listeners, Subscription};
use crate::{BridgeError, Result};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};
use tracing::{debug, warn};

/// Ticket identifying one read of one property group
pub type ReadTicket = u64;

#[derive(Debug, Default, Clone, Copy)]
struct GroupTickets {
    issued: ReadTicket,
    applied: ReadTicket,
}

struct ProxyShared {
    id: DeviceId,
    bridge: Arc<dyn DeviceBridge>,
    record: RwLock<DeviceRecord>,
    tickets: Mutex<[GroupTickets; 4]>,
    listeners: Listeners<PropertyGroup>,
    released: AtomicBool,
}

impl ProxyShared {
    fn ensure_live(&self) -> Result<()> {
        if self.released.load(Ordering::SeqCst) {
            return Err(BridgeError::DeviceGone(self.id.clone()));
        }
        Ok(())
    }

    fn snapshot(&self) -> DeviceRecord {
        self.record
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn begin_read(&self, group: PropertyGroup) -> ReadTicket {
        let mut tickets = self.tickets.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = &mut tickets[group.index()];
        entry.issued += 1;
        entry.issued
    }

    fn apply(&self, ticket: ReadTicket, payload: GroupPayload) -> bool {
        if self.released.load(Ordering::SeqCst) {
            debug!("Discarding {} result for released device {}", payload.group(), self.id);
            return false;
        }

        let group = payload.group();
        // Lock order is tickets then record; the check and the write are one step
        let applied = {
            let mut tickets = self.tickets.lock().unwrap_or_else(PoisonError::into_inner);
            let entry = &mut tickets[group.index()];
            if ticket <= entry.applied {
                debug!(
                    "Discarding stale {} read {} for {} (applied {})",
                    group, ticket, self.id, entry.applied
                );
                return false;
            }
            entry.applied = ticket;

            self.record
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .apply(payload)
        };

        if !applied {
            debug!("Ignoring battery reading for {}: no battery plugin", self.id);
            return false;
        }

        self.listeners.emit(&group);
        true
    }

    fn on_changed<F>(&self, group: PropertyGroup, callback: F) -> Subscription
    where
        F: Fn(PropertyGroup) + Send + Sync + 'static,
    {
        self.listeners.subscribe(move |changed| {
            if *changed == group {
                callback(*changed);
            }
        })
    }

    async fn refresh(&self, group: PropertyGroup) -> Result<()> {
        self.ensure_live()?;
        let ticket = self.begin_read(group);
        match self.bridge.read_group(&self.id, group).await {
            Ok(payload) => {
                self.apply(ticket, payload);
                Ok(())
            }
            Err(e) => {
                warn!("Failed to refresh {} for {}: {}", group, self.id, e);
                Err(e)
            }
        }
    }

    async fn request_trust(&self) -> Result<()> {
        self.ensure_live()?;
        self.bridge
            .request_trust(&self.id)
            .await
            .inspect_err(|e| warn!("Trust request for {} failed: {}", self.id, e))
    }

    async fn revoke_trust(&self) -> Result<()> {
        self.ensure_live()?;
        self.bridge
            .revoke_trust(&self.id)
            .await
            .inspect_err(|e| warn!("Revoking trust for {} failed: {}", self.id, e))
    }

    async fn toggle_trust(&self) -> Result<()> {
        if self.snapshot().trusted {
            self.revoke_trust().await
        } else {
            self.request_trust().await
        }
    }

    async fn find_device(&self) -> Result<()> {
        self.ensure_live()?;
        self.bridge
            .find_device(&self.id)
            .await
            .inspect_err(|e| warn!("Find request for {} failed: {}", self.id, e))
    }

    async fn send_message_to(&self, recipient_hint: &str) -> Result<()> {
        self.ensure_live()?;
        self.bridge
            .send_message(&self.id, recipient_hint)
            .await
            .inspect_err(|e| warn!("Message request for {} failed: {}", self.id, e))
    }
}

/// Owning view of one device, held by its session
pub struct DeviceProxy {
    shared: Arc<ProxyShared>,
}

impl DeviceProxy {
    /// Proxy with an empty record; groups are filled in by reads
    pub fn new(id: impl Into<DeviceId>, bridge: Arc<dyn DeviceBridge>) -> Self {
        let id = id.into();
        Self {
            shared: Arc::new(ProxyShared {
                record: RwLock::new(DeviceRecord::new(id.clone())),
                id,
                bridge,
                tickets: Mutex::new([GroupTickets::default(); 4]),
                listeners: Listeners::new(),
                released: AtomicBool::new(false),
            }),
        }
    }

    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// Copy of the cached record, without touching the bus
    pub fn snapshot(&self) -> DeviceRecord {
        self.shared.snapshot()
    }

    /// Run `callback` after each update of `group`
    pub fn on_changed<F>(&self, group: PropertyGroup, callback: F) -> Subscription
    where
        F: Fn(PropertyGroup) + Send + Sync + 'static,
    {
        self.shared.on_changed(group, callback)
    }

    /// Run `callback` after an update of any group
    pub fn on_any_changed<F>(&self, callback: F) -> Subscription
    where
        F: Fn(PropertyGroup) + Send + Sync + 'static,
    {
        self.shared.listeners.subscribe(move |group| callback(*group))
    }

    /// Re-read one group from the bus
    pub async fn refresh(&self, group: PropertyGroup) -> Result<()> {
        self.shared.refresh(group).await
    }

    /// Take a ticket for a read that will complete elsewhere
    pub fn begin_read(&self, group: PropertyGroup) -> ReadTicket {
        self.shared.begin_read(group)
    }

    /// Apply the result of the read identified by `ticket`
    ///
    /// Returns `false` when the result was discarded: stale ticket, released
    /// proxy, or a battery reading without the battery plugin.
    pub fn apply(&self, ticket: ReadTicket, payload: GroupPayload) -> bool {
        self.shared.apply(ticket, payload)
    }

    /// Apply values that arrived with a change signal
    pub fn apply_inline(&self, payload: GroupPayload) -> bool {
        let ticket = self.begin_read(payload.group());
        self.apply(ticket, payload)
    }

    pub async fn request_trust(&self) -> Result<()> {
        self.shared.request_trust().await
    }

    pub async fn revoke_trust(&self) -> Result<()> {
        self.shared.revoke_trust().await
    }

    /// Revoke trust if the device is trusted, request it otherwise
    pub async fn toggle_trust(&self) -> Result<()> {
        self.shared.toggle_trust().await
    }

    pub async fn find_device(&self) -> Result<()> {
        self.shared.find_device().await
    }

    pub async fn send_message_to(&self, recipient_hint: &str) -> Result<()> {
        self.shared.send_message_to(recipient_hint).await
    }

    /// Non-owning handle for presentation code
    pub fn handle(&self) -> DeviceHandle {
        DeviceHandle {
            id: self.shared.id.clone(),
            shared: Arc::downgrade(&self.shared),
        }
    }

    pub fn is_released(&self) -> bool {
        self.shared.released.load(Ordering::SeqCst)
    }

    /// Detach the proxy; later results and handle calls are rejected
    pub fn release(self) {
        self.shared.released.store(true, Ordering::SeqCst);
        debug!("Released device proxy {}", self.shared.id);
    }
}

impl Drop for DeviceProxy {
    fn drop(&mut self) {
        self.shared.released.store(true, Ordering::SeqCst);
    }
}

/// Weak reference to a device proxy
///
/// Every method fails with `BridgeError::DeviceGone` once the session has
/// released the device.
#[derive(Clone)]
pub struct DeviceHandle {
    id: DeviceId,
    shared: Weak<ProxyShared>,
}

impl DeviceHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    fn upgrade(&self) -> Result<Arc<ProxyShared>> {
        let shared = self
            .shared
            .upgrade()
            .ok_or_else(|| BridgeError::DeviceGone(self.id.clone()))?;
        shared.ensure_live()?;
        Ok(shared)
    }

    pub fn is_alive(&self) -> bool {
        self.upgrade().is_ok()
    }

    pub fn snapshot(&self) -> Result<DeviceRecord> {
        Ok(self.upgrade()?.snapshot())
    }

    pub fn on_changed<F>(&self, group: PropertyGroup, callback: F) -> Result<Subscription>
    where
        F: Fn(PropertyGroup) + Send + Sync + 'static,
    {
        Ok(self.upgrade()?.on_changed(group, callback))
    }

    pub async fn refresh(&self, group: PropertyGroup) -> Result<()> {
        self.upgrade()?.refresh(group).await
    }

    pub async fn request_trust(&self) -> Result<()> {
        self.upgrade()?.request_trust().await
    }

    pub async fn revoke_trust(&self) -> Result<()> {
        self.upgrade()?.revoke_trust().await
    }

    pub async fn toggle_trust(&self) -> Result<()> {
        self.upgrade()?.toggle_trust().await
    }

    pub async fn find_device(&self) -> Result<()> {
        self.upgrade()?.find_device().await
    }

    pub async fn send_message_to(&self, recipient_hint: &str) -> Result<()> {
        self.upgrade()?.send_message_to(recipient_hint).await
    }
}

impl std::fmt::Debug for DeviceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceHandle")
            .field("id", &self.id)
            .field("alive", &self.is_alive())
            .finish()
    }
}
