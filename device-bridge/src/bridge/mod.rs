//! Device Bridge Abstraction
//!
//! A device bridge is the external daemon (KDE Connect or MConnect) that
//! talks to the phone and exposes its devices over D-Bus. Sessions and
//! device proxies only see the `DeviceBridge` trait, so both backends share
//! one implementation of the session logic.
//!
//! ## Signals
//!
//! `subscribe` yields the backend's notifications already mapped onto
//! device ids and property groups:
//!
//! - `DeviceAdded` / `DeviceRemoved` - the device set changed
//! - `PropertyChanged` - one group changed; the payload is included when the
//!   backend sends the new values alongside the signal, otherwise the proxy
//!   reads the group back

pub mod kdeconnect;
pub mod mconnect;

use crate::device::{DeviceId, GroupPayload, PropertyGroup};
use crate::watcher::OwnerHandle;
use crate::{BridgeError, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use zbus::Connection;

pub use kdeconnect::KdeConnectBridge;
pub use mconnect::MConnectBridge;

/// Supported backend daemons
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum BackendKind {
    #[default]
    #[serde(rename = "kdeconnect")]
    KdeConnect,
    #[serde(rename = "mconnect")]
    MConnect,
}

const KDECONNECT_SETTINGS: &[&str] = &["kdeconnect-settings"];

impl BackendKind {
    /// Well-known bus name owned by the daemon
    pub fn bus_name(&self) -> &'static str {
        match self {
            BackendKind::KdeConnect => kdeconnect::BUS_NAME,
            BackendKind::MConnect => mconnect::BUS_NAME,
        }
    }

    /// Command line that starts the daemon
    pub fn daemon_command(&self) -> &'static [&'static str] {
        match self {
            BackendKind::KdeConnect => &["kdeconnectd"],
            BackendKind::MConnect => &["mconnect", "-d"],
        }
    }

    /// Settings application shipped with the backend, if any
    pub fn settings_command(&self) -> Option<&'static [&'static str]> {
        match self {
            BackendKind::KdeConnect => Some(KDECONNECT_SETTINGS),
            BackendKind::MConnect => None,
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            BackendKind::KdeConnect => "KDE Connect",
            BackendKind::MConnect => "MConnect",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Notification emitted by a bridge service
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeSignal {
    DeviceAdded(DeviceId),
    DeviceRemoved(DeviceId),
    PropertyChanged {
        device_id: DeviceId,
        group: PropertyGroup,
        payload: Option<GroupPayload>,
    },
}

impl BridgeSignal {
    pub fn device_id(&self) -> &str {
        match self {
            BridgeSignal::DeviceAdded(id) | BridgeSignal::DeviceRemoved(id) => id,
            BridgeSignal::PropertyChanged { device_id, .. } => device_id,
        }
    }
}

/// Stream of bridge notifications for one session
pub type SignalStream = BoxStream<'static, BridgeSignal>;

/// IPC capability of one running bridge service
#[async_trait]
pub trait DeviceBridge: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Subscribe to device set and property notifications
    ///
    /// The stream ends when the bus connection is lost.
    async fn subscribe(&self) -> Result<SignalStream>;

    /// Identifiers of all devices known to the service
    async fn list_devices(&self) -> Result<Vec<DeviceId>>;

    /// Read one property group of a device
    async fn read_group(&self, device_id: &str, group: PropertyGroup) -> Result<GroupPayload>;

    /// Ask the service to pair with / trust the device
    async fn request_trust(&self, device_id: &str) -> Result<()>;

    /// Unpair / distrust the device
    async fn revoke_trust(&self, device_id: &str) -> Result<()>;

    /// Make the device ring
    async fn find_device(&self, device_id: &str) -> Result<()>;

    /// Open a message composer for the device, addressed to the hint if the
    /// backend supports it
    async fn send_message(&self, device_id: &str, recipient_hint: &str) -> Result<()>;
}

/// Map a property read failure; undecodable values are malformed payloads
pub(crate) fn read_error(device_id: &str, group: PropertyGroup, error: zbus::Error) -> BridgeError {
    match error {
        zbus::Error::Variant(e) => BridgeError::malformed(device_id, group, e.to_string()),
        other => other.into(),
    }
}

/// Builds a bridge bound to the owner of a freshly appeared service
#[async_trait]
pub trait BridgeConnector: Send + Sync {
    fn kind(&self) -> BackendKind;

    async fn connect(&self, owner: &OwnerHandle) -> Result<Arc<dyn DeviceBridge>>;
}

/// Connector for the zbus backends on a shared connection
#[derive(Clone)]
pub struct ZbusConnector {
    connection: Connection,
    kind: BackendKind,
}

impl ZbusConnector {
    pub fn new(connection: Connection, kind: BackendKind) -> Self {
        Self { connection, kind }
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }
}

#[async_trait]
impl BridgeConnector for ZbusConnector {
    fn kind(&self) -> BackendKind {
        self.kind
    }

    async fn connect(&self, owner: &OwnerHandle) -> Result<Arc<dyn DeviceBridge>> {
        let bridge: Arc<dyn DeviceBridge> = match self.kind {
            BackendKind::KdeConnect => {
                Arc::new(KdeConnectBridge::new(self.connection.clone(), owner.clone()))
            }
            BackendKind::MConnect => {
                Arc::new(MConnectBridge::new(self.connection.clone(), owner.clone()))
            }
        };
        Ok(bridge)
    }
}
