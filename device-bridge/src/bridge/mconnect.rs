//! MConnect Bridge
//!
//! Talks to the `mconnect` daemon over the session bus. MConnect identifies
//! devices by object path, so the path string doubles as the device id.
//!
//! MConnect has no find-my-phone or SMS composer interface; those commands
//! fail with `BridgeError::Unsupported`.

use super::{BackendKind, BridgeSignal, DeviceBridge, SignalStream};
use crate::device::{
    BatteryState, DeviceClass, DeviceId, GroupPayload, PropertyGroup, StatusFlags,
};
use crate::{BridgeError, Result};
use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use tracing::{debug, info, warn};
use zbus::proxy::CacheProperties;
use zbus::zvariant::{OwnedObjectPath, OwnedValue};
use zbus::{proxy, Connection, MatchRule, Message, MessageStream};

/// Well-known bus name of mconnect
pub const BUS_NAME: &str = "org.mconnect";

/// Object path of the device manager
pub const MANAGER_PATH: &str = "/org/mconnect/manager";

const ROOT_PATH: &str = "/org/mconnect";
const MANAGER_INTERFACE: &str = "org.mconnect.DeviceManager";
const DEVICE_INTERFACE: &str = "org.mconnect.Device";
const BATTERY_INTERFACE: &str = "org.mconnect.Device.Battery";
const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";
const CAPABILITY_PREFIX: &str = "kdeconnect.";

#[proxy(
    interface = "org.mconnect.DeviceManager",
    default_service = "org.mconnect",
    default_path = "/org/mconnect/manager",
    gen_blocking = false
)]
trait DeviceManager {
    async fn list_devices(&self) -> zbus::Result<Vec<OwnedObjectPath>>;

    async fn allow_device(&self, path: &str) -> zbus::Result<()>;

    async fn disallow_device(&self, path: &str) -> zbus::Result<()>;
}

#[proxy(
    interface = "org.mconnect.Device",
    default_service = "org.mconnect",
    gen_blocking = false
)]
trait RemoteDevice {
    #[zbus(property)]
    fn name(&self) -> zbus::Result<String>;

    #[zbus(property)]
    fn device_type(&self) -> zbus::Result<String>;

    #[zbus(property)]
    fn is_active(&self) -> zbus::Result<bool>;

    #[zbus(property)]
    fn is_paired(&self) -> zbus::Result<bool>;

    #[zbus(property)]
    fn allowed(&self) -> zbus::Result<bool>;

    #[zbus(property)]
    fn incoming_capabilities(&self) -> zbus::Result<Vec<String>>;
}

#[proxy(
    interface = "org.mconnect.Device.Battery",
    default_service = "org.mconnect",
    gen_blocking = false
)]
trait Battery {
    #[zbus(property)]
    fn level(&self) -> zbus::Result<u32>;

    #[zbus(property)]
    fn charging(&self) -> zbus::Result<bool>;
}

/// MConnect implementation of `DeviceBridge`
pub struct MConnectBridge {
    connection: Connection,
    owner: String,
}

impl MConnectBridge {
    pub fn new(connection: Connection, owner: String) -> Self {
        Self { connection, owner }
    }

    async fn manager(&self) -> zbus::Result<DeviceManagerProxy<'static>> {
        DeviceManagerProxy::builder(&self.connection)
            .destination(self.owner.clone())?
            .build()
            .await
    }

    async fn device(&self, device_id: &str) -> zbus::Result<RemoteDeviceProxy<'static>> {
        RemoteDeviceProxy::builder(&self.connection)
            .destination(self.owner.clone())?
            .path(device_id.to_string())?
            .cache_properties(CacheProperties::No)
            .build()
            .await
    }

    async fn read_identity(&self, device_id: &str) -> zbus::Result<GroupPayload> {
        let device = self.device(device_id).await?;
        Ok(GroupPayload::Identity {
            name: device.name().await?,
            class: DeviceClass::from_backend(&device.device_type().await?),
        })
    }

    async fn read_status(&self, device_id: &str) -> zbus::Result<GroupPayload> {
        let device = self.device(device_id).await?;
        let allowed = device.allowed().await?;
        Ok(GroupPayload::Status(StatusFlags {
            active: device.is_active().await?,
            trusted: allowed,
            paired: device.is_paired().await?,
            allowed,
        }))
    }

    async fn read_plugins(&self, device_id: &str) -> zbus::Result<GroupPayload> {
        let device = self.device(device_id).await?;
        let capabilities = device.incoming_capabilities().await?;
        Ok(GroupPayload::Plugins(canonical_capabilities(&capabilities)))
    }

    async fn read_battery(&self, device_id: &str) -> Result<GroupPayload> {
        let battery = BatteryProxy::builder(&self.connection)
            .destination(self.owner.clone())?
            .path(device_id.to_string())?
            .cache_properties(CacheProperties::No)
            .build()
            .await?;
        let level = battery
            .level()
            .await
            .map_err(|e| super::read_error(device_id, PropertyGroup::Battery, e))?;
        let charging = battery
            .charging()
            .await
            .map_err(|e| super::read_error(device_id, PropertyGroup::Battery, e))?;

        BatteryState::from_raw(level.into(), charging)
            .map(GroupPayload::Battery)
            .ok_or_else(|| {
                BridgeError::malformed(
                    device_id,
                    PropertyGroup::Battery,
                    format!("level {} out of range", level),
                )
            })
    }
}

#[async_trait]
impl DeviceBridge for MConnectBridge {
    fn kind(&self) -> BackendKind {
        BackendKind::MConnect
    }

    async fn subscribe(&self) -> Result<SignalStream> {
        let rule = MatchRule::builder()
            .msg_type(zbus::message::Type::Signal)
            .sender(self.owner.as_str())?
            .path_namespace(ROOT_PATH)?
            .build();

        let messages = MessageStream::for_match_rule(rule, &self.connection, None).await?;
        info!("Subscribed to MConnect signals from {}", self.owner);

        let signals = messages
            .filter_map(|message| async move {
                match message {
                    Ok(message) => Some(message),
                    Err(e) => {
                        warn!("MConnect signal stream error: {}", e);
                        None
                    }
                }
            })
            .flat_map(|message| stream::iter(classify_message(&message)));

        Ok(signals.boxed())
    }

    async fn list_devices(&self) -> Result<Vec<DeviceId>> {
        let devices = self.manager().await?.list_devices().await?;
        debug!("MConnect lists {} devices", devices.len());
        Ok(devices.into_iter().map(|path| path.to_string()).collect())
    }

    async fn read_group(&self, device_id: &str, group: PropertyGroup) -> Result<GroupPayload> {
        match group {
            PropertyGroup::Identity => self
                .read_identity(device_id)
                .await
                .map_err(|e| super::read_error(device_id, group, e)),
            PropertyGroup::Status => self
                .read_status(device_id)
                .await
                .map_err(|e| super::read_error(device_id, group, e)),
            PropertyGroup::Plugins => self
                .read_plugins(device_id)
                .await
                .map_err(|e| super::read_error(device_id, group, e)),
            PropertyGroup::Battery => self.read_battery(device_id).await,
        }
    }

    async fn request_trust(&self, device_id: &str) -> Result<()> {
        let manager = self
            .manager()
            .await
            .map_err(|e| BridgeError::command_failed("request_trust", device_id, e))?;
        manager
            .allow_device(device_id)
            .await
            .map_err(|e| BridgeError::command_failed("request_trust", device_id, e))
    }

    async fn revoke_trust(&self, device_id: &str) -> Result<()> {
        let manager = self
            .manager()
            .await
            .map_err(|e| BridgeError::command_failed("revoke_trust", device_id, e))?;
        manager
            .disallow_device(device_id)
            .await
            .map_err(|e| BridgeError::command_failed("revoke_trust", device_id, e))
    }

    async fn find_device(&self, _device_id: &str) -> Result<()> {
        Err(BridgeError::Unsupported {
            backend: BackendKind::MConnect.display_name(),
            command: "find_device",
        })
    }

    async fn send_message(&self, _device_id: &str, _recipient_hint: &str) -> Result<()> {
        Err(BridgeError::Unsupported {
            backend: BackendKind::MConnect.display_name(),
            command: "send_message",
        })
    }
}

/// `kdeconnect.battery.request` → `battery`
fn canonical_capabilities(capabilities: &[String]) -> Vec<String> {
    let mut names: Vec<String> = capabilities
        .iter()
        .filter_map(|capability| {
            let name = capability
                .strip_prefix(CAPABILITY_PREFIX)
                .unwrap_or(capability)
                .split('.')
                .next()?;
            (!name.is_empty()).then(|| name.to_string())
        })
        .collect();
    names.sort();
    names.dedup();
    names
}

fn is_device_path(path: &str) -> bool {
    path.strip_prefix(ROOT_PATH)
        .is_some_and(|rest| rest.len() > 1 && rest.starts_with('/'))
        && path != MANAGER_PATH
}

/// Groups affected by a `PropertiesChanged` on the given interface
fn changed_property_groups(interface: &str, properties: &[&str]) -> Vec<PropertyGroup> {
    let mut groups = Vec::new();
    for property in properties {
        let group = match (interface, *property) {
            (DEVICE_INTERFACE, "Name" | "DeviceType") => PropertyGroup::Identity,
            (DEVICE_INTERFACE, "IsActive" | "IsPaired" | "Allowed") => PropertyGroup::Status,
            (DEVICE_INTERFACE, "IncomingCapabilities" | "OutgoingCapabilities") => {
                PropertyGroup::Plugins
            }
            (BATTERY_INTERFACE, "Level" | "Charging") => PropertyGroup::Battery,
            _ => continue,
        };
        if !groups.contains(&group) {
            groups.push(group);
        }
    }
    groups
}

/// Battery reading carried by a `PropertiesChanged`, when it holds both fields
fn battery_from_changed(changed: &HashMap<String, OwnedValue>) -> Option<BatteryState> {
    let level = changed.get("Level")?.downcast_ref::<u32>().ok()?;
    let charging = changed.get("Charging")?.downcast_ref::<bool>().ok()?;
    BatteryState::from_raw(level.into(), charging)
}

fn manager_signal_device(message: &Message) -> Option<DeviceId> {
    let body = message.body();
    if let Ok(path) = body.deserialize::<String>() {
        return Some(path);
    }
    body.deserialize::<OwnedObjectPath>()
        .ok()
        .map(|path| path.to_string())
}

fn classify_message(message: &Message) -> Vec<BridgeSignal> {
    let header = message.header();
    let (Some(path), Some(interface), Some(member)) =
        (header.path(), header.interface(), header.member())
    else {
        return Vec::new();
    };
    let (path, interface, member) = (path.as_str(), interface.as_str(), member.as_str());

    if path == MANAGER_PATH && interface == MANAGER_INTERFACE {
        let Some(device_id) = manager_signal_device(message) else {
            warn!("Malformed {} signal from MConnect", member);
            return Vec::new();
        };
        return match member {
            "DeviceAdded" => vec![BridgeSignal::DeviceAdded(device_id)],
            "DeviceRemoved" => vec![BridgeSignal::DeviceRemoved(device_id)],
            _ => Vec::new(),
        };
    }

    if !is_device_path(path) || interface != PROPERTIES_INTERFACE || member != "PropertiesChanged"
    {
        return Vec::new();
    }

    let (changed_interface, changed, invalidated) = match message
        .body()
        .deserialize::<(String, HashMap<String, OwnedValue>, Vec<String>)>()
    {
        Ok(body) => body,
        Err(e) => {
            warn!("Malformed PropertiesChanged from {}: {}", path, e);
            return Vec::new();
        }
    };

    let names: Vec<&str> = changed
        .keys()
        .map(String::as_str)
        .chain(invalidated.iter().map(String::as_str))
        .collect();

    changed_property_groups(&changed_interface, &names)
        .into_iter()
        .map(|group| {
            let payload = match group {
                PropertyGroup::Battery => battery_from_changed(&changed).map(GroupPayload::Battery),
                _ => None,
            };
            BridgeSignal::PropertyChanged {
                device_id: path.to_string(),
                group,
                payload,
            }
        })
        .collect()
}
