//! KDE Connect Bridge
//!
//! Talks to `kdeconnectd` over the session bus.
//!
//! ## Object Layout
//!
//! - `/modules/kdeconnect` - `org.kde.kdeconnect.daemon` (device list,
//!   `deviceAdded` / `deviceRemoved`)
//! - `/modules/kdeconnect/devices/<id>` - `org.kde.kdeconnect.device`
//! - `/modules/kdeconnect/devices/<id>/battery` - battery plugin
//! - `/modules/kdeconnect/devices/<id>/findmyphone` - find-my-phone plugin
//! - `/modules/kdeconnect/devices/<id>/sms` - SMS plugin
//!
//! Device ids are the bare KDE Connect ids; plugin names such as
//! `kdeconnect_battery` are reported without their `kdeconnect_` prefix.

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
use zbus::zvariant::OwnedValue;
use zbus::{proxy, Connection, MatchRule, Message, MessageStream};

/// Well-known bus name of kdeconnectd
pub const BUS_NAME: &str = "org.kde.kdeconnect";

/// Object path of the daemon interface
pub const DAEMON_PATH: &str = "/modules/kdeconnect";

const DEVICES_PREFIX: &str = "/modules/kdeconnect/devices/";
const DAEMON_INTERFACE: &str = "org.kde.kdeconnect.daemon";
const DEVICE_INTERFACE: &str = "org.kde.kdeconnect.device";
const BATTERY_INTERFACE: &str = "org.kde.kdeconnect.device.battery";
const PROPERTIES_INTERFACE: &str = "org.freedesktop.DBus.Properties";
const PLUGIN_PREFIX: &str = "kdeconnect_";

#[proxy(
    interface = "org.kde.kdeconnect.daemon",
    default_service = "org.kde.kdeconnect",
    default_path = "/modules/kdeconnect",
    gen_blocking = false
)]
trait Daemon {
    /// List device ids
    #[zbus(name = "devices")]
    async fn devices(&self, only_reachable: bool, only_paired: bool) -> zbus::Result<Vec<String>>;
}

#[proxy(
    interface = "org.kde.kdeconnect.device",
    default_service = "org.kde.kdeconnect",
    gen_blocking = false
)]
trait RemoteDevice {
    #[zbus(property, name = "name")]
    fn name(&self) -> zbus::Result<String>;

    #[zbus(property, name = "type")]
    fn device_type(&self) -> zbus::Result<String>;

    #[zbus(property, name = "isReachable")]
    fn is_reachable(&self) -> zbus::Result<bool>;

    #[zbus(property, name = "isTrusted")]
    fn is_trusted(&self) -> zbus::Result<bool>;

    #[zbus(property, name = "supportedPlugins")]
    fn supported_plugins(&self) -> zbus::Result<Vec<String>>;

    #[zbus(name = "requestPairing")]
    async fn request_pairing(&self) -> zbus::Result<()>;

    #[zbus(name = "unpair")]
    async fn unpair(&self) -> zbus::Result<()>;
}

#[proxy(
    interface = "org.kde.kdeconnect.device.battery",
    default_service = "org.kde.kdeconnect",
    gen_blocking = false
)]
trait Battery {
    #[zbus(property, name = "charge")]
    fn charge(&self) -> zbus::Result<i32>;

    #[zbus(property, name = "isCharging")]
    fn is_charging(&self) -> zbus::Result<bool>;
}

#[proxy(
    interface = "org.kde.kdeconnect.device.findmyphone",
    default_service = "org.kde.kdeconnect",
    gen_blocking = false
)]
trait FindMyPhone {
    #[zbus(name = "ring")]
    async fn ring(&self) -> zbus::Result<()>;
}

#[proxy(
    interface = "org.kde.kdeconnect.device.sms",
    default_service = "org.kde.kdeconnect",
    gen_blocking = false
)]
trait Sms {
    #[zbus(name = "launchApp")]
    async fn launch_app(&self) -> zbus::Result<()>;
}

/// KDE Connect implementation of `DeviceBridge`
pub struct KdeConnectBridge {
    connection: Connection,
    owner: String,
}

impl KdeConnectBridge {
    pub fn new(connection: Connection, owner: String) -> Self {
        Self { connection, owner }
    }

    fn device_path(device_id: &str, plugin: Option<&str>) -> String {
        match plugin {
            Some(plugin) => format!("{}{}/{}", DEVICES_PREFIX, device_id, plugin),
            None => format!("{}{}", DEVICES_PREFIX, device_id),
        }
    }

    async fn device(&self, device_id: &str) -> zbus::Result<RemoteDeviceProxy<'static>> {
        RemoteDeviceProxy::builder(&self.connection)
            .destination(self.owner.clone())?
            .path(Self::device_path(device_id, None))?
            .cache_properties(CacheProperties::No)
            .build()
            .await
    }

    async fn battery(&self, device_id: &str) -> zbus::Result<BatteryProxy<'static>> {
        BatteryProxy::builder(&self.connection)
            .destination(self.owner.clone())?
            .path(Self::device_path(device_id, Some("battery")))?
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
        let trusted = device.is_trusted().await?;
        Ok(GroupPayload::Status(StatusFlags {
            active: device.is_reachable().await?,
            trusted,
            // KDE Connect has no separate pairing or allow-list state
            paired: trusted,
            allowed: true,
        }))
    }

    async fn read_plugins(&self, device_id: &str) -> zbus::Result<GroupPayload> {
        let device = self.device(device_id).await?;
        let plugins = device.supported_plugins().await?;
        Ok(GroupPayload::Plugins(canonical_plugins(&plugins)))
    }

    async fn read_battery(&self, device_id: &str) -> Result<GroupPayload> {
        let battery = self.battery(device_id).await?;
        let charge = battery
            .charge()
            .await
            .map_err(|e| super::read_error(device_id, PropertyGroup::Battery, e))?;
        let charging = battery
            .is_charging()
            .await
            .map_err(|e| super::read_error(device_id, PropertyGroup::Battery, e))?;

        BatteryState::from_raw(charge.into(), charging)
            .map(GroupPayload::Battery)
            .ok_or_else(|| {
                BridgeError::malformed(
                    device_id,
                    PropertyGroup::Battery,
                    format!("charge {} out of range", charge),
                )
            })
    }
}

#[async_trait]
impl DeviceBridge for KdeConnectBridge {
    fn kind(&self) -> BackendKind {
        BackendKind::KdeConnect
    }

    async fn subscribe(&self) -> Result<SignalStream> {
        let rule = MatchRule::builder()
            .msg_type(zbus::message::Type::Signal)
            .sender(self.owner.as_str())?
            .path_namespace(DAEMON_PATH)?
            .build();

        let messages = MessageStream::for_match_rule(rule, &self.connection, None).await?;
        info!("Subscribed to KDE Connect signals from {}", self.owner);

        let signals = messages
            .filter_map(|message| async move {
                match message {
                    Ok(message) => Some(message),
                    Err(e) => {
                        warn!("KDE Connect signal stream error: {}", e);
                        None
                    }
                }
            })
            .flat_map(|message| stream::iter(classify_message(&message)));

        Ok(signals.boxed())
    }

    async fn list_devices(&self) -> Result<Vec<DeviceId>> {
        let daemon = DaemonProxy::builder(&self.connection)
            .destination(self.owner.clone())?
            .build()
            .await?;
        let devices = daemon.devices(false, false).await?;
        debug!("KDE Connect lists {} devices", devices.len());
        Ok(devices)
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
        let device = self
            .device(device_id)
            .await
            .map_err(|e| BridgeError::command_failed("request_trust", device_id, e))?;
        device
            .request_pairing()
            .await
            .map_err(|e| BridgeError::command_failed("request_trust", device_id, e))
    }

    async fn revoke_trust(&self, device_id: &str) -> Result<()> {
        let device = self
            .device(device_id)
            .await
            .map_err(|e| BridgeError::command_failed("revoke_trust", device_id, e))?;
        device
            .unpair()
            .await
            .map_err(|e| BridgeError::command_failed("revoke_trust", device_id, e))
    }

    async fn find_device(&self, device_id: &str) -> Result<()> {
        let plugin = FindMyPhoneProxy::builder(&self.connection)
            .destination(self.owner.clone())
            .and_then(|b| b.path(Self::device_path(device_id, Some("findmyphone"))))
            .map_err(|e| BridgeError::command_failed("find_device", device_id, e))?
            .build()
            .await
            .map_err(|e| BridgeError::command_failed("find_device", device_id, e))?;
        plugin
            .ring()
            .await
            .map_err(|e| BridgeError::command_failed("find_device", device_id, e))
    }

    async fn send_message(&self, device_id: &str, recipient_hint: &str) -> Result<()> {
        // The KDE Connect composer picks the recipient itself
        debug!(
            "Opening KDE Connect SMS composer for {} (hint: {:?})",
            device_id, recipient_hint
        );
        let plugin = SmsProxy::builder(&self.connection)
            .destination(self.owner.clone())
            .and_then(|b| b.path(Self::device_path(device_id, Some("sms"))))
            .map_err(|e| BridgeError::command_failed("send_message", device_id, e))?
            .build()
            .await
            .map_err(|e| BridgeError::command_failed("send_message", device_id, e))?;
        plugin
            .launch_app()
            .await
            .map_err(|e| BridgeError::command_failed("send_message", device_id, e))
    }
}

/// Strip the `kdeconnect_` prefix from plugin ids
fn canonical_plugins(plugins: &[String]) -> Vec<String> {
    let mut names: Vec<String> = plugins
        .iter()
        .map(|plugin| plugin.strip_prefix(PLUGIN_PREFIX).unwrap_or(plugin).to_string())
        .collect();
    names.sort();
    names.dedup();
    names
}

/// Split `/modules/kdeconnect/devices/<id>[/<plugin>]`
fn split_device_path(path: &str) -> Option<(&str, Option<&str>)> {
    let rest = path.strip_prefix(DEVICES_PREFIX)?;
    let mut parts = rest.splitn(2, '/');
    let id = parts.next().filter(|id| !id.is_empty())?;
    Some((id, parts.next()))
}

/// Groups affected by a device-level custom signal
fn device_signal_group(interface: &str, member: &str) -> Option<PropertyGroup> {
    match (interface, member) {
        (DEVICE_INTERFACE, "nameChanged" | "typeChanged") => Some(PropertyGroup::Identity),
        (DEVICE_INTERFACE, "reachableChanged" | "trustedChanged" | "pairStateChanged") => {
            Some(PropertyGroup::Status)
        }
        (DEVICE_INTERFACE, "pluginsChanged") => Some(PropertyGroup::Plugins),
        (BATTERY_INTERFACE, "refreshed" | "stateChanged" | "chargeChanged") => {
            Some(PropertyGroup::Battery)
        }
        _ => None,
    }
}

/// Groups affected by a `PropertiesChanged` on the given interface
fn changed_property_groups(interface: &str, properties: &[&str]) -> Vec<PropertyGroup> {
    let mut groups = Vec::new();
    for property in properties {
        let group = match (interface, *property) {
            (DEVICE_INTERFACE, "name" | "type") => PropertyGroup::Identity,
            (DEVICE_INTERFACE, "isReachable" | "isTrusted") => PropertyGroup::Status,
            (DEVICE_INTERFACE, "supportedPlugins") => PropertyGroup::Plugins,
            (BATTERY_INTERFACE, _) => PropertyGroup::Battery,
            _ => continue,
        };
        if !groups.contains(&group) {
            groups.push(group);
        }
    }
    groups
}

fn classify_message(message: &Message) -> Vec<BridgeSignal> {
    let header = message.header();
    let (Some(path), Some(interface), Some(member)) =
        (header.path(), header.interface(), header.member())
    else {
        return Vec::new();
    };
    let (path, interface, member) = (path.as_str(), interface.as_str(), member.as_str());

    if path == DAEMON_PATH && interface == DAEMON_INTERFACE {
        let device_id = match message.body().deserialize::<String>() {
            Ok(id) => id,
            Err(e) => {
                warn!("Malformed {} signal: {}", member, e);
                return Vec::new();
            }
        };
        return match member {
            "deviceAdded" => vec![BridgeSignal::DeviceAdded(device_id)],
            "deviceRemoved" => vec![BridgeSignal::DeviceRemoved(device_id)],
            _ => Vec::new(),
        };
    }

    let Some((device_id, _plugin)) = split_device_path(path) else {
        return Vec::new();
    };

    if interface == PROPERTIES_INTERFACE && member == "PropertiesChanged" {
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
        return changed_property_groups(&changed_interface, &names)
            .into_iter()
            .map(|group| BridgeSignal::PropertyChanged {
                device_id: device_id.to_string(),
                group,
                payload: None,
            })
            .collect();
    }

    let Some(group) = device_signal_group(interface, member) else {
        return Vec::new();
    };

    // `refreshed(isCharging, charge)` carries the new reading
    let payload = if interface == BATTERY_INTERFACE && member == "refreshed" {
        message
            .body()
            .deserialize::<(bool, i32)>()
            .ok()
            .and_then(|(charging, charge)| BatteryState::from_raw(charge.into(), charging))
            .map(GroupPayload::Battery)
    } else {
        None
    };

    vec![BridgeSignal::PropertyChanged {
        device_id: device_id.to_string(),
        group,
        payload,
    }]
}
