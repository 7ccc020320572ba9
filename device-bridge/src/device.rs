//! Device Records and Property Groups
//!
//! A `DeviceRecord` is the cached view of one remote device. It is never
//! replaced wholesale: each update carries one `GroupPayload` and only the
//! fields of that group change, so references held by the presentation layer
//! stay valid across updates.
//!
//! ## Property Groups
//!
//! | Group      | Fields                                  |
//! |------------|-----------------------------------------|
//! | `identity` | name, device class                      |
//! | `status`   | active, trusted, paired, allowed        |
//! | `plugins`  | capability set (plugin name → state)    |
//! | `battery`  | level (0-100), charging                 |
//!
//! Capability membership alone gates what a device can do: a missing
//! `telephony` key means messaging is unsupported, not unknown.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Canonical plugin names used as capability keys
pub mod plugins {
    /// Battery reporting
    pub const BATTERY: &str = "battery";
    /// SMS and call state
    pub const TELEPHONY: &str = "telephony";
    /// Ring the remote device
    pub const FIND_MY_PHONE: &str = "findmyphone";
}

/// Opaque, stable device identifier as reported by the backend
pub type DeviceId = String;

/// Device class as reported by the backend
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    Phone,
    Tablet,
    Desktop,
    #[default]
    Unknown,
}

impl DeviceClass {
    /// Parse a backend device type string
    ///
    /// KDE Connect reports `smartphone`/`phone`, MConnect reports `phone`;
    /// laptops are grouped with desktops.
    pub fn from_backend(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "phone" | "smartphone" => DeviceClass::Phone,
            "tablet" => DeviceClass::Tablet,
            "desktop" | "laptop" => DeviceClass::Desktop,
            _ => DeviceClass::Unknown,
        }
    }

    /// Raw class name
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceClass::Phone => "phone",
            DeviceClass::Tablet => "tablet",
            DeviceClass::Desktop => "desktop",
            DeviceClass::Unknown => "unknown",
        }
    }

    /// Label used to build status icon names; `phone` becomes `smartphone`
    pub fn icon_label(&self) -> &'static str {
        match self {
            DeviceClass::Phone => "smartphone",
            other => other.as_str(),
        }
    }
}

/// Named bundle of device attributes that is updated atomically
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropertyGroup {
    Identity,
    Status,
    Plugins,
    Battery,
}

impl PropertyGroup {
    /// All groups, in the order they are loaded for a new device
    pub const ALL: [PropertyGroup; 4] = [
        PropertyGroup::Identity,
        PropertyGroup::Status,
        PropertyGroup::Plugins,
        PropertyGroup::Battery,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PropertyGroup::Identity => "identity",
            PropertyGroup::Status => "status",
            PropertyGroup::Plugins => "plugins",
            PropertyGroup::Battery => "battery",
        }
    }

    pub(crate) fn index(&self) -> usize {
        match self {
            PropertyGroup::Identity => 0,
            PropertyGroup::Status => 1,
            PropertyGroup::Plugins => 2,
            PropertyGroup::Battery => 3,
        }
    }
}

impl fmt::Display for PropertyGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Battery reading from the battery plugin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatteryState {
    /// Charge percentage (0-100)
    pub level: u8,
    /// Whether the device is charging
    pub charging: bool,
}

impl BatteryState {
    /// Validate a raw backend reading
    ///
    /// Backends report `-1` when no battery data is available; anything
    /// outside `0..=100` is rejected.
    pub fn from_raw(level: i64, charging: bool) -> Option<Self> {
        u8::try_from(level)
            .ok()
            .filter(|level| *level <= 100)
            .map(|level| Self { level, charging })
    }
}

/// Plugin-specific state stored in the capability set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PluginState {
    /// Plugin whose presence is all that matters
    Present,
    /// Battery plugin with its latest reading, if one arrived yet
    Battery { reading: Option<BatteryState> },
}

/// Connectivity and trust flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StatusFlags {
    /// Device is connected and reachable
    pub active: bool,
    /// Device is trusted (paired and verified)
    pub trusted: bool,
    /// Device completed pairing
    pub paired: bool,
    /// Device is allowed to connect
    pub allowed: bool,
}

/// Structured payload for a single property group
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupPayload {
    Identity { name: String, class: DeviceClass },
    Status(StatusFlags),
    /// Canonical plugin names currently supported by the device
    Plugins(Vec<String>),
    Battery(BatteryState),
}

impl GroupPayload {
    pub fn group(&self) -> PropertyGroup {
        match self {
            GroupPayload::Identity { .. } => PropertyGroup::Identity,
            GroupPayload::Status(_) => PropertyGroup::Status,
            GroupPayload::Plugins(_) => PropertyGroup::Plugins,
            GroupPayload::Battery(_) => PropertyGroup::Battery,
        }
    }
}

/// Cached state of one device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub id: DeviceId,
    pub name: String,
    pub class: DeviceClass,
    pub active: bool,
    pub trusted: bool,
    pub paired: bool,
    pub allowed: bool,
    pub capabilities: BTreeMap<String, PluginState>,
}

impl DeviceRecord {
    /// Empty record for a freshly announced device
    pub fn new(id: impl Into<DeviceId>) -> Self {
        Self {
            id: id.into(),
            name: String::new(),
            class: DeviceClass::Unknown,
            active: false,
            trusted: false,
            paired: false,
            allowed: false,
            capabilities: BTreeMap::new(),
        }
    }

    pub fn has_plugin(&self, name: &str) -> bool {
        self.capabilities.contains_key(name)
    }

    /// Latest battery reading, if the battery plugin is present and reported
    pub fn battery(&self) -> Option<BatteryState> {
        match self.capabilities.get(plugins::BATTERY) {
            Some(PluginState::Battery { reading }) => *reading,
            _ => None,
        }
    }

    pub fn status(&self) -> StatusFlags {
        StatusFlags {
            active: self.active,
            trusted: self.trusted,
            paired: self.paired,
            allowed: self.allowed,
        }
    }

    /// Apply a group payload in place
    ///
    /// Returns `false` when the payload was not applicable, which only
    /// happens for a battery reading while the battery plugin is absent.
    pub fn apply(&mut self, payload: GroupPayload) -> bool {
        match payload {
            GroupPayload::Identity { name, class } => {
                self.name = name;
                self.class = class;
            }
            GroupPayload::Status(flags) => {
                self.active = flags.active;
                self.trusted = flags.trusted;
                self.paired = flags.paired;
                self.allowed = flags.allowed;
            }
            GroupPayload::Plugins(names) => {
                let mut capabilities = BTreeMap::new();
                for name in names {
                    let state = match self.capabilities.remove(&name) {
                        Some(existing) => existing,
                        None if name == plugins::BATTERY => PluginState::Battery { reading: None },
                        None => PluginState::Present,
                    };
                    capabilities.insert(name, state);
                }
                self.capabilities = capabilities;
            }
            GroupPayload::Battery(state) => match self.capabilities.get_mut(plugins::BATTERY) {
                Some(PluginState::Battery { reading }) => *reading = Some(state),
                _ => return false,
            },
        }
        true
    }
}
