//! Presentation Derivations
//!
//! Pure functions from cached device state to what an indicator shows.
//! The thresholds are the ones upower uses for its battery icons.

use crate::device::{plugins, DeviceClass, DeviceRecord};
use serde::{Deserialize, Serialize};

/// Battery charge tier
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatteryTier {
    Empty,
    Caution,
    Low,
    Good,
    Full,
}

impl BatteryTier {
    pub fn for_level(level: u8) -> Self {
        match level {
            0..=2 => BatteryTier::Empty,
            3..=9 => BatteryTier::Caution,
            10..=29 => BatteryTier::Low,
            30..=59 => BatteryTier::Good,
            _ => BatteryTier::Full,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            BatteryTier::Empty => "empty",
            BatteryTier::Caution => "caution",
            BatteryTier::Low => "low",
            BatteryTier::Good => "good",
            BatteryTier::Full => "full",
        }
    }
}

/// What the battery part of a device entry shows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatteryIndicator {
    /// Battery plugin absent, no reading yet, or device untrusted
    Unknown,
    Known {
        tier: BatteryTier,
        level: u8,
        charging: bool,
    },
}

impl BatteryIndicator {
    pub fn derive(level: u8, charging: bool, plugin_present: bool, trusted: bool) -> Self {
        if !plugin_present || !trusted {
            return BatteryIndicator::Unknown;
        }

        BatteryIndicator::Known {
            tier: BatteryTier::for_level(level),
            level,
            charging,
        }
    }

    pub fn for_device(record: &DeviceRecord) -> Self {
        match record.battery() {
            Some(reading) => Self::derive(
                reading.level,
                reading.charging,
                record.has_plugin(plugins::BATTERY),
                record.trusted,
            ),
            None => BatteryIndicator::Unknown,
        }
    }

    /// Icon name such as `battery-good` or `battery-full-charging`
    pub fn icon_name(&self) -> String {
        match self {
            BatteryIndicator::Unknown => "battery-missing".to_string(),
            BatteryIndicator::Known {
                tier, charging: true, ..
            } => format!("battery-{}-charging", tier.as_str()),
            BatteryIndicator::Known { tier, .. } => format!("battery-{}", tier.as_str()),
        }
    }

    pub fn symbolic_icon_name(&self) -> String {
        format!("{}-symbolic", self.icon_name())
    }

    /// Percentage label, absent for the unknown state
    pub fn label(&self) -> Option<String> {
        match self {
            BatteryIndicator::Unknown => None,
            BatteryIndicator::Known { level, .. } => Some(format!("{}%", level)),
        }
    }
}

/// Connection and trust status of a device, one case per combination the
/// presentation layer may want to tell apart
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceStatus {
    ConnectedTrusted,
    ConnectedUntrusted,
    TrustedDisconnected,
    PairedUntrusted,
    Disconnected,
}

impl DeviceStatus {
    /// Precedence: active, then trusted, then paired
    pub fn derive(active: bool, trusted: bool, paired: bool) -> Self {
        match (active, trusted, paired) {
            (true, true, _) => DeviceStatus::ConnectedTrusted,
            (true, false, _) => DeviceStatus::ConnectedUntrusted,
            (false, true, _) => DeviceStatus::TrustedDisconnected,
            (false, false, true) => DeviceStatus::PairedUntrusted,
            (false, false, false) => DeviceStatus::Disconnected,
        }
    }

    pub fn for_device(record: &DeviceRecord) -> Self {
        Self::derive(record.active, record.trusted, record.paired)
    }

    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            DeviceStatus::ConnectedTrusted | DeviceStatus::ConnectedUntrusted
        )
    }

    /// Default icon suffix; a paired but untrusted device looks disconnected
    pub fn icon_suffix(&self) -> &'static str {
        match self {
            DeviceStatus::ConnectedTrusted | DeviceStatus::ConnectedUntrusted => "connected",
            DeviceStatus::TrustedDisconnected => "trusted",
            DeviceStatus::PairedUntrusted | DeviceStatus::Disconnected => "disconnected",
        }
    }

    /// Icon name such as `smartphone-connected`
    pub fn icon_name(&self, class: &DeviceClass) -> String {
        format!("{}-{}", class.icon_label(), self.icon_suffix())
    }
}

/// Which device actions are available
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceActions {
    pub can_message: bool,
    pub can_find: bool,
    pub trusted: bool,
}

impl DeviceActions {
    pub fn for_device(record: &DeviceRecord) -> Self {
        Self {
            can_message: record.has_plugin(plugins::TELEPHONY),
            can_find: record.has_plugin(plugins::FIND_MY_PHONE),
            trusted: record.trusted,
        }
    }

    pub fn trust_icon_name(&self) -> &'static str {
        if self.trusted {
            "channel-secure-symbolic"
        } else {
            "channel-insecure-symbolic"
        }
    }
}

/// User preferences controlling which devices are listed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisibilityFilter {
    #[serde(default = "default_true")]
    pub show_unpaired: bool,
    #[serde(default = "default_true")]
    pub show_unallowed: bool,
    #[serde(default = "default_true")]
    pub show_inactive: bool,
}

fn default_true() -> bool {
    true
}

impl Default for VisibilityFilter {
    fn default() -> Self {
        Self {
            show_unpaired: true,
            show_unallowed: true,
            show_inactive: true,
        }
    }
}

impl VisibilityFilter {
    pub fn is_visible(&self, record: &DeviceRecord) -> bool {
        (self.show_unpaired || record.paired)
            && (self.show_unallowed || record.allowed)
            && (self.show_inactive || record.active)
    }
}
