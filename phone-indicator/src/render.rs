//! Text Rendering
//!
//! Turns session events into terminal lines. A device line is printed when
//! the device appears and whenever its rendered form changes; hidden devices
//! (per the display filter) are not printed. Without per-device output, any
//! such change prints one combined line for all visible devices instead.

use device_bridge::{
    BatteryIndicator, DeviceActions, DeviceHandle, DeviceId, DeviceRecord, DeviceStatus,
    SessionEvent, VisibilityFilter,
};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError, RwLock};

/// One-line summary of a device
///
/// `Pixel 7 (dev1): smartphone-connected, battery-good 45%, actions: sms find, channel-secure-symbolic`
pub fn describe(record: &DeviceRecord) -> String {
    let name = if record.name.is_empty() {
        record.id.as_str()
    } else {
        record.name.as_str()
    };

    let status = DeviceStatus::for_device(record).icon_name(&record.class);

    let battery = BatteryIndicator::for_device(record);
    let battery = match battery.label() {
        Some(label) => format!("{} {}", battery.icon_name(), label),
        None => battery.icon_name(),
    };

    let actions = DeviceActions::for_device(record);
    let mut available = Vec::new();
    if actions.can_message {
        available.push("sms");
    }
    if actions.can_find {
        available.push("find");
    }
    let available = if available.is_empty() {
        "none".to_string()
    } else {
        available.join(" ")
    };

    format!(
        "{} ({}): {}, {}, actions: {}, {}",
        name,
        record.id,
        status,
        battery,
        available,
        actions.trust_icon_name()
    )
}

struct Entry {
    handle: DeviceHandle,
    last: Option<String>,
}

/// Presentation consumer for session events
pub struct TextIndicator {
    filter: RwLock<VisibilityFilter>,
    per_device: AtomicBool,
    devices: Mutex<BTreeMap<DeviceId, Entry>>,
}

impl TextIndicator {
    pub fn new(filter: VisibilityFilter, per_device: bool) -> Self {
        Self {
            filter: RwLock::new(filter),
            per_device: AtomicBool::new(per_device),
            devices: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn set_per_device(&self, per_device: bool) {
        self.per_device.store(per_device, Ordering::SeqCst);
    }

    /// Replace the display filter and re-render every device
    pub fn set_filter(&self, filter: VisibilityFilter) -> Vec<String> {
        *self.filter.write().unwrap_or_else(PoisonError::into_inner) = filter;
        let ids: Vec<DeviceId> = self
            .devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        let lines = ids.iter().filter_map(|id| self.render(id)).collect();
        self.layout(lines)
    }

    /// Lines to print for an event
    pub fn handle(&self, event: &SessionEvent) -> Vec<String> {
        match event {
            SessionEvent::SessionStarted { owner } => {
                vec![format!("service available ({})", owner)]
            }
            SessionEvent::SessionEnded => {
                self.devices
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .clear();
                vec!["service unavailable".to_string()]
            }
            SessionEvent::DeviceAdded { id, device } => {
                self.devices
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert(
                        id.clone(),
                        Entry {
                            handle: device.clone(),
                            last: None,
                        },
                    );
                self.layout(self.render(id).into_iter().collect())
            }
            SessionEvent::DeviceRemoved(id) => {
                let removed = self
                    .devices
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .remove(id);
                let lines = match removed {
                    Some(Entry { last: Some(_), .. }) => vec![format!("- {}", id)],
                    _ => Vec::new(),
                };
                self.layout(lines)
            }
            SessionEvent::DeviceChanged { id, .. } => {
                self.layout(self.render(id).into_iter().collect())
            }
        }
    }

    /// Per-device lines as they are, or one combined line when anything changed
    fn layout(&self, lines: Vec<String>) -> Vec<String> {
        if lines.is_empty() || self.per_device.load(Ordering::SeqCst) {
            return lines;
        }

        let visible: Vec<String> = self.visible().iter().map(describe).collect();
        if visible.is_empty() {
            vec!["devices: none".to_string()]
        } else {
            vec![format!("devices: {}", visible.join(" | "))]
        }
    }

    /// Currently tracked, visible device records
    pub fn visible(&self) -> Vec<DeviceRecord> {
        let filter = *self.filter.read().unwrap_or_else(PoisonError::into_inner);
        self.devices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter_map(|entry| entry.handle.snapshot().ok())
            .filter(|record| filter.is_visible(record))
            .collect()
    }

    /// New line for the device, if its rendering changed
    fn render(&self, id: &str) -> Option<String> {
        let filter = *self.filter.read().unwrap_or_else(PoisonError::into_inner);
        let mut devices = self.devices.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = devices.get_mut(id)?;
        let record = entry.handle.snapshot().ok()?;

        if !filter.is_visible(&record) {
            return entry.last.take().map(|_| format!("- {}", id));
        }

        let line = describe(&record);
        if entry.last.as_deref() == Some(line.as_str()) {
            return None;
        }
        entry.last = Some(line.clone());
        Some(format!("* {}", line))
    }
}
