//! Device Bridge Session Watcher
//!
//! Tracks a device bridge service (KDE Connect or MConnect) on the D-Bus
//! session bus, keeps a live set of its devices, and reports device and
//! property changes to presentation code through disposable subscriptions.
//!
//! ## Components
//!
//! - `BusNameWatcher` follows the backend's well-known name
//! - `DeviceSessionManager` owns the device set of one service lifetime
//! - `DeviceProxy` caches one device and runs its commands
//! - `DeviceMonitor` ties them together in one dispatch loop
//!
//! ## Example
//!
//! ```rust,no_run
//! use device_bridge::{BackendKind, BusNameWatcher, DeviceMonitor, Listeners, SessionEvent, ZbusConnector};
//! use std::sync::Arc;
//!
//! # async fn run() -> device_bridge::Result<()> {
//! let connection = zbus::Connection::session().await?;
//! let kind = BackendKind::KdeConnect;
//! let watcher = BusNameWatcher::watch(&connection, kind.bus_name()).await?;
//!
//! let events = Listeners::new();
//! let _subscription = events.subscribe(|event: &SessionEvent| println!("{:?}", event));
//!
//! let connector = Arc::new(ZbusConnector::new(connection, kind));
//! let mut monitor = DeviceMonitor::new(watcher, connector, events);
//! let (_stop, shutdown) = tokio::sync::oneshot::channel();
//! monitor.run(shutdown).await;
//! # Ok(())
//! # }
//! ```

pub mod bridge;
pub mod device;
pub mod indicator;
pub mod monitor;
pub mod proxy;
pub mod session;
pub mod subscription;
pub mod watcher;

mod error;
pub use bridge::{
    BackendKind, BridgeConnector, BridgeSignal, DeviceBridge, SignalStream, ZbusConnector,
};
pub use device::{
    BatteryState, DeviceClass, DeviceId, DeviceRecord, GroupPayload, PluginState,
    PropertyGroup, StatusFlags,
};
pub use error::{BridgeError, Result};
pub use indicator::{BatteryIndicator, BatteryTier, DeviceActions, DeviceStatus, VisibilityFilter};
pub use monitor::DeviceMonitor;
pub use proxy::{DeviceHandle, DeviceProxy};
pub use session::{DeviceSessionManager, ServiceSession, SessionEvent, SessionState};
pub use subscription::{Listeners, Subscription};
pub use watcher::{BusNameWatcher, NameEvent, OwnerHandle};
