//! Error handling for the device bridge
//!
//! Every failure in this crate degrades to either "session not ready" or
//! "last known state"; nothing here is fatal to the hosting process.
//!
//! ## Error Categories
//!
//! - `TransportAbsent`: the bus or the backend service is unreachable. The
//!   monitor surfaces this as `SessionEnded` and waits for the service to
//!   appear again.
//! - `CommandFailed` / `Unsupported`: a trust, find or message call failed.
//!   Reported to the caller that issued it and never touches session state.
//! - `MalformedPayload`: a property read or signal carried unusable values.
//!   The affected group keeps its cached value and the failure is logged.
//! - `ProtocolViolation`: an add/remove/change notification that does not
//!   match the known device set. Logged and ignored.
//!
//! ## Example
//!
//! ```rust
//! use device_bridge::BridgeError;
//!
//! let error = BridgeError::DeviceGone("dev1".to_string());
//! assert_eq!(error.to_string(), "Device no longer tracked: dev1");
//! assert!(!error.is_recoverable());
//! ```

use crate::device::PropertyGroup;
use thiserror::Error;

/// Result type for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

/// Errors that can occur while talking to a device bridge service
#[derive(Error, Debug)]
pub enum BridgeError {
    /// Bus connection or backend service is unavailable
    #[error("Bridge service unavailable: {0}")]
    TransportAbsent(String),

    /// A device command returned an error or timed out
    #[error("Command {command} failed for {device_id}: {reason}")]
    CommandFailed {
        /// Command name (e.g. "find_device")
        command: &'static str,
        /// Target device
        device_id: String,
        /// Backend-provided reason
        reason: String,
    },

    /// The active backend offers no way to perform the command
    #[error("{backend} does not support {command}")]
    Unsupported {
        /// Backend display name
        backend: &'static str,
        /// Command name
        command: &'static str,
    },

    /// A property group payload was missing fields or held invalid values
    #[error("Malformed {group} payload for {device_id}: {reason}")]
    MalformedPayload {
        /// Device the payload belongs to
        device_id: String,
        /// Group that could not be decoded
        group: PropertyGroup,
        /// What was wrong with it
        reason: String,
    },

    /// Notification inconsistent with the tracked device set
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// The device proxy behind a handle has been released
    #[error("Device no longer tracked: {0}")]
    DeviceGone(String),

    /// The operation requires an active session
    #[error("Session is not active")]
    SessionNotActive,

    /// Low level D-Bus error
    #[error("DBus error: {0}")]
    DBus(#[from] zbus::Error),

    /// Error reported by a standard D-Bus interface
    #[error("DBus error: {0}")]
    Fdo(#[from] zbus::fdo::Error),
}

impl BridgeError {
    /// Build a `CommandFailed` from any displayable error
    pub fn command_failed(
        command: &'static str,
        device_id: &str,
        reason: impl std::fmt::Display,
    ) -> Self {
        Self::CommandFailed {
            command,
            device_id: device_id.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Build a `MalformedPayload` for a device group
    pub fn malformed(device_id: &str, group: PropertyGroup, reason: impl Into<String>) -> Self {
        Self::MalformedPayload {
            device_id: device_id.to_string(),
            group,
            reason: reason.into(),
        }
    }

    /// Whether waiting (for the service to reappear, or for the next update)
    /// can resolve the error without user action
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            BridgeError::TransportAbsent(_)
                | BridgeError::MalformedPayload { .. }
                | BridgeError::ProtocolViolation(_)
                | BridgeError::SessionNotActive
                | BridgeError::DBus(_)
                | BridgeError::Fdo(_)
        )
    }

    /// Whether the error means the bus or backend is gone
    pub fn is_transport(&self) -> bool {
        match self {
            BridgeError::TransportAbsent(_) => true,
            BridgeError::DBus(zbus::Error::InputOutput(_)) => true,
            BridgeError::DBus(zbus::Error::FDO(e)) => fdo_is_transport(e),
            BridgeError::Fdo(e) => fdo_is_transport(e),
            _ => false,
        }
    }
}

fn fdo_is_transport(error: &zbus::fdo::Error) -> bool {
    matches!(
        error,
        zbus::fdo::Error::ServiceUnknown(_)
            | zbus::fdo::Error::NameHasNoOwner(_)
            | zbus::fdo::Error::NoReply(_)
            | zbus::fdo::Error::Disconnected(_)
    )
}
