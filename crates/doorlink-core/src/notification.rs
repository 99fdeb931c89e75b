// Notifications fanned out to every subscriber of a device.

use std::time::Duration;

use crate::model::DeviceStatus;

/// Asynchronous events from the connection and the device.
///
/// Every error that happens off the caller's task (dropped links, failed
/// reconnects, unparseable status messages) arrives here as `Error`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Connected,
    Disconnected,
    Reconnecting {
        attempt: u32,
        max: u32,
        delay: Duration,
    },
    StatusChanged(DeviceStatus),
    Error(String),
}
