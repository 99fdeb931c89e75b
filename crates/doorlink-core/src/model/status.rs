// ── Door status domain types ──

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString, IntoStaticStr};

use crate::error::CoreError;

/// Physical state of the door as reported by the device.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    IntoStaticStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DoorState {
    Stopped,
    Opening,
    Closing,
    Open,
    Closed,
}

impl DoorState {
    /// Map a device status code. Unknown codes read as `Stopped`.
    pub fn from_code(code: i64) -> Self {
        match code {
            1 => Self::Opening,
            2 => Self::Closing,
            3 => Self::Open,
            4 => Self::Closed,
            _ => Self::Stopped,
        }
    }

    pub fn code(self) -> i64 {
        match self {
            Self::Stopped => 0,
            Self::Opening => 1,
            Self::Closing => 2,
            Self::Open => 3,
            Self::Closed => 4,
        }
    }
}

/// One status report from the device.
///
/// `raw_value` keeps the integer exactly as received, so an unrecognised
/// code is still visible even though `door_state` reads `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub door_state: DoorState,
    pub raw_value: i64,
}

/// Wire shape of an inbound status message.
#[derive(Deserialize)]
struct StatusPayload {
    door_status: i64,
}

impl DeviceStatus {
    pub fn from_code(code: i64) -> Self {
        Self {
            door_state: DoorState::from_code(code),
            raw_value: code,
        }
    }

    /// Decode a `{"door_status": <integer>}` message.
    pub fn from_payload(payload: &[u8]) -> Result<Self, CoreError> {
        let parsed: StatusPayload =
            serde_json::from_slice(payload).map_err(|e| CoreError::InvalidStatus {
                message: format!("{e}: {}", String::from_utf8_lossy(payload)),
            })?;
        Ok(Self::from_code(parsed.door_status))
    }

    pub fn is_stopped(&self) -> bool {
        self.door_state == DoorState::Stopped
    }

    pub fn is_opening(&self) -> bool {
        self.door_state == DoorState::Opening
    }

    pub fn is_closing(&self) -> bool {
        self.door_state == DoorState::Closing
    }

    pub fn is_open(&self) -> bool {
        self.door_state == DoorState::Open
    }

    pub fn is_closed(&self) -> bool {
        self.door_state == DoorState::Closed
    }
}
