// ── Command API ──
//
// Every outbound publish is one `Command`. Each variant serializes to a
// JSON object with exactly one field, published on `{device_id}/cmd`.

use std::fmt;

use bytes::Bytes;
use serde_json::{Value, json};
use strum::Display;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum DoorAction {
    Stop,
    Open,
    Close,
    Toggle,
}

impl DoorAction {
    pub fn code(self) -> u8 {
        match self {
            Self::Stop => 0,
            Self::Open => 1,
            Self::Close => 2,
            Self::Toggle => 3,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum LightAction {
    Off,
    On,
}

impl LightAction {
    pub fn code(self) -> u8 {
        match self {
            Self::Off => 0,
            Self::On => 1,
        }
    }
}

/// All messages the client sends to the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    Door(DoorAction),
    Light(LightAction),
    RequestStatus,
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Door(action) => write!(f, "door {action}"),
            Self::Light(action) => write!(f, "light {action}"),
            Self::RequestStatus => f.write_str("status request"),
        }
    }
}

impl Command {
    pub fn to_payload(self) -> Value {
        match self {
            Self::Door(action) => json!({ "door": action.code() }),
            Self::Light(action) => json!({ "light": action.code() }),
            Self::RequestStatus => json!({ "status": 0 }),
        }
    }

    /// Serialized payload, ready for PUBLISH.
    pub fn to_bytes(self) -> Bytes {
        Bytes::from(self.to_payload().to_string())
    }
}
