// Domain model for device state.

mod status;

pub use status::{DeviceStatus, DoorState};
