//! Connection lifecycle and door control on top of `doorlink-api`.
//!
//! - **[`GarageDoor`]**: Facade for one device. [`connect()`](GarageDoor::connect)
//!   authenticates, opens the signed broker link and subscribes to the
//!   device's response topic; door and light commands are fire-and-forget
//!   publishes, and [`status()`](GarageDoor::status) answers from the last
//!   status seen or waits for the next broadcast.
//!
//! - **[`ConnectionManager`]**: State machine around one broker link
//!   (`Idle → Connecting → Connected`, with `Reconnecting` and `Stopped` on
//!   unexpected loss). A background supervisor owns the link and applies
//!   exponential backoff; [`disconnect()`](ConnectionManager::disconnect)
//!   cancels it outright.
//!
//! - **[`StatusCorrelator`]**: Status messages carry no request id, so one
//!   message resolves every pending query. Keeps the last status seen.
//!
//! - **[`Notification`]**: Lifecycle events and asynchronous errors,
//!   delivered over a `tokio::sync::broadcast` channel.

pub mod command;
pub mod config;
pub mod connection;
pub mod correlator;
pub mod device;
pub mod error;
pub mod model;
pub mod notification;

// ── Primary re-exports ──────────────────────────────────────────────
pub use command::{Command, DoorAction, LightAction};
pub use config::{ConnectionTuning, DeviceConfig};
pub use connection::{ConnectionManager, ConnectionState, ReconnectPolicy};
pub use correlator::{QueryId, StatusCorrelator, StatusRequester};
pub use device::GarageDoor;
pub use error::CoreError;
pub use model::{DeviceStatus, DoorState};
pub use notification::Notification;

// Wire-level types consumers need to build a `DeviceConfig`.
pub use doorlink_api::{CloudEndpoints, TlsMode, TransportConfig};
