// doorlink-api: wire-level building blocks for a cloud-connected garage-door controller

pub mod auth;
pub mod error;
pub mod identity;
pub mod mqtt;
pub mod signer;
pub mod transport;
pub mod websocket;

pub use auth::{CloudEndpoints, Credentials, SigningScope};
pub use error::Error;
pub use identity::{Handshake, IdentityBroker};
pub use signer::SignedHeaders;
pub use transport::{TlsMode, TransportConfig};
pub use websocket::BrokerLink;
