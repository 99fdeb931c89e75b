// MQTT 3.1.1 framing for the broker WebSocket.
//
// Packets come from rumqttc's `mqttbytes::v4`; the socket stays ours so the
// upgrade can carry signed headers. These helpers adapt rumqttc's codec to
// the incremental buffer `BrokerLink` reads into.

use bytes::{Bytes, BytesMut};
use rumqttc::mqttbytes;

pub use rumqttc::mqttbytes::QoS;
pub use rumqttc::mqttbytes::v4::{
    ConnAck, Connect, ConnectReturnCode, Packet, PubAck, Publish, SubAck, Subscribe,
    SubscribeReasonCode,
};

use crate::error::Error;

/// Upper bound on a single packet in either direction. Status and command
/// payloads are a few bytes of JSON.
pub const MAX_PACKET_SIZE: usize = 64 * 1024;

/// CONNECT for a clean session without will or login; the signed upgrade
/// already authenticates the client.
pub fn connect_packet(client_id: impl Into<String>, keep_alive_secs: u16) -> Connect {
    let mut connect = Connect::new(client_id);
    connect.keep_alive = keep_alive_secs;
    connect.clean_session = true;
    connect
}

/// Take one whole packet off the front of `buffer`.
///
/// Returns `Ok(None)` and leaves `buffer` untouched while the next packet
/// is still incomplete.
pub fn decode(buffer: &mut BytesMut) -> Result<Option<Packet>, Error> {
    match Packet::read(buffer, MAX_PACKET_SIZE) {
        Ok(packet) => Ok(Some(packet)),
        Err(mqttbytes::Error::InsufficientBytes(_)) => Ok(None),
        Err(e) => Err(Error::Protocol(format!("malformed packet: {e}"))),
    }
}

pub fn encode(packet: &Packet) -> Result<Bytes, Error> {
    let mut buffer = BytesMut::new();
    packet
        .write(&mut buffer, MAX_PACKET_SIZE)
        .map_err(|e| Error::Protocol(format!("cannot encode packet: {e}")))?;
    Ok(buffer.freeze())
}

/// Whether the broker granted every filter in a SUBACK.
pub fn subscription_granted(ack: &SubAck) -> bool {
    !ack.return_codes.is_empty()
        && ack
            .return_codes
            .iter()
            .all(|code| matches!(code, SubscribeReasonCode::Success(_)))
}

/// CONNACK refusals that mean the credentials were not accepted.
pub fn is_auth_refusal(code: ConnectReturnCode) -> bool {
    matches!(
        code,
        ConnectReturnCode::BadUserNamePassword | ConnectReturnCode::NotAuthorized
    )
}

pub fn connack_reason(code: ConnectReturnCode) -> &'static str {
    match code {
        ConnectReturnCode::Success => "accepted",
        ConnectReturnCode::RefusedProtocolVersion => "unacceptable protocol version",
        ConnectReturnCode::BadClientId => "identifier rejected",
        ConnectReturnCode::ServiceUnavailable => "server unavailable",
        ConnectReturnCode::BadUserNamePassword => "bad user name or password",
        ConnectReturnCode::NotAuthorized => "not authorized",
    }
}
