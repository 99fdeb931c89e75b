//! MQTT session over a signed WebSocket.
//!
//! [`BrokerLink`] is one live connection: it performs the signed upgrade,
//! the CONNECT/CONNACK exchange, and then moves packets in both
//! directions. It has no reconnection logic of its own; the owner decides
//! what to do when [`BrokerLink::next_packet`] reports the end of the
//! stream.
//!
//! # Example
//!
//! ```rust,ignore
//! use doorlink_api::mqtt::{self, QoS};
//! use doorlink_api::websocket::BrokerLink;
//!
//! let headers = doorlink_api::signer::sign(&creds, &host, &scope, chrono::Utc::now())?;
//! let connect = mqtt::connect_packet("doorlink-1", 30);
//! let mut link = BrokerLink::open(&url, &headers, connect).await?;
//! link.subscribe("device/rsp", QoS::AtLeastOnce).await?;
//!
//! while let Some(packet) = link.next_packet().await? {
//!     println!("{packet:?}");
//! }
//! ```

use bytes::{Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{self, ClientRequestBuilder};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace};
use url::Url;

use crate::error::Error;
use crate::mqtt::{
    self, Connect, ConnectReturnCode, Packet, PubAck, Publish, QoS, Subscribe, connack_reason,
};
use crate::signer::{HOST_HEADER, SignedHeaders};

/// WebSocket sub-protocol the broker expects for MQTT.
pub const MQTT_SUBPROTOCOL: &str = "mqtt";

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ── BrokerLink ───────────────────────────────────────────────────────

/// One established MQTT session.
///
/// Dropping the link closes the socket without a DISCONNECT; call
/// [`close`](Self::close) for a graceful shutdown.
pub struct BrokerLink {
    ws: WsStream,
    buffer: BytesMut,
    next_packet_id: u16,
}

impl BrokerLink {
    /// Upgrade to a WebSocket carrying `headers`, send CONNECT and wait
    /// for CONNACK.
    ///
    /// No timeout is applied here; callers race this against their own
    /// deadline and drop the future (closing the socket) if it loses.
    pub async fn open(url: &Url, headers: &SignedHeaders, connect: Connect) -> Result<Self, Error> {
        info!(url = %url, client_id = %connect.client_id, "Connecting to broker");

        let uri: tungstenite::http::Uri = url
            .as_str()
            .parse()
            .map_err(|e: tungstenite::http::uri::InvalidUri| Error::WebSocketConnect(e.to_string()))?;

        let mut request = ClientRequestBuilder::new(uri).with_sub_protocol(MQTT_SUBPROTOCOL);
        for (name, value) in headers.pairs() {
            // The upgrade request derives Host from the URI itself.
            if name != HOST_HEADER {
                request = request.with_header(name, value);
            }
        }

        let (ws, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| match e {
                tungstenite::Error::Http(response) => Error::WebSocketRejected {
                    status: response.status().as_u16(),
                },
                other => Error::WebSocketConnect(other.to_string()),
            })?;

        debug!("WebSocket upgraded, sending CONNECT");

        let mut link = Self {
            ws,
            buffer: BytesMut::new(),
            next_packet_id: 0,
        };
        link.send(&Packet::Connect(connect)).await?;

        match link.next_packet().await? {
            Some(Packet::ConnAck(ack)) if ack.code == ConnectReturnCode::Success => {
                info!("Broker accepted connection");
                Ok(link)
            }
            Some(Packet::ConnAck(ack)) if mqtt::is_auth_refusal(ack.code) => {
                Err(Error::Authentication {
                    message: format!("broker refused connection: {}", connack_reason(ack.code)),
                })
            }
            Some(Packet::ConnAck(ack)) => Err(Error::Protocol(format!(
                "broker refused connection: {}",
                connack_reason(ack.code)
            ))),
            Some(other) => Err(Error::Protocol(format!("expected CONNACK, got {other:?}"))),
            None => Err(Error::WebSocketClosed {
                code: 1006,
                reason: "closed before CONNACK".into(),
            }),
        }
    }

    /// Send SUBSCRIBE for one topic filter. Returns the packet id the
    /// matching SUBACK will carry.
    pub async fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<u16, Error> {
        let packet_id = self.allocate_packet_id();
        let mut subscribe = Subscribe::new(topic, qos);
        subscribe.pkid = packet_id;
        self.send(&Packet::Subscribe(subscribe)).await?;
        debug!(topic, packet_id, "SUBSCRIBE sent");
        Ok(packet_id)
    }

    /// Send PUBLISH. Returns the packet id for QoS 1, which the broker
    /// acknowledges with a PUBACK carrying the same id. QoS 2 is not
    /// supported.
    pub async fn publish(&mut self, topic: &str, payload: Bytes, qos: QoS) -> Result<Option<u16>, Error> {
        let packet_id = match qos {
            QoS::AtMostOnce => None,
            QoS::AtLeastOnce => Some(self.allocate_packet_id()),
            QoS::ExactlyOnce => {
                return Err(Error::InvalidInput {
                    field: "qos",
                    reason: "exactly-once delivery is not supported".into(),
                });
            }
        };
        let mut publish = Publish::new(topic, qos, payload.to_vec());
        publish.pkid = packet_id.unwrap_or(0);
        self.send(&Packet::Publish(publish)).await?;
        trace!(topic, ?packet_id, "PUBLISH sent");
        Ok(packet_id)
    }

    /// Acknowledge an inbound QoS 1 publish.
    pub async fn ack(&mut self, packet_id: u16) -> Result<(), Error> {
        self.send(&Packet::PubAck(PubAck::new(packet_id))).await
    }

    pub async fn ping(&mut self) -> Result<(), Error> {
        self.send(&Packet::PingReq).await
    }

    /// Read the next MQTT packet.
    ///
    /// Returns `Ok(None)` when the broker closes the stream. Cancel-safe:
    /// bytes are only buffered after a whole frame has been received.
    pub async fn next_packet(&mut self) -> Result<Option<Packet>, Error> {
        loop {
            if let Some(packet) = mqtt::decode(&mut self.buffer)? {
                trace!(?packet, "packet received");
                return Ok(Some(packet));
            }

            match self.ws.next().await {
                Some(Ok(tungstenite::Message::Binary(data))) => {
                    self.buffer.extend_from_slice(&data);
                }
                Some(Ok(tungstenite::Message::Ping(_))) => {
                    // tungstenite handles pong replies automatically
                    trace!("WebSocket ping");
                }
                Some(Ok(tungstenite::Message::Close(frame))) => {
                    if let Some(ref cf) = frame {
                        info!(code = %cf.code, reason = %cf.reason, "WebSocket close frame received");
                    } else {
                        info!("WebSocket close frame received (no payload)");
                    }
                    return Ok(None);
                }
                Some(Ok(tungstenite::Message::Text(text))) => {
                    debug!(len = text.len(), "ignoring text frame on MQTT stream");
                }
                Some(Ok(_)) => {
                    // Pong, raw frames
                }
                Some(Err(e)) => return Err(Error::LinkFailed(e.to_string())),
                None => {
                    info!("WebSocket stream ended");
                    return Ok(None);
                }
            }
        }
    }

    /// Send DISCONNECT and close the socket. Errors are logged, not
    /// returned: the session is over either way.
    pub async fn close(mut self) {
        if let Err(e) = self.send(&Packet::Disconnect).await {
            debug!(error = %e, "DISCONNECT not delivered");
        }
        if let Err(e) = self.ws.close(None).await {
            debug!(error = %e, "WebSocket close handshake failed");
        }
        info!("Broker link closed");
    }

    async fn send(&mut self, packet: &Packet) -> Result<(), Error> {
        let bytes = mqtt::encode(packet)?;
        self.ws
            .send(tungstenite::Message::Binary(bytes))
            .await
            .map_err(|e| Error::LinkFailed(e.to_string()))
    }

    /// Packet ids are non-zero and wrap.
    fn allocate_packet_id(&mut self) -> u16 {
        self.next_packet_id = self.next_packet_id.checked_add(1).unwrap_or(1);
        self.next_packet_id
    }
}
