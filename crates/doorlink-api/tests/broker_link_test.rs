#![allow(clippy::unwrap_used)]
// Integration tests for `BrokerLink` against an in-process broker.

use std::sync::{Arc, Mutex};

use bytes::BytesMut;
use chrono::{TimeZone, Utc};
use futures_util::{SinkExt, StreamExt};
use secrecy::SecretString;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::http::{self, HeaderMap, HeaderValue};
use url::Url;

use doorlink_api::mqtt::{
    self, ConnAck, Connect, ConnectReturnCode, Packet, PubAck, Publish, QoS, SubAck,
    SubscribeReasonCode,
};
use doorlink_api::{BrokerLink, Credentials, Error, SigningScope, signer};

// ── Fake broker ─────────────────────────────────────────────────────

type ServerStream = WebSocketStream<TcpStream>;

struct ServerSide {
    ws: ServerStream,
    buffer: BytesMut,
}

impl ServerSide {
    async fn recv(&mut self) -> Option<Packet> {
        loop {
            if let Some(packet) = mqtt::decode(&mut self.buffer).unwrap() {
                return Some(packet);
            }
            match self.ws.next().await? {
                Ok(Message::Binary(data)) => self.buffer.extend_from_slice(&data),
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => {}
            }
        }
    }

    async fn send(&mut self, packet: &Packet) {
        let bytes = mqtt::encode(packet).unwrap();
        self.ws.send(Message::Binary(bytes)).await.unwrap();
    }
}

/// Bind a listener and hand the first accepted upgrade to `script`.
/// Upgrade request headers are captured into the returned slot.
async fn spawn_broker<F, Fut>(reject: Option<u16>, script: F) -> (Url, Arc<Mutex<Option<HeaderMap>>>, JoinHandle<()>)
where
    F: FnOnce(ServerSide) -> Fut + Send + 'static,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let url = Url::parse(&format!("ws://{addr}/mqtt")).unwrap();
    let captured = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&captured);

    let handle = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let callback = move |req: &Request, mut resp: Response| -> Result<Response, ErrorResponse> {
            *slot.lock().unwrap() = Some(req.headers().clone());
            if let Some(status) = reject {
                let denied = http::Response::builder()
                    .status(status)
                    .body(Some("denied".to_owned()))
                    .unwrap();
                return Err(denied);
            }
            resp.headers_mut()
                .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("mqtt"));
            Ok(resp)
        };

        let Ok(ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
            return;
        };
        script(ServerSide {
            ws,
            buffer: BytesMut::new(),
        })
        .await;
    });

    (url, captured, handle)
}

fn signed_headers(host: &str) -> signer::SignedHeaders {
    let credentials = Credentials {
        access_key_id: "ASIAEXAMPLE".into(),
        secret_access_key: SecretString::from("secret".to_owned()),
        session_token: Some(SecretString::from("token-xyz".to_owned())),
        expiration: Utc.with_ymd_and_hms(2100, 1, 1, 0, 0, 0).unwrap(),
    };
    let timestamp = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
    signer::sign(&credentials, host, &SigningScope::broker("us-east-1"), timestamp).unwrap()
}

fn connect_packet() -> Connect {
    mqtt::connect_packet("doorlink-test", 30)
}

fn connack(code: ConnectReturnCode) -> Packet {
    Packet::ConnAck(ConnAck::new(code, false))
}

// ── Session tests ───────────────────────────────────────────────────

#[tokio::test]
async fn test_open_carries_signed_headers_and_subprotocol() {
    let (url, captured, broker) = spawn_broker(None, |mut server| async move {
        match server.recv().await {
            Some(Packet::Connect(connect)) => {
                assert_eq!(connect.client_id, "doorlink-test");
                assert_eq!(connect.keep_alive, 30);
            }
            other => panic!("expected CONNECT, got {other:?}"),
        }
        server.send(&connack(ConnectReturnCode::Success)).await;
        // Wait for DISCONNECT.
        assert!(matches!(server.recv().await, Some(Packet::Disconnect)));
    })
    .await;

    let host = url.host_str().unwrap().to_owned();
    let link = BrokerLink::open(&url, &signed_headers(&host), connect_packet())
        .await
        .unwrap();
    link.close().await;
    broker.await.unwrap();

    let headers = captured.lock().unwrap().take().unwrap();
    assert_eq!(headers.get("x-amz-date").unwrap(), "20240601T120000Z");
    assert_eq!(headers.get("x-amz-security-token").unwrap(), "token-xyz");
    assert_eq!(headers.get("sec-websocket-protocol").unwrap(), "mqtt");
    let authorization = headers.get("authorization").unwrap().to_str().unwrap();
    assert!(authorization.starts_with(
        "AWS4-HMAC-SHA256 Credential=ASIAEXAMPLE/20240601/us-east-1/iotdevicegateway/aws4_request"
    ));
}

#[tokio::test]
async fn test_subscribe_and_receive_publish() {
    let (url, _captured, broker) = spawn_broker(None, |mut server| async move {
        server.recv().await.unwrap();
        server.send(&connack(ConnectReturnCode::Success)).await;

        let Some(Packet::Subscribe(subscribe)) = server.recv().await else {
            panic!("expected SUBSCRIBE");
        };
        assert_eq!(subscribe.filters.len(), 1);
        assert_eq!(subscribe.filters[0].path, "dev-1/rsp");
        assert_eq!(subscribe.filters[0].qos, QoS::AtLeastOnce);
        server
            .send(&Packet::SubAck(SubAck::new(
                subscribe.pkid,
                vec![SubscribeReasonCode::Success(QoS::AtLeastOnce)],
            )))
            .await;

        let mut publish = Publish::new("dev-1/rsp", QoS::AtLeastOnce, br#"{"door_status":4}"#.to_vec());
        publish.pkid = 77;
        server.send(&Packet::Publish(publish)).await;

        assert_eq!(server.recv().await, Some(Packet::PubAck(PubAck::new(77))));
    })
    .await;

    let host = url.host_str().unwrap().to_owned();
    let mut link = BrokerLink::open(&url, &signed_headers(&host), connect_packet())
        .await
        .unwrap();

    let packet_id = link.subscribe("dev-1/rsp", QoS::AtLeastOnce).await.unwrap();
    match link.next_packet().await.unwrap() {
        Some(Packet::SubAck(ack)) => {
            assert_eq!(ack.pkid, packet_id);
            assert!(mqtt::subscription_granted(&ack));
        }
        other => panic!("expected SUBACK, got {other:?}"),
    }

    match link.next_packet().await.unwrap() {
        Some(Packet::Publish(publish)) => {
            assert_eq!(publish.topic, "dev-1/rsp");
            assert_eq!(&publish.payload[..], br#"{"door_status":4}"#);
            assert_eq!(publish.qos, QoS::AtLeastOnce);
            link.ack(publish.pkid).await.unwrap();
        }
        other => panic!("expected PUBLISH, got {other:?}"),
    }

    broker.await.unwrap();
    // The broker task has finished and dropped its socket.
    assert!(!matches!(link.next_packet().await, Ok(Some(_))));
}

#[tokio::test]
async fn test_refused_connack_is_authentication_error() {
    let (url, _captured, broker) = spawn_broker(None, |mut server| async move {
        server.recv().await.unwrap();
        server.send(&connack(ConnectReturnCode::NotAuthorized)).await;
    })
    .await;

    let host = url.host_str().unwrap().to_owned();
    let result = BrokerLink::open(&url, &signed_headers(&host), connect_packet()).await;
    broker.await.unwrap();

    match result {
        Err(Error::Authentication { message }) => assert!(message.contains("not authorized")),
        Err(other) => panic!("expected Authentication, got {other:?}"),
        Ok(_) => panic!("expected refusal"),
    }
}

#[tokio::test]
async fn test_upgrade_rejection_maps_status() {
    let (url, captured, broker) = spawn_broker(Some(403), |_server| async {}).await;

    let host = url.host_str().unwrap().to_owned();
    let result = BrokerLink::open(&url, &signed_headers(&host), connect_packet()).await;
    broker.await.unwrap();

    let err = match result {
        Err(err) => err,
        Ok(_) => panic!("expected rejection"),
    };
    assert!(matches!(err, Error::WebSocketRejected { status: 403 }), "got {err:?}");
    assert!(err.is_auth_expired());
    assert!(captured.lock().unwrap().is_some());
}

#[tokio::test]
async fn test_close_before_connack() {
    let (url, _captured, broker) = spawn_broker(None, |mut server| async move {
        server.recv().await.unwrap();
        server.ws.close(None).await.unwrap();
    })
    .await;

    let host = url.host_str().unwrap().to_owned();
    let result = BrokerLink::open(&url, &signed_headers(&host), connect_packet()).await;
    broker.await.unwrap();

    assert!(
        matches!(result, Err(Error::WebSocketClosed { code: 1006, .. })),
        "unexpected result"
    );
}

#[tokio::test]
async fn test_abrupt_drop_after_connack_is_link_failure() {
    let (url, _captured, broker) = spawn_broker(None, |mut server| async move {
        server.recv().await.unwrap();
        server.send(&connack(ConnectReturnCode::Success)).await;
        // Dropped without a close frame.
    })
    .await;

    let host = url.host_str().unwrap().to_owned();
    let mut link = BrokerLink::open(&url, &signed_headers(&host), connect_packet())
        .await
        .unwrap();
    broker.await.unwrap();

    let err = link.next_packet().await.unwrap_err();
    assert!(matches!(err, Error::LinkFailed(_)), "got {err:?}");
    assert!(!err.is_auth_expired());
}
