#![allow(dead_code, clippy::unwrap_used)]
// Shared fixtures: a wiremock identity service and an in-process broker.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::BytesMut;
use futures_util::{SinkExt, StreamExt};
use secrecy::SecretString;
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{self, HeaderValue};
use url::Url;
use wiremock::matchers::{header, method};
use wiremock::{Mock, MockServer, ResponseTemplate};

use doorlink_api::mqtt::{
    self, ConnAck, ConnectReturnCode, Packet, PubAck, Publish, QoS, SubAck, SubscribeReasonCode,
};
use doorlink_core::{CloudEndpoints, ConnectionTuning, DeviceConfig, Notification};

pub const DEVICE_ID: &str = "dev-1";
pub const LOGIN_TARGET: &str = "AWSCognitoIdentityProviderService.InitiateAuth";

// ── Identity service ────────────────────────────────────────────────

/// Far enough ahead that credentials never expire during a test.
pub const FAR_FUTURE: f64 = 4_102_444_800.0;

pub async fn identity_server() -> MockServer {
    identity_server_expiring_at(FAR_FUTURE).await
}

/// Identity service whose credentials carry `expiration` (epoch seconds).
pub async fn identity_server_expiring_at(expiration: f64) -> MockServer {
    let server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(header("X-Amz-Target", LOGIN_TARGET))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "AuthenticationResult": { "IdToken": "id-token" }
        })))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(header("X-Amz-Target", "AWSCognitoIdentityService.GetId"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "IdentityId": "us-east-1:identity"
        })))
        .mount(&server)
        .await;

    Mock::given(method("POST"))
        .and(header(
            "X-Amz-Target",
            "AWSCognitoIdentityService.GetCredentialsForIdentity",
        ))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "Credentials": {
                "AccessKeyId": "ASIAEXAMPLE",
                "SecretKey": "secret",
                "SessionToken": "token",
                "Expiration": expiration
            }
        })))
        .mount(&server)
        .await;

    server
}

/// Number of InitiateAuth calls the identity service has seen.
pub async fn login_count(server: &MockServer) -> usize {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .filter(|req| {
            req.headers
                .get("X-Amz-Target")
                .is_some_and(|v| v.as_bytes() == LOGIN_TARGET.as_bytes())
        })
        .count()
}

pub fn device_config(identity: &MockServer, broker: &FakeBroker, tuning: ConnectionTuning) -> DeviceConfig {
    let idp = Url::parse(&identity.uri()).unwrap();
    let endpoints =
        CloudEndpoints::for_region("us-east-1", "us-east-1_Pool", "client", "pool", "broker.test")
            .unwrap()
            .with_idp_url(idp.clone())
            .with_identity_url(idp)
            .with_broker_url(broker.url.clone());

    DeviceConfig::new(
        "owner@example.com",
        SecretString::from("pw".to_owned()),
        DEVICE_ID,
        endpoints,
    )
    .unwrap()
    .with_tuning(tuning)
}

pub fn fast_tuning() -> ConnectionTuning {
    ConnectionTuning {
        connect_timeout: Duration::from_secs(2),
        status_timeout: Duration::from_secs(2),
        max_reconnect_attempts: 3,
        reconnect_base_delay: Duration::from_millis(50),
        keepalive_interval: Duration::from_secs(30),
    }
}

/// Make every later login fail with a 400, ahead of the mounted success.
pub async fn reject_logins(server: &MockServer) {
    Mock::given(method("POST"))
        .and(header("X-Amz-Target", LOGIN_TARGET))
        .respond_with(
            ResponseTemplate::new(400).set_body_string(r#"{"__type":"NotAuthorizedException"}"#),
        )
        .with_priority(1)
        .mount(server)
        .await;
}

// ── Fake broker ─────────────────────────────────────────────────────

/// How the broker answers SUBSCRIBE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeReply {
    Grant,
    /// SUBACK with the 0x80 failure code, then hang up.
    Refuse,
    /// Hang up without a SUBACK.
    HangUp,
}

#[derive(Debug, Clone)]
enum ServerEvent {
    DropLinks,
    Push(i64),
}

#[derive(Default)]
struct Shared {
    /// TCP connections accepted, including refused ones.
    accepted: AtomicUsize,
    /// Sessions that completed CONNECT.
    sessions: AtomicUsize,
    door_status: AtomicI64,
    refuse_tcp: AtomicBool,
    reject_status: Mutex<Option<u16>>,
    silent: AtomicBool,
    mute_pings: AtomicBool,
    subscribe_reply: Mutex<Option<SubscribeReply>>,
    received: Mutex<Vec<Value>>,
}

/// In-process MQTT-over-WebSocket broker speaking just enough of the
/// protocol for one device.
pub struct FakeBroker {
    pub url: Url,
    shared: Arc<Shared>,
    events: broadcast::Sender<ServerEvent>,
}

impl FakeBroker {
    pub async fn start(door_status: i64) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = Url::parse(&format!("ws://{}/mqtt", listener.local_addr().unwrap())).unwrap();
        let shared = Arc::new(Shared::default());
        shared.door_status.store(door_status, Ordering::SeqCst);
        let (events, _) = broadcast::channel(16);

        let accept_shared = Arc::clone(&shared);
        let accept_events = events.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                accept_shared.accepted.fetch_add(1, Ordering::SeqCst);
                if accept_shared.refuse_tcp.load(Ordering::SeqCst) {
                    drop(stream);
                    continue;
                }
                tokio::spawn(session(
                    stream,
                    Arc::clone(&accept_shared),
                    accept_events.subscribe(),
                ));
            }
        });

        Self { url, shared, events }
    }

    /// Kill every live session without a close handshake.
    pub fn drop_links(&self) {
        let _ = self.events.send(ServerEvent::DropLinks);
    }

    /// Publish an unsolicited status to every live session.
    pub fn push_status(&self, code: i64) {
        self.shared.door_status.store(code, Ordering::SeqCst);
        let _ = self.events.send(ServerEvent::Push(code));
    }

    pub fn set_door_status(&self, code: i64) {
        self.shared.door_status.store(code, Ordering::SeqCst);
    }

    pub fn refuse_connections(&self, refuse: bool) {
        self.shared.refuse_tcp.store(refuse, Ordering::SeqCst);
    }

    pub fn reject_upgrades(&self, status: Option<u16>) {
        *self.shared.reject_status.lock().unwrap() = status;
    }

    /// Accept upgrades but never answer CONNECT.
    pub fn go_silent(&self, silent: bool) {
        self.shared.silent.store(silent, Ordering::SeqCst);
    }

    pub fn mute_pings(&self, mute: bool) {
        self.shared.mute_pings.store(mute, Ordering::SeqCst);
    }

    pub fn answer_subscribe(&self, reply: SubscribeReply) {
        *self.shared.subscribe_reply.lock().unwrap() = Some(reply);
    }

    pub fn accepted(&self) -> usize {
        self.shared.accepted.load(Ordering::SeqCst)
    }

    pub fn sessions(&self) -> usize {
        self.shared.sessions.load(Ordering::SeqCst)
    }

    /// Command payloads received on `{device}/cmd`, in order.
    pub fn received(&self) -> Vec<Value> {
        self.shared.received.lock().unwrap().clone()
    }

    pub async fn wait_for_payload(&self, expected: &Value) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !self.received().contains(expected) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("broker never received {expected}"));
    }
}

async fn session(
    stream: TcpStream,
    shared: Arc<Shared>,
    mut events: broadcast::Receiver<ServerEvent>,
) {
    let reject = *shared.reject_status.lock().unwrap();
    let callback = move |_req: &Request, mut resp: Response| -> Result<Response, ErrorResponse> {
        if let Some(status) = reject {
            return Err(http::Response::builder()
                .status(status)
                .body(Some("denied".to_owned()))
                .unwrap());
        }
        resp.headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("mqtt"));
        Ok(resp)
    };

    let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
        return;
    };
    let mut buffer = BytesMut::new();

    loop {
        while let Some(packet) = mqtt::decode(&mut buffer).unwrap() {
            if !respond(&mut ws, &shared, packet).await {
                return;
            }
        }

        tokio::select! {
            message = ws.next() => match message {
                Some(Ok(Message::Binary(data))) => buffer.extend_from_slice(&data),
                Some(Ok(Message::Close(_)) | Err(_)) | None => return,
                Some(Ok(_)) => {}
            },
            event = events.recv() => match event {
                Ok(ServerEvent::Push(code)) => send_status(&mut ws, code).await,
                Ok(ServerEvent::DropLinks) | Err(_) => return,
            },
        }
    }
}

/// Answer one client packet. Returns `false` when the session should end.
async fn respond(ws: &mut WebSocketStream<TcpStream>, shared: &Shared, packet: Packet) -> bool {
    match packet {
        Packet::Connect(_) => {
            if shared.silent.load(Ordering::SeqCst) {
                return true;
            }
            shared.sessions.fetch_add(1, Ordering::SeqCst);
            send(
                ws,
                &Packet::ConnAck(ConnAck::new(ConnectReturnCode::Success, false)),
            )
            .await;
        }
        Packet::Subscribe(subscribe) => {
            let reply = (*shared.subscribe_reply.lock().unwrap()).unwrap_or(SubscribeReply::Grant);
            let code = match reply {
                SubscribeReply::Grant => SubscribeReasonCode::Success(QoS::AtLeastOnce),
                SubscribeReply::Refuse => SubscribeReasonCode::Failure,
                SubscribeReply::HangUp => return false,
            };
            let return_codes = vec![code; subscribe.filters.len()];
            send(ws, &Packet::SubAck(SubAck::new(subscribe.pkid, return_codes))).await;
            if reply == SubscribeReply::Refuse {
                return false;
            }
        }
        Packet::Publish(publish) => {
            if publish.qos == QoS::AtLeastOnce {
                send(ws, &Packet::PubAck(PubAck::new(publish.pkid))).await;
            }
            let body: Value = serde_json::from_slice(&publish.payload).unwrap();
            let wants_status = body.get("status").is_some();
            shared.received.lock().unwrap().push(body);
            if wants_status {
                send_status(ws, shared.door_status.load(Ordering::SeqCst)).await;
            }
        }
        Packet::PingReq => {
            if !shared.mute_pings.load(Ordering::SeqCst) {
                send(ws, &Packet::PingResp).await;
            }
        }
        Packet::Disconnect => return false,
        _ => {}
    }
    true
}

async fn send_status(ws: &mut WebSocketStream<TcpStream>, code: i64) {
    let payload = json!({ "door_status": code }).to_string();
    send(
        ws,
        &Packet::Publish(Publish::new(
            format!("{DEVICE_ID}/rsp"),
            QoS::AtMostOnce,
            payload,
        )),
    )
    .await;
}

async fn send(ws: &mut WebSocketStream<TcpStream>, packet: &Packet) {
    let bytes = mqtt::encode(packet).unwrap();
    // The client may already be gone.
    let _ = ws.send(Message::Binary(bytes)).await;
}

// ── Notification helpers ────────────────────────────────────────────

/// Wait for the first notification matching `pred`, skipping others.
pub async fn expect_notification<F>(
    rx: &mut broadcast::Receiver<Notification>,
    mut pred: F,
) -> Notification
where
    F: FnMut(&Notification) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let notification = rx.recv().await.unwrap();
            if pred(&notification) {
                return notification;
            }
        }
    })
    .await
    .expect("timed out waiting for notification")
}
