// ── Connection manager ──
//
// Owns the broker session for one device: credential refresh, request
// signing, the WebSocket + MQTT link, and the reconnect supervisor.
// Outbound commands reach the link through an mpsc queue; inbound status
// payloads and lifecycle notifications fan out through broadcast channels.

mod state;
mod supervisor;

pub use state::{ConnectionState, ReconnectPolicy};

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use chrono::Utc;
use tokio::sync::{Mutex, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use doorlink_api::mqtt::{self, Packet, Publish, QoS};
use doorlink_api::{BrokerLink, Credentials, IdentityBroker, signer};

use crate::command::Command;
use crate::config::ConnectionTuning;
use crate::correlator::StatusRequester;
use crate::error::CoreError;
use crate::notification::Notification;

const NOTIFICATION_CHANNEL_SIZE: usize = 64;
const INBOUND_CHANNEL_SIZE: usize = 64;

/// Work queued for the supervisor's live link.
enum LinkCommand {
    Publish(Command),
}

/// Sending half of the live link's command queue. Present only while a
/// link is up.
struct LinkHandle {
    commands: mpsc::UnboundedSender<LinkCommand>,
}

/// The running supervisor and the token that stops it.
struct Session {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

// ── ConnectionManager ────────────────────────────────────────────

/// Persistent, self-healing broker connection for one device.
///
/// Cheaply cloneable via `Arc<Inner>`. After [`connect()`](Self::connect)
/// succeeds, a background supervisor owns the link: it forwards queued
/// commands, answers keepalives, and reconnects with exponential backoff
/// when the link drops unexpectedly.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

struct Inner {
    broker: Arc<IdentityBroker>,
    device_id: String,
    client_id: String,
    tuning: ConnectionTuning,
    policy: ReconnectPolicy,
    state: watch::Sender<ConnectionState>,
    notifications: broadcast::Sender<Notification>,
    inbound: broadcast::Sender<Bytes>,
    link: ArcSwapOption<LinkHandle>,
    reconnect_wanted: AtomicBool,
    force_reauth: AtomicBool,
    attempts: AtomicU32,
    connect_lock: Mutex<()>,
    session: std::sync::Mutex<Option<Session>>,
}

impl ConnectionManager {
    /// Create an idle manager. Does NOT connect.
    pub fn new(
        broker: Arc<IdentityBroker>,
        device_id: impl Into<String>,
        tuning: ConnectionTuning,
    ) -> Self {
        let (state, _) = watch::channel(ConnectionState::Idle);
        let (notifications, _) = broadcast::channel(NOTIFICATION_CHANNEL_SIZE);
        let (inbound, _) = broadcast::channel(INBOUND_CHANNEL_SIZE);

        Self {
            inner: Arc::new(Inner {
                broker,
                device_id: device_id.into(),
                client_id: format!("doorlink-{}", Uuid::new_v4().simple()),
                policy: ReconnectPolicy::from_tuning(&tuning),
                tuning,
                state,
                notifications,
                inbound,
                link: ArcSwapOption::empty(),
                reconnect_wanted: AtomicBool::new(false),
                force_reauth: AtomicBool::new(false),
                attempts: AtomicU32::new(0),
                connect_lock: Mutex::new(()),
                session: std::sync::Mutex::new(None),
            }),
        }
    }

    // ── Connection lifecycle ─────────────────────────────────────

    /// Connect to the broker and start the supervisor.
    ///
    /// Authenticates first when the cached credentials are missing,
    /// expired, or were refused by the broker last time. Resolves once the
    /// link is subscribed and the initial status request is out. A no-op
    /// while already connected, connecting, or reconnecting; waits for a
    /// disconnect in progress to finish.
    pub async fn connect(&self) -> Result<(), CoreError> {
        if self.ignores_connect() {
            return Ok(());
        }
        let _guard = self.inner.connect_lock.lock().await;
        if self.ignores_connect() {
            return Ok(());
        }

        // A supervisor that reached `Stopped` has already exited.
        drop(self.inner.take_session());

        self.inner.reconnect_wanted.store(true, Ordering::SeqCst);
        self.inner.set_state(ConnectionState::Connecting);

        let link = match self.inner.establish().await {
            Ok(link) => link,
            Err(e) => {
                warn!(error = %e, "connect failed");
                self.inner.reconnect_wanted.store(false, Ordering::SeqCst);
                self.inner.set_state(ConnectionState::Idle);
                return Err(e);
            }
        };

        if !self.inner.reconnect_wanted.load(Ordering::SeqCst) {
            info!("disconnect requested while connecting");
            link.close().await;
            self.inner.set_state(ConnectionState::Idle);
            return Err(CoreError::ConnectionFailed {
                reason: "disconnect requested while connecting".into(),
            });
        }

        let commands = self.inner.activate();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(supervisor::supervise(
            Arc::clone(&self.inner),
            link,
            commands,
            cancel.clone(),
        ));
        *self
            .inner
            .session
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Session { cancel, task });

        Ok(())
    }

    /// Disconnect and stay disconnected.
    ///
    /// Cancels the supervisor, including any backoff wait in progress,
    /// sends DISCONNECT on a live link, and leaves the manager `Idle`.
    /// Without an active session this does nothing.
    pub async fn disconnect(&self) {
        self.inner.reconnect_wanted.store(false, Ordering::SeqCst);
        let _guard = self.inner.connect_lock.lock().await;

        let Some(session) = self.inner.take_session() else {
            debug!("disconnect without an active session");
            return;
        };

        let announce = self.state().is_active();
        if announce {
            self.inner.set_state(ConnectionState::Disconnecting);
        }

        session.cancel.cancel();
        if let Err(e) = session.task.await {
            warn!(error = %e, "supervisor task ended abnormally");
        }

        self.inner.link.store(None);
        self.inner.set_state(ConnectionState::Idle);
        if announce {
            self.inner.notify(Notification::Disconnected);
        }
        info!(device_id = %self.inner.device_id, "disconnected");
    }

    fn ignores_connect(&self) -> bool {
        let current = self.state();
        if current.is_active() {
            debug!(state = ?current, "connect ignored");
        }
        current.is_active()
    }

    // ── Commands ─────────────────────────────────────────────────

    /// Queue a command for the live link at QoS 1.
    ///
    /// Rejected immediately with [`CoreError::NotConnected`] unless the
    /// manager is `Connected`. Failures after queueing surface as
    /// [`Notification::Error`].
    pub fn publish(&self, command: Command) -> Result<(), CoreError> {
        if !self.is_connected() {
            return Err(CoreError::NotConnected);
        }
        let handle = self.inner.link.load_full().ok_or(CoreError::NotConnected)?;
        handle
            .commands
            .send(LinkCommand::Publish(command))
            .map_err(|_| CoreError::NotConnected)?;
        debug!(%command, "command queued");
        Ok(())
    }

    // ── Observation ──────────────────────────────────────────────

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.inner.notifications.subscribe()
    }

    /// Raw payloads received on `{device_id}/rsp`.
    pub fn inbound(&self) -> broadcast::Receiver<Bytes> {
        self.inner.inbound.subscribe()
    }

    pub(crate) fn notifier(&self) -> broadcast::Sender<Notification> {
        self.inner.notifications.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn is_credentials_expired(&self) -> bool {
        self.inner.broker.is_credentials_expired()
    }

    pub fn device_id(&self) -> &str {
        &self.inner.device_id
    }

    /// Consecutive reconnect attempts since the last fully established
    /// link.
    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.attempts.load(Ordering::SeqCst)
    }
}

impl StatusRequester for ConnectionManager {
    fn request_status(&self) -> Result<(), CoreError> {
        self.publish(Command::RequestStatus)
    }
}

// ── Link establishment ───────────────────────────────────────────

impl Inner {
    fn response_topic(&self) -> String {
        format!("{}/rsp", self.device_id)
    }

    fn command_topic(&self) -> String {
        format!("{}/cmd", self.device_id)
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            debug!(from = ?previous, to = ?next, "connection state changed");
        }
    }

    fn notify(&self, notification: Notification) {
        let _ = self.notifications.send(notification);
    }

    fn take_session(&self) -> Option<Session> {
        self.session
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Publish a fresh link handle and announce the connection. Only a
    /// fully established link clears the reconnect attempt counter.
    fn activate(&self) -> mpsc::UnboundedReceiver<LinkCommand> {
        self.attempts.store(0, Ordering::SeqCst);
        let (tx, rx) = mpsc::unbounded_channel();
        self.link.store(Some(Arc::new(LinkHandle { commands: tx })));
        self.set_state(ConnectionState::Connected);
        self.notify(Notification::Connected);
        info!(device_id = %self.device_id, "connected to broker");
        rx
    }

    /// One full connection attempt: credentials, signed upgrade, CONNACK,
    /// subscription, implicit status request.
    async fn establish(&self) -> Result<BrokerLink, CoreError> {
        let credentials = self.credentials().await?;
        let endpoints = self.broker.endpoints();
        let headers = signer::sign(
            &credentials,
            &endpoints.broker_host,
            &endpoints.signing_scope(),
            Utc::now(),
        )?;
        let connect = mqtt::connect_packet(
            self.client_id.clone(),
            u16::try_from(self.tuning.keepalive_interval.as_secs()).unwrap_or(u16::MAX),
        );

        let timeout = self.tuning.connect_timeout;
        let opened = tokio::time::timeout(
            timeout,
            BrokerLink::open(&endpoints.broker_url, &headers, connect),
        )
        .await;

        let mut link = match opened {
            Ok(Ok(link)) => link,
            Ok(Err(e)) => {
                if e.is_auth_expired() {
                    debug!("broker refused credentials, next attempt re-authenticates");
                    self.force_reauth.store(true, Ordering::SeqCst);
                }
                return Err(e.into());
            }
            Err(_) => return Err(timed_out(timeout)),
        };

        match tokio::time::timeout(timeout, self.subscribe(&mut link)).await {
            Ok(result) => result?,
            Err(_) => return Err(timed_out(timeout)),
        }

        link.publish(
            &self.command_topic(),
            Command::RequestStatus.to_bytes(),
            QoS::AtLeastOnce,
        )
        .await?;
        debug!("initial status request sent");

        Ok(link)
    }

    async fn credentials(&self) -> Result<Arc<Credentials>, CoreError> {
        let forced = self.force_reauth.swap(false, Ordering::SeqCst);
        if !forced {
            if let Some(credentials) = self.broker.credentials().filter(|c| !c.is_expired()) {
                debug!("reusing cached credentials");
                return Ok(credentials);
            }
        }

        info!(forced, "authenticating");
        match self.broker.authenticate().await {
            Ok(handshake) => Ok(handshake.credentials),
            Err(e) => {
                if forced {
                    self.force_reauth.store(true, Ordering::SeqCst);
                }
                Err(e.into())
            }
        }
    }

    async fn subscribe(&self, link: &mut BrokerLink) -> Result<(), CoreError> {
        let topic = self.response_topic();
        let packet_id = link.subscribe(&topic, QoS::AtLeastOnce).await?;

        loop {
            match link.next_packet().await? {
                Some(Packet::SubAck(ack)) if ack.pkid == packet_id => {
                    if !mqtt::subscription_granted(&ack) {
                        return Err(CoreError::ConnectionFailed {
                            reason: format!("broker refused subscription to {topic}"),
                        });
                    }
                    debug!(%topic, "subscribed");
                    return Ok(());
                }
                Some(Packet::Publish(publish)) => self.deliver(link, publish).await?,
                Some(other) => debug!(?other, "ignoring packet while awaiting SUBACK"),
                None => {
                    return Err(CoreError::ConnectionFailed {
                        reason: "link closed before SUBACK".into(),
                    });
                }
            }
        }
    }

    /// Acknowledge an inbound publish and forward status payloads.
    async fn deliver(
        &self,
        link: &mut BrokerLink,
        publish: Publish,
    ) -> Result<(), doorlink_api::Error> {
        if publish.qos == QoS::AtLeastOnce {
            link.ack(publish.pkid).await?;
        }

        if publish.topic != self.response_topic() {
            debug!(topic = %publish.topic, "ignoring message on unexpected topic");
            return Ok(());
        }

        if self.inbound.send(publish.payload).is_err() {
            debug!("status message dropped, no listeners");
        }
        Ok(())
    }
}

fn timed_out(timeout: Duration) -> CoreError {
    CoreError::ConnectTimeout {
        timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
    }
}
