// ── GarageDoor façade ──
//
// Wires the identity broker, connection manager and status correlator
// together for one device, and exposes door and light control.

use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use doorlink_api::IdentityBroker;

use crate::command::{Command, DoorAction, LightAction};
use crate::config::DeviceConfig;
use crate::connection::{ConnectionManager, ConnectionState};
use crate::correlator::{StatusCorrelator, StatusRequester};
use crate::error::CoreError;
use crate::model::DeviceStatus;
use crate::notification::Notification;

/// The main entry point for consumers.
///
/// ```rust,ignore
/// let door = GarageDoor::new(config)?;
/// door.connect().await?;
/// if door.status().await?.is_closed() {
///     door.open()?;
/// }
/// door.disconnect().await;
/// ```
pub struct GarageDoor {
    config: DeviceConfig,
    manager: ConnectionManager,
    correlator: Arc<StatusCorrelator>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl GarageDoor {
    /// Build the collaborators. Does NOT connect.
    pub fn new(config: DeviceConfig) -> Result<Self, CoreError> {
        let http = config.transport.build_client()?;
        let broker = Arc::new(IdentityBroker::with_client(
            http,
            config.username.clone(),
            config.password.clone(),
            config.endpoints.clone(),
        ));

        let manager = ConnectionManager::new(broker, config.device_id.clone(), config.tuning.clone());
        let correlator = Arc::new(StatusCorrelator::new(
            Arc::new(manager.clone()) as Arc<dyn StatusRequester>,
            manager.notifier(),
        ));

        Ok(Self {
            config,
            manager,
            correlator,
            pump: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    // ── Connection lifecycle ─────────────────────────────────────

    /// Connect to the broker and start routing status messages.
    pub async fn connect(&self) -> Result<(), CoreError> {
        self.ensure_pump();
        self.manager.connect().await
    }

    /// Disconnect and forget the cached status.
    pub async fn disconnect(&self) {
        self.manager.disconnect().await;
        self.correlator.forget();
    }

    // ── Door & light ─────────────────────────────────────────────

    pub fn open(&self) -> Result<(), CoreError> {
        self.manager.publish(Command::Door(DoorAction::Open))
    }

    pub fn close(&self) -> Result<(), CoreError> {
        self.manager.publish(Command::Door(DoorAction::Close))
    }

    pub fn stop(&self) -> Result<(), CoreError> {
        self.manager.publish(Command::Door(DoorAction::Stop))
    }

    pub fn toggle(&self) -> Result<(), CoreError> {
        self.manager.publish(Command::Door(DoorAction::Toggle))
    }

    pub fn light_on(&self) -> Result<(), CoreError> {
        self.manager.publish(Command::Light(LightAction::On))
    }

    pub fn light_off(&self) -> Result<(), CoreError> {
        self.manager.publish(Command::Light(LightAction::Off))
    }

    // ── Status ───────────────────────────────────────────────────

    /// Current door status, waiting up to the configured status timeout.
    pub async fn status(&self) -> Result<DeviceStatus, CoreError> {
        self.correlator.query(self.config.tuning.status_timeout).await
    }

    pub fn last_status(&self) -> Option<DeviceStatus> {
        self.correlator.last_known()
    }

    // ── Observation ──────────────────────────────────────────────

    pub fn notifications(&self) -> broadcast::Receiver<Notification> {
        self.manager.notifications()
    }

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.manager.connection_state()
    }

    pub fn is_connected(&self) -> bool {
        self.manager.is_connected()
    }

    pub fn is_credentials_expired(&self) -> bool {
        self.manager.is_credentials_expired()
    }

    /// Start the inbound pump once. It subscribes before the first
    /// connect so the initial status response is not missed.
    fn ensure_pump(&self) {
        let mut pump = self.pump.lock().unwrap_or_else(PoisonError::into_inner);
        if pump.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }

        let mut inbound = self.manager.inbound();
        let correlator = Arc::clone(&self.correlator);
        *pump = Some(tokio::spawn(async move {
            loop {
                match inbound.recv().await {
                    Ok(payload) => {
                        // Parse failures are reported as notifications.
                        let _ = correlator.on_message(&payload);
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "status pump lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("status pump exiting");
        }));
    }
}

impl Drop for GarageDoor {
    fn drop(&mut self) {
        if let Some(task) = self
            .pump
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}
