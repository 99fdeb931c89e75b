// ── Status correlation ──
//
// Status responses carry no request identifier, so every inbound status
// message resolves every outstanding query at once. The most recent status
// is cached and answers queries without a round trip.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use indexmap::IndexMap;
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, warn};

use crate::error::CoreError;
use crate::model::DeviceStatus;
use crate::notification::Notification;

/// Something that can ask the device to report its status.
pub trait StatusRequester: Send + Sync {
    fn request_status(&self) -> Result<(), CoreError>;
}

/// Handle identifying one pending query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryId(u64);

type PendingMap = IndexMap<QueryId, oneshot::Sender<DeviceStatus>>;

pub struct StatusCorrelator {
    requester: Arc<dyn StatusRequester>,
    notifications: broadcast::Sender<Notification>,
    last: ArcSwapOption<DeviceStatus>,
    pending: Mutex<PendingMap>,
    next_id: AtomicU64,
}

impl StatusCorrelator {
    pub fn new(
        requester: Arc<dyn StatusRequester>,
        notifications: broadcast::Sender<Notification>,
    ) -> Self {
        Self {
            requester,
            notifications,
            last: ArcSwapOption::empty(),
            pending: Mutex::new(IndexMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Current door status.
    ///
    /// Answers from the cache when a status has been seen; otherwise asks
    /// the device and waits up to `timeout` for the next status message.
    /// On timeout or cancellation the pending entry is removed.
    pub async fn query(&self, timeout: Duration) -> Result<DeviceStatus, CoreError> {
        if let Some(status) = self.last_known() {
            return Ok(status);
        }

        let (id, rx) = self.register();
        let _entry = PendingEntry {
            pending: &self.pending,
            id,
        };

        self.requester.request_status()?;
        debug!(?id, "status query waiting");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(status)) => Ok(status),
            Ok(Err(_)) => Err(CoreError::Internal("status resolver dropped".into())),
            Err(_) => Err(CoreError::StatusTimeout {
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }

    /// Feed one inbound status payload.
    ///
    /// A valid payload replaces the cache, resolves every pending query,
    /// and emits `StatusChanged`. An invalid one emits `Error` and leaves
    /// the cache alone.
    pub fn on_message(&self, payload: &[u8]) -> Result<DeviceStatus, CoreError> {
        let status = match DeviceStatus::from_payload(payload) {
            Ok(status) => status,
            Err(e) => {
                warn!(error = %e, "discarding unparseable status message");
                let _ = self.notifications.send(Notification::Error(e.to_string()));
                return Err(e);
            }
        };

        self.last.store(Some(Arc::new(status)));

        let resolvers: Vec<_> = self.lock_pending().drain(..).collect();
        let resolved = resolvers.len();
        for (_, resolver) in resolvers {
            // The receiver may have timed out in the meantime.
            let _ = resolver.send(status);
        }

        debug!(state = %status.door_state, raw = status.raw_value, resolved, "status received");
        let _ = self
            .notifications
            .send(Notification::StatusChanged(status));
        Ok(status)
    }

    pub fn last_known(&self) -> Option<DeviceStatus> {
        self.last.load_full().map(|status| *status)
    }

    /// Drop the cached status so the next query asks the device.
    pub fn forget(&self) {
        self.last.store(None);
    }

    pub fn pending_count(&self) -> usize {
        self.lock_pending().len()
    }

    fn register(&self) -> (QueryId, oneshot::Receiver<DeviceStatus>) {
        let id = QueryId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();
        self.lock_pending().insert(id, tx);
        (id, rx)
    }

    fn lock_pending(&self) -> std::sync::MutexGuard<'_, PendingMap> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Removes its query from the pending map when dropped, whichever way the
/// query ended.
struct PendingEntry<'a> {
    pending: &'a Mutex<PendingMap>,
    id: QueryId,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .shift_remove(&self.id);
    }
}
