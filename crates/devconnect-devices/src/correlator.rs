/*!
 * Asynchronous response correlator.
 *
 * Pairs replies arriving over an asynchronous transport with the request
 * that caused them. Each pending request is identified by a monotonic
 * [`RequestId`] embedded in the outbound frame and walks this state machine:
 *
 * ```text
 * Created -> AwaitingAck -> Acked -> Completed
 *         \-> AwaitingResult ------> Completed
 * AwaitingAck -> Nacked -> Recovering -> AwaitingAck   (retry)
 *                       \-> Failed                    (budget spent)
 * any live state -> TimedOut | Cancelled | Failed
 * ```
 *
 * Removing an entry from the pending map is the only way to complete it, so
 * every request resolves exactly once, through a reply, a timeout, a
 * failure or a cancellation.
 */
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use devconnect_core::{event::Capability, types::ServiceId};

use crate::device::{DeviceError, Result};
use crate::registry::RemovalHook;
use crate::transport::{Frame, FramePayload};

/// Identifier carried by a command and echoed by its reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestId(u32);

impl RequestId {
    /// The raw value
    pub fn value(&self) -> u32 {
        self.0
    }
}

impl From<u32> for RequestId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// State of a pending request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PendingState {
    /// Registered, frame not sent yet
    Created,
    /// Sent over a transport that acknowledges
    AwaitingAck,
    /// The device accepted the command
    Acked,
    /// Sent, waiting for the reply
    AwaitingResult,
    /// The device refused the command
    Nacked,
    /// Running the recovery action before a resend
    Recovering,
    /// Reply matched
    Completed,
    /// Failed for good
    Failed,
    /// No reply within the window
    TimedOut,
    /// Cancelled by removal, disconnect, supersession or shutdown
    Cancelled,
}

impl PendingState {
    /// Whether the request has resolved
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            PendingState::Completed | PendingState::Failed | PendingState::TimedOut | PendingState::Cancelled
        )
    }
}

/// What to do after a NACK
#[derive(Debug, Clone, PartialEq)]
pub enum NackOutcome {
    /// Recover, then resend this frame
    Retry {
        /// The frame to resend
        frame: Frame,
        /// Attempt number of the resend, starting at 2
        attempt: u32,
    },
    /// The retry budget is spent; the caller got a connection error
    Exhausted,
    /// No such pending request
    Unknown,
}

struct PendingEntry {
    service_id: ServiceId,
    capability: Capability,
    state: PendingState,
    created_at: Instant,
    retries: u32,
    max_retries: u32,
    acknowledges: bool,
    frame: Option<Frame>,
    tx: oneshot::Sender<Result<FramePayload>>,
    timer: Option<JoinHandle<()>>,
}

impl PendingEntry {
    fn stop_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

struct CorrelatorInner {
    pending: Mutex<HashMap<RequestId, PendingEntry>>,
    next_id: AtomicU32,
    timeout: Duration,
}

/// Response correlator, cheap to clone
#[derive(Clone)]
pub struct Correlator {
    inner: Arc<CorrelatorInner>,
}

impl fmt::Debug for Correlator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Correlator")
            .field("pending", &self.pending_count())
            .field("timeout", &self.inner.timeout)
            .finish()
    }
}

/// Caller side of a pending request
#[derive(Debug)]
pub struct PendingHandle {
    id: RequestId,
    service_id: ServiceId,
    rx: oneshot::Receiver<Result<FramePayload>>,
}

impl PendingHandle {
    /// The request id
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// The target device
    pub fn service_id(&self) -> &ServiceId {
        &self.service_id
    }

    /// Wait for the request to resolve
    ///
    /// The correlator's own timer bounds this wait.
    pub async fn wait(self) -> Result<FramePayload> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(DeviceError::unknown(format!(
                "request {} dropped without completion",
                self.id
            ))),
        }
    }
}

impl Correlator {
    /// Create a correlator with a response window
    pub fn new(timeout: Duration) -> Self {
        Self {
            inner: Arc::new(CorrelatorInner {
                pending: Mutex::new(HashMap::new()),
                next_id: AtomicU32::new(1),
                timeout,
            }),
        }
    }

    /// The response window
    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    /// Register a one-shot request for a device capability
    ///
    /// An earlier request still pending for the same device and capability
    /// is superseded: its caller gets an illegal-state error right away.
    pub fn register(&self, service_id: &ServiceId, capability: &Capability, max_retries: u32) -> PendingHandle {
        let id = RequestId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = oneshot::channel();

        let superseded: Vec<PendingEntry> = {
            let mut pending = self.lock();
            let stale: Vec<RequestId> = pending
                .iter()
                .filter(|(_, e)| &e.service_id == service_id && &e.capability == capability)
                .map(|(id, _)| *id)
                .collect();
            let superseded = stale.iter().filter_map(|id| pending.remove(id)).collect();

            pending.insert(
                id,
                PendingEntry {
                    service_id: service_id.clone(),
                    capability: capability.clone(),
                    state: PendingState::Created,
                    created_at: Instant::now(),
                    retries: 0,
                    max_retries,
                    acknowledges: false,
                    frame: None,
                    tx,
                    timer: None,
                },
            );
            superseded
        };

        for mut entry in superseded {
            entry.stop_timer();
            info!(
                service_id = %service_id,
                capability = %capability,
                superseded_by = %id,
                "Superseding pending request"
            );
            let _ = entry.tx.send(Err(DeviceError::illegal_state(format!(
                "superseded by request {}",
                id
            ))));
        }

        debug!(request_id = %id, service_id = %service_id, capability = %capability, "Registered pending request");
        PendingHandle {
            id,
            service_id: service_id.clone(),
            rx,
        }
    }

    /// Record the frame about to be sent and start the response timer
    pub fn arm(&self, id: RequestId, frame: Frame, acknowledges: bool) -> bool {
        let timer = self.spawn_timer(id);
        let mut pending = self.lock();
        let Some(entry) = pending.get_mut(&id) else {
            timer.abort();
            return false;
        };

        entry.stop_timer();
        entry.timer = Some(timer);
        entry.acknowledges = acknowledges;
        entry.frame = Some(frame);
        entry.state = if acknowledges {
            PendingState::AwaitingAck
        } else {
            PendingState::AwaitingResult
        };
        true
    }

    /// The device accepted the command
    pub fn ack(&self, id: RequestId) -> bool {
        let mut pending = self.lock();
        match pending.get_mut(&id) {
            Some(entry) if entry.state == PendingState::AwaitingAck => {
                entry.state = PendingState::Acked;
                debug!(request_id = %id, "Request acknowledged");
                true
            }
            Some(entry) => {
                debug!(request_id = %id, state = ?entry.state, "Ignoring unexpected ack");
                false
            }
            None => false,
        }
    }

    /// The device refused the command
    ///
    /// Within the retry budget the request moves to [`PendingState::Nacked`]
    /// and the frame to resend is returned; otherwise it fails with a
    /// connection error. A fresh response window bounds the recovery.
    pub fn nack(&self, id: RequestId) -> NackOutcome {
        let exhausted = {
            let mut pending = self.lock();
            let Some(entry) = pending.get_mut(&id) else {
                return NackOutcome::Unknown;
            };

            match (entry.frame.clone(), entry.retries < entry.max_retries) {
                (Some(frame), true) => {
                    entry.stop_timer();
                    entry.timer = Some(self.spawn_timer(id));
                    entry.retries += 1;
                    entry.state = PendingState::Nacked;
                    warn!(
                        request_id = %id,
                        attempt = entry.retries + 1,
                        "Request refused, will retry after recovery"
                    );
                    return NackOutcome::Retry {
                        frame,
                        attempt: entry.retries + 1,
                    };
                }
                _ => entry.retries + 1,
            }
        };

        self.finish(
            id,
            PendingState::Failed,
            Err(DeviceError::connection(format!(
                "request {} refused after {} attempts",
                id, exhausted
            ))),
        );
        NackOutcome::Exhausted
    }

    /// Enter the recovery action of a refused request
    pub fn begin_recovery(&self, id: RequestId) -> bool {
        let mut pending = self.lock();
        match pending.get_mut(&id) {
            Some(entry) if entry.state == PendingState::Nacked => {
                entry.state = PendingState::Recovering;
                true
            }
            _ => false,
        }
    }

    /// Leave recovery and restart the wait; returns the frame to resend if
    /// the request is still pending
    pub fn resume(&self, id: RequestId) -> Option<Frame> {
        let timer = self.spawn_timer(id);
        let mut pending = self.lock();
        let entry = match pending.get_mut(&id) {
            Some(entry) if entry.state == PendingState::Recovering => entry,
            _ => {
                timer.abort();
                return None;
            }
        };

        entry.stop_timer();
        entry.timer = Some(timer);
        entry.state = if entry.acknowledges {
            PendingState::AwaitingAck
        } else {
            PendingState::AwaitingResult
        };
        entry.frame.clone()
    }

    /// A reply carrying this id arrived
    pub fn complete(&self, id: RequestId, body: FramePayload) -> bool {
        self.finish(id, PendingState::Completed, Ok(body))
    }

    /// Fail a request
    pub fn fail(&self, id: RequestId, error: DeviceError) -> bool {
        self.finish(id, PendingState::Failed, Err(error))
    }

    /// Cancel every pending request addressed to a device
    pub fn cancel_device(&self, service_id: &ServiceId, error: DeviceError) -> usize {
        let ids: Vec<RequestId> = self
            .lock()
            .iter()
            .filter(|(_, e)| &e.service_id == service_id)
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter()
            .filter(|id| self.finish(*id, PendingState::Cancelled, Err(error.clone())))
            .count()
    }

    /// Cancel every pending request
    pub fn cancel_all(&self, error: DeviceError) -> usize {
        let ids: Vec<RequestId> = self.lock().keys().copied().collect();
        ids.into_iter()
            .filter(|id| self.finish(*id, PendingState::Cancelled, Err(error.clone())))
            .count()
    }

    /// State of a live request
    pub fn state(&self, id: RequestId) -> Option<PendingState> {
        self.lock().get(&id).map(|e| e.state)
    }

    /// Number of live requests
    pub fn pending_count(&self) -> usize {
        self.lock().len()
    }

    /// The device a live request targets
    pub fn service_of(&self, id: RequestId) -> Option<ServiceId> {
        self.lock().get(&id).map(|e| e.service_id.clone())
    }

    fn finish(&self, id: RequestId, state: PendingState, result: Result<FramePayload>) -> bool {
        let Some(mut entry) = self.lock().remove(&id) else {
            return false;
        };
        entry.stop_timer();

        debug!(
            request_id = %id,
            service_id = %entry.service_id,
            from = ?entry.state,
            to = ?state,
            elapsed_ms = entry.created_at.elapsed().as_millis() as u64,
            "Pending request resolved"
        );
        if entry.tx.send(result).is_err() {
            debug!(request_id = %id, "Caller gave up before completion");
        }
        true
    }

    fn spawn_timer(&self, id: RequestId) -> JoinHandle<()> {
        let inner: Weak<CorrelatorInner> = Arc::downgrade(&self.inner);
        let window = self.inner.timeout;
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            if let Some(inner) = inner.upgrade() {
                let correlator = Correlator { inner };
                if correlator.finish(
                    id,
                    PendingState::TimedOut,
                    Err(DeviceError::Timeout(format!(
                        "no response to request {} within {:?}",
                        id, window
                    ))),
                ) {
                    warn!(request_id = %id, "Request timed out");
                }
            }
        })
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<RequestId, PendingEntry>> {
        self.inner.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl RemovalHook for Correlator {
    fn on_device_removed(&self, id: &ServiceId) {
        let cancelled = self.cancel_device(id, DeviceError::Removed(id.to_string()));
        if cancelled > 0 {
            info!(service_id = %id, cancelled, "Cancelled pending requests of removed device");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ErrorKind;

    fn detect() -> Capability {
        Capability::new("humanDetection", None, "onBodyDetection")
    }

    fn frame_for(handle: &PendingHandle) -> Frame {
        Frame {
            request_id: Some(handle.id()),
            service_id: handle.service_id().clone(),
            command: "detect.body".into(),
            payload: FramePayload::Empty,
        }
    }

    #[tokio::test]
    async fn test_reply_completes_once() {
        let correlator = Correlator::new(Duration::from_secs(4));
        let handle = correlator.register(&"hvc-1".into(), &detect(), 0);
        let id = handle.id();
        assert_eq!(correlator.state(id), Some(PendingState::Created));
        assert!(correlator.arm(id, frame_for(&handle), false));
        assert_eq!(correlator.state(id), Some(PendingState::AwaitingResult));

        let body = FramePayload::Json(serde_json::json!({"bodies": 1}));
        assert!(correlator.complete(id, body.clone()));
        assert!(!correlator.complete(id, FramePayload::Empty));
        assert!(!correlator.fail(id, DeviceError::unknown("late")));

        assert_eq!(handle.wait().await.unwrap(), body);
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_is_connection_error() {
        let correlator = Correlator::new(Duration::from_millis(4000));
        let handle = correlator.register(&"pebble-1".into(), &detect(), 1);
        let id = handle.id();
        correlator.arm(id, frame_for(&handle), true);

        let err = handle.wait().await.unwrap_err();
        assert!(matches!(err, DeviceError::Timeout(_)));
        assert_eq!(err.kind(), ErrorKind::Connection);
        assert_eq!(correlator.state(id), None);
        assert!(!correlator.complete(id, FramePayload::Empty));
    }

    #[tokio::test]
    async fn test_ack_then_reply() {
        let correlator = Correlator::new(Duration::from_secs(4));
        let handle = correlator.register(&"pebble-1".into(), &detect(), 1);
        let id = handle.id();
        correlator.arm(id, frame_for(&handle), true);
        assert_eq!(correlator.state(id), Some(PendingState::AwaitingAck));

        assert!(correlator.ack(id));
        assert_eq!(correlator.state(id), Some(PendingState::Acked));
        assert!(!correlator.ack(id));

        correlator.complete(id, FramePayload::Empty);
        assert_eq!(handle.wait().await.unwrap(), FramePayload::Empty);
    }

    #[tokio::test]
    async fn test_nack_retry_then_exhausted() {
        let correlator = Correlator::new(Duration::from_secs(4));
        let handle = correlator.register(&"pebble-1".into(), &detect(), 1);
        let id = handle.id();
        let frame = frame_for(&handle);
        correlator.arm(id, frame.clone(), true);

        assert_eq!(correlator.nack(id), NackOutcome::Retry { frame: frame.clone(), attempt: 2 });
        assert_eq!(correlator.state(id), Some(PendingState::Nacked));
        assert!(correlator.resume(id).is_none());
        assert!(correlator.begin_recovery(id));
        assert_eq!(correlator.state(id), Some(PendingState::Recovering));
        assert_eq!(correlator.resume(id), Some(frame));
        assert_eq!(correlator.state(id), Some(PendingState::AwaitingAck));

        assert_eq!(correlator.nack(id), NackOutcome::Exhausted);
        assert_eq!(correlator.nack(id), NackOutcome::Unknown);
        let err = handle.wait().await.unwrap_err();
        assert!(matches!(err, DeviceError::Connection(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_is_bounded_by_window() {
        let correlator = Correlator::new(Duration::from_millis(4000));
        let handle = correlator.register(&"pebble-1".into(), &detect(), 2);
        let id = handle.id();
        correlator.arm(id, frame_for(&handle), true);

        tokio::time::sleep(Duration::from_millis(3000)).await;
        assert!(matches!(correlator.nack(id), NackOutcome::Retry { .. }));
        assert!(correlator.begin_recovery(id));

        // the window restarted at the nack
        tokio::time::sleep(Duration::from_millis(3000)).await;
        assert_eq!(correlator.state(id), Some(PendingState::Recovering));

        let err = handle.wait().await.unwrap_err();
        assert!(matches!(err, DeviceError::Timeout(_)));
        assert_eq!(correlator.pending_count(), 0);
        assert!(correlator.resume(id).is_none());
    }

    #[tokio::test]
    async fn test_supersede_same_capability() {
        let correlator = Correlator::new(Duration::from_secs(4));
        let first = correlator.register(&"hvc-1".into(), &detect(), 0);
        let other_device = correlator.register(&"hvc-2".into(), &detect(), 0);
        let second = correlator.register(&"hvc-1".into(), &detect(), 0);

        let err = first.wait().await.unwrap_err();
        assert!(matches!(err, DeviceError::IllegalDeviceState(_)));
        assert_eq!(correlator.pending_count(), 2);
        assert!(correlator.state(second.id()).is_some());
        assert!(correlator.state(other_device.id()).is_some());
    }

    #[tokio::test]
    async fn test_cancel_device() {
        let correlator = Correlator::new(Duration::from_secs(4));
        let a = correlator.register(&"hvc-1".into(), &detect(), 0);
        let b = correlator.register(
            &"hvc-1".into(),
            &Capability::new("humanDetection", None, "onHandDetection"),
            0,
        );
        let c = correlator.register(&"hvc-2".into(), &detect(), 0);

        correlator.on_device_removed(&"hvc-1".into());
        assert!(matches!(a.wait().await, Err(DeviceError::Removed(_))));
        assert!(matches!(b.wait().await, Err(DeviceError::Removed(_))));
        assert_eq!(correlator.pending_count(), 1);

        assert_eq!(correlator.cancel_all(DeviceError::unknown("shutdown")), 1);
        assert!(matches!(c.wait().await, Err(DeviceError::Unknown(_))));
    }

    #[tokio::test]
    async fn test_ids_are_unique() {
        let correlator = Correlator::new(Duration::from_secs(4));
        let a = correlator.register(&"x".into(), &detect(), 0);
        let b = correlator.register(&"y".into(), &detect(), 0);
        assert_ne!(a.id(), b.id());
        assert_eq!(correlator.service_of(b.id()), Some(ServiceId::new("y")));
    }
}
