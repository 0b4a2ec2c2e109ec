/*!
 * Connection sessions for bleq.
 *
 * A [`DeviceSession`] owns the single physical channel to one peripheral,
 * tracks its lifecycle, and correlates every asynchronous completion (or
 * timeout) with the one pending request it belongs to.
 *
 * Two contexts touch a session: the task queue worker issuing operations,
 * and the driver event dispatch delivering completions. Both mutate the
 * pending-request slots under the session lock, and a resolution always
 * clears its slot before invoking the listener, so each request resolves
 * at most once.
 *
 * Every issued request carries a monotonically increasing [`RequestId`].
 * A timeout and a driver callback race to take the slot for their
 * request; the loser finds the slot empty or holding a newer id and is
 * dropped. This makes a late callback for a timed-out request detectable
 * instead of being misattributed to the next request of the same kind.
 */
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use bleq_core::types::{CharacteristicId, DescriptorId, OperationKind, PeripheralId, ServiceId};
use bleq_core::utils::hex_str;

use crate::error::{GattError, Result};
use crate::transport::{
    Channel, ChannelEvent, Status, Transport, NOTIFY_DISABLE, NOTIFY_ENABLE,
};

/// Capacity of the per-session event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Capacity of the driver event channel handed to the transport
const DRIVER_CHANNEL_CAPACITY: usize = 32;

/// Monotonic identity of one issued request within a session
pub type RequestId = u64;

/// Connection lifecycle state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// No physical connection
    Disconnected,
    /// Native connect issued, waiting for the driver
    Connecting,
    /// Physical connection established
    Connected,
    /// Connected, service discovery in progress
    ServiceDiscovery,
    /// Services discovered, fully usable
    Ready,
    /// Teardown requested, waiting for the disconnect callback
    Closing,
}

impl SessionState {
    /// Whether operations may be issued against the channel
    pub fn is_connected(&self) -> bool {
        matches!(
            self,
            SessionState::Connected | SessionState::ServiceDiscovery | SessionState::Ready
        )
    }
}

/// Why a request resolved the way it did
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Reason {
    /// The operation completed successfully
    Success,
    /// Connect requested while already connected; nothing was issued
    AlreadyConnected,
    /// The driver reported a non-success status
    Failed,
    /// No resolution arrived within the caller's deadline
    Timeout,
    /// The operation was attempted while disconnected
    NotConnected,
    /// The connection dropped while the request was outstanding
    ConnectionLost,
}

/// The single resolution every connect/read/write request receives
#[derive(Debug, Clone)]
pub struct Outcome {
    /// Whether the operation succeeded
    pub success: bool,
    /// Why it resolved this way
    pub reason: Reason,
    /// Raw driver status, where one was reported
    pub status: Option<Status>,
    /// Read data, for successful reads
    pub data: Option<Bytes>,
}

impl Outcome {
    /// A successful resolution
    pub fn success(reason: Reason) -> Self {
        Self {
            success: true,
            reason,
            status: None,
            data: None,
        }
    }

    /// A failed resolution
    pub fn failure(reason: Reason) -> Self {
        Self {
            success: false,
            reason,
            status: None,
            data: None,
        }
    }

    /// Attach the raw driver status
    pub fn with_status(mut self, status: Status) -> Self {
        self.status = Some(status);
        self
    }

    /// Attach read data
    pub fn with_data(mut self, data: Option<Bytes>) -> Self {
        self.data = data;
        self
    }
}

/// Observer events emitted by a session
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A connection attempt finished
    ConnectComplete {
        /// Whether the connection was established
        success: bool,
    },
    /// Service discovery finished; the session is fully usable
    ServicesReady,
    /// The connection dropped
    Disconnected,
    /// The channel handle was released
    Closed,
    /// A read request resolved
    ReadDone {
        /// Whether the read succeeded
        success: bool,
        /// The data, when it did
        data: Option<Bytes>,
    },
    /// A write request resolved
    WriteDone {
        /// Whether the write succeeded
        success: bool,
    },
    /// Unsolicited notification with a new characteristic value
    ValueChanged {
        /// The characteristic whose value changed
        characteristic: CharacteristicId,
        /// The new value
        data: Bytes,
    },
}

/// One outstanding request: its identity, its one-shot listener, and the
/// timeout racing against its completion.
#[derive(Debug)]
struct PendingRequest {
    id: RequestId,
    tx: oneshot::Sender<Outcome>,
    timeout: JoinHandle<()>,
}

impl PendingRequest {
    /// Resolve the request, disarming its timeout first
    fn resolve(self, outcome: Outcome) {
        self.timeout.abort();
        let _ = self.tx.send(outcome);
    }

    /// Drop the request without resolving it
    fn discard(self) {
        self.timeout.abort();
    }
}

/// Per-kind pending slots and the queues of ids issued to the native
/// channel that have not called back yet.
#[derive(Debug, Default)]
struct Slots {
    connect: Option<PendingRequest>,
    read: Option<PendingRequest>,
    write: Option<PendingRequest>,
    issued_read: VecDeque<RequestId>,
    issued_write: VecDeque<RequestId>,
}

impl Slots {
    fn slot_mut(&mut self, kind: OperationKind) -> &mut Option<PendingRequest> {
        match kind {
            OperationKind::Connect => &mut self.connect,
            OperationKind::Read => &mut self.read,
            OperationKind::Write => &mut self.write,
        }
    }

    /// Take the pending request of `kind` only if it is still request `id`
    fn take_if(&mut self, kind: OperationKind, id: RequestId) -> Option<PendingRequest> {
        let slot = self.slot_mut(kind);
        match slot {
            Some(pending) if pending.id == id => slot.take(),
            _ => None,
        }
    }

    /// Take the pending request matching the oldest issued-but-unanswered
    /// id of `kind`, dropping the callback as stale on a mismatch.
    ///
    /// A request whose callback never arrives leaves its id at the
    /// queue head, so the next request's genuine callback is dropped
    /// here and that request resolves by timeout. One request is
    /// sacrificed rather than risking misattribution.
    fn take_for_callback(&mut self, kind: OperationKind) -> Option<PendingRequest> {
        let issued = match kind {
            OperationKind::Read => &mut self.issued_read,
            OperationKind::Write => &mut self.issued_write,
            OperationKind::Connect => return self.connect.take(),
        };
        let answered = issued.pop_front();
        let slot = self.slot_mut(kind);
        match (answered, slot.as_ref().map(|p| p.id)) {
            (Some(a), Some(p)) if a == p => slot.take(),
            (answered, _) => {
                warn!(
                    "stale {} callback dropped (request {:?})",
                    kind, answered
                );
                None
            }
        }
    }

    fn drop_issued(&mut self, kind: OperationKind, id: RequestId) {
        match kind {
            OperationKind::Read => self.issued_read.retain(|i| *i != id),
            OperationKind::Write => self.issued_write.retain(|i| *i != id),
            OperationKind::Connect => {}
        }
    }

    /// Take every pending request and forget all issued ids
    fn take_all(&mut self) -> Vec<PendingRequest> {
        self.issued_read.clear();
        self.issued_write.clear();
        [&mut self.connect, &mut self.read, &mut self.write]
            .into_iter()
            .filter_map(|slot| slot.take())
            .collect()
    }
}

#[derive(Debug)]
struct SessionInner {
    state: SessionState,
    channel: Option<Arc<dyn Channel>>,
    dispatch: Option<JoinHandle<()>>,
    // Identity of the current connect attempt. Events delivered by a
    // superseded attempt's dispatch loop carry an older id and are
    // dropped before they can touch the slots.
    attempt: RequestId,
    slots: Slots,
}

#[derive(Debug)]
struct Shared {
    peripheral: PeripheralId,
    inner: Mutex<SessionInner>,
    events_tx: broadcast::Sender<SessionEvent>,
    next_request: AtomicU64,
}

impl Shared {
    fn next_id(&self) -> RequestId {
        self.next_request.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn emit(&self, event: SessionEvent) {
        trace!("{} event: {:?}", self.peripheral, event);
        let _ = self.events_tx.send(event);
    }
}

/// A connection session owning the one physical channel to a peripheral.
///
/// Created on first reference to a peripheral id and persisting across
/// connect/disconnect cycles; destroyed only when the owning registry
/// shuts it down.
#[derive(Debug)]
pub struct DeviceSession {
    transport: Arc<dyn Transport>,
    shared: Arc<Shared>,
}

impl DeviceSession {
    /// Create a session for one peripheral
    pub fn new(peripheral: PeripheralId, transport: Arc<dyn Transport>) -> Self {
        debug!("creating session for {}", peripheral);
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            transport,
            shared: Arc::new(Shared {
                peripheral,
                inner: Mutex::new(SessionInner {
                    state: SessionState::Disconnected,
                    channel: None,
                    dispatch: None,
                    attempt: 0,
                    slots: Slots::default(),
                }),
                events_tx,
                next_request: AtomicU64::new(0),
            }),
        }
    }

    /// The peripheral this session belongs to
    pub fn peripheral(&self) -> &PeripheralId {
        &self.shared.peripheral
    }

    /// Subscribe to session observer events
    pub fn subscribe_events(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.events_tx.subscribe()
    }

    /// The current connection state
    pub async fn state(&self) -> SessionState {
        self.shared.inner.lock().await.state
    }

    /// Begin connecting to the peripheral.
    ///
    /// Returns the receiver of the request's single resolution. Already
    /// connected sessions resolve immediately as `AlreadyConnected`
    /// without touching the channel. On a successful connect the session
    /// starts service discovery on its own.
    pub async fn begin_connect(&self, timeout: Duration) -> oneshot::Receiver<Outcome> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.shared.inner.lock().await;

        if inner.state.is_connected() {
            debug!("{} already connected", self.shared.peripheral);
            let _ = tx.send(Outcome::success(Reason::AlreadyConnected));
            return rx;
        }
        if inner.state == SessionState::Connecting || inner.state == SessionState::Closing {
            warn!(
                "{} connect requested while {:?}",
                self.shared.peripheral, inner.state
            );
            let _ = tx.send(Outcome::failure(Reason::Failed));
            return rx;
        }

        let (driver_tx, driver_rx) = mpsc::channel(DRIVER_CHANNEL_CAPACITY);
        match self.transport.connect(&self.shared.peripheral, driver_tx).await {
            Ok(channel) => {
                let id = self.shared.next_id();
                info!(
                    "connecting to {} (request {}, timeout {:?})",
                    self.shared.peripheral, id, timeout
                );
                inner.state = SessionState::Connecting;
                inner.channel = Some(channel);
                inner.attempt = id;
                inner.slots.connect = Some(PendingRequest {
                    id,
                    tx,
                    timeout: arm_timeout(&self.shared, OperationKind::Connect, id, timeout),
                });
                inner.dispatch = Some(spawn_dispatch(self.shared.clone(), driver_rx, id));
            }
            Err(e) => {
                warn!("native connect to {} failed: {}", self.shared.peripheral, e);
                inner.state = SessionState::Disconnected;
                let _ = tx.send(Outcome::failure(Reason::Failed));
            }
        }
        rx
    }

    /// Begin a characteristic read.
    ///
    /// Resolves immediately as `NotConnected`, without arming a timeout
    /// or touching the channel, when the session is not connected.
    pub async fn begin_read(
        &self,
        service: ServiceId,
        characteristic: CharacteristicId,
        timeout: Duration,
    ) -> oneshot::Receiver<Outcome> {
        let (tx, rx) = oneshot::channel();
        let (channel, id) = {
            let mut inner = self.shared.inner.lock().await;
            let channel = match (&inner.state, inner.channel.clone()) {
                (state, Some(channel)) if state.is_connected() => channel,
                _ => {
                    debug!("{} read while not connected", self.shared.peripheral);
                    let _ = tx.send(Outcome::failure(Reason::NotConnected));
                    return rx;
                }
            };
            let id = self.shared.next_id();
            debug!(
                "{} read {} (request {}, timeout {:?})",
                self.shared.peripheral, characteristic, id, timeout
            );
            if let Some(old) = inner.slots.read.replace(PendingRequest {
                id,
                tx,
                timeout: arm_timeout(&self.shared, OperationKind::Read, id, timeout),
            }) {
                warn!("{} read slot replaced while pending", self.shared.peripheral);
                old.discard();
            }
            inner.slots.issued_read.push_back(id);
            (channel, id)
        };

        if let Err(e) = channel.read(service, characteristic).await {
            warn!("{} native read failed: {}", self.shared.peripheral, e);
            fail_issued(&self.shared, OperationKind::Read, id).await;
        }
        rx
    }

    /// Begin a characteristic write. Guarded like reads.
    pub async fn begin_write(
        &self,
        service: ServiceId,
        characteristic: CharacteristicId,
        data: Bytes,
        timeout: Duration,
    ) -> oneshot::Receiver<Outcome> {
        let (tx, rx) = oneshot::channel();
        let (channel, id) = {
            let mut inner = self.shared.inner.lock().await;
            let channel = match (&inner.state, inner.channel.clone()) {
                (state, Some(channel)) if state.is_connected() => channel,
                _ => {
                    debug!("{} write while not connected", self.shared.peripheral);
                    let _ = tx.send(Outcome::failure(Reason::NotConnected));
                    return rx;
                }
            };
            let id = self.shared.next_id();
            debug!(
                "{} write {} (request {}, data = {})",
                self.shared.peripheral,
                characteristic,
                id,
                hex_str(Some(&data))
            );
            if let Some(old) = inner.slots.write.replace(PendingRequest {
                id,
                tx,
                timeout: arm_timeout(&self.shared, OperationKind::Write, id, timeout),
            }) {
                warn!("{} write slot replaced while pending", self.shared.peripheral);
                old.discard();
            }
            inner.slots.issued_write.push_back(id);
            (channel, id)
        };

        if let Err(e) = channel.write(service, characteristic, data).await {
            warn!("{} native write failed: {}", self.shared.peripheral, e);
            fail_issued(&self.shared, OperationKind::Write, id).await;
        }
        rx
    }

    /// Enable notification delivery for one characteristic.
    ///
    /// Fire-and-forget: no result listener, no timeout. Value changes
    /// arrive as [`SessionEvent::ValueChanged`].
    pub async fn subscribe(
        &self,
        service: ServiceId,
        characteristic: CharacteristicId,
        descriptor: DescriptorId,
    ) -> Result<()> {
        let channel = self.connected_channel().await?;
        debug!("{} subscribe {}", self.shared.peripheral, characteristic);
        channel
            .write_descriptor(
                service,
                characteristic,
                descriptor,
                Bytes::from_static(&NOTIFY_ENABLE),
            )
            .await
    }

    /// Disable notification delivery for one characteristic
    pub async fn unsubscribe(
        &self,
        service: ServiceId,
        characteristic: CharacteristicId,
        descriptor: DescriptorId,
    ) -> Result<()> {
        let channel = self.connected_channel().await?;
        debug!("{} unsubscribe {}", self.shared.peripheral, characteristic);
        channel
            .write_descriptor(
                service,
                characteristic,
                descriptor,
                Bytes::from_static(&NOTIFY_DISABLE),
            )
            .await
    }

    /// Request a disconnect. Fire-and-forget: the driver's disconnect
    /// event drives the transition back to `Disconnected`.
    pub async fn disconnect(&self) {
        let channel = {
            let mut inner = self.shared.inner.lock().await;
            if inner.state.is_connected() {
                inner.state = SessionState::Closing;
            }
            inner.channel.clone()
        };
        if let Some(channel) = channel {
            debug!("{} disconnect requested", self.shared.peripheral);
            if let Err(e) = channel.disconnect().await {
                warn!("{} native disconnect failed: {}", self.shared.peripheral, e);
            }
        }
    }

    /// Release the channel handle. Idempotent and reachable from any
    /// state.
    pub async fn close(&self) {
        let (channel, dispatch) = {
            let mut inner = self.shared.inner.lock().await;
            inner.state = SessionState::Disconnected;
            (inner.channel.take(), inner.dispatch.take())
        };
        if let Some(channel) = channel {
            debug!("{} closing channel", self.shared.peripheral);
            channel.close().await;
            self.shared.emit(SessionEvent::Closed);
        }
        if let Some(dispatch) = dispatch {
            dispatch.abort();
        }
    }

    /// Registry-driven teardown: resolve everything outstanding as
    /// `ConnectionLost` and release the channel without emitting events.
    pub async fn shutdown(&self) {
        debug!("{} session shutting down", self.shared.peripheral);
        let (pending, channel, dispatch) = {
            let mut inner = self.shared.inner.lock().await;
            inner.state = SessionState::Disconnected;
            (
                inner.slots.take_all(),
                inner.channel.take(),
                inner.dispatch.take(),
            )
        };
        for request in pending {
            request.resolve(Outcome::failure(Reason::ConnectionLost));
        }
        if let Some(channel) = channel {
            channel.close().await;
        }
        if let Some(dispatch) = dispatch {
            dispatch.abort();
        }
    }

    async fn connected_channel(&self) -> Result<Arc<dyn Channel>> {
        let inner = self.shared.inner.lock().await;
        match (&inner.state, inner.channel.clone()) {
            (state, Some(channel)) if state.is_connected() => Ok(channel),
            _ => Err(GattError::NotConnected(self.shared.peripheral.clone())),
        }
    }
}

fn spawn_dispatch(
    shared: Arc<Shared>,
    mut rx: mpsc::Receiver<ChannelEvent>,
    attempt: RequestId,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if !handle_event(&shared, event, attempt).await {
                break;
            }
        }
        debug!("{} event dispatch ended", shared.peripheral);
    })
}

/// Handle one driver event. Returns false once the channel is released
/// and the dispatch loop should end. `attempt` is the connect attempt
/// this loop belongs to; events from a superseded attempt are dropped
/// and end the loop.
async fn handle_event(shared: &Arc<Shared>, event: ChannelEvent, attempt: RequestId) -> bool {
    match event {
        ChannelEvent::Connected => {
            let channel = {
                let mut inner = shared.inner.lock().await;
                if inner.attempt != attempt {
                    warn!(
                        "{} connected event from superseded attempt dropped",
                        shared.peripheral
                    );
                    return false;
                }
                if inner.state != SessionState::Connecting {
                    warn!(
                        "{} connected event in state {:?} ignored",
                        shared.peripheral, inner.state
                    );
                    return true;
                }
                info!("{} connected", shared.peripheral);
                inner.state = SessionState::Connected;
                if let Some(request) = inner.slots.connect.take() {
                    request.resolve(Outcome::success(Reason::Success));
                }
                inner.channel.clone()
            };
            shared.emit(SessionEvent::ConnectComplete { success: true });

            // Service discovery follows a successful connect automatically
            if let Some(channel) = channel {
                {
                    let mut inner = shared.inner.lock().await;
                    if inner.attempt == attempt {
                        inner.state = SessionState::ServiceDiscovery;
                    }
                }
                if let Err(e) = channel.discover_services().await {
                    warn!(
                        "{} failed to start service discovery: {}",
                        shared.peripheral, e
                    );
                    let _ = channel.disconnect().await;
                }
            }
            true
        }
        ChannelEvent::ConnectFailed { status } => {
            warn!("{} connect failed, status {:?}", shared.peripheral, status);
            let channel = {
                let mut inner = shared.inner.lock().await;
                if inner.attempt != attempt {
                    warn!(
                        "{} connect failure from superseded attempt dropped",
                        shared.peripheral
                    );
                    return false;
                }
                inner.state = SessionState::Disconnected;
                if let Some(request) = inner.slots.connect.take() {
                    request.resolve(Outcome::failure(Reason::Failed).with_status(status));
                }
                inner.dispatch = None;
                inner.channel.take()
            };
            shared.emit(SessionEvent::ConnectComplete { success: false });
            if let Some(channel) = channel {
                channel.close().await;
                shared.emit(SessionEvent::Closed);
            }
            false
        }
        ChannelEvent::Disconnected => {
            info!("{} disconnected", shared.peripheral);
            let (pending, channel) = {
                let mut inner = shared.inner.lock().await;
                if inner.attempt != attempt {
                    warn!(
                        "{} disconnect event from superseded attempt dropped",
                        shared.peripheral
                    );
                    return false;
                }
                inner.state = SessionState::Disconnected;
                inner.dispatch = None;
                (inner.slots.take_all(), inner.channel.take())
            };
            // Requests still outstanding will never hear back
            for request in pending {
                request.resolve(Outcome::failure(Reason::ConnectionLost));
            }
            shared.emit(SessionEvent::Disconnected);
            if let Some(channel) = channel {
                channel.close().await;
                shared.emit(SessionEvent::Closed);
            }
            false
        }
        ChannelEvent::ServicesDiscovered { status } => {
            {
                let inner = shared.inner.lock().await;
                if inner.attempt != attempt {
                    warn!(
                        "{} discovery event from superseded attempt dropped",
                        shared.peripheral
                    );
                    return false;
                }
            }
            if status.is_success() {
                info!("{} services discovered", shared.peripheral);
                let mut inner = shared.inner.lock().await;
                if inner.state == SessionState::ServiceDiscovery {
                    inner.state = SessionState::Ready;
                }
                drop(inner);
                shared.emit(SessionEvent::ServicesReady);
            } else {
                warn!(
                    "{} service discovery failed, status {:?}",
                    shared.peripheral, status
                );
                let channel = shared.inner.lock().await.channel.clone();
                if let Some(channel) = channel {
                    let _ = channel.disconnect().await;
                }
            }
            true
        }
        ChannelEvent::ReadResult {
            characteristic,
            status,
            data,
        } => {
            let success = status.is_success();
            debug!(
                "{} read {} {}, data = {}",
                shared.peripheral,
                characteristic,
                if success { "success" } else { "failed" },
                hex_str(data.as_deref())
            );
            let resolved = {
                let mut inner = shared.inner.lock().await;
                if inner.attempt != attempt {
                    warn!(
                        "{} read event from superseded attempt dropped",
                        shared.peripheral
                    );
                    return false;
                }
                inner.slots.take_for_callback(OperationKind::Read)
            };
            if let Some(request) = resolved {
                let reason = if success { Reason::Success } else { Reason::Failed };
                request.resolve(
                    Outcome {
                        success,
                        reason,
                        status: Some(status),
                        data: data.clone(),
                    },
                );
                shared.emit(SessionEvent::ReadDone { success, data });
            }
            true
        }
        ChannelEvent::WriteResult {
            characteristic,
            status,
        } => {
            let success = status.is_success();
            debug!(
                "{} write {} {}",
                shared.peripheral,
                characteristic,
                if success { "success" } else { "failed" }
            );
            let resolved = {
                let mut inner = shared.inner.lock().await;
                if inner.attempt != attempt {
                    warn!(
                        "{} write event from superseded attempt dropped",
                        shared.peripheral
                    );
                    return false;
                }
                inner.slots.take_for_callback(OperationKind::Write)
            };
            if let Some(request) = resolved {
                let reason = if success { Reason::Success } else { Reason::Failed };
                request.resolve(Outcome {
                    success,
                    reason,
                    status: Some(status),
                    data: None,
                });
                shared.emit(SessionEvent::WriteDone { success });
            }
            true
        }
        ChannelEvent::ValueChanged {
            characteristic,
            data,
        } => {
            {
                let inner = shared.inner.lock().await;
                if inner.attempt != attempt {
                    return false;
                }
            }
            trace!(
                "{} value changed on {}, data = {}",
                shared.peripheral,
                characteristic,
                hex_str(Some(&data))
            );
            shared.emit(SessionEvent::ValueChanged {
                characteristic,
                data,
            });
            true
        }
    }
}

/// Arm the timeout racing against request `id` of `kind`
fn arm_timeout(
    shared: &Arc<Shared>,
    kind: OperationKind,
    id: RequestId,
    timeout: Duration,
) -> JoinHandle<()> {
    let shared = shared.clone();
    tokio::spawn(async move {
        tokio::time::sleep(timeout).await;
        on_timeout(&shared, kind, id).await;
    })
}

async fn on_timeout(shared: &Arc<Shared>, kind: OperationKind, id: RequestId) {
    let (request, channel) = {
        let mut inner = shared.inner.lock().await;
        let Some(request) = inner.slots.take_if(kind, id) else {
            // The driver callback won the race
            return;
        };
        // A timed-out connect releases the channel; the native attempt
        // is abandoned, and any late connected event is ignored.
        // Read/write timeouts leave the native request outstanding; its
        // id stays in the issued queue so a late callback is detected
        // as stale.
        let channel = if kind == OperationKind::Connect {
            inner.state = SessionState::Disconnected;
            if let Some(dispatch) = inner.dispatch.take() {
                dispatch.abort();
            }
            inner.channel.take()
        } else {
            None
        };
        (request, channel)
    };
    warn!("{} {} request {} timed out", shared.peripheral, kind, id);
    request.resolve(Outcome::failure(Reason::Timeout));
    if kind == OperationKind::Connect {
        shared.emit(SessionEvent::ConnectComplete { success: false });
    }
    if let Some(channel) = channel {
        let _ = channel.disconnect().await;
        channel.close().await;
        shared.emit(SessionEvent::Closed);
    }
}

async fn fail_issued(shared: &Arc<Shared>, kind: OperationKind, id: RequestId) {
    let resolved = {
        let mut inner = shared.inner.lock().await;
        inner.slots.drop_issued(kind, id);
        inner.slots.take_if(kind, id)
    };
    if let Some(request) = resolved {
        request.resolve(Outcome::failure(Reason::Failed));
    }
}
