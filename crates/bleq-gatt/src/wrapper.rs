/*!
 * The bleq operation facade.
 *
 * [`BleWrapper`] ties the pieces together: callers hand it peripheral
 * ids and operations, and it serializes every connect, read and write
 * through one sequential task queue so at most one request is in flight
 * against the radio at a time. Each queued task issues its operation
 * against the peripheral's session and releases the queue only once the
 * session resolves the request, by callback or by timeout.
 */
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{broadcast, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use bleq_core::config::Config;
use bleq_core::taskqueue::{Completion, Task, TaskExecutor};
use bleq_core::types::{CharacteristicId, DescriptorId, PeripheralId, ServiceId};

use crate::error::{GattError, Result};
use crate::registry::SessionRegistry;
use crate::scanner::{ScanEvent, ScanOptions, Scanner};
use crate::session::{DeviceSession, Outcome, Reason, SessionEvent, SessionState};
use crate::transport::Transport;

/// Capacity of the wrapper event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Events emitted by the wrapper
#[derive(Debug, Clone)]
pub enum WrapperEvent {
    /// A session event, tagged with its peripheral
    Session {
        /// The peripheral the event belongs to
        peripheral: PeripheralId,
        /// The event itself
        event: SessionEvent,
    },
    /// A scan event
    Scan(ScanEvent),
}

/// The operation facade.
///
/// One instance per transport; callers construct it explicitly and pass
/// it around. Dropping the wrapper without calling
/// [`BleWrapper::stop`] leaves spawned workers to wind down on their
/// own.
#[derive(Debug)]
pub struct BleWrapper {
    config: Config,
    executor: Arc<TaskExecutor>,
    registry: Arc<SessionRegistry>,
    scanner: Arc<Scanner>,
    event_tx: broadcast::Sender<WrapperEvent>,
    forwards: Mutex<HashMap<PeripheralId, JoinHandle<()>>>,
    scan_forward: Mutex<Option<JoinHandle<()>>>,
}

impl BleWrapper {
    /// Create a wrapper over `transport` with the given configuration.
    ///
    /// Nothing runs until [`BleWrapper::start`] is called.
    pub fn new(transport: Arc<dyn Transport>, config: Config) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            executor: Arc::new(TaskExecutor::new(config.queue.capacity)),
            registry: Arc::new(SessionRegistry::new(transport.clone())),
            scanner: Arc::new(Scanner::new(transport)),
            config,
            event_tx,
            forwards: Mutex::new(HashMap::new()),
            scan_forward: Mutex::new(None),
        }
    }

    /// Start the task queue worker and event forwarding
    pub fn start(&self) {
        info!("starting wrapper (queue capacity {})", self.config.queue.capacity);
        self.executor.start();

        let Ok(mut scan_forward) = self.scan_forward.lock() else {
            return;
        };
        if scan_forward.is_some() {
            return;
        }
        let mut rx = self.scanner.subscribe_events();
        let event_tx = self.event_tx.clone();
        scan_forward.replace(tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        let _ = event_tx.send(WrapperEvent::Scan(event));
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("scan event forwarding lagged by {}", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }));
    }

    /// Stop everything: the scan, every session, and the task queue.
    ///
    /// Queued tasks that have not started are discarded; outstanding
    /// requests resolve as `ConnectionLost`.
    pub async fn stop(&self) {
        info!("stopping wrapper");
        self.scanner.stop().await;
        if let Err(e) = self.registry.shutdown_all().await {
            warn!("session teardown failed: {}", e);
        }
        self.executor.shutdown();

        if let Ok(mut forwards) = self.forwards.lock() {
            for (_, handle) in forwards.drain() {
                handle.abort();
            }
        }
        if let Ok(mut scan_forward) = self.scan_forward.lock() {
            if let Some(handle) = scan_forward.take() {
                handle.abort();
            }
        }
    }

    /// Whether the wrapper has been started and not stopped
    pub fn is_running(&self) -> bool {
        self.executor.is_running()
    }

    /// Subscribe to wrapper events
    pub fn subscribe_events(&self) -> broadcast::Receiver<WrapperEvent> {
        self.event_tx.subscribe()
    }

    /// Start a scan using the configured options
    pub async fn start_scan(&self) -> Result<()> {
        self.ensure_running()?;
        self.scanner
            .start(ScanOptions {
                filter_duplicates: self.config.scan.filter_duplicates,
                timeout: self.config.scan.timeout(),
            })
            .await
    }

    /// Stop an in-progress scan
    pub async fn stop_scan(&self) {
        self.scanner.stop().await;
    }

    /// Queue a connect to `peripheral` and wait for its resolution.
    ///
    /// The session is created if this is the first reference to the
    /// peripheral. An in-progress scan is stopped first. The returned
    /// outcome is the request's single resolution; queue-level failures
    /// surface as errors instead.
    pub async fn connect(&self, peripheral: &PeripheralId) -> Result<Outcome> {
        self.connect_with_timeout(peripheral, self.config.queue.connect_timeout())
            .await
    }

    /// [`BleWrapper::connect`] with an explicit timeout
    pub async fn connect_with_timeout(
        &self,
        peripheral: &PeripheralId,
        timeout: Duration,
    ) -> Result<Outcome> {
        self.ensure_running()?;
        // Scanning competes with connecting for the radio
        self.scanner.stop().await;

        let session = self.registry.get_or_create(peripheral)?;
        self.ensure_forwarding(peripheral, &session);

        let (tx, rx) = oneshot::channel();
        self.executor.submit(Box::new(ConnectTask {
            session,
            timeout,
            result: Some(tx),
        }))?;
        rx.await.map_err(|_| GattError::Abandoned)
    }

    /// Queue a characteristic read and wait for its resolution.
    ///
    /// Requires a session for `peripheral` to already exist.
    pub async fn read(
        &self,
        peripheral: &PeripheralId,
        service: ServiceId,
        characteristic: CharacteristicId,
    ) -> Result<Outcome> {
        self.read_with_timeout(
            peripheral,
            service,
            characteristic,
            self.config.queue.operation_timeout(),
        )
        .await
    }

    /// [`BleWrapper::read`] with an explicit timeout
    pub async fn read_with_timeout(
        &self,
        peripheral: &PeripheralId,
        service: ServiceId,
        characteristic: CharacteristicId,
        timeout: Duration,
    ) -> Result<Outcome> {
        self.ensure_running()?;
        let session = self.known_session(peripheral)?;

        let (tx, rx) = oneshot::channel();
        self.executor.submit(Box::new(ReadTask {
            session,
            service,
            characteristic,
            timeout,
            result: Some(tx),
        }))?;
        rx.await.map_err(|_| GattError::Abandoned)
    }

    /// Queue a characteristic write and wait for its resolution.
    pub async fn write(
        &self,
        peripheral: &PeripheralId,
        service: ServiceId,
        characteristic: CharacteristicId,
        data: Bytes,
    ) -> Result<Outcome> {
        self.write_with_timeout(
            peripheral,
            service,
            characteristic,
            data,
            self.config.queue.operation_timeout(),
        )
        .await
    }

    /// [`BleWrapper::write`] with an explicit timeout
    pub async fn write_with_timeout(
        &self,
        peripheral: &PeripheralId,
        service: ServiceId,
        characteristic: CharacteristicId,
        data: Bytes,
        timeout: Duration,
    ) -> Result<Outcome> {
        self.ensure_running()?;
        let session = self.known_session(peripheral)?;

        let (tx, rx) = oneshot::channel();
        self.executor.submit(Box::new(WriteTask {
            session,
            service,
            characteristic,
            data,
            timeout,
            result: Some(tx),
        }))?;
        rx.await.map_err(|_| GattError::Abandoned)
    }

    /// Enable notifications for a characteristic. Not queued; takes
    /// effect immediately against the session.
    pub async fn subscribe(
        &self,
        peripheral: &PeripheralId,
        service: ServiceId,
        characteristic: CharacteristicId,
        descriptor: DescriptorId,
    ) -> Result<()> {
        self.known_session(peripheral)?
            .subscribe(service, characteristic, descriptor)
            .await
    }

    /// Disable notifications for a characteristic
    pub async fn unsubscribe(
        &self,
        peripheral: &PeripheralId,
        service: ServiceId,
        characteristic: CharacteristicId,
        descriptor: DescriptorId,
    ) -> Result<()> {
        self.known_session(peripheral)?
            .unsubscribe(service, characteristic, descriptor)
            .await
    }

    /// Request a disconnect from `peripheral`. Not queued.
    pub async fn disconnect(&self, peripheral: &PeripheralId) -> Result<()> {
        self.known_session(peripheral)?.disconnect().await;
        Ok(())
    }

    /// The connection state of `peripheral`, if a session exists
    pub async fn session_state(&self, peripheral: &PeripheralId) -> Option<SessionState> {
        match self.registry.get(peripheral) {
            Ok(Some(session)) => Some(session.state().await),
            _ => None,
        }
    }

    /// Ids of every known peripheral
    pub fn peripherals(&self) -> Vec<PeripheralId> {
        self.registry.ids().unwrap_or_default()
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(GattError::NotRunning)
        }
    }

    fn known_session(&self, peripheral: &PeripheralId) -> Result<Arc<DeviceSession>> {
        self.registry
            .get(peripheral)?
            .ok_or_else(|| GattError::UnknownPeripheral(peripheral.clone()))
    }

    /// Forward session events into the wrapper's event channel, once
    /// per peripheral.
    fn ensure_forwarding(&self, peripheral: &PeripheralId, session: &Arc<DeviceSession>) {
        let Ok(mut forwards) = self.forwards.lock() else {
            return;
        };
        let alive = forwards
            .get(peripheral)
            .map(|h| !h.is_finished())
            .unwrap_or(false);
        if alive {
            return;
        }

        let mut rx = session.subscribe_events();
        let event_tx = self.event_tx.clone();
        let tag = peripheral.clone();
        forwards.insert(
            peripheral.clone(),
            tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(event) => {
                            let _ = event_tx.send(WrapperEvent::Session {
                                peripheral: tag.clone(),
                                event,
                            });
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("event forwarding for {} lagged by {}", tag, n);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }),
        );
    }
}

/// Queued connect. Holds the queue until the session resolves the
/// connect request.
struct ConnectTask {
    session: Arc<DeviceSession>,
    timeout: Duration,
    result: Option<oneshot::Sender<Outcome>>,
}

#[async_trait]
impl Task for ConnectTask {
    fn name(&self) -> &str {
        "connect"
    }

    async fn start(&mut self, done: Completion) -> bleq_core::error::Result<()> {
        debug!("connect task for {} starting", self.session.peripheral());
        let outcome_rx = self.session.begin_connect(self.timeout).await;
        let result = self.result.take();
        tokio::spawn(async move {
            let outcome = outcome_rx
                .await
                .unwrap_or_else(|_| Outcome::failure(Reason::ConnectionLost));
            if let Some(tx) = result {
                let _ = tx.send(outcome);
            }
            done.complete();
        });
        Ok(())
    }
}

/// Queued characteristic read
struct ReadTask {
    session: Arc<DeviceSession>,
    service: ServiceId,
    characteristic: CharacteristicId,
    timeout: Duration,
    result: Option<oneshot::Sender<Outcome>>,
}

#[async_trait]
impl Task for ReadTask {
    fn name(&self) -> &str {
        "read"
    }

    async fn start(&mut self, done: Completion) -> bleq_core::error::Result<()> {
        let outcome_rx = self
            .session
            .begin_read(self.service, self.characteristic, self.timeout)
            .await;
        let result = self.result.take();
        tokio::spawn(async move {
            let outcome = outcome_rx
                .await
                .unwrap_or_else(|_| Outcome::failure(Reason::ConnectionLost));
            if let Some(tx) = result {
                let _ = tx.send(outcome);
            }
            done.complete();
        });
        Ok(())
    }
}

/// Queued characteristic write
struct WriteTask {
    session: Arc<DeviceSession>,
    service: ServiceId,
    characteristic: CharacteristicId,
    data: Bytes,
    timeout: Duration,
    result: Option<oneshot::Sender<Outcome>>,
}

#[async_trait]
impl Task for WriteTask {
    fn name(&self) -> &str {
        "write"
    }

    async fn start(&mut self, done: Completion) -> bleq_core::error::Result<()> {
        let outcome_rx = self
            .session
            .begin_write(
                self.service,
                self.characteristic,
                self.data.clone(),
                self.timeout,
            )
            .await;
        let result = self.result.take();
        tokio::spawn(async move {
            let outcome = outcome_rx
                .await
                .unwrap_or_else(|_| Outcome::failure(Reason::ConnectionLost));
            if let Some(tx) = result {
                let _ = tx.send(outcome);
            }
            done.complete();
        });
        Ok(())
    }
}
