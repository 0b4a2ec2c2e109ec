//! End-to-end tests of the wrapper against a scripted transport.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use tokio::sync::mpsc;
use uuid::Uuid;

use bleq_core::config::Config;
use bleq_core::types::PeripheralId;
use bleq_gatt::{
    Advertisement, BleWrapper, Channel, ChannelEvent, GattError, Reason, ScanEvent, SessionState,
    Status, Transport, WrapperEvent,
};

type CallLog = Arc<Mutex<Vec<String>>>;

/// What the scripted transport does with each request kind
#[derive(Debug, Clone)]
struct Behavior {
    /// Delay before the connected event; `None` never calls back
    connect_reply: Option<Duration>,
    /// Report connect failure instead of success
    connect_fail: bool,
    /// Delay, status and data of read replies; `None` never calls back
    read_reply: Option<(Duration, Status, Bytes)>,
    /// Delay and status of write replies; `None` never calls back
    write_reply: Option<(Duration, Status)>,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            connect_reply: Some(Duration::from_millis(50)),
            connect_fail: false,
            read_reply: Some((
                Duration::from_millis(30),
                Status::SUCCESS,
                Bytes::from_static(b"\x2A"),
            )),
            write_reply: Some((Duration::from_millis(30), Status::SUCCESS)),
        }
    }
}

#[derive(Debug)]
struct ScriptedTransport {
    behavior: Behavior,
    log: CallLog,
    drivers: Mutex<HashMap<PeripheralId, mpsc::Sender<ChannelEvent>>>,
    scan_tx: Mutex<Option<mpsc::Sender<Advertisement>>>,
}

impl ScriptedTransport {
    fn new(behavior: Behavior) -> Self {
        Self {
            behavior,
            log: Arc::new(Mutex::new(Vec::new())),
            drivers: Mutex::new(HashMap::new()),
            scan_tx: Mutex::new(None),
        }
    }

    fn log_entries(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn driver(&self, peripheral: &PeripheralId) -> mpsc::Sender<ChannelEvent> {
        self.drivers
            .lock()
            .unwrap()
            .get(peripheral)
            .cloned()
            .expect("no driver for peripheral")
    }

    fn scan_sender(&self) -> mpsc::Sender<Advertisement> {
        self.scan_tx.lock().unwrap().clone().expect("not scanning")
    }
}

#[derive(Debug)]
struct ScriptedChannel {
    behavior: Behavior,
    log: CallLog,
    events: mpsc::Sender<ChannelEvent>,
}

#[async_trait]
impl Channel for ScriptedChannel {
    async fn discover_services(&self) -> bleq_gatt::Result<()> {
        self.log.lock().unwrap().push("discover issued".into());
        let events = self.events.clone();
        let log = self.log.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            log.lock().unwrap().push("discover replied".into());
            let _ = events
                .send(ChannelEvent::ServicesDiscovered {
                    status: Status::SUCCESS,
                })
                .await;
        });
        Ok(())
    }

    async fn read(&self, _service: Uuid, characteristic: Uuid) -> bleq_gatt::Result<()> {
        self.log.lock().unwrap().push("read issued".into());
        if let Some((delay, status, data)) = self.behavior.read_reply.clone() {
            let events = self.events.clone();
            let log = self.log.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                log.lock().unwrap().push("read replied".into());
                let _ = events
                    .send(ChannelEvent::ReadResult {
                        characteristic,
                        status,
                        data: Some(data),
                    })
                    .await;
            });
        }
        Ok(())
    }

    async fn write(
        &self,
        _service: Uuid,
        characteristic: Uuid,
        _data: Bytes,
    ) -> bleq_gatt::Result<()> {
        self.log.lock().unwrap().push("write issued".into());
        if let Some((delay, status)) = self.behavior.write_reply {
            let events = self.events.clone();
            let log = self.log.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                log.lock().unwrap().push("write replied".into());
                let _ = events
                    .send(ChannelEvent::WriteResult {
                        characteristic,
                        status,
                    })
                    .await;
            });
        }
        Ok(())
    }

    async fn write_descriptor(
        &self,
        _service: Uuid,
        _characteristic: Uuid,
        _descriptor: Uuid,
        data: Bytes,
    ) -> bleq_gatt::Result<()> {
        self.log
            .lock()
            .unwrap()
            .push(format!("descriptor {:02X?}", data.as_ref()));
        Ok(())
    }

    async fn disconnect(&self) -> bleq_gatt::Result<()> {
        self.log.lock().unwrap().push("disconnect issued".into());
        let events = self.events.clone();
        tokio::spawn(async move {
            let _ = events.send(ChannelEvent::Disconnected).await;
        });
        Ok(())
    }

    async fn close(&self) {
        self.log.lock().unwrap().push("closed".into());
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    async fn connect(
        &self,
        peripheral: &PeripheralId,
        events: mpsc::Sender<ChannelEvent>,
    ) -> bleq_gatt::Result<Arc<dyn Channel>> {
        self.log
            .lock()
            .unwrap()
            .push(format!("connect {}", peripheral));
        self.drivers
            .lock()
            .unwrap()
            .insert(peripheral.clone(), events.clone());

        if self.behavior.connect_fail {
            let failed = events.clone();
            tokio::spawn(async move {
                let _ = failed
                    .send(ChannelEvent::ConnectFailed { status: Status(133) })
                    .await;
            });
        } else if let Some(delay) = self.behavior.connect_reply {
            let connected = events.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                let _ = connected.send(ChannelEvent::Connected).await;
            });
        }

        Ok(Arc::new(ScriptedChannel {
            behavior: self.behavior.clone(),
            log: self.log.clone(),
            events,
        }))
    }

    async fn start_scan(&self, events: mpsc::Sender<Advertisement>) -> bleq_gatt::Result<()> {
        self.log.lock().unwrap().push("scan started".into());
        *self.scan_tx.lock().unwrap() = Some(events);
        Ok(())
    }

    async fn stop_scan(&self) {
        if self.scan_tx.lock().unwrap().take().is_some() {
            self.log.lock().unwrap().push("scan stopped".into());
        }
    }
}

fn peripheral() -> PeripheralId {
    PeripheralId::new("AA:BB:CC:DD:EE:FF")
}

fn wrapper_with(behavior: Behavior) -> (BleWrapper, Arc<ScriptedTransport>) {
    let transport = Arc::new(ScriptedTransport::new(behavior));
    let wrapper = BleWrapper::new(transport.clone(), Config::default());
    wrapper.start();
    (wrapper, transport)
}

async fn connect_ready(wrapper: &BleWrapper, id: &PeripheralId) {
    let outcome = wrapper.connect(id).await.unwrap();
    assert!(outcome.success);
    for _ in 0..200 {
        if wrapper.session_state(id).await == Some(SessionState::Ready) {
            return;
        }
        // Under start_paused, sleeping lets the clock auto-advance;
        // yield_now would keep the runtime unparked forever.
        tokio::time::sleep(Duration::from_millis(1)).await;
    }
    panic!("session never reached Ready");
}

#[tokio::test(start_paused = true)]
async fn writes_are_strictly_serialized() {
    let (wrapper, transport) = wrapper_with(Behavior::default());
    let id = peripheral();
    connect_ready(&wrapper, &id).await;

    let service = Uuid::new_v4();
    let characteristic = Uuid::new_v4();
    for _ in 0..3 {
        let outcome = wrapper
            .write(&id, service, characteristic, Bytes::from_static(b"\x01"))
            .await
            .unwrap();
        assert!(outcome.success);
    }

    // Each write must be answered before the next one reaches the radio
    let writes: Vec<String> = transport
        .log_entries()
        .into_iter()
        .filter(|e| e.starts_with("write"))
        .collect();
    assert_eq!(
        writes,
        vec![
            "write issued",
            "write replied",
            "write issued",
            "write replied",
            "write issued",
            "write replied",
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn silent_connect_times_out() {
    let (wrapper, _transport) = wrapper_with(Behavior {
        connect_reply: None,
        ..Behavior::default()
    });
    let id = peripheral();

    let outcome = wrapper.connect(&id).await.unwrap();
    assert!(!outcome.success);
    assert_eq!(outcome.reason, Reason::Timeout);
    assert_eq!(
        wrapper.session_state(&id).await,
        Some(SessionState::Disconnected)
    );
}

#[tokio::test(start_paused = true)]
async fn connect_failure_reports_status() {
    let (wrapper, _transport) = wrapper_with(Behavior {
        connect_fail: true,
        ..Behavior::default()
    });
    let id = peripheral();

    let outcome = wrapper.connect(&id).await.unwrap();
    assert!(!outcome.success);
    assert_eq!(outcome.reason, Reason::Failed);
    assert_eq!(outcome.status, Some(Status(133)));
}

#[tokio::test(start_paused = true)]
async fn queued_read_waits_for_connect() {
    let (wrapper, transport) = wrapper_with(Behavior {
        connect_reply: Some(Duration::from_millis(200)),
        ..Behavior::default()
    });
    let id = peripheral();

    // Queue connect and read back to back; the read must not reach the
    // radio until the connect task has fully resolved.
    let outcome = wrapper.connect(&id).await.unwrap();
    assert!(outcome.success);
    let outcome = wrapper.read(&id, Uuid::new_v4(), Uuid::new_v4()).await.unwrap();
    assert!(outcome.success);

    let log = transport.log_entries();
    let connect_pos = log.iter().position(|e| e.starts_with("connect")).unwrap();
    let read_pos = log.iter().position(|e| e == "read issued").unwrap();
    assert!(connect_pos < read_pos);
}

#[tokio::test(start_paused = true)]
async fn write_while_disconnected_fails_without_waiting() {
    let (wrapper, transport) = wrapper_with(Behavior {
        connect_fail: true,
        ..Behavior::default()
    });
    let id = peripheral();

    // The failed connect leaves a known but disconnected session
    let outcome = wrapper.connect(&id).await.unwrap();
    assert!(!outcome.success);

    let before = tokio::time::Instant::now();
    let outcome = wrapper
        .write(&id, Uuid::new_v4(), Uuid::new_v4(), Bytes::from_static(b"\x01"))
        .await
        .unwrap();
    assert!(!outcome.success);
    assert_eq!(outcome.reason, Reason::NotConnected);
    // Resolved without burning the operation timeout
    assert!(before.elapsed() < Duration::from_millis(100));
    assert!(!transport.log_entries().contains(&"write issued".to_string()));
}

#[tokio::test(start_paused = true)]
async fn stale_reply_does_not_resolve_newer_request() {
    let (wrapper, transport) = wrapper_with(Behavior {
        // Reads never reply on their own; the test injects replies
        read_reply: None,
        ..Behavior::default()
    });
    let id = peripheral();
    connect_ready(&wrapper, &id).await;
    let driver = transport.driver(&id);

    // First read times out with its native request still outstanding
    let outcome = wrapper.read(&id, Uuid::new_v4(), Uuid::new_v4()).await.unwrap();
    assert_eq!(outcome.reason, Reason::Timeout);

    // Second read goes out; the reply to the first arrives before the
    // reply to the second and must be dropped, not misattributed.
    let read = {
        let wrapper = &wrapper;
        let id = id.clone();
        async move { wrapper.read(&id, Uuid::new_v4(), Uuid::new_v4()).await }
    };
    let inject = async {
        // Give the second read time to reach the radio
        tokio::time::sleep(Duration::from_millis(100)).await;
        driver
            .send(ChannelEvent::ReadResult {
                characteristic: Uuid::new_v4(),
                status: Status::SUCCESS,
                data: Some(Bytes::from_static(b"stale")),
            })
            .await
            .unwrap();
        driver
            .send(ChannelEvent::ReadResult {
                characteristic: Uuid::new_v4(),
                status: Status::SUCCESS,
                data: Some(Bytes::from_static(b"fresh")),
            })
            .await
            .unwrap();
    };
    let (outcome, _) = tokio::join!(read, inject);
    let outcome = outcome.unwrap();
    assert!(outcome.success);
    assert_eq!(outcome.data, Some(Bytes::from_static(b"fresh")));
}

#[tokio::test(start_paused = true)]
async fn unsolicited_disconnect_fails_outstanding_request() {
    let (wrapper, transport) = wrapper_with(Behavior {
        read_reply: None,
        ..Behavior::default()
    });
    let id = peripheral();
    connect_ready(&wrapper, &id).await;
    let driver = transport.driver(&id);

    let read = {
        let wrapper = &wrapper;
        let id = id.clone();
        async move { wrapper.read(&id, Uuid::new_v4(), Uuid::new_v4()).await }
    };
    let drop_link = async {
        tokio::time::sleep(Duration::from_millis(100)).await;
        driver.send(ChannelEvent::Disconnected).await.unwrap();
    };
    let (outcome, _) = tokio::join!(read, drop_link);
    let outcome = outcome.unwrap();
    assert!(!outcome.success);
    assert_eq!(outcome.reason, Reason::ConnectionLost);
    assert_eq!(
        wrapper.session_state(&id).await,
        Some(SessionState::Disconnected)
    );
}

#[tokio::test(start_paused = true)]
async fn requested_disconnect_emits_events() {
    let (wrapper, _transport) = wrapper_with(Behavior::default());
    let id = peripheral();
    connect_ready(&wrapper, &id).await;
    let mut events = wrapper.subscribe_events();

    wrapper.disconnect(&id).await.unwrap();

    let mut saw_disconnected = false;
    let mut saw_closed = false;
    while !(saw_disconnected && saw_closed) {
        match events.recv().await.unwrap() {
            WrapperEvent::Session { event, .. } => match event {
                bleq_gatt::SessionEvent::Disconnected => saw_disconnected = true,
                bleq_gatt::SessionEvent::Closed => saw_closed = true,
                _ => {}
            },
            _ => {}
        }
    }
    assert_eq!(
        wrapper.session_state(&id).await,
        Some(SessionState::Disconnected)
    );
}

#[tokio::test(start_paused = true)]
async fn reconnect_after_disconnect_works() {
    let (wrapper, _transport) = wrapper_with(Behavior::default());
    let id = peripheral();
    connect_ready(&wrapper, &id).await;

    wrapper.disconnect(&id).await.unwrap();
    for _ in 0..200 {
        if wrapper.session_state(&id).await == Some(SessionState::Disconnected) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
    }

    // The session persists and can connect again
    connect_ready(&wrapper, &id).await;
}

#[tokio::test(start_paused = true)]
async fn scan_filters_duplicates_and_finishes() {
    let (wrapper, transport) = wrapper_with(Behavior::default());
    let mut events = wrapper.subscribe_events();

    wrapper.start_scan().await.unwrap();
    let tx = transport.scan_sender();
    for mac in ["AA:00:00:00:00:01", "AA:00:00:00:00:01", "AA:00:00:00:00:02"] {
        tx.send(Advertisement {
            peripheral: PeripheralId::new(mac),
            name: None,
            rssi: -50,
            discovered_at: Utc::now(),
        })
        .await
        .unwrap();
    }

    let mut seen = Vec::new();
    loop {
        match events.recv().await.unwrap() {
            WrapperEvent::Scan(ScanEvent::Advertisement(adv)) => {
                seen.push(adv.peripheral.to_string());
            }
            WrapperEvent::Scan(ScanEvent::Finished) => break,
            _ => {}
        }
    }
    // The configured deadline ended the scan; the repeat was dropped
    assert_eq!(seen, vec!["AA:00:00:00:00:01", "AA:00:00:00:00:02"]);
}

#[tokio::test(start_paused = true)]
async fn connect_stops_running_scan() {
    let (wrapper, transport) = wrapper_with(Behavior::default());
    let id = peripheral();

    wrapper.start_scan().await.unwrap();
    connect_ready(&wrapper, &id).await;

    let log = transport.log_entries();
    let stop_pos = log.iter().position(|e| e == "scan stopped").unwrap();
    let connect_pos = log.iter().position(|e| e.starts_with("connect")).unwrap();
    assert!(stop_pos < connect_pos);
}

#[tokio::test(start_paused = true)]
async fn subscribe_writes_enable_descriptor() {
    let (wrapper, transport) = wrapper_with(Behavior::default());
    let id = peripheral();
    connect_ready(&wrapper, &id).await;

    wrapper
        .subscribe(&id, Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4())
        .await
        .unwrap();
    wrapper
        .unsubscribe(&id, Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4())
        .await
        .unwrap();

    let log = transport.log_entries();
    assert!(log.contains(&"descriptor [01, 00]".to_string()));
    assert!(log.contains(&"descriptor [00, 00]".to_string()));
}

#[tokio::test(start_paused = true)]
async fn notifications_flow_to_observers() {
    let (wrapper, transport) = wrapper_with(Behavior::default());
    let id = peripheral();
    connect_ready(&wrapper, &id).await;
    let mut events = wrapper.subscribe_events();
    let driver = transport.driver(&id);

    let characteristic = Uuid::new_v4();
    driver
        .send(ChannelEvent::ValueChanged {
            characteristic,
            data: Bytes::from_static(b"\x63"),
        })
        .await
        .unwrap();

    loop {
        if let WrapperEvent::Session {
            event: bleq_gatt::SessionEvent::ValueChanged { characteristic: c, data },
            ..
        } = events.recv().await.unwrap()
        {
            assert_eq!(c, characteristic);
            assert_eq!(data, Bytes::from_static(b"\x63"));
            break;
        }
    }
}

#[tokio::test(start_paused = true)]
async fn full_queue_rejects_submissions() {
    let transport = Arc::new(ScriptedTransport::new(Behavior {
        connect_reply: None,
        ..Behavior::default()
    }));
    let mut config = Config::default();
    config.queue.capacity = 1;
    let wrapper = Arc::new(BleWrapper::new(transport, config));
    wrapper.start();
    let id = peripheral();

    // The silent connect occupies the worker until its timeout fires
    let connecting = tokio::spawn({
        let wrapper = wrapper.clone();
        let id = id.clone();
        async move { wrapper.connect(&id).await }
    });
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }

    // One submission fits in the queue behind the running connect
    let queued = tokio::spawn({
        let wrapper = wrapper.clone();
        let id = id.clone();
        async move { wrapper.read(&id, Uuid::new_v4(), Uuid::new_v4()).await }
    });
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }

    // The next one is rejected instead of blocking
    let rejected = wrapper.read(&id, Uuid::new_v4(), Uuid::new_v4()).await;
    assert!(matches!(
        rejected,
        Err(GattError::Core(bleq_core::error::Error::QueueFull))
    ));

    let outcome = connecting.await.unwrap().unwrap();
    assert_eq!(outcome.reason, Reason::Timeout);
    let outcome = queued.await.unwrap().unwrap();
    assert_eq!(outcome.reason, Reason::NotConnected);
}

#[tokio::test(start_paused = true)]
async fn stop_tears_everything_down() {
    let (wrapper, _transport) = wrapper_with(Behavior::default());
    let id = peripheral();
    connect_ready(&wrapper, &id).await;

    wrapper.stop().await;
    assert!(!wrapper.is_running());
    assert!(wrapper.peripherals().is_empty());
    assert!(matches!(
        wrapper.connect(&id).await,
        Err(GattError::NotRunning)
    ));
}
