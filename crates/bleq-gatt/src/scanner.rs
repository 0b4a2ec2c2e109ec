/*!
 * Advertising scanner for bleq.
 *
 * Wraps the transport's scan with duplicate filtering and a scan
 * deadline. Results and the end-of-scan marker are broadcast as
 * [`ScanEvent`]s.
 */
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use bleq_core::types::PeripheralId;

use crate::error::Result;
use crate::transport::{Advertisement, Transport};

/// Capacity of the scan event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Capacity of the advertisement channel handed to the transport
const ADVERTISEMENT_CHANNEL_CAPACITY: usize = 64;

/// Events emitted while scanning
#[derive(Debug, Clone)]
pub enum ScanEvent {
    /// An advertisement passed the duplicate filter
    Advertisement(Advertisement),
    /// The scan ended, by deadline or by request
    Finished,
}

/// Options for one scan
#[derive(Debug, Clone)]
pub struct ScanOptions {
    /// Report each peripheral at most once per scan
    pub filter_duplicates: bool,
    /// How long the scan runs before stopping on its own
    pub timeout: Duration,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            filter_duplicates: true,
            timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Default)]
struct ScanTasks {
    forward: Option<JoinHandle<()>>,
    deadline: Option<JoinHandle<()>>,
}

/// Scanner owning at most one scan at a time.
#[derive(Debug)]
pub struct Scanner {
    transport: Arc<dyn Transport>,
    event_tx: broadcast::Sender<ScanEvent>,
    tasks: Mutex<ScanTasks>,
}

impl Scanner {
    /// Create a scanner backed by `transport`
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            transport,
            event_tx,
            tasks: Mutex::new(ScanTasks::default()),
        }
    }

    /// Subscribe to scan events
    pub fn subscribe_events(&self) -> broadcast::Receiver<ScanEvent> {
        self.event_tx.subscribe()
    }

    /// Whether a scan is currently running
    pub fn is_scanning(&self) -> bool {
        self.tasks
            .lock()
            .map(|t| t.forward.as_ref().map(|f| !f.is_finished()).unwrap_or(false))
            .unwrap_or(false)
    }

    /// Start a scan. A scan already in progress is stopped first.
    pub async fn start(&self, options: ScanOptions) -> Result<()> {
        if self.is_scanning() {
            debug!("scan already in progress, restarting");
            self.stop().await;
        }

        info!(
            "starting scan (timeout {:?}, filter_duplicates = {})",
            options.timeout, options.filter_duplicates
        );
        let (adv_tx, mut adv_rx) = mpsc::channel(ADVERTISEMENT_CHANNEL_CAPACITY);
        self.transport.start_scan(adv_tx).await?;

        let event_tx = self.event_tx.clone();
        let filter_duplicates = options.filter_duplicates;
        let forward = tokio::spawn(async move {
            let mut seen: HashSet<PeripheralId> = HashSet::new();
            while let Some(adv) = adv_rx.recv().await {
                if filter_duplicates && !seen.insert(adv.peripheral.clone()) {
                    trace!("duplicate advertisement from {} dropped", adv.peripheral);
                    continue;
                }
                debug!(
                    "advertisement from {} (rssi {})",
                    adv.peripheral, adv.rssi
                );
                let _ = event_tx.send(ScanEvent::Advertisement(adv));
            }
        });

        let transport = self.transport.clone();
        let event_tx = self.event_tx.clone();
        let deadline = tokio::spawn(async move {
            tokio::time::sleep(options.timeout).await;
            debug!("scan deadline reached");
            transport.stop_scan().await;
            let _ = event_tx.send(ScanEvent::Finished);
        });

        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.forward = Some(forward);
            tasks.deadline = Some(deadline);
        } else {
            warn!("scanner state lock poisoned");
        }
        Ok(())
    }

    /// Stop the scan. Idempotent: stopping an idle scanner is a no-op
    /// and emits nothing.
    pub async fn stop(&self) {
        let (forward, deadline) = match self.tasks.lock() {
            Ok(mut tasks) => (tasks.forward.take(), tasks.deadline.take()),
            Err(_) => (None, None),
        };
        let Some(forward) = forward else {
            return;
        };
        debug!("stopping scan");
        self.transport.stop_scan().await;
        forward.abort();
        if let Some(deadline) = deadline {
            deadline.abort();
        }
        let _ = self.event_tx.send(ScanEvent::Finished);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::GattError;
    use crate::transport::{Channel, ChannelEvent};
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::Mutex as StdMutex;

    /// Transport that hands the advertisement sender to the test
    #[derive(Debug, Default)]
    struct ScanTransport {
        adv_tx: StdMutex<Option<mpsc::Sender<Advertisement>>>,
    }

    impl ScanTransport {
        fn sender(&self) -> mpsc::Sender<Advertisement> {
            self.adv_tx.lock().unwrap().clone().unwrap()
        }
    }

    #[async_trait]
    impl Transport for ScanTransport {
        async fn connect(
            &self,
            _peripheral: &PeripheralId,
            _events: mpsc::Sender<ChannelEvent>,
        ) -> Result<Arc<dyn Channel>> {
            Err(GattError::transport("not available"))
        }

        async fn start_scan(&self, events: mpsc::Sender<Advertisement>) -> Result<()> {
            *self.adv_tx.lock().unwrap() = Some(events);
            Ok(())
        }

        async fn stop_scan(&self) {
            self.adv_tx.lock().unwrap().take();
        }
    }

    fn advertisement(mac: &str, rssi: i16) -> Advertisement {
        Advertisement {
            peripheral: PeripheralId::new(mac),
            name: Some("sensor".to_string()),
            rssi,
            discovered_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_duplicates_are_filtered() {
        let transport = Arc::new(ScanTransport::default());
        let scanner = Scanner::new(transport.clone());
        let mut events = scanner.subscribe_events();

        scanner.start(ScanOptions::default()).await.unwrap();
        let tx = transport.sender();
        tx.send(advertisement("AA:00:00:00:00:01", -40)).await.unwrap();
        tx.send(advertisement("AA:00:00:00:00:01", -45)).await.unwrap();
        tx.send(advertisement("AA:00:00:00:00:02", -60)).await.unwrap();

        let mut seen = Vec::new();
        for _ in 0..2 {
            if let ScanEvent::Advertisement(adv) = events.recv().await.unwrap() {
                seen.push(adv.peripheral.to_string());
            }
        }
        assert_eq!(seen, vec!["AA:00:00:00:00:01", "AA:00:00:00:00:02"]);

        scanner.stop().await;
        assert!(matches!(events.recv().await.unwrap(), ScanEvent::Finished));
    }

    #[tokio::test]
    async fn test_unfiltered_scan_reports_repeats() {
        let transport = Arc::new(ScanTransport::default());
        let scanner = Scanner::new(transport.clone());
        let mut events = scanner.subscribe_events();

        scanner
            .start(ScanOptions {
                filter_duplicates: false,
                ..ScanOptions::default()
            })
            .await
            .unwrap();
        let tx = transport.sender();
        tx.send(advertisement("AA:00:00:00:00:01", -40)).await.unwrap();
        tx.send(advertisement("AA:00:00:00:00:01", -45)).await.unwrap();

        let mut count = 0;
        for _ in 0..2 {
            if let ScanEvent::Advertisement(_) = events.recv().await.unwrap() {
                count += 1;
            }
        }
        assert_eq!(count, 2);
        scanner.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_finishes_scan() {
        let transport = Arc::new(ScanTransport::default());
        let scanner = Scanner::new(transport.clone());
        let mut events = scanner.subscribe_events();

        scanner
            .start(ScanOptions {
                filter_duplicates: true,
                timeout: Duration::from_millis(500),
            })
            .await
            .unwrap();

        assert!(matches!(events.recv().await.unwrap(), ScanEvent::Finished));
        // The deadline handed the sender back
        assert!(transport.adv_tx.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stop_idle_scanner_is_noop() {
        let transport = Arc::new(ScanTransport::default());
        let scanner = Scanner::new(transport);
        let mut events = scanner.subscribe_events();

        scanner.stop().await;
        assert!(matches!(
            events.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
        assert!(!scanner.is_scanning());
    }
}
